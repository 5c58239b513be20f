pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod logger;
pub mod net;
pub mod store;
pub mod transport;

pub use client::{Client, ConnectOptions, DeliveryToken, DisconnectOptions, WillOptions};
pub use config::EngineConfig;
pub use engine::{
    client_state::{Callbacks, TlsOptions, VersionPreference},
    command::{CommandOutcome, Token},
    Engine,
};
pub use error::{ClientError, ClientErrorKind};
pub use logger::EngineLogger;
pub use store::{FileStore, MemStore, Store};
pub use transport::{ServerUri, Socket, TokioTransport, Transport};

pub use mqtt_core::{
    qos::{QosLevel, SubAckQoS},
    topic::{TopicFilter, TopicName},
};
