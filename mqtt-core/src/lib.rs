//! Wire codec for MQTT 3.1 and 3.1.1: fixed headers, remaining-length varints,
//! and the fourteen typed control packets. Runtime-agnostic — no I/O, no async.

pub mod err;
pub mod io;
mod packet;
pub mod qos;
pub mod topic;

pub use packet::{
    ConnAckPacket, ConnectPacket, ConnectReturnCode, DisconnectPacket, FixedHeader, MqttPacket,
    MqttVersion, PacketType, PingReqPacket, PingRespPacket, PubAckPacket, PubCompPacket,
    PubRecPacket, PubRelPacket, PublishFlags, PublishPacket, SubAckPacket, SubscribePacket,
    UnsubAckPacket, UnsubscribePacket, Will,
};
