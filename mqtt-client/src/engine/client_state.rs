use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Instant,
};

use bytes::Bytes;
use mqtt_core::{qos::QosLevel, topic::TopicName};

use crate::{store::Store, transport::Socket};

/// Which ack this in-flight message is still waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedAck {
    PubAck,
    PubRec,
    PubComp,
}

/// Stage of the per-client CONNECT handshake (§4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectState {
    Idle,
    TcpPending,
    TlsPending,
    MqttConnectSent,
    Connected,
    Disconnecting,
}

/// The MQTT protocol level a client asked to negotiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionPreference {
    Default,
    V3_1,
    V3_1_1,
}

/// Backing bytes for a publication, shared between the outbound retry path and
/// (transiently) a partially-written socket. `Arc::strong_count` plays the role
/// of the source's manual refcount (invariant 7, §3).
#[derive(Debug, PartialEq, Eq)]
pub struct StoredPublication {
    pub topic: TopicName,
    pub payload: Bytes,
}

/// A published or received message whose ack flow has not yet completed.
pub struct OutboundMessage {
    pub msg_id: u16,
    pub qos: QosLevel,
    pub retained: bool,
    pub publication: Arc<StoredPublication>,
    pub next_expected: ExpectedAck,
    pub last_touch: Instant,
}

pub struct InboundMessage {
    pub msg_id: u16,
    pub qos: QosLevel,
    pub retained: bool,
    pub publication: Arc<StoredPublication>,
}

/// Delivery backlog entry: a publication waiting for `on_message_arrived` to
/// accept it, or waiting for a reconnect before it can be sent at all.
#[derive(Clone)]
pub struct QueuedPublication {
    pub topic: TopicName,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub retained: bool,
    pub msg_id: Option<u16>,
    pub dup: bool,
    pub seqno: u64,
}

#[derive(Clone)]
pub struct Will {
    pub topic: TopicName,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub retained: bool,
}

/// Snapshot of `ConnectOptions` (§6) applied onto `ClientState` before the
/// CONNECT command is dispatched.
pub struct ConnectConfig {
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub max_inflight: usize,
    pub will: Option<Will>,
    pub tls_opts: Option<TlsOptions>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub connect_timeout_secs: u64,
    pub retry_interval_secs: u64,
    pub automatic_reconnect: bool,
    pub min_retry_interval_secs: u64,
    pub max_retry_interval_secs: u64,
    pub max_buffered_messages: usize,
}

#[derive(Clone, Default)]
pub struct TlsOptions {
    pub trust_store: Option<String>,
    pub key_store: Option<String>,
    pub private_key: Option<String>,
    pub private_key_password: Option<String>,
    pub enabled_cipher_suites: Vec<String>,
    pub enable_server_cert_auth: bool,
}

/// User-supplied hooks, invoked by whichever worker observes the completing event.
/// Held as trait objects rather than generics so `ClientState` can live in a single
/// homogeneous registry.
pub struct Callbacks {
    pub on_connection_lost: Option<Box<dyn Fn(Option<String>) + Send + Sync>>,
    pub on_message_arrived:
        Option<Box<dyn Fn(&TopicName, &Bytes, QosLevel, bool, bool) -> bool + Send + Sync>>,
    pub on_delivery_complete: Option<Box<dyn Fn(u16) + Send + Sync>>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_connection_lost: None,
            on_message_arrived: None,
            on_delivery_complete: None,
        }
    }
}

/// Per-client mutable state, the sole owner of its fields, shared by reference
/// with the Sender/Receiver workers under the engine's global lock.
pub struct ClientState {
    // immutable
    pub client_id: String,
    pub server_uri_primary: String,
    pub use_tls: bool,

    // connection fields
    pub socket: Option<Socket>,
    pub connect_state: ConnectState,
    pub connected: bool,
    pub good: bool,
    pub ping_outstanding: bool,
    pub last_sent: Instant,
    pub last_received: Instant,
    pub keep_alive_secs: u64,
    pub retry_interval_secs: u64,
    pub clean_session: bool,
    pub mqtt_version_negotiated: VersionPreference,
    pub mqtt_version_attempt: VersionPreference,

    // session state
    pub next_msg_id: u16,
    pub outbound_msgs: BTreeMap<u16, OutboundMessage>,
    pub inbound_msgs: BTreeMap<u16, InboundMessage>,
    pub message_queue: VecDeque<QueuedPublication>,
    /// Ids handed out by `assign_msg_id` for a submitted-but-not-yet-acked
    /// command — a superset of `outbound_msgs`/`inbound_msgs` keys that also
    /// covers commands still sitting in the global queue (invariant 1, §3).
    /// Claimed at submission time, released once the matching ack lands.
    pub claimed_msg_ids: std::collections::HashSet<u16>,
    /// Upper bound on concurrently in-flight QoS 1/2 publishes for this
    /// client (`connect_options.max_inflight`, §6). The Sender treats a
    /// client as ineligible for another publish/subscribe/unsubscribe
    /// dispatch once `outbound_msgs` reaches this size.
    pub max_inflight: usize,

    // config
    pub will: Option<Will>,
    pub tls_opts: Option<TlsOptions>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub server_uris: Vec<String>,
    pub current_uri_index: usize,

    // ambient additions (§3.1)
    pub offline_queue: VecDeque<QueuedPublication>,
    pub max_buffered_messages: usize,
    pub automatic_reconnect: bool,
    pub min_retry_interval_secs: u64,
    pub max_retry_interval_secs: u64,
    pub current_retry_delay_secs: u64,
    /// When an automatic reconnect is scheduled after exhausting every
    /// URI/version combination, the instant it becomes due (§4.5 fallback,
    /// §3.1 automatic reconnect).
    pub reconnect_at: Option<Instant>,

    // callbacks
    pub callbacks: Callbacks,

    // persistence
    pub store: Option<Arc<dyn Store>>,
    pub command_seqno: u64,
    /// Local ordering counter stamped onto inbound `QueuedPublication`s as
    /// they're handed to `message_queue` (distinct from `command_seqno`,
    /// which only tracks outbound persisted commands).
    pub inbound_seqno: u64,

    // connect-phase bookkeeping
    pub connect_started_at: Option<Instant>,
    pub connect_timeout_secs: u64,
    pub disconnect_started_at: Option<Instant>,
    pub disconnect_timeout_secs: u64,
}

impl ClientState {
    pub fn new(client_id: String, server_uri_primary: String) -> Self {
        let use_tls = server_uri_primary.starts_with("ssl://");
        let now = Instant::now();
        Self {
            client_id,
            server_uri_primary,
            use_tls,

            socket: None,
            connect_state: ConnectState::Idle,
            connected: false,
            good: false,
            ping_outstanding: false,
            last_sent: now,
            last_received: now,
            keep_alive_secs: 60,
            retry_interval_secs: 20,
            clean_session: true,
            mqtt_version_negotiated: VersionPreference::Default,
            mqtt_version_attempt: VersionPreference::Default,

            next_msg_id: 0,
            outbound_msgs: BTreeMap::new(),
            inbound_msgs: BTreeMap::new(),
            message_queue: VecDeque::new(),
            claimed_msg_ids: std::collections::HashSet::new(),
            max_inflight: 10,

            will: None,
            tls_opts: None,
            username: None,
            password: None,
            server_uris: Vec::new(),
            current_uri_index: 0,

            offline_queue: VecDeque::new(),
            max_buffered_messages: 100,
            automatic_reconnect: false,
            min_retry_interval_secs: 1,
            max_retry_interval_secs: 60,
            current_retry_delay_secs: 1,
            reconnect_at: None,

            callbacks: Callbacks::default(),

            store: None,
            command_seqno: 0,
            inbound_seqno: 0,

            connect_started_at: None,
            connect_timeout_secs: 30,
            disconnect_started_at: None,
            disconnect_timeout_secs: 10,
        }
    }

    /// The URI this client should dial next: the current entry of `server_uris`
    /// if populated, else the primary.
    pub fn effective_server_uri(&self) -> String {
        self.server_uris
            .get(self.current_uri_index)
            .cloned()
            .unwrap_or_else(|| self.server_uri_primary.clone())
    }

    /// Invariant 6 (§3): clean-session close wipes all in-memory and persisted
    /// per-client state.
    pub fn wipe_session_state(&mut self) {
        self.outbound_msgs.clear();
        self.inbound_msgs.clear();
        self.message_queue.clear();
        self.offline_queue.clear();
        self.claimed_msg_ids.clear();
        if let Some(store) = &self.store {
            if let Ok(keys) = store.list(&format!("c-{}-", self.client_id)) {
                for key in keys {
                    let _ = store.remove(&key);
                }
            }
        }
    }
}
