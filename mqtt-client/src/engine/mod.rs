pub mod client_state;
pub mod command;
pub mod persistence;
pub mod protocol;
mod receiver;
pub mod registry;
mod sender;

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
};

use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
};

use crate::{
    config::EngineConfig,
    engine::{
        client_state::{ClientState, ConnectConfig, QueuedPublication},
        command::{Command, CommandKind, CommandQueue},
        persistence::{CommandRecord, PersistentReplay},
        protocol::ProtocolMachine,
        registry::ClientRegistry,
    },
    error::{ClientError, ClientErrorKind},
    store::Store,
    transport::Transport,
};

/// Worker lifecycle (§5 "Stop semantics"): `Starting -> Running -> Stopping ->
/// Stopped`, tracked so `destroy` can wait for a clean exit rather than
/// detaching the task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Starting = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl From<u8> for WorkerStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// The process-wide engine singleton (§9 "Global mutable state"): one command
/// queue and two long-running workers shared by every client handle. Created
/// lazily on the first `create` and torn down on the last `destroy`.
///
/// Generic over the transport rather than holding `Box<dyn Transport>`:
/// `Transport::connect` is an `async fn` in the trait, which stable Rust
/// cannot call through a trait object.
pub struct Engine<T: Transport> {
    registry: Mutex<ClientRegistry>,
    queue: Mutex<CommandQueue>,
    notify: Notify,
    stop: AtomicBool,
    sender_status: AtomicU8,
    receiver_status: AtomicU8,
    transport: T,
    config: EngineConfig,
    workers: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T, config: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(ClientRegistry::new()),
            queue: Mutex::new(CommandQueue::new()),
            notify: Notify::new(),
            stop: AtomicBool::new(false),
            sender_status: AtomicU8::new(WorkerStatus::Stopped as u8),
            receiver_status: AtomicU8::new(WorkerStatus::Stopped as u8),
            transport,
            config,
            workers: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Lazily spins up the Sender/Receiver tasks on the first `create_client`
    /// (§4.1 "lazily initialises shared infrastructure").
    async fn ensure_workers_started(self: &Arc<Self>) {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return;
        }
        self.stop.store(false, Ordering::Release);
        self.sender_status.store(WorkerStatus::Starting as u8, Ordering::Release);
        self.receiver_status.store(WorkerStatus::Starting as u8, Ordering::Release);

        let sender_engine = Arc::clone(self);
        let sender_handle = tokio::spawn(async move { sender::run(sender_engine).await });
        let receiver_engine = Arc::clone(self);
        let receiver_handle = tokio::spawn(async move { receiver::run(receiver_engine).await });

        *workers = Some((sender_handle, receiver_handle));
    }

    /// Stops both workers and waits for them to exit. Called once the last
    /// client has been destroyed.
    async fn stop_workers(&self) {
        self.stop.store(true, Ordering::Release);
        self.notify.notify_waiters();
        let handles = self.workers.lock().await.take();
        if let Some((sender_handle, receiver_handle)) = handles {
            let _ = sender_handle.await;
            let _ = receiver_handle.await;
        }
    }

    /// §4.1 `create`: registers a new client, restoring any persisted
    /// commands in ascending sequence-number order (§6 "Persistence key
    /// layout").
    pub async fn create_client(
        self: &Arc<Self>,
        client_id: String,
        server_uri: String,
        store: Option<Arc<dyn Store>>,
    ) -> Result<(), ClientError> {
        if client_id.is_empty() {
            return Err(ClientError::new(
                ClientErrorKind::InvalidArgument,
                "client_id must not be empty",
            ));
        }

        {
            let registry = self.registry.lock().await;
            if registry.clients.contains_key(&client_id) {
                return Err(ClientError::new(
                    ClientErrorKind::InvalidArgument,
                    format!("client `{client_id}` already exists"),
                ));
            }
        }

        let mut state = ClientState::new(client_id.clone(), server_uri);
        state.store = store.clone();

        let restored = if let Some(store) = &store {
            PersistentReplay::restore(store.as_ref(), &client_id)?
        } else {
            Vec::new()
        };

        let mut max_seqno = 0u64;
        let mut restored_commands = Vec::new();
        for (seqno, record) in restored {
            max_seqno = max_seqno.max(seqno);
            if let Some(cmd) = restore_command(&client_id, &mut state, record, seqno) {
                restored_commands.push(cmd);
            }
        }
        state.command_seqno = max_seqno;

        {
            let mut registry = self.registry.lock().await;
            registry.clients.insert(client_id.clone(), state);
        }
        {
            let mut queue = self.queue.lock().await;
            for cmd in restored_commands {
                queue.enqueue(cmd);
            }
        }

        self.ensure_workers_started().await;
        self.notify.notify_one();
        Ok(())
    }

    /// §4.1 `set_callbacks`: rejected once CONNECT has been issued for this
    /// client (the source's "can't change callbacks mid-flight" rule).
    pub async fn set_callbacks(
        &self,
        client_id: &str,
        callbacks: client_state::Callbacks,
    ) -> Result<(), ClientError> {
        let mut registry = self.registry.lock().await;
        let client = registry.clients.get_mut(client_id).ok_or_else(unknown_client(client_id))?;
        if client.connect_state != client_state::ConnectState::Idle || client.connected {
            return Err(ClientError::new(
                ClientErrorKind::InvalidArgument,
                "callbacks cannot be changed after connect has been issued",
            ));
        }
        client.callbacks = callbacks;
        Ok(())
    }

    /// Applies a `ConnectConfig` snapshot of `ConnectOptions` (§6) onto the
    /// client before its CONNECT command is enqueued.
    pub async fn configure_connect(&self, client_id: &str, config: ConnectConfig) -> Result<(), ClientError> {
        let mut registry = self.registry.lock().await;
        let client = registry.clients.get_mut(client_id).ok_or_else(unknown_client(client_id))?;
        client.keep_alive_secs = config.keep_alive_secs;
        client.clean_session = config.clean_session;
        client.max_inflight = config.max_inflight;
        client.will = config.will;
        client.tls_opts = config.tls_opts;
        client.username = config.username;
        client.password = config.password;
        client.connect_timeout_secs = config.connect_timeout_secs;
        client.retry_interval_secs = config.retry_interval_secs;
        client.automatic_reconnect = config.automatic_reconnect;
        client.min_retry_interval_secs = config.min_retry_interval_secs;
        client.max_retry_interval_secs = config.max_retry_interval_secs;
        client.max_buffered_messages = config.max_buffered_messages;
        Ok(())
    }

    /// Buffers `queued` onto `client_id`'s offline delivery queue (§3.1),
    /// dropping the oldest entry and logging a warning once it would exceed
    /// `max_buffered_messages`.
    pub async fn buffer_offline(&self, client_id: &str, queued: QueuedPublication) -> Result<(), ClientError> {
        let mut registry = self.registry.lock().await;
        let client = registry.clients.get_mut(client_id).ok_or_else(unknown_client(client_id))?;
        if client.offline_queue.len() >= client.max_buffered_messages {
            client.offline_queue.pop_front();
            log::warn!("`{client_id}` offline queue full, dropping oldest buffered message");
        }
        client.offline_queue.push_back(queued);
        Ok(())
    }

    /// §4.1 `destroy`: drains and frees. Pending commands/responses are
    /// dropped without invoking callbacks (§5 "Cancellation").
    pub async fn destroy_client(&self, client_id: &str) -> Result<(), ClientError> {
        {
            let mut queue = self.queue.lock().await;
            queue.drop_client(client_id);
        }
        {
            let mut registry = self.registry.lock().await;
            registry.forget_client(client_id);
        }

        let empty = self.registry.lock().await.clients.is_empty();
        if empty {
            self.stop_workers().await;
        }
        Ok(())
    }

    /// Assigns a msg id under the registry lock and reserves it immediately
    /// so a concurrent submission for the same client can't collide with it
    /// before this command is dispatched (§4.5 `assign_msg_id`, invariant 1).
    pub async fn assign_msg_id(&self, client_id: &str) -> Result<u16, ClientError> {
        let mut registry = self.registry.lock().await;
        let client = registry.clients.get_mut(client_id).ok_or_else(unknown_client(client_id))?;
        let reserved: Vec<u16> = client.claimed_msg_ids.iter().copied().collect();
        let id = ProtocolMachine::assign_msg_id(client, &reserved);
        if id == 0 {
            return Err(ClientError::new(ClientErrorKind::NoResources, "no message ids available"));
        }
        client.claimed_msg_ids.insert(id);
        Ok(id)
    }

    /// §4.2 `enqueue`: persists durable command kinds then admits the
    /// command to the shared queue and wakes the Sender.
    pub async fn submit(&self, mut cmd: Command, record: Option<CommandRecord>) -> Result<(), ClientError> {
        if let Some(record) = record {
            let mut registry = self.registry.lock().await;
            if let Some(client) = registry.clients.get_mut(&cmd.client_id) {
                if let Some(store) = client.store.clone() {
                    client.command_seqno += 1;
                    let seqno = client.command_seqno;
                    drop(registry);
                    PersistentReplay::persist(store.as_ref(), &cmd.client_id, seqno, &record)?;
                    cmd.persisted_seqno = Some(seqno);
                }
            }
        }

        let mut queue = self.queue.lock().await;
        queue.enqueue(cmd);
        drop(queue);
        self.notify.notify_one();
        Ok(())
    }

    pub async fn is_connected(&self, client_id: &str) -> Result<bool, ClientError> {
        let registry = self.registry.lock().await;
        let client = registry.clients.get(client_id).ok_or_else(unknown_client(client_id))?;
        Ok(client.connected)
    }

    /// Whether `client_id` was last configured with `automatic_reconnect`
    /// (§6), consulted by `Client::publish` to decide whether a publish
    /// while disconnected should be buffered (§3.1) or rejected outright.
    pub async fn automatic_reconnect(&self, client_id: &str) -> Result<bool, ClientError> {
        let registry = self.registry.lock().await;
        let client = registry.clients.get(client_id).ok_or_else(unknown_client(client_id))?;
        Ok(client.automatic_reconnect)
    }

    /// `get_pending_tokens` (§6): every msg id this client currently has
    /// claimed, sorted for deterministic output.
    pub async fn pending_tokens(&self, client_id: &str) -> Result<Vec<u16>, ClientError> {
        let registry = self.registry.lock().await;
        let client = registry.clients.get(client_id).ok_or_else(unknown_client(client_id))?;
        let mut ids: Vec<u16> = client.claimed_msg_ids.iter().copied().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn is_complete(&self, client_id: &str, msg_id: u16) -> Result<bool, ClientError> {
        let registry = self.registry.lock().await;
        let client = registry.clients.get(client_id).ok_or_else(unknown_client(client_id))?;
        Ok(!client.claimed_msg_ids.contains(&msg_id))
    }
}

fn unknown_client(client_id: &str) -> impl FnOnce() -> ClientError + '_ {
    move || ClientError::new(ClientErrorKind::InvalidArgument, format!("unknown client `{client_id}`"))
}

/// Turns a persisted `CommandRecord` back into a `Command`, reinstating its
/// msg id claim on `state` so `assign_msg_id` won't reissue it. Subscribe and
/// Unsubscribe records restore topic filters verbatim; a record whose topic
/// no longer parses (corrupt persistence) is logged and dropped rather than
/// panicking the restore path.
fn restore_command(client_id: &str, state: &mut ClientState, record: CommandRecord, seqno: u64) -> Option<Command> {
    let token_id = record.token();
    state.claimed_msg_ids.insert(token_id);

    let kind = match record {
        CommandRecord::Subscribe { token, topics } => {
            let mut filters = Vec::with_capacity(topics.len());
            let mut qoss = Vec::with_capacity(topics.len());
            for (topic, qos) in topics {
                match mqtt_core::topic::TopicFilter::from_str(&topic) {
                    Ok(filter) => {
                        filters.push(filter);
                        qoss.push(qos);
                    }
                    Err(err) => {
                        log::error!("dropping restored SUBSCRIBE with unparsable filter `{topic}`: {err}");
                        return None;
                    }
                }
            }
            CommandKind::Subscribe { msg_id: token, topics: filters, qoss }
        }
        CommandRecord::Unsubscribe { token, topics } => {
            let mut filters = Vec::with_capacity(topics.len());
            for topic in topics {
                match mqtt_core::topic::TopicFilter::from_str(&topic) {
                    Ok(filter) => filters.push(filter),
                    Err(err) => {
                        log::error!("dropping restored UNSUBSCRIBE with unparsable filter `{topic}`: {err}");
                        return None;
                    }
                }
            }
            CommandKind::Unsubscribe { msg_id: token, topics: filters }
        }
        CommandRecord::Publish { token, topic, payload, qos, retained } => {
            match mqtt_core::topic::TopicName::from_str(&topic) {
                Ok(topic) => CommandKind::Publish {
                    msg_id: Some(token),
                    topic,
                    payload,
                    qos,
                    retained,
                    dup: true,
                },
                Err(err) => {
                    log::error!("dropping restored PUBLISH with unparsable topic `{topic}`: {err}");
                    return None;
                }
            }
        }
    };

    Some(Command {
        client_id: client_id.to_string(),
        kind,
        token: command::Token::from_msg_id(token_id),
        submitted_at: std::time::Instant::now(),
        completion: None,
        persisted_seqno: Some(seqno),
        on_success: None,
        on_failure: None,
    })
}

/// Message ids claimed but not released when a client is torn down are, by
/// construction, never reused — `HashSet` rather than a bitmap is enough at
/// this scale (at most 65535 ids per client).
#[allow(dead_code)]
fn _assert_claim_set_type(_: &HashSet<u16>) {}
