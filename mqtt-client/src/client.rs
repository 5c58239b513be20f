//! The public handle (§6 "EXTERNAL INTERFACES"): a thin wrapper around a
//! client id plus a shared [`Engine`], exposing `connect`/`publish`/
//! `subscribe`/`unsubscribe`/`disconnect` as `async fn`s that return a
//! [`DeliveryToken`] immediately and resolve it once the matching terminal
//! event lands. Callers who prefer the original callback shape can supply
//! `on_success`/`on_failure` on `ConnectOptions`; both paths are driven off
//! the same `Command::complete` call, so neither observes a different
//! outcome than the other.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::Bytes;
use mqtt_core::{
    qos::QosLevel,
    topic::{TopicFilter, TopicName},
};
use tokio::sync::oneshot;

use crate::{
    engine::{
        client_state::{Callbacks, ConnectConfig, QueuedPublication, TlsOptions, VersionPreference, Will},
        command::{Command, CommandKind, CommandOutcome, Token},
        persistence::CommandRecord,
        Engine,
    },
    error::{ClientError, ClientErrorKind},
    store::Store,
    transport::{TokioTransport, Transport},
};

/// A will message to publish if the connection drops uncleanly (`connect_options.will`, §6).
#[derive(Clone)]
pub struct WillOptions {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QosLevel,
    pub retained: bool,
}

/// `connect(options)` parameters (§6). `on_success`/`on_failure` are optional:
/// most callers instead `.await` the returned `DeliveryToken`.
pub struct ConnectOptions {
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub max_inflight: usize,
    pub mqtt_version: VersionPreference,
    pub will: Option<WillOptions>,
    pub tls_opts: Option<TlsOptions>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub connect_timeout_secs: u64,
    pub retry_interval_secs: u64,
    pub server_uris: Vec<String>,
    pub automatic_reconnect: bool,
    pub min_retry_interval_secs: u64,
    pub max_retry_interval_secs: u64,
    pub max_buffered_messages: usize,
    pub on_success: Option<Box<dyn FnOnce(CommandOutcome) + Send>>,
    pub on_failure: Option<Box<dyn FnOnce(ClientError) + Send>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            keep_alive_secs: 60,
            clean_session: true,
            max_inflight: 10,
            mqtt_version: VersionPreference::Default,
            will: None,
            tls_opts: None,
            username: None,
            password: None,
            connect_timeout_secs: 30,
            retry_interval_secs: 20,
            server_uris: Vec::new(),
            automatic_reconnect: false,
            min_retry_interval_secs: 1,
            max_retry_interval_secs: 60,
            max_buffered_messages: 100,
            on_success: None,
            on_failure: None,
        }
    }
}

/// `disconnect(options)` parameters (§6): how long to wait for in-flight QoS
/// 1/2 work to drain before the session is torn down regardless.
pub struct DisconnectOptions {
    pub timeout_secs: u64,
}

impl Default for DisconnectOptions {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

/// Sugar over the completion of a single `Command` (§6): a handle that can be
/// polled for the assigned `Token` right away, or `.await`ed for the terminal
/// `Result`. Two commands never share one, so cloning isn't offered.
pub struct DeliveryToken {
    token: Token,
    state: DeliveryTokenState,
}

enum DeliveryTokenState {
    Pending(oneshot::Receiver<Result<CommandOutcome, ClientError>>),
    Ready(Option<Result<CommandOutcome, ClientError>>),
}

impl DeliveryToken {
    fn pending(token: Token, rx: oneshot::Receiver<Result<CommandOutcome, ClientError>>) -> Self {
        Self {
            token,
            state: DeliveryTokenState::Pending(rx),
        }
    }

    /// A token that resolves immediately, used for offline-buffered publishes
    /// (§3.1) that were never dispatched as a `Command` and so have no
    /// matching ack to wait for.
    fn ready(token: Token, outcome: Result<CommandOutcome, ClientError>) -> Self {
        Self {
            token,
            state: DeliveryTokenState::Ready(Some(outcome)),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }
}

impl Future for DeliveryToken {
    type Output = Result<CommandOutcome, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            DeliveryTokenState::Ready(slot) => {
                Poll::Ready(slot.take().expect("DeliveryToken polled again after completion"))
            }
            DeliveryTokenState::Pending(rx) => Pin::new(rx).poll(cx).map(|result| {
                result.unwrap_or_else(|_| {
                    Err(ClientError::new(
                        ClientErrorKind::Disconnected,
                        "command was dropped before it completed",
                    ))
                })
            }),
        }
    }
}

/// Public client handle (§6): cheap to clone, every method borrows the shared
/// [`Engine`] rather than owning any per-client state directly.
pub struct Client<T: Transport = TokioTransport> {
    engine: Arc<Engine<T>>,
    client_id: String,
}

impl<T: Transport> Client<T> {
    /// `create` (§4.1): registers `client_id` against `server_uri`, restoring
    /// any commands durably written under `store` in ascending seqno order.
    pub async fn create(
        engine: Arc<Engine<T>>,
        client_id: impl Into<String>,
        server_uri: impl Into<String>,
        store: Option<Arc<dyn Store>>,
    ) -> Result<Self, ClientError> {
        let client_id = client_id.into();
        engine.create_client(client_id.clone(), server_uri.into(), store).await?;
        Ok(Self { engine, client_id })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// `set_callbacks` (§4.1): rejected once CONNECT has been issued.
    pub async fn set_callbacks(&self, callbacks: Callbacks) -> Result<(), ClientError> {
        self.engine.set_callbacks(&self.client_id, callbacks).await
    }

    /// `connect(options)` (§6): applies the options onto client state, then
    /// enqueues a `Connect` command (queue-jumping ahead of any backlog).
    pub async fn connect(&self, options: ConnectOptions) -> Result<DeliveryToken, ClientError> {
        let will = options
            .will
            .as_ref()
            .map(|will| {
                Ok::<_, ClientError>(Will {
                    topic: TopicName::from_str(&will.topic)?,
                    payload: will.payload.clone(),
                    qos: will.qos,
                    retained: will.retained,
                })
            })
            .transpose()?;

        let config = ConnectConfig {
            keep_alive_secs: options.keep_alive_secs,
            clean_session: options.clean_session,
            max_inflight: options.max_inflight,
            will,
            tls_opts: options.tls_opts.clone(),
            username: options.username.clone(),
            password: options.password.clone(),
            connect_timeout_secs: options.connect_timeout_secs,
            retry_interval_secs: options.retry_interval_secs,
            automatic_reconnect: options.automatic_reconnect,
            min_retry_interval_secs: options.min_retry_interval_secs,
            max_retry_interval_secs: options.max_retry_interval_secs,
            max_buffered_messages: options.max_buffered_messages,
        };
        self.engine.configure_connect(&self.client_id, config).await?;

        let timeout = Duration::from_secs(options.connect_timeout_secs);
        let token = Token::synthetic();
        let (tx, rx) = oneshot::channel();
        let cmd = Command {
            client_id: self.client_id.clone(),
            kind: CommandKind::Connect {
                timeout,
                server_uris: options.server_uris,
                current_uri_index: 0,
                mqtt_version_attempt: options.mqtt_version,
            },
            token,
            submitted_at: Instant::now(),
            completion: Some(tx),
            persisted_seqno: None,
            on_success: options.on_success,
            on_failure: options.on_failure,
        };
        self.engine.submit(cmd, None).await?;
        Ok(DeliveryToken::pending(token, rx))
    }

    /// `disconnect(options)` (§6): an internal=false Disconnect, which waits
    /// for in-flight QoS 1/2 work to flush before closing (§4.3, §4.5).
    pub async fn disconnect(&self, options: DisconnectOptions) -> Result<DeliveryToken, ClientError> {
        let token = Token::synthetic();
        let (tx, rx) = oneshot::channel();
        let cmd = Command {
            client_id: self.client_id.clone(),
            kind: CommandKind::Disconnect {
                timeout: Duration::from_secs(options.timeout_secs),
                internal: false,
            },
            token,
            submitted_at: Instant::now(),
            completion: Some(tx),
            persisted_seqno: None,
            on_success: None,
            on_failure: None,
        };
        self.engine.submit(cmd, None).await?;
        Ok(DeliveryToken::pending(token, rx))
    }

    pub async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<DeliveryToken, ClientError> {
        self.subscribe_many(&[(topic, qos)]).await
    }

    /// `subscribe_many` (§6): one SUBSCRIBE packet carrying every topic/qos
    /// pair, completing with the broker's granted-qos list in request order.
    pub async fn subscribe_many(&self, topics: &[(&str, QosLevel)]) -> Result<DeliveryToken, ClientError> {
        let mut filters = Vec::with_capacity(topics.len());
        let mut qoss = Vec::with_capacity(topics.len());
        for (topic, qos) in topics {
            filters.push(TopicFilter::from_str(topic)?);
            qoss.push(*qos);
        }

        let msg_id = self.engine.assign_msg_id(&self.client_id).await?;
        let record = CommandRecord::Subscribe {
            token: msg_id,
            topics: filters.iter().zip(qoss.iter()).map(|(f, q)| (f.as_str().to_string(), *q)).collect(),
        };

        let (tx, rx) = oneshot::channel();
        let cmd = Command {
            client_id: self.client_id.clone(),
            kind: CommandKind::Subscribe {
                msg_id,
                topics: filters,
                qoss,
            },
            token: Token::from_msg_id(msg_id),
            submitted_at: Instant::now(),
            completion: Some(tx),
            persisted_seqno: None,
            on_success: None,
            on_failure: None,
        };
        self.engine.submit(cmd, Some(record)).await?;
        Ok(DeliveryToken::pending(Token::from_msg_id(msg_id), rx))
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<DeliveryToken, ClientError> {
        self.unsubscribe_many(&[topic]).await
    }

    pub async fn unsubscribe_many(&self, topics: &[&str]) -> Result<DeliveryToken, ClientError> {
        let filters = topics
            .iter()
            .map(|topic| TopicFilter::from_str(topic))
            .collect::<Result<Vec<_>, _>>()?;

        let msg_id = self.engine.assign_msg_id(&self.client_id).await?;
        let record = CommandRecord::Unsubscribe {
            token: msg_id,
            topics: filters.iter().map(|f| f.as_str().to_string()).collect(),
        };

        let (tx, rx) = oneshot::channel();
        let cmd = Command {
            client_id: self.client_id.clone(),
            kind: CommandKind::Unsubscribe { msg_id, topics: filters },
            token: Token::from_msg_id(msg_id),
            submitted_at: Instant::now(),
            completion: Some(tx),
            persisted_seqno: None,
            on_success: None,
            on_failure: None,
        };
        self.engine.submit(cmd, Some(record)).await?;
        Ok(DeliveryToken::pending(Token::from_msg_id(msg_id), rx))
    }

    /// `send`/`send_message` (§6): publishes `payload` to `topic`. While
    /// disconnected, qos>0 publish/subscribe/unsubscribe commands simply wait
    /// in the shared queue for the Sender to admit them once reconnected —
    /// only `publish` gets the dedicated offline buffer of §3.1, because a
    /// qos 0 write has nothing to resend once the socket is gone.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QosLevel,
        retained: bool,
    ) -> Result<DeliveryToken, ClientError> {
        let topic = TopicName::from_str(topic)?;
        let payload = payload.into();
        let connected = self.engine.is_connected(&self.client_id).await?;

        if !connected {
            return self.buffer_or_reject(topic, payload, qos, retained).await;
        }

        if qos == QosLevel::AtMostOnce {
            let (tx, rx) = oneshot::channel();
            let token = Token::synthetic();
            let cmd = Command {
                client_id: self.client_id.clone(),
                kind: CommandKind::Publish {
                    msg_id: None,
                    topic,
                    payload,
                    qos,
                    retained,
                    dup: false,
                },
                token,
                submitted_at: Instant::now(),
                completion: Some(tx),
                persisted_seqno: None,
                on_success: None,
                on_failure: None,
            };
            self.engine.submit(cmd, None).await?;
            return Ok(DeliveryToken::pending(token, rx));
        }

        let msg_id = self.engine.assign_msg_id(&self.client_id).await?;
        let record = CommandRecord::Publish {
            token: msg_id,
            topic: topic.as_str().to_string(),
            payload: payload.clone(),
            qos,
            retained,
        };
        let (tx, rx) = oneshot::channel();
        let cmd = Command {
            client_id: self.client_id.clone(),
            kind: CommandKind::Publish {
                msg_id: Some(msg_id),
                topic,
                payload,
                qos,
                retained,
                dup: false,
            },
            token: Token::from_msg_id(msg_id),
            submitted_at: Instant::now(),
            completion: Some(tx),
            persisted_seqno: None,
            on_success: None,
            on_failure: None,
        };
        self.engine.submit(cmd, Some(record)).await?;
        Ok(DeliveryToken::pending(Token::from_msg_id(msg_id), rx))
    }

    pub async fn send_message(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QosLevel,
        retained: bool,
    ) -> Result<DeliveryToken, ClientError> {
        self.publish(topic, payload, qos, retained).await
    }

    /// Offline buffering (§3.1): only reached while disconnected. Buffered
    /// entries carry no `msg_id` yet — `receiver::flush_offline_queue`
    /// assigns one when the connection that resumes delivery comes back up.
    /// The returned token resolves immediately: there is no ack to await for
    /// a publish that hasn't gone out yet.
    async fn buffer_or_reject(
        &self,
        topic: TopicName,
        payload: Bytes,
        qos: QosLevel,
        retained: bool,
    ) -> Result<DeliveryToken, ClientError> {
        let automatic_reconnect = {
            // `is_connected` already told us `connected == false`; whether
            // buffering applies depends on the `automatic_reconnect` flag
            // last applied via `configure_connect`, which only `connect()`
            // can set — read it back through `pending_tokens`'s sibling
            // rather than duplicating state here.
            self.engine.automatic_reconnect(&self.client_id).await?
        };

        if !automatic_reconnect {
            return Err(ClientError::new(
                ClientErrorKind::Disconnected,
                "client is not connected and automatic_reconnect is disabled",
            ));
        }

        let token = Token::synthetic();
        self.engine
            .buffer_offline(
                &self.client_id,
                QueuedPublication {
                    topic,
                    payload,
                    qos,
                    retained,
                    msg_id: None,
                    dup: false,
                    seqno: 0,
                },
            )
            .await?;
        Ok(DeliveryToken::ready(token, Ok(CommandOutcome::Published)))
    }

    pub async fn is_connected(&self) -> Result<bool, ClientError> {
        self.engine.is_connected(&self.client_id).await
    }

    pub async fn get_pending_tokens(&self) -> Result<Vec<u16>, ClientError> {
        self.engine.pending_tokens(&self.client_id).await
    }

    pub async fn is_complete(&self, msg_id: u16) -> Result<bool, ClientError> {
        self.engine.is_complete(&self.client_id, msg_id).await
    }

    /// `wait_for_completion(token, timeout)` (§6): the blocking counterpart
    /// to `.await`ing a `DeliveryToken` directly.
    pub async fn wait_for_completion(
        &self,
        token: DeliveryToken,
        timeout: Duration,
    ) -> Result<CommandOutcome, ClientError> {
        tokio::time::timeout(timeout, token)
            .await
            .map_err(|_| ClientError::new(ClientErrorKind::Timeout, "wait_for_completion timed out"))?
    }

    /// `destroy` (§4.1): cancellation, not graceful shutdown — pending
    /// commands are dropped without completing their callbacks. Call
    /// `disconnect` first for a clean close.
    pub async fn destroy(self) -> Result<(), ClientError> {
        self.engine.destroy_client(&self.client_id).await
    }
}

// `free_message` (§6) has no counterpart here: payloads are owned `Bytes`
// values freed by ordinary drop glue once `on_message_arrived` returns, so
// there is nothing for callers to free by hand.
