use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use bytes::Bytes;
use mqtt_core::{
    qos::{QosLevel, SubAckQoS},
    topic::{TopicFilter, TopicName},
};
use tokio::sync::oneshot;

use crate::{engine::client_state::VersionPreference, error::ClientError};

/// External handle for an in-flight operation. Mirrors an MQTT message id for
/// qos>0 publish/subscribe/unsubscribe; a library-generated value otherwise
/// (qos 0 publish, connect, disconnect).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

static NEXT_SYNTHETIC_TOKEN: AtomicU64 = AtomicU64::new(1 << 32);

impl Token {
    pub fn from_msg_id(msg_id: u16) -> Self {
        Self(msg_id as u64)
    }

    /// Allocates a token for operations that don't carry a wire message id.
    pub fn synthetic() -> Self {
        Self(NEXT_SYNTHETIC_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Connected { server_uri: String, session_present: bool },
    Published,
    Subscribed(Vec<SubAckQoS>),
    Unsubscribed,
    Disconnected,
}

pub enum CommandKind {
    Connect {
        timeout: Duration,
        server_uris: Vec<String>,
        current_uri_index: usize,
        mqtt_version_attempt: VersionPreference,
    },
    Subscribe {
        msg_id: u16,
        topics: Vec<TopicFilter>,
        qoss: Vec<QosLevel>,
    },
    Unsubscribe {
        msg_id: u16,
        topics: Vec<TopicFilter>,
    },
    Publish {
        msg_id: Option<u16>,
        topic: TopicName,
        payload: Bytes,
        qos: QosLevel,
        retained: bool,
        dup: bool,
    },
    Disconnect {
        timeout: Duration,
        internal: bool,
    },
}

impl CommandKind {
    fn same_shape(&self, other: &CommandKind) -> bool {
        matches!(
            (self, other),
            (CommandKind::Connect { .. }, CommandKind::Connect { .. })
                | (CommandKind::Disconnect { .. }, CommandKind::Disconnect { .. })
        )
    }
}

/// A user-submitted operation, queued until the Sender can admit it for this
/// client. `completion` is resolved by whichever worker observes the terminal
/// event; it backs both the callback contract and the `DeliveryToken` sugar.
pub struct Command {
    pub client_id: String,
    pub kind: CommandKind,
    pub token: Token,
    pub submitted_at: Instant,
    pub completion: Option<oneshot::Sender<Result<CommandOutcome, ClientError>>>,
    /// The persistence sequence number this command was durably written
    /// under, if any — needed to remove the record once its ack lands
    /// (§6 "Persistence key layout"). `None` for CONNECT/DISCONNECT and for
    /// any command submitted without a store configured.
    pub persisted_seqno: Option<u64>,
    /// Legacy callback-style completion hooks (§6 "connect_options"), carried
    /// alongside `completion` rather than instead of it: `DeliveryToken` is
    /// sugar over the same terminal event, not a replacement for it.
    pub on_success: Option<Box<dyn FnOnce(CommandOutcome) + Send>>,
    pub on_failure: Option<Box<dyn FnOnce(ClientError) + Send>>,
}

impl Command {
    pub fn complete(&mut self, outcome: Result<CommandOutcome, ClientError>) {
        match &outcome {
            Ok(value) => {
                if let Some(cb) = self.on_success.take() {
                    cb(value.clone());
                }
            }
            Err(err) => {
                if let Some(cb) = self.on_failure.take() {
                    cb(err.clone());
                }
            }
        }
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
    }

    fn is_internal_disconnect(&self) -> bool {
        matches!(self.kind, CommandKind::Disconnect { internal: true, .. })
    }

    fn queue_jumps(&self) -> bool {
        matches!(self.kind, CommandKind::Connect { .. }) || self.is_internal_disconnect()
    }
}

/// Ordered queue of commands across every client, with per-client admission
/// rules (§4.2). CONNECT and internal DISCONNECT jump the queue so a reconnect
/// can interleave ahead of backlogged publishes; everything else is strict FIFO.
#[derive(Default)]
pub struct CommandQueue {
    queue: VecDeque<Command>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Appends `cmd` unless it is a CONNECT or internal DISCONNECT, in which case
    /// it jumps to the head of its client's run: if the current head is already
    /// the same shape for the same client the new one is dropped (invariant 5,
    /// §3), otherwise it is prepended.
    pub fn enqueue(&mut self, cmd: Command) {
        if cmd.queue_jumps() {
            if let Some(head) = self.queue.front() {
                if head.client_id == cmd.client_id && head.kind.same_shape(&cmd.kind) {
                    return;
                }
            }
            self.queue.push_front(cmd);
        } else {
            self.queue.push_back(cmd);
        }
    }

    /// Scans in order, skipping any client already known ineligible this pass,
    /// and removes + returns the first command whose client satisfies
    /// `is_eligible`. CONNECT/DISCONNECT are always eligible per §4.2 rule 2;
    /// `is_eligible` only needs to check the publish/subscribe/unsubscribe case.
    pub fn next_eligible(&mut self, mut is_eligible: impl FnMut(&Command) -> bool) -> Option<Command> {
        let mut ignored = std::collections::HashSet::new();
        let mut idx = 0;

        while idx < self.queue.len() {
            let cmd = &self.queue[idx];
            if ignored.contains(&cmd.client_id) {
                idx += 1;
                continue;
            }

            let always_eligible = matches!(
                cmd.kind,
                CommandKind::Connect { .. } | CommandKind::Disconnect { .. }
            );

            if always_eligible || is_eligible(cmd) {
                return self.queue.remove(idx);
            }

            ignored.insert(cmd.client_id.clone());
            idx += 1;
        }

        None
    }

    /// Removes every pending command for `client_id` without completing them —
    /// used by `destroy` (cancellation, §5).
    pub fn drop_client(&mut self, client_id: &str) {
        self.queue.retain(|cmd| cmd.client_id != client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_cmd(client_id: &str) -> Command {
        Command {
            client_id: client_id.to_string(),
            kind: CommandKind::Connect {
                timeout: Duration::from_secs(30),
                server_uris: vec![],
                current_uri_index: 0,
                mqtt_version_attempt: VersionPreference::Default,
            },
            token: Token::synthetic(),
            submitted_at: Instant::now(),
            completion: None,
            persisted_seqno: None,
            on_success: None,
            on_failure: None,
        }
    }

    fn publish_cmd(client_id: &str) -> Command {
        Command {
            client_id: client_id.to_string(),
            kind: CommandKind::Publish {
                msg_id: None,
                topic: TopicName::from_str("a/b").unwrap(),
                payload: Bytes::from_static(b"x"),
                qos: QosLevel::AtMostOnce,
                retained: false,
                dup: false,
            },
            token: Token::synthetic(),
            submitted_at: Instant::now(),
            completion: None,
            persisted_seqno: None,
            on_success: None,
            on_failure: None,
        }
    }

    #[test]
    fn duplicate_connect_for_same_client_is_dropped() {
        let mut queue = CommandQueue::new();
        queue.enqueue(publish_cmd("a"));
        queue.enqueue(connect_cmd("a"));
        queue.enqueue(connect_cmd("a"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn connect_jumps_ahead_of_backlogged_publish() {
        let mut queue = CommandQueue::new();
        queue.enqueue(publish_cmd("a"));
        queue.enqueue(connect_cmd("a"));
        let first = queue.next_eligible(|_| false).unwrap();
        assert!(matches!(first.kind, CommandKind::Connect { .. }));
    }

    #[test]
    fn ineligible_head_does_not_block_other_clients() {
        let mut queue = CommandQueue::new();
        queue.enqueue(publish_cmd("a"));
        queue.enqueue(publish_cmd("b"));
        let next = queue.next_eligible(|cmd| cmd.client_id == "b").unwrap();
        assert_eq!(next.client_id, "b");
    }
}
