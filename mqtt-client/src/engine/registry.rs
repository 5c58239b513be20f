use std::collections::HashMap;

use crate::engine::{client_state::ClientState, command::Command};

/// Process-wide table of client handles to their per-client state (§4.1).
/// Lives inside the engine's single global lock together with the
/// pending-response tables it shares identity with — a CONNACK, SUBACK, or
/// PUBACK/PUBCOMP can only be matched to its command by looking both up
/// together.
///
/// The source's separate `sockets_index: fd -> handle` table has no
/// counterpart here: the Receiver iterates each client's own socket directly
/// rather than routing a bare fd back to its owner (see `engine::receiver`).
#[derive(Default)]
pub struct ClientRegistry {
    pub clients: HashMap<String, ClientState>,
    /// The one CONNECT in flight per client, if any (invariant 5, §3).
    pub pending_connect: HashMap<String, Command>,
    /// The one internal/user DISCONNECT in flight per client, if any.
    pub pending_disconnect: HashMap<String, Command>,
    /// SUBSCRIBE/UNSUBSCRIBE/PUBLISH(qos>0) commands awaiting their ack,
    /// keyed by client id then by the MQTT message id they carry.
    pub pending_responses: HashMap<String, HashMap<u16, Command>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancellation (§5): removes every trace of `client_id` from the shared
    /// tables without invoking any callback. The caller is responsible for
    /// also draining the command queue via `CommandQueue::drop_client`.
    pub fn forget_client(&mut self, client_id: &str) -> Option<ClientState> {
        self.pending_connect.remove(client_id);
        self.pending_disconnect.remove(client_id);
        self.pending_responses.remove(client_id);
        self.clients.remove(client_id)
    }
}
