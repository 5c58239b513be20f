use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

use futures::future::select_all;
use mqtt_core::{qos::QosLevel, MqttPacket};
use tokio::time::timeout;

use crate::{
    engine::{
        client_state::{ClientState, ConnectState, ExpectedAck},
        command::CommandOutcome,
        protocol::ProtocolMachine,
        sender,
        Engine, WorkerStatus,
    },
    error::{ClientError, ClientErrorKind},
    net,
    transport::{Socket, Transport},
};

const RECEIVER_WAIT: Duration = Duration::from_secs(1);

/// The Receiver loop (§4.4): polls every connected client's socket for
/// readiness without holding the registry lock across the wait, reads at
/// most one packet off whichever socket becomes ready, routes it, then
/// drains that client's delivery backlog.
pub async fn run<T: Transport>(engine: Arc<Engine<T>>) {
    engine.receiver_status.store(WorkerStatus::Running as u8, Ordering::Release);

    loop {
        if engine.is_stopping() {
            break;
        }

        if let Some((client_id, result)) = poll_ready_client(&engine).await {
            handle_read_result(&engine, &client_id, result).await;
            drain_message_queue(&engine, &client_id).await;
        }
    }

    engine.receiver_status.store(WorkerStatus::Stopped as u8, Ordering::Release);
}

/// Takes every connected client's socket out of the registry, races their
/// `readable()` futures, reads at most one packet off the winner, then
/// returns every socket (including the one just read from) to the registry.
/// Sockets are never held across an `.await` while the registry lock is
/// taken, so other workers aren't blocked while this waits on I/O.
async fn poll_ready_client<T: Transport>(
    engine: &Arc<Engine<T>>,
) -> Option<(String, Result<Option<MqttPacket>, ClientError>)> {
    let mut taken: Vec<(String, Socket)> = {
        let mut registry = engine.registry.lock().await;
        registry
            .clients
            .values_mut()
            .filter_map(|client| client.socket.take().map(|socket| (client.client_id.clone(), socket)))
            .collect()
    };

    if taken.is_empty() {
        tokio::time::sleep(RECEIVER_WAIT).await;
        return None;
    }

    let futs = taken.iter().map(|(_, socket)| Box::pin(socket.readable()));
    let ready_index = match timeout(RECEIVER_WAIT, select_all(futs)).await {
        Ok((_ready, index, _rest)) => Some(index),
        Err(_) => None,
    };

    let Some(index) = ready_index else {
        reinsert(engine, taken).await;
        return None;
    };

    let (client_id, mut socket) = taken.remove(index);
    let result = net::read_packet(&mut socket).await;
    taken.push((client_id.clone(), socket));
    reinsert(engine, taken).await;
    Some((client_id, result))
}

async fn reinsert<T: Transport>(engine: &Arc<Engine<T>>, sockets: Vec<(String, Socket)>) {
    let mut registry = engine.registry.lock().await;
    for (client_id, socket) in sockets {
        if let Some(client) = registry.clients.get_mut(&client_id) {
            client.socket = Some(socket);
        }
    }
}

async fn handle_read_result<T: Transport>(
    engine: &Arc<Engine<T>>,
    client_id: &str,
    result: Result<Option<MqttPacket>, ClientError>,
) {
    match result {
        Ok(Some(packet)) => handle_packet(engine, client_id, packet).await,
        Ok(None) => {
            log::info!("`{client_id}` connection closed by peer");
            sender::internal_disconnect(engine, client_id).await;
        }
        Err(err) => {
            log::warn!("read error on `{client_id}`: {err}");
            sender::internal_disconnect(engine, client_id).await;
        }
    }
}

async fn handle_packet<T: Transport>(engine: &Arc<Engine<T>>, client_id: &str, packet: MqttPacket) {
    match packet {
        MqttPacket::ConnAck(connack) => handle_connack(engine, client_id, connack).await,
        MqttPacket::Publish(publish) => handle_inbound_publish(engine, client_id, publish).await,
        MqttPacket::PubAck(puback) => complete_outbound(engine, client_id, puback.msg_id(), CommandOutcome::Published).await,
        MqttPacket::PubRec(pubrec) => handle_pubrec(engine, client_id, pubrec.msg_id()).await,
        MqttPacket::PubRel(pubrel) => handle_pubrel(engine, client_id, pubrel.msg_id()).await,
        MqttPacket::PubComp(pubcomp) => complete_outbound(engine, client_id, pubcomp.msg_id(), CommandOutcome::Published).await,
        MqttPacket::SubAck(suback) => handle_suback(engine, client_id, suback).await,
        MqttPacket::UnsubAck(unsuback) => {
            complete_outbound(engine, client_id, unsuback.msg_id(), CommandOutcome::Unsubscribed).await;
        }
        MqttPacket::PingResp(_) => {
            let mut registry = engine.registry.lock().await;
            if let Some(client) = registry.clients.get_mut(client_id) {
                client.ping_outstanding = false;
                client.last_received = std::time::Instant::now();
            }
        }
        other => {
            log::warn!("`{client_id}` received unexpected packet from broker: {other:?}");
        }
    }
}

async fn handle_connack<T: Transport>(engine: &Arc<Engine<T>>, client_id: &str, connack: mqtt_core::ConnAckPacket) {
    let pending = {
        let mut registry = engine.registry.lock().await;
        registry.pending_connect.remove(client_id)
    };
    let Some(mut cmd) = pending else {
        log::warn!("`{client_id}` received unsolicited CONNACK");
        return;
    };

    let mut registry = engine.registry.lock().await;
    let Some(client) = registry.clients.get_mut(client_id) else {
        return;
    };
    client.last_received = std::time::Instant::now();

    let accepted = ProtocolMachine::complete_connection(client, &connack).await;
    if !accepted {
        drop(registry);
        let err = ClientError::new(
            ClientErrorKind::ProtocolError,
            format!("broker rejected CONNECT: {:?}", connack.return_code),
        );
        sender::fail_or_fallback(engine, cmd, err).await;
        return;
    }

    flush_offline_queue(client).await;
    let server_uri = client.effective_server_uri();
    let session_present = connack.session_present;
    drop(registry);

    cmd.complete(Ok(CommandOutcome::Connected { server_uri, session_present }));
}

/// Re-submits every buffered offline publication in FIFO order (§3.1
/// "automatic reconnect" offline queue), allocating fresh msg ids for QoS>0
/// entries that weren't already stamped with one.
async fn flush_offline_queue(client: &mut ClientState) {
    let pending: Vec<_> = client.offline_queue.drain(..).collect();
    for mut queued in pending {
        if queued.qos != QosLevel::AtMostOnce && queued.msg_id.is_none() {
            let reserved: Vec<u16> = client.claimed_msg_ids.iter().copied().collect();
            let id = ProtocolMachine::assign_msg_id(client, &reserved);
            if id == 0 {
                log::error!("`{}` ran out of message ids flushing the offline queue", client.client_id);
                continue;
            }
            client.claimed_msg_ids.insert(id);
            queued.msg_id = Some(id);
        }

        let result = ProtocolMachine::start_publish(
            client,
            queued.topic,
            queued.payload,
            queued.qos,
            queued.retained,
            queued.dup,
            queued.msg_id,
        )
        .await;

        if let Err(err) = result {
            log::warn!("`{}` failed to flush offline queue entry: {err}", client.client_id);
            break;
        }
    }
}

async fn handle_inbound_publish<T: Transport>(
    engine: &Arc<Engine<T>>,
    client_id: &str,
    packet: mqtt_core::PublishPacket,
) {
    let mut registry = engine.registry.lock().await;
    let Some(client) = registry.clients.get_mut(client_id) else {
        return;
    };
    client.last_received = std::time::Instant::now();
    client.inbound_seqno += 1;
    let seqno = client.inbound_seqno;

    match ProtocolMachine::handle_publish(client, packet, seqno).await {
        Ok(Some(queued)) => client.message_queue.push_back(queued),
        Ok(None) => {}
        Err(err) => {
            drop(registry);
            log::warn!("`{client_id}` PUBLISH intake failed: {err}");
            sender::internal_disconnect(engine, client_id).await;
        }
    }
}

/// Inbound PUBREC (ack of an outbound QoS 2 publish): advance the flow to
/// await PUBCOMP and reply with PUBREL.
async fn handle_pubrec<T: Transport>(engine: &Arc<Engine<T>>, client_id: &str, msg_id: u16) {
    let mut registry = engine.registry.lock().await;
    let Some(client) = registry.clients.get_mut(client_id) else {
        return;
    };

    let Some(outbound) = client.outbound_msgs.get_mut(&msg_id) else {
        log::warn!("`{client_id}` PUBREC for unknown msg id {msg_id}");
        return;
    };
    outbound.next_expected = ExpectedAck::PubComp;
    outbound.last_touch = std::time::Instant::now();

    let encoded = mqtt_core::PubRelPacket::new(msg_id).encode();
    if let Err(err) = sender::write_packet(client, Ok(encoded)).await {
        drop(registry);
        log::warn!("`{client_id}` failed to send PUBREL: {err}");
        sender::internal_disconnect(engine, client_id).await;
    }
}

/// Inbound PUBREL (broker releasing a QoS 2 message we're receiving):
/// complete the flow with PUBCOMP and hand the publication to delivery.
async fn handle_pubrel<T: Transport>(engine: &Arc<Engine<T>>, client_id: &str, msg_id: u16) {
    let mut registry = engine.registry.lock().await;
    let Some(client) = registry.clients.get_mut(client_id) else {
        return;
    };
    client.inbound_seqno += 1;
    let seqno = client.inbound_seqno;

    match ProtocolMachine::handle_pubrel(client, msg_id, seqno).await {
        Ok(Some(queued)) => client.message_queue.push_back(queued),
        Ok(None) => {}
        Err(err) => {
            drop(registry);
            log::warn!("`{client_id}` PUBREL handling failed: {err}");
            sender::internal_disconnect(engine, client_id).await;
        }
    }
}

/// PUBACK/PUBCOMP both terminate an outbound in-flight message the same way:
/// drop it from `outbound_msgs`, unpersist it if it was durable, complete the
/// matching queued command, and — if this was the last outstanding message
/// and a user `disconnect` is waiting on `outbound_msgs` to drain — close the
/// session right away instead of letting it sit until the disconnect timeout
/// (§5 "waits up to the timeout ... then closes", §4.5 `check_disconnect`).
async fn complete_outbound<T: Transport>(
    engine: &Arc<Engine<T>>,
    client_id: &str,
    msg_id: u16,
    outcome: CommandOutcome,
) {
    let (completed, store, drained_disconnect) = {
        let mut registry = engine.registry.lock().await;
        let Some(client) = registry.clients.get_mut(client_id) else {
            return;
        };
        client.last_received = std::time::Instant::now();
        client.outbound_msgs.remove(&msg_id);
        client.claimed_msg_ids.remove(&msg_id);
        let store = client.store.clone();

        let completed = registry
            .pending_responses
            .get_mut(client_id)
            .and_then(|table| table.remove(&msg_id));

        let client = registry.clients.get_mut(client_id).expect("client present, checked above");
        let drained_disconnect = if client.connect_state == ConnectState::Disconnecting && client.outbound_msgs.is_empty() {
            ProtocolMachine::close_session(client).await;
            registry.pending_disconnect.remove(client_id)
        } else {
            None
        };

        (completed, store, drained_disconnect)
    };

    if let (Some(store), Some(seqno)) = (&store, completed.as_ref().and_then(|cmd| cmd.persisted_seqno)) {
        let _ = crate::engine::persistence::PersistentReplay::unpersist(store.as_ref(), client_id, seqno);
    }

    if completed.is_some() && matches!(outcome, CommandOutcome::Published) {
        let registry = engine.registry.lock().await;
        if let Some(client) = registry.clients.get(client_id) {
            if let Some(cb) = client.callbacks.on_delivery_complete.as_ref() {
                cb(msg_id);
            }
        }
    }

    if let Some(mut cmd) = completed {
        cmd.complete(Ok(outcome));
    }

    if let Some(mut disconnect_cmd) = drained_disconnect {
        disconnect_cmd.complete(Ok(CommandOutcome::Disconnected));
    }
}

/// SUBACK completion (§4.4, §6 "SUBACK 0x80 means failure"): a single
/// requested subscription granted `0x80` completes with failure; everything
/// else — including a mixed SUBACK with some filters downgraded or failed —
/// completes with success carrying the granted-qos list in request order
/// (S4).
async fn handle_suback<T: Transport>(engine: &Arc<Engine<T>>, client_id: &str, suback: mqtt_core::SubAckPacket) {
    let msg_id = suback.msg_id();
    let (completed, store) = {
        let mut registry = engine.registry.lock().await;
        let Some(client) = registry.clients.get_mut(client_id) else {
            return;
        };
        client.last_received = std::time::Instant::now();
        client.claimed_msg_ids.remove(&msg_id);
        let store = client.store.clone();

        let completed = registry
            .pending_responses
            .get_mut(client_id)
            .and_then(|table| table.remove(&msg_id));
        (completed, store)
    };

    let Some(mut cmd) = completed else {
        log::warn!("`{client_id}` received SUBACK for unknown msg id {msg_id}");
        return;
    };

    if let (Some(store), Some(seqno)) = (store, cmd.persisted_seqno) {
        let _ = crate::engine::persistence::PersistentReplay::unpersist(store.as_ref(), client_id, seqno);
    }

    let requested_count = match &cmd.kind {
        crate::engine::command::CommandKind::Subscribe { topics, .. } => topics.len(),
        _ => suback.granted().len(),
    };
    let granted = suback.granted().to_vec();

    if requested_count == 1 && granted.first().is_some_and(|g| g.is_failure()) {
        cmd.complete(Err(ClientError::new(
            ClientErrorKind::ProtocolError,
            "broker refused subscription (SUBACK 0x80)",
        )));
        return;
    }

    cmd.complete(Ok(CommandOutcome::Subscribed(granted)));
}

/// §4.4 point 5: deliver the head of `message_queue` to `on_message_arrived`;
/// only pop (and unpersist) it if the callback accepts it, otherwise leave it
/// in place so the next Receiver turn tries again.
async fn drain_message_queue<T: Transport>(engine: &Arc<Engine<T>>, client_id: &str) {
    loop {
        let mut registry = engine.registry.lock().await;
        let Some(client) = registry.clients.get_mut(client_id) else {
            return;
        };
        let Some(queued) = client.message_queue.front() else {
            return;
        };

        let Some(callback) = client.callbacks.on_message_arrived.as_ref() else {
            return;
        };
        let accepted = callback(&queued.topic, &queued.payload, queued.qos, queued.retained, queued.dup);
        if !accepted {
            return;
        }

        client.message_queue.pop_front();
    }
}
