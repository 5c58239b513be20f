use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use tokio::time::timeout;

use crate::{
    engine::{
        client_state::{ClientState, ConnectState},
        command::{Command, CommandKind, CommandOutcome},
        protocol::{KeepaliveAction, ProtocolMachine, TimeoutAction},
        Engine, WorkerStatus,
    },
    error::ClientError,
    transport::{ServerUri, Transport},
};

const SENDER_WAIT: Duration = Duration::from_secs(1);

/// The Sender loop (§4.3): drains eligible commands, dispatches them against
/// the wire, then blocks on `notify` with a 1 s fallback so keepalive/retry/
/// timeout scans still run in the absence of new work.
pub async fn run<T: Transport>(engine: Arc<Engine<T>>) {
    engine.sender_status.store(WorkerStatus::Running as u8, Ordering::Release);
    let mut last_timeouts_check = Instant::now();

    loop {
        if engine.is_stopping() {
            break;
        }

        while let Some(cmd) = dequeue_eligible(&engine).await {
            dispatch(&engine, cmd).await;
            if engine.is_stopping() {
                break;
            }
        }

        if engine.is_stopping() {
            break;
        }

        let notified = engine.notify.notified();
        let _ = timeout(SENDER_WAIT, notified).await;

        let now = Instant::now();
        run_periodic_scans(&engine, now).await;
        if ProtocolMachine::should_run_check_timeouts(last_timeouts_check, now) {
            last_timeouts_check = now;
            run_check_timeouts(&engine, now).await;
        }
    }

    engine.sender_status.store(WorkerStatus::Stopped as u8, Ordering::Release);
}

async fn dequeue_eligible<T: Transport>(engine: &Engine<T>) -> Option<Command> {
    let registry = engine.registry.lock().await;
    let mut queue = engine.queue.lock().await;
    queue.next_eligible(|cmd| match registry.clients.get(&cmd.client_id) {
        Some(client) => {
            matches!(cmd.kind, CommandKind::Publish { .. } | CommandKind::Subscribe { .. } | CommandKind::Unsubscribe { .. })
                && client.connected
                && client.connect_state == ConnectState::Idle
                && client.outbound_msgs.len() < client.max_inflight
        }
        None => false,
    })
}

async fn dispatch<T: Transport>(engine: &Arc<Engine<T>>, cmd: Command) {
    match cmd.kind {
        CommandKind::Connect { .. } => dispatch_connect(engine, cmd).await,
        CommandKind::Subscribe { .. } => dispatch_subscribe(engine, cmd).await,
        CommandKind::Unsubscribe { .. } => dispatch_unsubscribe(engine, cmd).await,
        CommandKind::Publish { .. } => dispatch_publish(engine, cmd).await,
        CommandKind::Disconnect { .. } => dispatch_disconnect(engine, cmd).await,
    }
}

async fn dispatch_connect<T: Transport>(engine: &Arc<Engine<T>>, cmd: Command) {
    let CommandKind::Connect {
        server_uris,
        current_uri_index,
        mqtt_version_attempt,
        ..
    } = &cmd.kind
    else {
        unreachable!("dispatch_connect only called for Connect commands");
    };
    let server_uris = server_uris.clone();
    let current_uri_index = *current_uri_index;
    let mqtt_version_attempt = *mqtt_version_attempt;

    let uri_string = {
        let mut registry = engine.registry.lock().await;
        let Some(client) = registry.clients.get_mut(&cmd.client_id) else {
            return;
        };
        if !server_uris.is_empty() {
            client.server_uris = server_uris;
        }
        client.current_uri_index = current_uri_index;
        client.mqtt_version_attempt = mqtt_version_attempt;
        client.connect_state = ConnectState::TcpPending;
        client.effective_server_uri()
    };

    let server_uri = match ServerUri::parse(&uri_string) {
        Ok(uri) => uri,
        Err(err) => {
            log::warn!("malformed server URI for `{}`: {err}", cmd.client_id);
            fail_or_fallback(engine, cmd, err).await;
            return;
        }
    };

    log::info!("connecting `{}` to {uri_string}", cmd.client_id);
    let socket = engine.transport().connect(&server_uri).await;

    match socket {
        Ok(socket) => {
            let sent = {
                let mut registry = engine.registry.lock().await;
                let Some(client) = registry.clients.get_mut(&cmd.client_id) else {
                    return;
                };
                client.socket = Some(socket);
                client.connect_state = if server_uri.tls {
                    ConnectState::TlsPending
                } else {
                    ConnectState::TcpPending
                };
                ProtocolMachine::send_connect(client).await
            };

            match sent {
                Ok(()) => {
                    let mut registry = engine.registry.lock().await;
                    registry.pending_connect.insert(cmd.client_id.clone(), cmd);
                }
                Err(err) => fail_or_fallback(engine, cmd, err).await,
            }
        }
        Err(err) => {
            log::warn!("connect attempt for `{}` failed: {err}", cmd.client_id);
            fail_or_fallback(engine, cmd, err).await;
        }
    }
}

/// On a CONNECT-phase failure, advance the multi-URI/version fallback if any
/// combination remains; otherwise either schedule an automatic reconnect or
/// complete the command with failure (§4.5 "Multi-URI fallback").
pub(super) async fn fail_or_fallback<T: Transport>(engine: &Arc<Engine<T>>, mut cmd: Command, err: ClientError) {
    let mut registry = engine.registry.lock().await;
    let Some(client) = registry.clients.get_mut(&cmd.client_id) else {
        return;
    };

    client.socket = None;
    client.connect_state = ConnectState::Idle;

    if ProtocolMachine::advance_fallback(client) {
        let server_uris = client.server_uris.clone();
        let current_uri_index = client.current_uri_index;
        let mqtt_version_attempt = client.mqtt_version_attempt;
        let timeout = match &cmd.kind {
            CommandKind::Connect { timeout, .. } => *timeout,
            _ => Duration::from_secs(30),
        };
        drop(registry);

        cmd.kind = CommandKind::Connect {
            timeout,
            server_uris,
            current_uri_index,
            mqtt_version_attempt,
        };
        let mut queue = engine.queue.lock().await;
        queue.enqueue(cmd);
        drop(queue);
        engine.notify.notify_one();
        return;
    }

    if client.automatic_reconnect {
        let delay = client
            .current_retry_delay_secs
            .clamp(client.min_retry_interval_secs, client.max_retry_interval_secs);
        client.reconnect_at = Some(Instant::now() + Duration::from_secs(delay));
        client.current_retry_delay_secs = (client.current_retry_delay_secs * 2).min(client.max_retry_interval_secs);
        log::info!(
            "`{}` exhausted every server URI/version, will retry automatically in {delay}s",
            cmd.client_id
        );
        drop(registry);
        return;
    }

    drop(registry);
    cmd.complete(Err(err));
}

async fn dispatch_subscribe<T: Transport>(engine: &Arc<Engine<T>>, mut cmd: Command) {
    let CommandKind::Subscribe { msg_id, topics, qoss } = &cmd.kind else {
        unreachable!("dispatch_subscribe only called for Subscribe commands");
    };
    let msg_id = *msg_id;
    let packet = mqtt_core::SubscribePacket::new(
        msg_id,
        topics.iter().cloned().zip(qoss.iter().copied()).collect(),
    );

    let mut registry = engine.registry.lock().await;
    let Some(client) = registry.clients.get_mut(&cmd.client_id) else {
        return;
    };
    let result = write_packet(client, packet.encode()).await;
    match result {
        Ok(()) => {
            registry
                .pending_responses
                .entry(cmd.client_id.clone())
                .or_default()
                .insert(msg_id, cmd);
        }
        Err(err) => {
            drop(registry);
            internal_disconnect(engine, &cmd.client_id).await;
            cmd.complete(Err(err));
        }
    }
}

async fn dispatch_unsubscribe<T: Transport>(engine: &Arc<Engine<T>>, mut cmd: Command) {
    let CommandKind::Unsubscribe { msg_id, topics } = &cmd.kind else {
        unreachable!("dispatch_unsubscribe only called for Unsubscribe commands");
    };
    let msg_id = *msg_id;
    let packet = mqtt_core::UnsubscribePacket::new(msg_id, topics.clone());

    let mut registry = engine.registry.lock().await;
    let Some(client) = registry.clients.get_mut(&cmd.client_id) else {
        return;
    };
    let result = write_packet(client, packet.encode()).await;
    match result {
        Ok(()) => {
            registry
                .pending_responses
                .entry(cmd.client_id.clone())
                .or_default()
                .insert(msg_id, cmd);
        }
        Err(err) => {
            drop(registry);
            internal_disconnect(engine, &cmd.client_id).await;
            cmd.complete(Err(err));
        }
    }
}

async fn dispatch_publish<T: Transport>(engine: &Arc<Engine<T>>, mut cmd: Command) {
    let (msg_id, topic, payload, qos, retained, dup) = match &cmd.kind {
        CommandKind::Publish {
            msg_id,
            topic,
            payload,
            qos,
            retained,
            dup,
        } => (*msg_id, topic.clone(), payload.clone(), *qos, *retained, *dup),
        _ => unreachable!("dispatch_publish only called for Publish commands"),
    };

    let mut registry = engine.registry.lock().await;
    let Some(client) = registry.clients.get_mut(&cmd.client_id) else {
        return;
    };

    let result = ProtocolMachine::start_publish(client, topic, payload, qos, retained, dup, msg_id).await;
    match result {
        Ok(Some(id)) => {
            registry
                .pending_responses
                .entry(cmd.client_id.clone())
                .or_default()
                .insert(id, cmd);
        }
        Ok(None) => {
            drop(registry);
            cmd.complete(Ok(CommandOutcome::Published));
        }
        Err(err) => {
            drop(registry);
            internal_disconnect(engine, &cmd.client_id).await;
            cmd.complete(Err(err));
        }
    }
}

async fn dispatch_disconnect<T: Transport>(engine: &Arc<Engine<T>>, cmd: Command) {
    let mut registry = engine.registry.lock().await;
    let Some(client) = registry.clients.get_mut(&cmd.client_id) else {
        return;
    };

    client.connect_state = ConnectState::Disconnecting;
    client.disconnect_started_at = Some(Instant::now());

    if client.outbound_msgs.is_empty() {
        ProtocolMachine::close_session(client).await;
        drop(registry);
        let mut cmd = cmd;
        cmd.complete(Ok(CommandOutcome::Disconnected));
        return;
    }

    registry.pending_disconnect.insert(cmd.client_id.clone(), cmd);
}

pub(super) async fn write_packet(
    client: &mut ClientState,
    encoded: Result<bytes::Bytes, mqtt_core::err::EncodeError>,
) -> Result<(), ClientError> {
    use tokio::io::AsyncWriteExt;
    let encoded = encoded?;
    let socket = client
        .socket
        .as_mut()
        .ok_or_else(|| ClientError::new(crate::error::ClientErrorKind::Disconnected, "client has no active socket"))?;
    socket.write_all(&encoded).await?;
    client.last_sent = Instant::now();
    Ok(())
}

/// Closes the session and, if a disconnect wasn't user-initiated, raises
/// `on_connection_lost`. Called whenever a dispatch hits a transport error
/// mid-flight (§7 "TransportError").
pub(super) async fn internal_disconnect<T: Transport>(engine: &Arc<Engine<T>>, client_id: &str) {
    let mut registry = engine.registry.lock().await;
    let Some(client) = registry.clients.get_mut(client_id) else {
        return;
    };
    let was_connected = client.connected;
    ProtocolMachine::close_session(client).await;
    let callback = client.callbacks.on_connection_lost.as_ref();
    if was_connected {
        if let Some(cb) = callback {
            cb(None);
        }
    }
}

/// Runs the keepalive and retry scans across every client once per Sender
/// wakeup (§4.5 keepalive/retry scan), plus due automatic reconnects.
async fn run_periodic_scans<T: Transport>(engine: &Arc<Engine<T>>, now: Instant) {
    let client_ids: Vec<String> = {
        let registry = engine.registry.lock().await;
        registry.clients.keys().cloned().collect()
    };

    for client_id in client_ids {
        let mut registry = engine.registry.lock().await;
        let Some(client) = registry.clients.get_mut(&client_id) else {
            continue;
        };

        match ProtocolMachine::keepalive(client, now) {
            KeepaliveAction::None => {}
            KeepaliveAction::SendPing => {
                let _ = ProtocolMachine::send_pingreq(client).await;
            }
            KeepaliveAction::ConnectionLost => {
                drop(registry);
                internal_disconnect(engine, &client_id).await;
                continue;
            }
        }

        if ProtocolMachine::retry(client, now, false).await.is_err() {
            drop(registry);
            internal_disconnect(engine, &client_id).await;
            continue;
        }

        if !client.connected && client.automatic_reconnect {
            if let Some(due) = client.reconnect_at {
                if now >= due {
                    client.reconnect_at = None;
                    let server_uris = client.server_uris.clone();
                    let current_uri_index = client.current_uri_index;
                    let mqtt_version_attempt = client.mqtt_version_attempt;
                    drop(registry);

                    let reconnect = Command {
                        client_id: client_id.clone(),
                        kind: CommandKind::Connect {
                            timeout: Duration::from_secs(30),
                            server_uris,
                            current_uri_index,
                            mqtt_version_attempt,
                        },
                        token: crate::engine::command::Token::synthetic(),
                        submitted_at: Instant::now(),
                        completion: None,
                        persisted_seqno: None,
                        on_success: None,
                        on_failure: None,
                    };
                    let mut queue = engine.queue.lock().await;
                    queue.enqueue(reconnect);
                    drop(queue);
                    engine.notify.notify_one();
                }
            }
        }
    }
}

async fn run_check_timeouts<T: Transport>(engine: &Arc<Engine<T>>, now: Instant) {
    let client_ids: Vec<String> = {
        let registry = engine.registry.lock().await;
        registry.clients.keys().cloned().collect()
    };

    for client_id in client_ids {
        let mut registry = engine.registry.lock().await;
        let Some(client) = registry.clients.get_mut(&client_id) else {
            continue;
        };

        match ProtocolMachine::check_timeouts(client, now) {
            TimeoutAction::None => {}
            TimeoutAction::FallbackConnect => {
                let pending = registry.pending_connect.remove(&client_id);
                drop(registry);
                if let Some(cmd) = pending {
                    fail_or_fallback(
                        engine,
                        cmd,
                        ClientError::new(crate::error::ClientErrorKind::Timeout, "CONNECT timed out"),
                    )
                    .await;
                }
            }
            TimeoutAction::CloseSession => {
                ProtocolMachine::close_session(client).await;
                let pending = registry.pending_disconnect.remove(&client_id);
                drop(registry);
                if let Some(mut cmd) = pending {
                    cmd.complete(Ok(CommandOutcome::Disconnected));
                }
            }
        }
    }
}
