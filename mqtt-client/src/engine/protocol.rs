use std::time::{Duration, Instant};

use bytes::Bytes;
use mqtt_core::{
    qos::QosLevel,
    ConnAckPacket, ConnectPacket, DisconnectPacket, MqttVersion, PingReqPacket, PubAckPacket,
    PubCompPacket, PublishPacket, PubRecPacket, PubRelPacket, Will as WireWill,
};
use tokio::io::AsyncWriteExt;

use crate::{
    engine::client_state::{
        ClientState, ConnectState, ExpectedAck, InboundMessage, OutboundMessage,
        QueuedPublication, StoredPublication, VersionPreference,
    },
    error::{ClientError, ClientErrorKind},
};

const MAX_MSG_ID: u16 = u16::MAX;
const RETRY_FLOOR_SECS: u64 = 10;
const CHECK_TIMEOUTS_INTERVAL_SECS: u64 = 3;

/// The next action the Sender/Receiver should take after a keepalive scan.
pub enum KeepaliveAction {
    None,
    SendPing,
    ConnectionLost,
}

/// The next action after a `check_timeouts` pass.
pub enum TimeoutAction {
    None,
    FallbackConnect,
    CloseSession,
}

/// Stateless namespace for the per-client MQTT flow logic (§4.5). Every function
/// takes `&mut ClientState` already proven reachable under the engine lock —
/// none of these re-acquire it (§5, §9 re-entrancy note).
pub struct ProtocolMachine;

impl ProtocolMachine {
    /// Starting from `client.next_msg_id + 1` (mod 65535, wrapping into `1..=65535`),
    /// scans forward for an id not in `outbound_msgs`, `inbound_msgs`, or
    /// `also_reserved` (ids already claimed by commands not yet dispatched).
    /// Returns 0 if a full cycle finds none.
    pub fn assign_msg_id(client: &mut ClientState, also_reserved: &[u16]) -> u16 {
        let mut candidate = client.next_msg_id.wrapping_add(1);
        if candidate == 0 {
            candidate = 1;
        }
        let first = candidate;

        loop {
            let free = !client.outbound_msgs.contains_key(&candidate)
                && !client.inbound_msgs.contains_key(&candidate)
                && !also_reserved.contains(&candidate);

            if free {
                client.next_msg_id = candidate;
                return candidate;
            }

            candidate = if candidate == MAX_MSG_ID { 1 } else { candidate + 1 };
            if candidate == first {
                return 0;
            }
        }
    }

    /// Emits the CONNECT packet for the version/URI currently selected on
    /// `client`, transitioning `connect_state` to `MqttConnectSent`.
    pub async fn send_connect(client: &mut ClientState) -> Result<(), ClientError> {
        let version = match client.mqtt_version_attempt {
            VersionPreference::V3_1 => MqttVersion::V3_1,
            _ => MqttVersion::V3_1_1,
        };

        let will = client.will.as_ref().map(|will| WireWill {
            topic: will.topic.as_str().to_string(),
            payload: will.payload.clone(),
            qos: will.qos,
            retain: will.retained,
        });

        let packet = ConnectPacket {
            version,
            clean_session: client.clean_session,
            keep_alive_secs: client.keep_alive_secs as u16,
            client_id: client.client_id.clone(),
            will,
            username: client.username.clone(),
            password: client.password.clone(),
        };

        let encoded = packet.encode()?;
        let socket = socket_mut(client)?;
        socket.write_all(&encoded).await?;
        client.connect_state = ConnectState::MqttConnectSent;
        client.connect_started_at = Some(Instant::now());
        client.last_sent = Instant::now();
        Ok(())
    }

    /// CONNACK handling: on success, mark the client connected, reset retry
    /// state, flush the offline queue, and force an unconditional retry pass so
    /// unacknowledged QoS 1/2 flows are re-sent immediately rather than waiting
    /// for the next scheduled retry scan (§4.5 "On CONNACK success ... call
    /// `retry(now, regardless=true)`"). On failure the caller is expected to
    /// drive the multi-URI fallback.
    pub async fn complete_connection(client: &mut ClientState, connack: &ConnAckPacket) -> bool {
        if !connack.return_code.is_success() {
            return false;
        }

        client.connected = true;
        client.good = true;
        client.connect_state = ConnectState::Idle;
        client.connect_started_at = None;
        client.current_retry_delay_secs = client.min_retry_interval_secs;
        client.last_received = Instant::now();

        if client.clean_session {
            client.wipe_session_state();
        } else if let Err(err) = Self::retry(client, Instant::now(), true).await {
            log::warn!(
                "`{}` failed to resend in-flight QoS 1/2 work after reconnect: {err}",
                client.client_id
            );
        }

        true
    }

    /// Advances the multi-URI/version fallback described in §4.5: tries the
    /// next URI, then the next MQTT version, before giving up. Returns `true`
    /// if there is another attempt to make (the caller re-prepends a Connect
    /// command), `false` once every combination has been exhausted.
    pub fn advance_fallback(client: &mut ClientState) -> bool {
        if client.current_uri_index + 1 < client.server_uris.len() {
            client.current_uri_index += 1;
            return true;
        }

        if client.mqtt_version_attempt == VersionPreference::Default
            || client.mqtt_version_attempt == VersionPreference::V3_1_1
        {
            if matches!(client.mqtt_version_attempt, VersionPreference::Default) {
                client.mqtt_version_attempt = VersionPreference::V3_1;
                return true;
            }
        }

        false
    }

    /// Allocates an OutboundMessage (qos 1/2) or emits directly (qos 0), per
    /// §4.5 "Publish emission". Returns the msg id actually used, if any.
    pub async fn start_publish(
        client: &mut ClientState,
        topic: mqtt_core::topic::TopicName,
        payload: Bytes,
        qos: QosLevel,
        retained: bool,
        dup: bool,
        msg_id: Option<u16>,
    ) -> Result<Option<u16>, ClientError> {
        let publication = std::sync::Arc::new(StoredPublication {
            topic: topic.clone(),
            payload: payload.clone(),
        });

        let mut packet = PublishPacket::new(topic, payload, qos, retained, msg_id);
        packet.set_dup(dup);

        if qos != QosLevel::AtMostOnce {
            let id = msg_id.expect("qos>0 publish always carries a pre-allocated msg_id");
            client.outbound_msgs.insert(
                id,
                OutboundMessage {
                    msg_id: id,
                    qos,
                    retained,
                    publication,
                    next_expected: ExpectedAck::PubAck,
                    last_touch: Instant::now(),
                },
            );
        }

        let encoded = packet.encode()?;
        let socket = socket_mut(client)?;
        socket.write_all(&encoded).await?;
        client.last_sent = Instant::now();
        Ok(packet.msg_id())
    }

    /// §4.5 "Publish intake": qos 0 is handed straight to the delivery queue;
    /// qos 1 is ack'd before delivery; qos 2 is stored and ack'd with PUBREC,
    /// with actual delivery deferred until the matching PUBREL.
    pub async fn handle_publish(
        client: &mut ClientState,
        packet: PublishPacket,
        seqno: u64,
    ) -> Result<Option<QueuedPublication>, ClientError> {
        let queued = QueuedPublication {
            topic: packet.topic().clone(),
            payload: packet.payload().clone(),
            qos: packet.qos(),
            retained: packet.retain(),
            msg_id: packet.msg_id(),
            dup: packet.dup(),
            seqno,
        };

        match packet.qos() {
            QosLevel::AtMostOnce => Ok(Some(queued)),
            QosLevel::AtLeastOnce => {
                let msg_id = packet.msg_id().expect("qos 1 PUBLISH always carries a msg_id");
                let encoded = PubAckPacket::new(msg_id).encode();
                socket_mut(client)?.write_all(&encoded).await?;
                client.last_sent = Instant::now();
                Ok(Some(queued))
            }
            QosLevel::ExactlyOnce => {
                let msg_id = packet.msg_id().expect("qos 2 PUBLISH always carries a msg_id");
                let publication = std::sync::Arc::new(StoredPublication {
                    topic: packet.topic().clone(),
                    payload: packet.payload().clone(),
                });
                client.inbound_msgs.insert(
                    msg_id,
                    InboundMessage {
                        msg_id,
                        qos: QosLevel::ExactlyOnce,
                        retained: packet.retain(),
                        publication,
                    },
                );
                let encoded = PubRecPacket::new(msg_id).encode();
                socket_mut(client)?.write_all(&encoded).await?;
                client.last_sent = Instant::now();
                Ok(None)
            }
        }
    }

    /// Completes the qos 2 inbound flow on PUBREL: acks with PUBCOMP and
    /// returns the stored publication for delivery.
    pub async fn handle_pubrel(
        client: &mut ClientState,
        msg_id: u16,
        seqno: u64,
    ) -> Result<Option<QueuedPublication>, ClientError> {
        let Some(inbound) = client.inbound_msgs.remove(&msg_id) else {
            return Ok(None);
        };

        let encoded = PubCompPacket::new(msg_id).encode();
        socket_mut(client)?.write_all(&encoded).await?;
        client.last_sent = Instant::now();

        Ok(Some(QueuedPublication {
            topic: inbound.publication.topic.clone(),
            payload: inbound.publication.payload.clone(),
            qos: QosLevel::ExactlyOnce,
            retained: inbound.retained,
            msg_id: Some(msg_id),
            dup: false,
            seqno,
        }))
    }

    /// §4.5 "Keepalive scan": called once per Sender wakeup.
    pub fn keepalive(client: &ClientState, now: Instant) -> KeepaliveAction {
        if !client.connected || client.keep_alive_secs == 0 {
            return KeepaliveAction::None;
        }

        let silent_for_send = now.duration_since(client.last_sent).as_secs() >= client.keep_alive_secs;
        let silent_for_recv = now.duration_since(client.last_received).as_secs() >= client.keep_alive_secs;

        if !silent_for_send && !silent_for_recv {
            return KeepaliveAction::None;
        }

        if client.ping_outstanding {
            KeepaliveAction::ConnectionLost
        } else {
            KeepaliveAction::SendPing
        }
    }

    pub async fn send_pingreq(client: &mut ClientState) -> Result<(), ClientError> {
        let encoded = PingReqPacket.encode();
        socket_mut(client)?.write_all(&encoded).await?;
        client.ping_outstanding = true;
        client.last_sent = Instant::now();
        Ok(())
    }

    /// §4.5 "Retry scan": re-sends unacknowledged QoS 1/2 flows whose
    /// `last_touch` has aged past the retry interval, or unconditionally when
    /// `regardless` (post-reconnect resync).
    pub async fn retry(client: &mut ClientState, now: Instant, regardless: bool) -> Result<(), ClientError> {
        if !client.connected {
            return Ok(());
        }

        let threshold = Duration::from_secs(client.retry_interval_secs.max(RETRY_FLOOR_SECS));
        let due: Vec<u16> = client
            .outbound_msgs
            .iter()
            .filter(|(_, msg)| regardless || now.duration_since(msg.last_touch) >= threshold)
            .map(|(id, _)| *id)
            .collect();

        for msg_id in due {
            let (qos, next_expected, topic, payload, retained) = {
                let msg = client
                    .outbound_msgs
                    .get(&msg_id)
                    .expect("scanned id was just observed in outbound_msgs");
                (
                    msg.qos,
                    msg.next_expected,
                    msg.publication.topic.clone(),
                    msg.publication.payload.clone(),
                    msg.retained,
                )
            };

            let encoded = match next_expected {
                ExpectedAck::PubAck | ExpectedAck::PubRec => {
                    let mut packet = PublishPacket::new(topic, payload, qos, retained, Some(msg_id));
                    packet.set_dup(true);
                    packet.encode()?
                }
                ExpectedAck::PubComp => PubRelPacket::new(msg_id).encode(),
            };

            socket_mut(client)?.write_all(&encoded).await?;
            client.last_sent = Instant::now();
            if let Some(msg) = client.outbound_msgs.get_mut(&msg_id) {
                msg.last_touch = now;
            }
        }

        Ok(())
    }

    /// §4.5 "Check-timeouts": CONNECT timeout triggers the fallback path;
    /// an expired disconnect timeout forces the session closed.
    pub fn check_timeouts(client: &ClientState, now: Instant) -> TimeoutAction {
        if let Some(started) = client.connect_started_at {
            if now.duration_since(started).as_secs() >= client.connect_timeout_secs {
                return TimeoutAction::FallbackConnect;
            }
        }

        if client.connect_state == ConnectState::Disconnecting {
            if let Some(started) = client.disconnect_started_at {
                if now.duration_since(started).as_secs() >= client.disconnect_timeout_secs {
                    return TimeoutAction::CloseSession;
                }
            }
        }

        TimeoutAction::None
    }

    pub fn should_run_check_timeouts(last_run: Instant, now: Instant) -> bool {
        now.duration_since(last_run).as_secs() >= CHECK_TIMEOUTS_INTERVAL_SECS
    }

    /// Zeroes the socket and connection flags, sending a DISCONNECT first if
    /// still connected.
    pub async fn close_only(client: &mut ClientState) {
        if client.connected {
            if let Some(socket) = client.socket.as_mut() {
                let _ = socket.write_all(&DisconnectPacket.encode()).await;
            }
        }
        client.socket = None;
        client.connected = false;
        client.ping_outstanding = false;
        client.connect_state = ConnectState::Idle;
        client.connect_started_at = None;
        client.disconnect_started_at = None;
    }

    /// `close_only` plus a clean-session purge when applicable (invariant 6, §3).
    pub async fn close_session(client: &mut ClientState) {
        Self::close_only(client).await;
        if client.clean_session {
            client.wipe_session_state();
        }
    }
}

fn socket_mut(client: &mut ClientState) -> Result<&mut crate::transport::Socket, ClientError> {
    client
        .socket
        .as_mut()
        .ok_or_else(|| ClientError::new(ClientErrorKind::Disconnected, "client has no active socket"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_client() -> ClientState {
        ClientState::new("client-a".to_string(), "tcp://localhost:1883".to_string())
    }

    #[test]
    fn assign_msg_id_skips_in_use_ids() {
        let mut client = fresh_client();
        client.next_msg_id = 0;
        let first = ProtocolMachine::assign_msg_id(&mut client, &[]);
        assert_eq!(first, 1);

        client.outbound_msgs.insert(
            2,
            OutboundMessage {
                msg_id: 2,
                qos: QosLevel::AtLeastOnce,
                retained: false,
                publication: std::sync::Arc::new(StoredPublication {
                    topic: mqtt_core::topic::TopicName::from_str("t").unwrap(),
                    payload: Bytes::new(),
                }),
                next_expected: ExpectedAck::PubAck,
                last_touch: Instant::now(),
            },
        );

        let second = ProtocolMachine::assign_msg_id(&mut client, &[]);
        assert_eq!(second, 3);
    }

    #[test]
    fn assign_msg_id_returns_zero_when_exhausted() {
        let mut client = fresh_client();
        for id in 1..=MAX_MSG_ID {
            client.outbound_msgs.insert(
                id,
                OutboundMessage {
                    msg_id: id,
                    qos: QosLevel::AtLeastOnce,
                    retained: false,
                    publication: std::sync::Arc::new(StoredPublication {
                        topic: mqtt_core::topic::TopicName::from_str("t").unwrap(),
                        payload: Bytes::new(),
                    }),
                    next_expected: ExpectedAck::PubAck,
                    last_touch: Instant::now(),
                },
            );
        }
        assert_eq!(ProtocolMachine::assign_msg_id(&mut client, &[]), 0);
    }

    #[test]
    fn keepalive_requires_ping_before_declaring_loss() {
        let mut client = fresh_client();
        client.connected = true;
        client.keep_alive_secs = 1;
        client.last_sent = Instant::now() - Duration::from_secs(5);
        client.last_received = Instant::now() - Duration::from_secs(5);

        assert!(matches!(
            ProtocolMachine::keepalive(&client, Instant::now()),
            KeepaliveAction::SendPing
        ));

        client.ping_outstanding = true;
        assert!(matches!(
            ProtocolMachine::keepalive(&client, Instant::now()),
            KeepaliveAction::ConnectionLost
        ));
    }

    #[test]
    fn fallback_steps_through_uris_then_versions() {
        let mut client = fresh_client();
        client.server_uris = vec!["tcp://a:1".to_string(), "tcp://b:1".to_string()];
        client.current_uri_index = 0;

        assert!(ProtocolMachine::advance_fallback(&mut client));
        assert_eq!(client.current_uri_index, 1);

        assert!(ProtocolMachine::advance_fallback(&mut client));
        assert_eq!(client.mqtt_version_attempt, VersionPreference::V3_1);

        assert!(!ProtocolMachine::advance_fallback(&mut client));
    }
}
