//! Drives the engine against an in-process mock broker over real loopback
//! sockets, covering the end-to-end scenarios a unit test can't reach:
//! QoS round trips, multi-topic SUBACK grants, crash/restart replay, and
//! multi-URI fallback. The broker is just a `TcpListener` speaking the wire
//! protocol by hand via `mqtt_core`/`mqtt_client::net`, so every exchange here
//! is the real codec, not a stand-in.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mqtt_client::{
    net, Callbacks, Client, ConnectOptions, Engine, EngineConfig, MemStore, QosLevel, Socket,
    Store, SubAckQoS, TokioTransport,
};
use mqtt_core::{
    qos::QosLevel as CoreQos, topic::TopicName, ConnAckPacket, ConnectReturnCode, MqttPacket,
    PubAckPacket, PubRelPacket, PublishPacket, SubAckPacket, UnsubAckPacket,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
    let addr = listener.local_addr().expect("listener has a local addr");
    (listener, format!("tcp://{addr}"))
}

async fn accept(listener: TcpListener) -> Socket {
    let (stream, _) = listener.accept().await.expect("accept one connection");
    stream.set_nodelay(true).ok();
    Socket::Plain(stream)
}

async fn send(socket: &mut Socket, bytes: Bytes) {
    socket.write_all(&bytes).await.expect("write to test socket");
}

async fn expect_connect(socket: &mut Socket) {
    match net::read_packet(socket).await.expect("read CONNECT") {
        Some(MqttPacket::Connect(_)) => {}
        other => panic!("expected CONNECT, got {other:?}"),
    }
}

fn new_engine() -> Arc<Engine<TokioTransport>> {
    Engine::new(TokioTransport::new(), EngineConfig::default())
}

/// S1: a QoS 0 publish has no ack to wait for — the command completes as
/// soon as the bytes are on the wire, and the broker only needs to observe
/// the PUBLISH to confirm the payload made it across intact.
#[tokio::test]
async fn qos0_publish_completes_without_an_ack() {
    let (listener, uri) = listener().await;
    let broker = tokio::spawn(async move {
        let mut socket = accept(listener).await;
        expect_connect(&mut socket).await;
        send(&mut socket, ConnAckPacket { session_present: false, return_code: ConnectReturnCode::Accepted }.encode()).await;

        match net::read_packet(&mut socket).await.expect("read PUBLISH") {
            Some(MqttPacket::Publish(p)) => {
                assert_eq!(p.topic().as_str(), "telemetry/temp");
                assert_eq!(p.payload(), &Bytes::from_static(b"21.5"));
                assert_eq!(p.qos(), CoreQos::AtMostOnce);
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    });

    let engine = new_engine();
    let client = Client::create(Arc::clone(&engine), "qos0-client", uri, None).await.unwrap();
    let token = client.connect(ConnectOptions::default()).await.unwrap();
    client.wait_for_completion(token, Duration::from_secs(5)).await.unwrap();

    let token = client
        .publish("telemetry/temp", Bytes::from_static(b"21.5"), QosLevel::AtMostOnce, false)
        .await
        .unwrap();
    client.wait_for_completion(token, Duration::from_secs(5)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
    client.destroy().await.unwrap();
}

/// S2: a QoS 2 publish pushed down from the broker must round-trip through
/// PUBREC/PUBREL/PUBCOMP before `on_message_arrived` fires exactly once, and
/// the payload handed to the callback must match what the broker sent.
#[tokio::test]
async fn qos2_inbound_message_completes_the_full_handshake() {
    let (listener, uri) = listener().await;
    let broker = tokio::spawn(async move {
        let mut socket = accept(listener).await;
        expect_connect(&mut socket).await;
        send(&mut socket, ConnAckPacket { session_present: false, return_code: ConnectReturnCode::Accepted }.encode()).await;

        match net::read_packet(&mut socket).await.expect("read SUBSCRIBE") {
            Some(MqttPacket::Subscribe(_)) => {}
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        }
        send(&mut socket, SubAckPacket::new(1, vec![SubAckQoS::Qos(QosLevel::ExactlyOnce)]).encode().unwrap()).await;

        let publish = PublishPacket::new(
            TopicName::from_str("sensors/door").unwrap(),
            Bytes::from_static(b"opened"),
            CoreQos::ExactlyOnce,
            false,
            Some(7),
        );
        send(&mut socket, publish.encode().unwrap()).await;

        match net::read_packet(&mut socket).await.expect("read PUBREC") {
            Some(MqttPacket::PubRec(p)) => assert_eq!(p.msg_id(), 7),
            other => panic!("expected PUBREC, got {other:?}"),
        }
        send(&mut socket, PubRelPacket::new(7).encode()).await;

        match net::read_packet(&mut socket).await.expect("read PUBCOMP") {
            Some(MqttPacket::PubComp(p)) => assert_eq!(p.msg_id(), 7),
            other => panic!("expected PUBCOMP, got {other:?}"),
        }
    });

    let engine = new_engine();
    let client = Client::create(Arc::clone(&engine), "qos2-client", uri, None).await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    client
        .set_callbacks(Callbacks {
            on_connection_lost: None,
            on_message_arrived: Some(Box::new(move |topic, payload, qos, retained, dup| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send((topic.as_str().to_string(), payload.clone(), qos, retained, dup));
                }
                true
            })),
            on_delivery_complete: None,
        })
        .await
        .unwrap();

    let token = client.connect(ConnectOptions::default()).await.unwrap();
    client.wait_for_completion(token, Duration::from_secs(5)).await.unwrap();

    let token = client.subscribe("sensors/door", QosLevel::ExactlyOnce).await.unwrap();
    client.wait_for_completion(token, Duration::from_secs(5)).await.unwrap();

    let (topic, payload, qos, retained, dup) = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(topic, "sensors/door");
    assert_eq!(payload, Bytes::from_static(b"opened"));
    assert_eq!(qos, QosLevel::ExactlyOnce);
    assert!(!retained);
    assert!(!dup);

    tokio::time::timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
    client.destroy().await.unwrap();
}

/// S4: a SUBSCRIBE for several filters at once gets one SUBACK back carrying
/// a per-filter grant, including a downgrade and an outright rejection.
#[tokio::test]
async fn subscribe_many_reports_per_filter_grants() {
    let (listener, uri) = listener().await;
    let broker = tokio::spawn(async move {
        let mut socket = accept(listener).await;
        expect_connect(&mut socket).await;
        send(&mut socket, ConnAckPacket { session_present: false, return_code: ConnectReturnCode::Accepted }.encode()).await;

        match net::read_packet(&mut socket).await.expect("read SUBSCRIBE") {
            Some(MqttPacket::Subscribe(s)) => assert_eq!(s.filters().len(), 2),
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        }
        send(
            &mut socket,
            SubAckPacket::new(1, vec![SubAckQoS::Qos(QosLevel::AtLeastOnce), SubAckQoS::Failure]).encode().unwrap(),
        )
        .await;
    });

    let engine = new_engine();
    let client = Client::create(Arc::clone(&engine), "multi-sub-client", uri, None).await.unwrap();
    let token = client.connect(ConnectOptions::default()).await.unwrap();
    client.wait_for_completion(token, Duration::from_secs(5)).await.unwrap();

    let token = client
        .subscribe_many(&[("a/topic", QosLevel::ExactlyOnce), ("b/topic", QosLevel::AtLeastOnce)])
        .await
        .unwrap();
    let outcome = client.wait_for_completion(token, Duration::from_secs(5)).await.unwrap();
    match outcome {
        mqtt_client::CommandOutcome::Subscribed(grants) => {
            assert_eq!(grants, vec![SubAckQoS::Qos(QosLevel::AtLeastOnce), SubAckQoS::Failure]);
        }
        other => panic!("expected Subscribed, got {other:?}"),
    }

    tokio::time::timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
    client.destroy().await.unwrap();
}

/// A single-filter SUBSCRIBE whose SUBACK grants `0x80` completes with
/// failure rather than a `Subscribed` outcome (§6 "SUBACK 0x80 means
/// failure", distinguished from the multi-filter case in S4 above).
#[tokio::test]
async fn subscribe_single_filter_rejection_completes_with_failure() {
    let (listener, uri) = listener().await;
    let broker = tokio::spawn(async move {
        let mut socket = accept(listener).await;
        expect_connect(&mut socket).await;
        send(&mut socket, ConnAckPacket { session_present: false, return_code: ConnectReturnCode::Accepted }.encode()).await;

        match net::read_packet(&mut socket).await.expect("read SUBSCRIBE") {
            Some(MqttPacket::Subscribe(s)) => assert_eq!(s.filters().len(), 1),
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        }
        send(&mut socket, SubAckPacket::new(1, vec![SubAckQoS::Failure]).encode().unwrap()).await;
    });

    let engine = new_engine();
    let client = Client::create(Arc::clone(&engine), "rejected-sub-client", uri, None).await.unwrap();
    let token = client.connect(ConnectOptions::default()).await.unwrap();
    client.wait_for_completion(token, Duration::from_secs(5)).await.unwrap();

    let token = client.subscribe("forbidden/topic", QosLevel::AtLeastOnce).await.unwrap();
    let outcome = client.wait_for_completion(token, Duration::from_secs(5)).await;
    assert!(outcome.is_err(), "single rejected filter should complete with failure, got {outcome:?}");

    tokio::time::timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
    client.destroy().await.unwrap();
}

/// S5: the first URI in the list is unreachable (nothing listens there), so
/// the Sender must advance the fallback and succeed against the second.
#[tokio::test]
async fn multi_uri_fallback_tries_the_next_uri_on_refusal() {
    let (dead_listener, dead_uri) = listener().await;
    drop(dead_listener);

    let (listener, good_uri) = listener().await;
    let broker = tokio::spawn(async move {
        let mut socket = accept(listener).await;
        expect_connect(&mut socket).await;
        send(&mut socket, ConnAckPacket { session_present: false, return_code: ConnectReturnCode::Accepted }.encode()).await;
    });

    let engine = new_engine();
    let client = Client::create(Arc::clone(&engine), "fallback-client", "tcp://127.0.0.1:1", None)
        .await
        .unwrap();

    let token = client
        .connect(ConnectOptions {
            server_uris: vec![dead_uri, good_uri],
            ..Default::default()
        })
        .await
        .unwrap();
    let outcome = client.wait_for_completion(token, Duration::from_secs(10)).await.unwrap();
    assert!(matches!(outcome, mqtt_client::CommandOutcome::Connected { .. }));

    tokio::time::timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
    client.destroy().await.unwrap();
}

/// S3: a SUBSCRIBE submitted while disconnected is persisted; recreating the
/// client against the same store (standing in for a process restart after a
/// crash) must replay it onto a fresh engine without the caller resubmitting
/// anything, and the broker must see it go out once the new client connects.
#[tokio::test]
async fn restart_replays_a_persisted_subscribe() {
    let store: Arc<dyn Store> = Arc::new(MemStore::new());

    {
        let engine = new_engine();
        let client = Client::create(Arc::clone(&engine), "restart-client", "tcp://127.0.0.1:1", Some(Arc::clone(&store)))
            .await
            .unwrap();
        // Never connects; the command sits in the queue, persisted, until the
        // client is torn down uncleanly (no `disconnect`, just `destroy`).
        let _ = client.subscribe("crash/recovery", QosLevel::AtLeastOnce).await.unwrap();
        client.destroy().await.unwrap();
    }

    let (listener, uri) = listener().await;
    let broker = tokio::spawn(async move {
        let mut socket = accept(listener).await;
        expect_connect(&mut socket).await;
        send(&mut socket, ConnAckPacket { session_present: false, return_code: ConnectReturnCode::Accepted }.encode()).await;

        match net::read_packet(&mut socket).await.expect("read replayed SUBSCRIBE") {
            Some(MqttPacket::Subscribe(s)) => {
                assert_eq!(s.filters()[0].0.as_str(), "crash/recovery");
            }
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        }
    });

    let engine = new_engine();
    let client = Client::create(Arc::clone(&engine), "restart-client", uri, Some(store)).await.unwrap();
    let token = client.connect(ConnectOptions::default()).await.unwrap();
    client.wait_for_completion(token, Duration::from_secs(5)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
    client.destroy().await.unwrap();
}

/// S3: a QoS 1 publish is still in flight (no PUBACK yet) when the broker
/// drops the connection. On reconnect with `clean_session: false` the
/// unacknowledged PUBLISH must go out again immediately, carrying `dup=1`
/// and the same message id, rather than waiting for the next scheduled
/// retry scan (§4.5 "On CONNACK success ... call `retry(now, regardless=true)`").
#[tokio::test]
async fn reconnect_resends_in_flight_qos1_publish_with_dup() {
    let (listener1, uri1) = listener().await;
    let (listener2, uri2) = listener().await;
    let (msg_id_tx, msg_id_rx) = tokio::sync::oneshot::channel::<u16>();

    let first_broker = tokio::spawn(async move {
        let mut socket = accept(listener1).await;
        expect_connect(&mut socket).await;
        send(&mut socket, ConnAckPacket { session_present: false, return_code: ConnectReturnCode::Accepted }.encode()).await;

        let msg_id = match net::read_packet(&mut socket).await.expect("read PUBLISH") {
            Some(MqttPacket::Publish(p)) => {
                assert!(!p.dup(), "first send should not carry dup");
                assert_eq!(p.qos(), CoreQos::AtLeastOnce);
                p.msg_id().expect("qos 1 publish carries a msg_id")
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        };
        msg_id_tx.send(msg_id).ok();
        // No PUBACK: drop the connection to simulate a mid-flight network loss.
    });

    let engine = new_engine();
    let client = Client::create(Arc::clone(&engine), "resend-client", uri1.clone(), None).await.unwrap();

    let connect_opts = |server_uris: Vec<String>| ConnectOptions {
        clean_session: false,
        server_uris,
        ..Default::default()
    };

    let token = client.connect(connect_opts(vec![uri1])).await.unwrap();
    client.wait_for_completion(token, Duration::from_secs(5)).await.unwrap();

    let publish_token = client
        .publish("retry/topic", Bytes::from_static(b"in-flight"), QosLevel::AtLeastOnce, false)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), first_broker).await.unwrap().unwrap();
    let expected_msg_id = tokio::time::timeout(Duration::from_secs(5), msg_id_rx).await.unwrap().unwrap();

    // Give the Receiver a moment to notice the closed socket and mark the
    // client disconnected before reconnecting against the second broker.
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.is_connected().await.unwrap() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client should notice the dropped connection");

    let second_broker = tokio::spawn(async move {
        let mut socket = accept(listener2).await;
        match net::read_packet(&mut socket).await.expect("read CONNECT") {
            Some(MqttPacket::Connect(c)) => assert!(!c.clean_session, "reconnect must keep the prior session"),
            other => panic!("expected CONNECT, got {other:?}"),
        }
        send(&mut socket, ConnAckPacket { session_present: true, return_code: ConnectReturnCode::Accepted }.encode()).await;

        match net::read_packet(&mut socket).await.expect("read resent PUBLISH") {
            Some(MqttPacket::Publish(p)) => {
                assert!(p.dup(), "resent publish must carry dup=1");
                assert_eq!(p.msg_id(), Some(expected_msg_id));
            }
            other => panic!("expected PUBLISH, got {other:?}"),
        }
        send(&mut socket, PubAckPacket::new(expected_msg_id).encode()).await;
    });

    let reconnect_token = client.connect(connect_opts(vec![uri2])).await.unwrap();
    client.wait_for_completion(reconnect_token, Duration::from_secs(5)).await.unwrap();

    // The resend is driven straight off CONNACK, not the ~20s retry scan, so
    // this must resolve well inside the same short timeout every other test uses.
    client.wait_for_completion(publish_token, Duration::from_secs(5)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), second_broker).await.unwrap().unwrap();
    client.destroy().await.unwrap();
}

/// `disconnect` issued while a QoS 1 publish is still in flight must resolve
/// as soon as the matching PUBACK drains `outbound_msgs`, not only once the
/// disconnect timeout expires (§5 "waits up to the timeout ... then closes").
#[tokio::test]
async fn disconnect_completes_promptly_once_in_flight_publish_is_acked() {
    let (listener, uri) = listener().await;
    let broker = tokio::spawn(async move {
        let mut socket = accept(listener).await;
        expect_connect(&mut socket).await;
        send(&mut socket, ConnAckPacket { session_present: false, return_code: ConnectReturnCode::Accepted }.encode()).await;

        let msg_id = match net::read_packet(&mut socket).await.expect("read PUBLISH") {
            Some(MqttPacket::Publish(p)) => p.msg_id().expect("qos 1 publish carries a msg_id"),
            other => panic!("expected PUBLISH, got {other:?}"),
        };

        // Hold the ack back briefly so the disconnect command is definitely
        // parked waiting on `outbound_msgs` before it drains.
        tokio::time::sleep(Duration::from_millis(200)).await;
        send(&mut socket, PubAckPacket::new(msg_id).encode()).await;

        match net::read_packet(&mut socket).await.expect("read DISCONNECT") {
            Some(MqttPacket::Disconnect(_)) => {}
            other => panic!("expected DISCONNECT, got {other:?}"),
        }
    });

    let engine = new_engine();
    let client = Client::create(Arc::clone(&engine), "disconnect-inflight-client", uri, None).await.unwrap();
    let token = client.connect(ConnectOptions::default()).await.unwrap();
    client.wait_for_completion(token, Duration::from_secs(5)).await.unwrap();

    let publish_token = client
        .publish("shutdown/topic", Bytes::from_static(b"draining"), QosLevel::AtLeastOnce, false)
        .await
        .unwrap();

    let disconnect_started = std::time::Instant::now();
    let disconnect_token = client
        .disconnect(mqtt_client::DisconnectOptions { timeout_secs: 10 })
        .await
        .unwrap();

    let outcome = client.wait_for_completion(disconnect_token, Duration::from_secs(5)).await.unwrap();
    assert!(matches!(outcome, mqtt_client::CommandOutcome::Disconnected));
    assert!(
        disconnect_started.elapsed() < Duration::from_secs(2),
        "disconnect should resolve as soon as the PUBACK drains outbound_msgs, not wait for the 10s timeout, took {:?}",
        disconnect_started.elapsed()
    );

    client.wait_for_completion(publish_token, Duration::from_secs(5)).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
    client.destroy().await.unwrap();
}

/// Unsubscribe acks are plumbed through the same pending-response path as
/// subscribe; a single round trip is enough to cover it here.
#[tokio::test]
async fn unsubscribe_completes_on_unsuback() {
    let (listener, uri) = listener().await;
    let broker = tokio::spawn(async move {
        let mut socket = accept(listener).await;
        expect_connect(&mut socket).await;
        send(&mut socket, ConnAckPacket { session_present: false, return_code: ConnectReturnCode::Accepted }.encode()).await;

        match net::read_packet(&mut socket).await.expect("read UNSUBSCRIBE") {
            Some(MqttPacket::Unsubscribe(u)) => assert_eq!(u.filters()[0].as_str(), "old/topic"),
            other => panic!("expected UNSUBSCRIBE, got {other:?}"),
        }
        send(&mut socket, UnsubAckPacket::new(1).encode()).await;
    });

    let engine = new_engine();
    let client = Client::create(Arc::clone(&engine), "unsub-client", uri, None).await.unwrap();
    let token = client.connect(ConnectOptions::default()).await.unwrap();
    client.wait_for_completion(token, Duration::from_secs(5)).await.unwrap();

    let token = client.unsubscribe("old/topic").await.unwrap();
    let outcome = client.wait_for_completion(token, Duration::from_secs(5)).await.unwrap();
    assert!(matches!(outcome, mqtt_client::CommandOutcome::Unsubscribed));

    tokio::time::timeout(Duration::from_secs(5), broker).await.unwrap().unwrap();
    client.destroy().await.unwrap();
}
