//! End-to-end scenarios from spec.md §8, exercised against the public
//! `Client`/`Server` API over an in-memory loopback carrier (no real
//! sockets — `rt-ws-carrier` is covered separately). Each scenario test
//! owns its own pair so they can't interfere with each other's timers.

use async_trait::async_trait;
use rt_transport_core::{
    Client, Connection, ConnectionError, Dialer, EstablishedConnection, Event, EventKind, Server,
    TransportConfig,
};
use rt_wire::{Codec, JsonCodec, PartialMessage, Payload};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One direction of an in-memory "wire": bytes pushed in arrive verbatim on
/// the receiving end's inbound channel, unless `blackhole` is set — then
/// they are silently dropped, simulating a dead link that neither side can
/// see closing (spec.md §8 scenario 3, "phantom disconnect").
struct ChannelConnection {
    tx: mpsc::Sender<Vec<u8>>,
    blackhole: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        if self.blackhole.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.tx.send(frame).await.map_err(|_| ConnectionError::Closed)
    }

    async fn close(&self) {}
}

/// Dials a fixed `Server` in-process, handing it one half of a channel pair
/// and returning the other half as the dial result — no sockets. Keeps the
/// last client-to-server raw sender around so tests can inject forged
/// frames directly onto the "wire" (used by the misbehaving-peer scenario).
struct LoopbackDialer {
    server: StdMutex<Arc<Server>>,
    blackhole: Arc<AtomicBool>,
    last_client_to_server_tx: StdMutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl LoopbackDialer {
    fn new(server: Arc<Server>) -> Arc<Self> {
        Arc::new(LoopbackDialer {
            server: StdMutex::new(server),
            blackhole: Arc::new(AtomicBool::new(false)),
            last_client_to_server_tx: StdMutex::new(None),
        })
    }

    fn set_blackhole(&self, on: bool) {
        self.blackhole.store(on, Ordering::SeqCst);
    }

    fn swap_server(&self, server: Arc<Server>) {
        *self.server.lock().unwrap() = server;
    }

    fn raw_client_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.last_client_to_server_tx.lock().unwrap().clone().expect("dial happened at least once")
    }
}

#[async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self, _peer: &str) -> Result<EstablishedConnection, std::io::Error> {
        let (c2s_tx, c2s_rx) = mpsc::channel::<Vec<u8>>(64);
        let (s2c_tx, s2c_rx) = mpsc::channel::<Vec<u8>>(64);
        *self.last_client_to_server_tx.lock().unwrap() = Some(c2s_tx.clone());

        let server = self.server.lock().unwrap().clone();
        let established_for_server = EstablishedConnection {
            connection: Arc::new(ChannelConnection { tx: s2c_tx, blackhole: self.blackhole.clone() }),
            inbound: c2s_rx,
        };
        tokio::spawn(async move {
            server.handle_connection(established_for_server).await;
        });

        Ok(EstablishedConnection {
            connection: Arc::new(ChannelConnection { tx: c2s_tx, blackhole: self.blackhole.clone() }),
            inbound: s2c_rx,
        })
    }
}

fn fast_config() -> TransportConfig {
    TransportConfig {
        heartbeat_interval: Duration::from_millis(30),
        heartbeats_until_dead: 2,
        session_disconnect_grace: Duration::from_millis(500),
        handshake_timeout: Duration::from_millis(150),
        base_interval: Duration::from_millis(10),
        max_jitter: Duration::from_millis(5),
        budget_restore_interval: Duration::from_millis(20),
        ..TransportConfig::default()
    }
}

fn collect_events(target: &Arc<StdMutex<Vec<Event>>>) -> impl Fn(&Event) + Send + Sync + 'static {
    let target = target.clone();
    move |event: &Event| target.lock().unwrap().push(event.clone())
}

#[tokio::test]
async fn basic_rpc_echoes_a_single_message_with_seq_zero_on_both_sides() {
    let server = Server::new("server", fast_config());
    let server_events: Arc<StdMutex<Vec<Event>>> = Arc::new(StdMutex::new(Vec::new()));
    let server_for_echo = server.clone();
    server.add_event_listener(EventKind::Message, collect_events(&server_events));
    server.add_event_listener(EventKind::Message, move |event| {
        let Event::Message(msg) = event else { return };
        let Payload::App(payload) = msg.payload.clone() else { return };
        let server = server_for_echo.clone();
        let to = msg.from.clone();
        let stream_id = msg.stream_id.clone();
        tokio::spawn(async move {
            let _ = server.send(&to, PartialMessage::app(to.clone(), stream_id, payload)).await;
        });
    });

    let dialer = LoopbackDialer::new(server.clone());
    let client = Client::new("client", dialer, fast_config());
    let client_events: Arc<StdMutex<Vec<Event>>> = Arc::new(StdMutex::new(Vec::new()));
    client.add_event_listener(EventKind::Message, collect_events(&client_events));

    client.connect("server").await.unwrap();
    client
        .send("server", PartialMessage::app("server", "rpc-1", serde_json::json!({"n": 3})))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let server_msgs: Vec<_> = server_events.lock().unwrap().clone();
    assert_eq!(server_msgs.len(), 1);
    let Event::Message(m) = &server_msgs[0] else { panic!() };
    assert_eq!(m.seq, 0);
    assert_eq!(m.payload, Payload::App(serde_json::json!({"n": 3})));

    let client_msgs: Vec<_> = client_events.lock().unwrap().clone();
    assert_eq!(client_msgs.len(), 1, "client should see exactly one echoed delivery");
    let Event::Message(m) = &client_msgs[0] else { panic!() };
    assert_eq!(m.seq, 0, "server's outbound seq to client also starts at 0");
    assert_eq!(m.payload, Payload::App(serde_json::json!({"n": 3})));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn transparent_reconnect_delivers_everything_in_order_with_no_duplicates() {
    let server = Server::new("server", fast_config());
    let received: Arc<StdMutex<Vec<u64>>> = Arc::new(StdMutex::new(Vec::new()));
    let received2 = received.clone();
    server.add_event_listener(EventKind::Message, move |event| {
        if let Event::Message(msg) = event {
            if let Payload::App(v) = &msg.payload {
                received2.lock().unwrap().push(v.as_u64().unwrap());
            }
        }
    });

    let dialer = LoopbackDialer::new(server.clone());
    let client = Client::new("client", dialer.clone(), fast_config());
    client.connect("server").await.unwrap();

    for i in 0..55u64 {
        client.send("server", PartialMessage::app("server", "upload", serde_json::json!(i))).await.unwrap();
    }

    // Simulate the link going dark: sends while disconnected land only in
    // the client's send buffer, to be replayed once the link returns.
    dialer.set_blackhole(true);
    // Let the client's heartbeat clock notice and drop the dead connection.
    tokio::time::sleep(Duration::from_millis(150)).await;

    for i in 55..90u64 {
        client.send("server", PartialMessage::app("server", "upload", serde_json::json!(i))).await.unwrap();
    }

    dialer.set_blackhole(false);
    // Client's reconnect-on-drop picks this back up automatically.
    tokio::time::sleep(Duration::from_millis(300)).await;

    for i in 90..100u64 {
        client.send("server", PartialMessage::app("server", "upload", serde_json::json!(i))).await.unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    let got = received.lock().unwrap().clone();
    assert_eq!(got, (0..100u64).collect::<Vec<_>>(), "all 100 items delivered in order, no duplicates");

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn phantom_disconnect_reconnects_transparently_with_session_id_unchanged() {
    let server = Server::new("server", fast_config());
    let client_sessions: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    let client_sessions2 = client_sessions.clone();

    let dialer = LoopbackDialer::new(server.clone());
    let client = Client::new("client", dialer.clone(), fast_config());
    client.add_event_listener(EventKind::SessionStatus, move |event| {
        if let Event::SessionStatus { session_id, .. } = event {
            client_sessions2.lock().unwrap().push(session_id.clone());
        }
    });

    client.connect("server").await.unwrap();
    dialer.set_blackhole(true);
    // heartbeat_interval=30ms * (heartbeats_until_dead=2 + 1) plus margin.
    tokio::time::sleep(Duration::from_millis(150)).await;
    dialer.set_blackhole(false);
    tokio::time::sleep(Duration::from_millis(300)).await;

    client.connect("server").await.unwrap();

    let ids = client_sessions.lock().unwrap().clone();
    assert_eq!(
        ids.len(),
        1,
        "a transparent reconnect must not re-fire sessionStatus (spec.md §7 connect/disconnect counters stay at (1,0)): {ids:?}"
    );

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn hard_reconnect_after_server_restart_gets_a_fresh_session_id() {
    let server_a = Server::new("server", fast_config());
    let dialer = LoopbackDialer::new(server_a.clone());
    let client = Client::new("client", dialer.clone(), fast_config());

    let session_events: Arc<StdMutex<Vec<Event>>> = Arc::new(StdMutex::new(Vec::new()));
    client.add_event_listener(EventKind::SessionStatus, collect_events(&session_events));

    client.connect("server").await.unwrap();
    let first_id = {
        let events = session_events.lock().unwrap();
        let Event::SessionStatus { session_id, .. } = &events[0] else { panic!() };
        session_id.clone()
    };

    // "Restart the server": a fresh Server with no memory of the old
    // session id, reachable through the same dialer. The client has no
    // direct signal this happened — closing `server_a` doesn't touch the
    // client's own connection half, so it discovers the dead link the same
    // way it would discover a real network failure: missed heartbeats.
    server_a.close().await;
    let server_b = Server::new("server", fast_config());
    dialer.swap_server(server_b.clone());

    // heartbeat_interval=30ms * (heartbeats_until_dead=2 + 1) to notice the
    // link is dead, plus time for the automatic reconnect to land on server_b.
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.connect("server").await.unwrap();

    let events = session_events.lock().unwrap().clone();
    let disconnect_then_connect = events.iter().any(|e| matches!(e, Event::SessionStatus { status, .. } if matches!(status, rt_transport_core::ConnStatus::Disconnect)));
    assert!(disconnect_then_connect, "expect a disconnect event before the fresh session connects");

    let last_id = {
        let Event::SessionStatus { session_id, status, .. } = events.last().unwrap() else { panic!() };
        assert!(matches!(status, rt_transport_core::ConnStatus::Connect));
        session_id.clone()
    };
    assert_ne!(first_id, last_id, "server restart must produce a new session id, not reuse the old one");

    client.close().await;
    server_b.close().await;
}

#[tokio::test]
async fn handshake_version_mismatch_rejects_and_creates_no_session() {
    let mut server_config = fast_config();
    server_config.protocol_version = "v1".to_owned();
    let server = Server::new("server", server_config);

    let protocol_errors: Arc<StdMutex<Vec<Event>>> = Arc::new(StdMutex::new(Vec::new()));
    server.add_event_listener(EventKind::ProtocolError, collect_events(&protocol_errors));

    let dialer = LoopbackDialer::new(server.clone());
    let mut client_config = fast_config();
    client_config.protocol_version = "v2".to_owned();
    let client = Client::new("client", dialer, client_config);

    let err = client.connect("server").await.unwrap_err();
    assert!(matches!(err, rt_transport_core::ClientError::HandshakeRejected(_)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let errors = protocol_errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        Event::ProtocolError { kind: rt_transport_core::ProtocolErrorKind::HandshakeFailed { .. }, .. }
    ));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn stream_control_helpers_carry_their_flag_through_to_the_message_event() {
    let server = Server::new("server", fast_config());
    let received: Arc<StdMutex<Vec<Event>>> = Arc::new(StdMutex::new(Vec::new()));
    server.add_event_listener(EventKind::Message, collect_events(&received));

    let dialer = LoopbackDialer::new(server.clone());
    let client = Client::new("client", dialer, fast_config());
    client.connect("server").await.unwrap();

    client.send_close_stream("server", "stream-a").await.unwrap();
    client.send_request_close("server", "stream-b").await.unwrap();
    client.send_abort("server", "stream-c").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = received.lock().unwrap().clone();
    assert_eq!(events.len(), 3);
    let flags: Vec<_> = events
        .iter()
        .map(|e| {
            let Event::Message(m) = e else { panic!() };
            (m.stream_id.clone(), m.control_flags)
        })
        .collect();
    assert!(flags.contains(&("stream-a".to_owned(), rt_wire::ControlFlags::STREAM_CLOSED)));
    assert!(flags.contains(&("stream-b".to_owned(), rt_wire::ControlFlags::STREAM_CLOSE_REQUEST)));
    assert!(flags.contains(&("stream-c".to_owned(), rt_wire::ControlFlags::STREAM_ABORT)));

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn metrics_count_delivered_duplicate_and_fatal_messages_separately() {
    let server = Server::new("server", fast_config());
    let dialer = LoopbackDialer::new(server.clone());
    let client = Client::new("client", dialer.clone(), fast_config());
    client.connect("server").await.unwrap();

    client.send("server", PartialMessage::app("server", "s1", serde_json::json!(1))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(server.metrics().await.messages_delivered, 1);

    // Replay the exact same frame the client already sent at seq 0 — a
    // duplicate the server must drop without advancing its ack.
    let duplicate = rt_wire::TransportMessage {
        id: "dup-1".to_owned(),
        from: "client".to_owned(),
        to: "server".to_owned(),
        seq: 0,
        ack: 0,
        stream_id: "s1".to_owned(),
        service_name: None,
        procedure_name: None,
        control_flags: rt_wire::ControlFlags::NONE,
        tracing: None,
        payload: Payload::App(serde_json::json!(1)),
    };
    let bytes = JsonCodec.encode(&duplicate).unwrap();
    let frame = rt_transport_core::framing::encode_frame(&bytes);
    dialer.raw_client_sender().send(frame).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let metrics = server.metrics().await;
    assert_eq!(metrics.messages_delivered, 1, "the duplicate must not count as delivered");
    assert_eq!(metrics.duplicates_dropped, 1);
    assert_eq!(metrics.out_of_order_fatal, 0);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn misbehaving_peer_forging_a_seq_gap_is_fatal_to_the_session() {
    let server = Server::new("server", fast_config());
    let protocol_errors: Arc<StdMutex<Vec<Event>>> = Arc::new(StdMutex::new(Vec::new()));
    server.add_event_listener(EventKind::ProtocolError, collect_events(&protocol_errors));
    let session_events: Arc<StdMutex<Vec<Event>>> = Arc::new(StdMutex::new(Vec::new()));
    server.add_event_listener(EventKind::SessionStatus, collect_events(&session_events));

    let dialer = LoopbackDialer::new(server.clone());
    let client = Client::new("client", dialer.clone(), fast_config());
    client.connect("server").await.unwrap();

    // A well-formed message at seq 0 first, so the server's expected-ack
    // pointer sits at 1 before the forged jump.
    client.send("server", PartialMessage::app("server", "s1", serde_json::json!({"ok": true}))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Forge a message claiming seq 10 directly on the wire, bypassing the
    // client's own sequencing.
    let forged = rt_wire::TransportMessage {
        id: "forged-1".to_owned(),
        from: "client".to_owned(),
        to: "server".to_owned(),
        seq: 10,
        ack: 0,
        stream_id: "s1".to_owned(),
        service_name: None,
        procedure_name: None,
        control_flags: rt_wire::ControlFlags::NONE,
        tracing: None,
        payload: Payload::App(serde_json::json!({"forged": true})),
    };
    let bytes = JsonCodec.encode(&forged).unwrap();
    let frame = rt_transport_core::framing::encode_frame(&bytes);
    dialer.raw_client_sender().send(frame).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let errors = protocol_errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        Event::ProtocolError { kind: rt_transport_core::ProtocolErrorKind::MessageOrderingViolated { expected: 1, actual: 10 }, .. }
    ));

    let destroyed = session_events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, Event::SessionStatus { status, .. } if matches!(status, rt_transport_core::ConnStatus::Disconnect)));
    assert!(destroyed, "the session must be destroyed on the server side");

    client.close().await;
    server.close().await;
}
