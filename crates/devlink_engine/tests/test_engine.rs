use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use devlink_engine::{
    ConnectionId, DeviceIdentity, Engine, EngineConfig, EngineError, EngineEvent, Envelope,
    MessageKind, SessionState,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn loopback_config() -> EngineConfig {
    EngineConfig {
        bind_ip: "127.0.0.1".parse().unwrap(),
        ..EngineConfig::default()
    }
}

fn engine_with(name: &str, config: EngineConfig) -> Engine {
    Engine::with_config(DeviceIdentity::generate(name, "linux"), config)
}

async fn listening(name: &str, config: EngineConfig) -> (Engine, SocketAddr) {
    let engine = engine_with(name, config);
    let addr = engine.listen(0).await.unwrap();
    (engine, addr)
}

async fn next_event<F>(rx: &mut broadcast::Receiver<EngineEvent>, matches: F) -> EngineEvent
where
    F: Fn(&EngineEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed while waiting"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn authenticated(rx: &mut broadcast::Receiver<EngineEvent>) -> (ConnectionId, DeviceIdentity) {
    match next_event(rx, |e| matches!(e, EngineEvent::PeerAuthenticated { .. })).await {
        EngineEvent::PeerAuthenticated {
            connection_id,
            identity,
        } => (connection_id, identity),
        _ => unreachable!(),
    }
}

/// A listener that never accepts and whose accept queue is already full,
/// so new connection attempts to it stay pending. The returned streams
/// must be kept alive for as long as that is needed.
async fn stalled_listener() -> (TcpListener, Vec<TcpStream>, SocketAddr) {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut queued = Vec::new();
    for _ in 0..64 {
        match tokio::time::timeout(Duration::from_millis(250), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => queued.push(stream),
            _ => break,
        }
    }
    (listener, queued, addr)
}

/// A bare peer speaking the wire protocol directly.
struct RawPeer {
    stream: BufReader<TcpStream>,
}

impl RawPeer {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Connect and consume the listener greeting.
    async fn connect_greeted(addr: SocketAddr) -> (Self, String) {
        let mut peer = Self::connect(addr).await;
        let greeting = peer.recv().await.unwrap();
        assert_eq!(greeting.kind, MessageKind::ConnectionEstablished);
        let id = greeting.str_field("connectionId").unwrap().to_string();
        (peer, id)
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.get_mut().write_all(bytes).await.unwrap();
    }

    async fn send(&mut self, envelope: &Envelope) {
        let mut line = envelope.to_json().unwrap();
        line.push('\n');
        self.send_raw(line.as_bytes()).await;
    }

    async fn identify(&mut self, device_id: &str) -> DeviceIdentity {
        let mut identity = DeviceIdentity::generate(device_id, "android");
        identity.device_id = devlink_engine::DeviceId::from_string(device_id);
        self.send(&Envelope::identity(&identity)).await;
        let reply = self.recv_kind(MessageKind::AuthenticationSuccess).await;
        reply.device_identity("serverDeviceInfo").unwrap()
    }

    /// Next frame, or `None` once the engine closed the connection.
    async fn recv(&mut self) -> Option<Envelope> {
        let mut line = String::new();
        let n = tokio::time::timeout(WAIT, self.stream.read_line(&mut line))
            .await
            .expect("timed out waiting for frame")
            .unwrap_or(0);
        if n == 0 {
            return None;
        }
        Some(Envelope::from_json(line.trim_end()).unwrap())
    }

    /// Next frame of `kind`, skipping supervisor heartbeats.
    async fn recv_kind(&mut self, kind: MessageKind) -> Envelope {
        loop {
            let env = self.recv().await.expect("connection closed");
            if env.kind == kind {
                return env;
            }
        }
    }

    async fn expect_closed(&mut self) {
        while let Some(env) = self.recv().await {
            assert_eq!(env.kind, MessageKind::Heartbeat, "unexpected frame {env:?}");
        }
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_dial_authenticates_both_sides() {
    let (a, addr) = listening("pc", loopback_config()).await;
    let b = engine_with("laptop", loopback_config());
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let b_conn = b.dial(addr).await.unwrap();

    let (a_conn, seen_by_a) = authenticated(&mut a_events).await;
    assert_eq!(seen_by_a.device_id, b.identity().device_id);

    let (conn, seen_by_b) = authenticated(&mut b_events).await;
    assert_eq!(conn, b_conn);
    assert_eq!(seen_by_b.device_id, a.identity().device_id);

    let session = a.session(&a_conn).unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(a.stats().active_sessions, 1);

    // Addressing by device id works in both directions.
    let note = Envelope::with_json(MessageKind::Notification, serde_json::json!({"title": "hi"}));
    a.send_to(b.identity().device_id.as_str(), note.clone()).await.unwrap();
    match next_event(&mut b_events, |e| e.name() == "notification").await {
        EngineEvent::Notification { payload, .. } => assert_eq!(payload["title"], "hi"),
        _ => unreachable!(),
    }
    b.send_to(a.identity().device_id.as_str(), note).await.unwrap();
    next_event(&mut a_events, |e| e.name() == "notification").await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_listener_greets_then_answers_identity() {
    let (engine, addr) = listening("pc", loopback_config()).await;
    let (mut peer, conn_id) = RawPeer::connect_greeted(addr).await;

    let conn = ConnectionId::from_string(conn_id);
    assert_eq!(
        engine.session(&conn).unwrap().state(),
        SessionState::Unauthenticated
    );

    let server = peer.identify("phone-1").await;
    assert_eq!(server, *engine.identity());
    assert_eq!(engine.session(&conn).unwrap().device_id(), Some("phone-1"));

    // Re-sending identity is not answered again.
    peer.send(&Envelope::identity(&DeviceIdentity::generate("x", "ios"))).await;
    peer.send(&Envelope::heartbeat()).await;
    let next = peer.recv().await.unwrap();
    assert!(next.is_heartbeat_reply());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_frames_split_across_writes_are_reassembled() {
    let (engine, addr) = listening("pc", loopback_config()).await;
    let mut events = engine.subscribe();
    let (mut peer, _) = RawPeer::connect_greeted(addr).await;

    let mut identity = DeviceIdentity::generate("tablet", "android");
    identity.device_id = devlink_engine::DeviceId::from_string("tablet-7");
    let mut wire = Envelope::identity(&identity).to_json().unwrap().into_bytes();
    wire.push(b'\n');
    wire.extend_from_slice(b"{\"type\":\"clipboard\",\"data\":\"copied\"}\n");

    for piece in wire.chunks(5) {
        peer.send_raw(piece).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let (_, seen) = authenticated(&mut events).await;
    assert_eq!(seen.device_id.as_str(), "tablet-7");
    match next_event(&mut events, |e| e.name() == "clipboard").await {
        EngineEvent::Clipboard { payload, .. } => assert_eq!(payload["data"], "copied"),
        _ => unreachable!(),
    }

    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Protocol errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bad_frames_get_error_replies_and_connection_stays_open() {
    let (engine, addr) = listening("pc", loopback_config()).await;
    let (mut peer, conn_id) = RawPeer::connect_greeted(addr).await;

    peer.send_raw(b"{\"type\":\"bogus\"}\n").await;
    let err = peer.recv_kind(MessageKind::Error).await;
    assert_eq!(err.str_field("errorCode"), Some("unknown_message_type"));

    peer.send_raw(b"{oops\n").await;
    let err = peer.recv_kind(MessageKind::Error).await;
    assert_eq!(err.str_field("errorCode"), Some("invalid_message"));

    peer.send(&Envelope::heartbeat()).await;
    assert!(peer.recv_kind(MessageKind::Heartbeat).await.is_heartbeat_reply());

    let session = engine.session(&ConnectionId::from_string(conn_id)).unwrap();
    // bogus + heartbeat decoded; the malformed frame is not counted.
    assert_eq!(session.message_count(), 2);
    assert!(session.bytes_in() > 0);
    assert!(session.bytes_out() > 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let config = EngineConfig {
        max_frame_len: 64,
        ..loopback_config()
    };
    let (engine, addr) = listening("pc", config).await;
    let mut events = engine.subscribe();
    let (mut peer, _) = RawPeer::connect_greeted(addr).await;

    peer.send_raw(&[b'a'; 100]).await;
    let err = peer.recv_kind(MessageKind::Error).await;
    assert_eq!(err.str_field("errorCode"), Some("frame_too_long"));
    peer.expect_closed().await;

    next_event(&mut events, |e| e.name() == "peer-disconnected").await;
    assert_eq!(engine.stats().total_sessions, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_session_cap_refuses_extra_connections() {
    let config = EngineConfig {
        max_sessions: 1,
        ..loopback_config()
    };
    let (engine, addr) = listening("pc", config).await;
    let (_first, _) = RawPeer::connect_greeted(addr).await;

    let mut second = RawPeer::connect(addr).await;
    let err = second.recv().await.unwrap();
    assert_eq!(err.kind, MessageKind::Error);
    assert_eq!(err.str_field("errorCode"), Some("too_many_sessions"));
    assert!(second.recv().await.is_none());
    assert_eq!(engine.stats().total_sessions, 1);

    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_send_to_requires_authenticated_peer() {
    let (engine, addr) = listening("pc", loopback_config()).await;
    let (_peer, conn_id) = RawPeer::connect_greeted(addr).await;

    let result = engine.send_to("phone-1", Envelope::heartbeat()).await;
    assert!(matches!(result, Err(EngineError::PeerUnavailable(id)) if id == "phone-1"));

    // Addressing the raw connection still works.
    assert!(engine.send(&ConnectionId::from_string(conn_id), Envelope::heartbeat()).await);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_skips_unauthenticated_and_excluded() {
    let (engine, addr) = listening("pc", loopback_config()).await;
    let mut events = engine.subscribe();

    let (mut p1, _) = RawPeer::connect_greeted(addr).await;
    p1.identify("p1").await;
    let (mut p2, p2_conn) = RawPeer::connect_greeted(addr).await;
    p2.identify("p2").await;
    let (mut anon, _) = RawPeer::connect_greeted(addr).await;
    authenticated(&mut events).await;
    authenticated(&mut events).await;

    let note = Envelope::with_json(MessageKind::Notification, serde_json::json!({"n": 1}));
    let excluded = ConnectionId::from_string(p2_conn);
    assert_eq!(engine.broadcast(note, Some(&excluded)).await, 1);

    let got = p1.recv_kind(MessageKind::Notification).await;
    assert_eq!(got.payload["n"], 1);
    assert!(!got.message_id.is_empty());

    // Neither the excluded nor the anonymous peer get it: the next thing
    // they see after sending a heartbeat is the reply to it.
    for peer in [&mut p2, &mut anon] {
        peer.send(&Envelope::heartbeat()).await;
        let next = peer.recv().await.unwrap();
        assert_eq!(next.kind, MessageKind::Heartbeat);
    }

    engine.shutdown().await;
}

#[tokio::test]
async fn test_large_frames_in_both_directions() {
    let config = EngineConfig {
        write_timeout: Duration::from_secs(30),
        ..loopback_config()
    };
    let (a, addr) = listening("pc", config.clone()).await;
    let b = engine_with("phone", config);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let b_conn = b.dial(addr).await.unwrap();
    let (a_conn, _) = authenticated(&mut a_events).await;
    authenticated(&mut b_events).await;

    // Each frame is far larger than both socket buffers together, so
    // neither write can finish unless the other side keeps reading.
    let frame = |from: &str| {
        Envelope::with_json(
            MessageKind::ScreenFrame,
            serde_json::json!({"from": from, "frameData": "A".repeat(8 * 1024 * 1024)}),
        )
    };
    let (sent_by_a, sent_by_b) = tokio::time::timeout(Duration::from_secs(60), async {
        tokio::join!(a.send(&a_conn, frame("a")), b.send(&b_conn, frame("b")))
    })
    .await
    .expect("simultaneous large sends stalled");
    assert!(sent_by_a);
    assert!(sent_by_b);

    match next_event(&mut a_events, |e| e.name() == "screen-frame").await {
        EngineEvent::ScreenFrame { connection_id, payload } => {
            assert_eq!(connection_id, a_conn);
            assert_eq!(payload["from"], "b");
        }
        _ => unreachable!(),
    }
    match next_event(&mut b_events, |e| e.name() == "screen-frame").await {
        EngineEvent::ScreenFrame { connection_id, payload } => {
            assert_eq!(connection_id, b_conn);
            assert_eq!(payload["from"], "a");
        }
        _ => unreachable!(),
    }

    // Both connections are still usable afterwards.
    assert!(b.send(&b_conn, Envelope::heartbeat()).await);
    assert_eq!(a.stats().active_sessions, 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_ack_and_peer_error_events() {
    let (a, addr) = listening("pc", loopback_config()).await;
    let b = engine_with("phone", loopback_config());
    let mut a_events = a.subscribe();
    let b_conn = b.dial(addr).await.unwrap();
    let (a_conn, _) = authenticated(&mut a_events).await;

    assert!(b.ack(&b_conn, "msg-1").await);
    match next_event(&mut a_events, |e| e.name() == "message-acknowledged").await {
        EngineEvent::MessageAcknowledged { connection_id, message_id } => {
            assert_eq!(connection_id, a_conn);
            assert_eq!(message_id, "msg-1");
        }
        _ => unreachable!(),
    }

    assert!(b.send(&b_conn, Envelope::error("busy", "try later")).await);
    match next_event(&mut a_events, |e| e.name() == "peer-error").await {
        EngineEvent::PeerError { code, message, .. } => {
            assert_eq!(code, "busy");
            assert_eq!(message, "try later");
        }
        _ => unreachable!(),
    }

    a.shutdown().await;
    b.shutdown().await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_disconnect_notifies_both_sides() {
    let (a, addr) = listening("pc", loopback_config()).await;
    let b = engine_with("phone", loopback_config());
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let b_conn = b.dial(addr).await.unwrap();
    let (a_conn, _) = authenticated(&mut a_events).await;

    assert!(a.disconnect(&a_conn));
    match next_event(&mut a_events, |e| e.name() == "peer-disconnected").await {
        EngineEvent::PeerDisconnected { connection_id, identity } => {
            assert_eq!(connection_id, a_conn);
            assert_eq!(identity.unwrap().device_id, b.identity().device_id);
        }
        _ => unreachable!(),
    }
    match next_event(&mut b_events, |e| e.name() == "peer-disconnected").await {
        EngineEvent::PeerDisconnected { connection_id, .. } => assert_eq!(connection_id, b_conn),
        _ => unreachable!(),
    }

    assert!(a.session(&a_conn).is_none());
    assert!(!b.send(&b_conn, Envelope::heartbeat()).await);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_is_evicted() {
    let config = EngineConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(200),
        ..loopback_config()
    };
    let (engine, addr) = listening("pc", config).await;
    let mut events = engine.subscribe();
    let (mut peer, conn_id) = RawPeer::connect_greeted(addr).await;

    // The supervisor pings the peer before giving up on it.
    let ping = peer.recv_kind(MessageKind::Heartbeat).await;
    assert!(!ping.is_heartbeat_reply());

    match next_event(&mut events, |e| e.name() == "session-evicted").await {
        EngineEvent::SessionEvicted { connection_id, identity } => {
            assert_eq!(connection_id.as_str(), conn_id);
            assert!(identity.is_none());
        }
        _ => unreachable!(),
    }
    peer.expect_closed().await;
    assert_eq!(engine.stats().total_sessions, 0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let (a, addr) = listening("pc", loopback_config()).await;
    let b = engine_with("phone", loopback_config());
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    b.dial(addr).await.unwrap();
    authenticated(&mut a_events).await;

    a.shutdown().await;
    assert!(a.stats().total_sessions == 0 && !a.stats().listening);
    next_event(&mut b_events, |e| e.name() == "peer-disconnected").await;

    // A's bus ends after the shutdown events drain.
    let mut rest = Vec::new();
    loop {
        match a_events.recv().await {
            Ok(event) => rest.push(event.name()),
            Err(RecvError::Closed) => break,
            Err(RecvError::Lagged(_)) => continue,
        }
    }
    assert!(rest.contains(&"listener-stopped"));
    assert!(rest.contains(&"peer-disconnected"));

    assert!(b.dial(addr).await.is_err());
    assert!(matches!(a.dial(addr).await, Err(EngineError::ShutDown)));
    b.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_during_dial_does_not_hang() {
    let (_listener, _queued, addr) = stalled_listener().await;
    let config = EngineConfig {
        connect_timeout: Duration::from_secs(60),
        ..loopback_config()
    };
    let engine = Arc::new(engine_with("pc", config));

    let dialing = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.dial(addr).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!dialing.is_finished(), "connect attempt finished early");

    tokio::time::timeout(WAIT, engine.shutdown())
        .await
        .expect("shutdown waited on a pending dial");
    let result = tokio::time::timeout(WAIT, dialing)
        .await
        .expect("dial kept waiting after shutdown")
        .unwrap();
    assert!(matches!(result, Err(EngineError::ShutDown)));
    assert_eq!(engine.stats().total_sessions, 0);
    assert!(engine.sessions().is_empty());
}

#[tokio::test]
async fn test_dial_racing_shutdown_leaves_no_session() {
    let (a, addr) = listening("pc", loopback_config()).await;

    for round in 0..20 {
        let b = Arc::new(engine_with("phone", loopback_config()));
        let dialing = tokio::spawn({
            let b = Arc::clone(&b);
            async move { b.dial(addr).await }
        });
        // Vary how far the dial gets before shutdown starts.
        for _ in 0..round % 4 {
            tokio::task::yield_now().await;
        }
        b.shutdown().await;

        let result = tokio::time::timeout(WAIT, dialing).await.unwrap().unwrap();
        assert!(
            matches!(result, Ok(_) | Err(EngineError::ShutDown)),
            "round {round}: {result:?}"
        );
        assert!(b.sessions().is_empty(), "round {round}");
    }

    a.shutdown().await;
}
