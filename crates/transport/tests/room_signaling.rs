//! Room orchestrator tests against a scripted in-process signaling server.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use lt_config::Settings;
use lt_core::{HpbSettings, ReconnectMethod, SigConnectResult};
use lt_transport::room::{RoomOrchestrator, RoomState};
use lt_transport::util::hmac_sha256_hex;

const SECRET: &str = "test-secret";

fn test_settings(addr: SocketAddr, call_leave_timeout_ms: u64) -> Settings {
    let mut settings = Settings::default();
    settings.hpb_url = format!("http://{addr}");
    settings.hpb_internal_secret = SECRET.to_string();
    settings.backend_url = "https://cloud.example.org".to_string();
    settings.call_leave_timeout_ms = call_leave_timeout_ms;
    settings
}

struct TestHpb {
    ws: WebSocketStream<TcpStream>,
}

impl TestHpb {
    async fn accept(listener: TcpListener) -> Self {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        Self { ws }
    }

    async fn recv_json(&mut self) -> Option<Value> {
        while let Some(msg) = self.ws.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(serde_json::from_str(&text).unwrap()),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    async fn try_recv_json(&mut self, wait: Duration) -> Option<Value> {
        timeout(wait, self.recv_json()).await.ok().flatten()
    }

    async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .unwrap();
    }

    /// Validate the authenticated hello, accept it, and consume the
    /// follow-up incall and join messages.
    async fn complete_handshake(&mut self, expected_room: &str) -> Value {
        let hello = self.recv_json().await.expect("hello");
        assert_eq!(hello["type"], "hello");
        assert_eq!(hello["id"], "1");
        assert_eq!(hello["hello"]["version"], "2.0");
        assert_eq!(hello["hello"]["auth"]["type"], "internal");
        let params = &hello["hello"]["auth"]["params"];
        let nonce = params["random"].as_str().expect("nonce");
        assert_eq!(
            params["token"].as_str().expect("token"),
            hmac_sha256_hex(SECRET, nonce),
            "hello token must be the HMAC of the nonce"
        );
        assert!(params["backend"]
            .as_str()
            .unwrap()
            .ends_with("/ocs/v2.php/apps/spreed/api/v3/signaling/backend"));

        self.send_json(json!({"type": "welcome", "welcome": {}}))
            .await;
        self.send_json(json!({
            "type": "hello",
            "hello": {"sessionid": "S1", "resumeid": "R1"},
        }))
        .await;

        let incall = self.recv_json().await.expect("incall");
        assert_eq!(incall["type"], "internal");
        assert_eq!(incall["internal"]["type"], "incall");
        assert_eq!(incall["internal"]["incall"]["incall"], 1);
        assert_eq!(incall["id"], "2");

        let join = self.recv_json().await.expect("join");
        assert_eq!(join["type"], "room");
        assert_eq!(join["room"]["roomid"], expected_room);
        assert_eq!(join["room"]["sessionid"], "S1");
        assert_eq!(join["id"], "3");

        hello
    }

    async fn send_participants_update(&mut self, users: Value) {
        self.send_json(json!({
            "type": "event",
            "event": {
                "target": "participants",
                "type": "update",
                "update": {"users": users},
            },
        }))
        .await;
    }
}

async fn wait_for_defunct(room: &std::sync::Arc<RoomOrchestrator>, wait: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        if room.state() == RoomState::Defunct {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn fresh_connect_authenticates_and_joins_with_monotonic_ids() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
    let room = RoomOrchestrator::new(
        "room-1",
        test_settings(addr, 60_000),
        HpbSettings::default(),
        "en",
        closed_tx,
    );

    let server = tokio::spawn(async move {
        let mut hpb = TestHpb::accept(listener).await;
        hpb.complete_handshake("room-1").await;
        hpb
    });

    let result = room.connect(ReconnectMethod::Fresh).await;
    assert_eq!(result, SigConnectResult::Success);
    assert_eq!(room.state(), RoomState::Connected);
    assert_eq!(room.session_id().as_deref(), Some("S1"));

    let _hpb = server.await.unwrap();
    room.close().await;
}

#[tokio::test]
async fn duplicate_session_is_a_terminal_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
    let room = RoomOrchestrator::new(
        "room-dup",
        test_settings(addr, 60_000),
        HpbSettings::default(),
        "en",
        closed_tx,
    );

    let server = tokio::spawn(async move {
        let mut hpb = TestHpb::accept(listener).await;
        let _hello = hpb.recv_json().await.expect("hello");
        hpb.send_json(json!({
            "type": "error",
            "error": {"code": "duplicate_session", "message": "already there"},
        }))
        .await;
        hpb
    });

    let result = room.connect(ReconnectMethod::Fresh).await;
    assert_eq!(result, SigConnectResult::Failure);
    assert_ne!(room.state(), RoomState::Connected);

    let _hpb = server.await.unwrap();
    room.close().await;
}

#[tokio::test]
async fn room_join_failed_yields_retry_on_fresh_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
    let room = RoomOrchestrator::new(
        "room-retry",
        test_settings(addr, 60_000),
        HpbSettings::default(),
        "en",
        closed_tx,
    );

    let server = tokio::spawn(async move {
        let mut hpb = TestHpb::accept(listener).await;
        let _hello = hpb.recv_json().await.expect("hello");
        hpb.send_json(json!({
            "type": "error",
            "error": {"code": "room_join_failed", "message": "not yet"},
        }))
        .await;
        hpb
    });

    let result = room.connect(ReconnectMethod::Fresh).await;
    assert_eq!(result, SigConnectResult::Retry);

    let _hpb = server.await.unwrap();
    room.close().await;
}

#[tokio::test]
async fn room_with_no_recipients_leaves_after_grace_period() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let room = RoomOrchestrator::new(
        "room-empty",
        test_settings(addr, 200),
        HpbSettings::default(),
        "en",
        closed_tx,
    );

    let server = tokio::spawn(async move {
        let mut hpb = TestHpb::accept(listener).await;
        hpb.complete_handshake("room-empty").await;
        // The deferred leave should produce a bye.
        let bye = hpb.try_recv_json(Duration::from_secs(5)).await.expect("bye");
        assert_eq!(bye["type"], "bye");
        hpb
    });

    assert_eq!(
        room.connect(ReconnectMethod::Fresh).await,
        SigConnectResult::Success
    );

    let token = timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .expect("close notification")
        .unwrap();
    assert_eq!(token, "room-empty");
    assert!(wait_for_defunct(&room, Duration::from_secs(2)).await);

    // A defunct orchestrator refuses further connects and emits nothing.
    assert_eq!(
        room.connect(ReconnectMethod::Fresh).await,
        SigConnectResult::Failure
    );

    let mut hpb = server.await.unwrap();
    assert!(hpb.try_recv_json(Duration::from_millis(300)).await.is_none());
}

#[tokio::test]
async fn recipient_arriving_within_grace_period_keeps_the_room_alive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
    let room = RoomOrchestrator::new(
        "room-keep",
        test_settings(addr, 400),
        HpbSettings::default(),
        "en",
        closed_tx,
    );

    let server = tokio::spawn(async move {
        let mut hpb = TestHpb::accept(listener).await;
        hpb.complete_handshake("room-keep").await;
        hpb
    });

    assert_eq!(
        room.connect(ReconnectMethod::Fresh).await,
        SigConnectResult::Success
    );
    let mut hpb = server.await.unwrap();

    // Map nc-a to an HPB session (no audio, so no offer request).
    hpb.send_participants_update(json!([
        {"sessionId": "hpb-a", "nextcloudSessionId": "nc-a", "inCall": 1}
    ]))
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    room.start("nc-a").await;
    room.stop("nc-a").await;
    // Re-register before the 400 ms grace period expires.
    tokio::time::sleep(Duration::from_millis(150)).await;
    room.start("nc-a").await;

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(room.state(), RoomState::Connected);
    assert!(
        hpb.try_recv_json(Duration::from_millis(200)).await.is_none(),
        "no bye may be sent while a recipient is registered"
    );

    // Now actually leave: empty recipients past the grace period.
    room.stop("nc-a").await;
    let bye = hpb.try_recv_json(Duration::from_secs(5)).await.expect("bye");
    assert_eq!(bye["type"], "bye");
    assert!(wait_for_defunct(&room, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn participant_with_audio_triggers_an_offer_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
    let room = RoomOrchestrator::new(
        "room-audio",
        test_settings(addr, 60_000),
        HpbSettings::default(),
        "en",
        closed_tx,
    );

    let server = tokio::spawn(async move {
        let mut hpb = TestHpb::accept(listener).await;
        hpb.complete_handshake("room-audio").await;
        hpb
    });

    assert_eq!(
        room.connect(ReconnectMethod::Fresh).await,
        SigConnectResult::Success
    );
    let mut hpb = server.await.unwrap();

    hpb.send_participants_update(json!([
        {"sessionId": "hpb-speaker", "nextcloudSessionId": "nc-speaker", "inCall": 3}
    ]))
    .await;

    let request = hpb
        .try_recv_json(Duration::from_secs(5))
        .await
        .expect("requestoffer");
    assert_eq!(request["type"], "message");
    assert_eq!(request["message"]["recipient"]["sessionid"], "hpb-speaker");
    assert_eq!(request["message"]["data"]["type"], "requestoffer");

    // Internal peers never get offer requests.
    hpb.send_participants_update(json!([
        {"sessionId": "hpb-internal", "internal": true, "inCall": 3}
    ]))
    .await;
    assert!(hpb.try_recv_json(Duration::from_millis(300)).await.is_none());

    room.close().await;
}

#[tokio::test]
async fn server_bye_tears_the_room_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let room = RoomOrchestrator::new(
        "room-bye",
        test_settings(addr, 60_000),
        HpbSettings::default(),
        "en",
        closed_tx,
    );

    let server = tokio::spawn(async move {
        let mut hpb = TestHpb::accept(listener).await;
        hpb.complete_handshake("room-bye").await;
        hpb.send_json(json!({"type": "bye", "bye": {}})).await;
        hpb
    });

    assert_eq!(
        room.connect(ReconnectMethod::Fresh).await,
        SigConnectResult::Success
    );
    let _hpb = server.await.unwrap();

    let token = timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .expect("close notification")
        .unwrap();
    assert_eq!(token, "room-bye");
    assert!(wait_for_defunct(&room, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn call_ended_for_everyone_tears_the_room_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let room = RoomOrchestrator::new(
        "room-ended",
        test_settings(addr, 60_000),
        HpbSettings::default(),
        "en",
        closed_tx,
    );

    let server = tokio::spawn(async move {
        let mut hpb = TestHpb::accept(listener).await;
        hpb.complete_handshake("room-ended").await;
        hpb.send_json(json!({
            "type": "event",
            "event": {
                "target": "participants",
                "type": "update",
                "update": {"all": true, "incall": 0},
            },
        }))
        .await;
        hpb
    });

    assert_eq!(
        room.connect(ReconnectMethod::Fresh).await,
        SigConnectResult::Success
    );
    let _hpb = server.await.unwrap();

    let token = timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .expect("close notification")
        .unwrap();
    assert_eq!(token, "room-ended");
}
