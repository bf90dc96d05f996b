//! HPB signaling client
//!
//! One outbound WebSocket per room. This layer owns the socket, stamps
//! monotonic message ids, and implements the two handshake forms
//! (authenticated hello and short resume); connection policy lives in the
//! room orchestrator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{
    connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream,
};

use lt_config::constants::signaling;
use lt_core::Transcript;

use crate::messages;
use crate::util::{hmac_sha256_hex, random_nonce, sanitize_websocket_url};
use crate::TransportError;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Outcome of the authenticated connect handshake.
#[derive(Debug)]
pub enum HandshakeOutcome {
    Established {
        session_id: String,
        resume_id: String,
    },
    /// Transient; the caller may schedule a reconnect.
    Retry,
    /// Terminal for this connection attempt.
    Failure(HandshakeFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// Another session with our identity exists.
    DuplicateSession,
    /// The server said goodbye during the handshake.
    Bye,
    /// No frame arrived within the handshake receive timeout.
    Timeout,
    /// Any other signaling error.
    Rejected(String),
}

/// Outcome of a short-resume attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeOutcome {
    Resumed { session_id: String },
    /// The previous session expired; fall through to a full reconnect.
    Expired,
    /// Rate limited; terminal for the room.
    RateLimited,
    Failed,
}

/// Client for the HPB signaling WebSocket.
pub struct SignalingClient {
    url: String,
    secret: String,
    signaling_backend: String,
    skip_cert_verify: bool,
    writer: Mutex<Option<WsSink>>,
    reader: Mutex<Option<WsSource>>,
    next_id: AtomicU64,
    open: AtomicBool,
}

impl SignalingClient {
    /// `hpb_url` may be http(s) or ws(s); it is normalized to the `/spreed`
    /// WebSocket endpoint. `backend_url` is the Nextcloud base URL.
    pub fn new(hpb_url: &str, secret: &str, backend_url: &str, skip_cert_verify: bool) -> Self {
        let signaling_backend = format!(
            "{}/ocs/v2.php/apps/spreed/api/v3/signaling/backend",
            backend_url.trim_end_matches('/')
        );
        Self {
            url: sanitize_websocket_url(hpb_url),
            secret: secret.to_string(),
            signaling_backend,
            skip_cert_verify,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            next_id: AtomicU64::new(0),
            open: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Dial the signaling server, replacing any previous socket. Resets the
    /// message id counter; ids are monotonic per connection.
    pub async fn open(&self) -> Result<(), TransportError> {
        let connector = if self.skip_cert_verify {
            tracing::warn!(url = %self.url, "TLS verification disabled for signaling socket");
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (ws, _) = connect_async_tls_with_config(self.url.as_str(), None, false, connector)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (sink, stream) = ws.split();

        *self.writer.lock().await = Some(sink);
        *self.reader.lock().await = Some(stream);
        self.next_id.store(0, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        tracing::debug!(url = %self.url, "signaling socket open");
        Ok(())
    }

    /// Close and drop the socket halves.
    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.reader.lock().await.take();
    }

    fn next_message_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stamp the next id onto `msg` and send it as one text frame.
    pub async fn send(&self, mut msg: Value) -> Result<(), TransportError> {
        let id = self.next_message_id();
        msg["id"] = Value::String(id.to_string());

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::Text(msg.to_string()))
            .await
            .map_err(|e| {
                self.open.store(false, Ordering::SeqCst);
                TransportError::Socket(e.to_string())
            })?;
        tracing::trace!(id, "signaling message sent");
        Ok(())
    }

    /// Next inbound JSON frame. Non-JSON text frames are skipped; a closed
    /// or broken socket is an error.
    pub async fn recv(&self) -> Result<Value, TransportError> {
        let mut reader = self.reader.lock().await;
        let stream = reader.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        tracing::warn!(error = %e, "ignoring malformed signaling frame");
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    self.open.store(false, Ordering::SeqCst);
                    return Err(TransportError::Socket("connection closed".into()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.open.store(false, Ordering::SeqCst);
                    return Err(TransportError::Socket(e.to_string()));
                }
            }
        }
    }

    /// `recv` bounded by `timeout`; `Ok(None)` when nothing arrived in time.
    pub async fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Value>, TransportError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Authenticated hello handshake: send the HMAC hello, then read until
    /// the server accepts, rejects, or too many unrelated frames arrive.
    pub async fn authenticate(&self) -> HandshakeOutcome {
        let nonce = random_nonce();
        let token = hmac_sha256_hex(&self.secret, &nonce);
        if let Err(e) = self
            .send(messages::hello_auth(&nonce, &token, &self.signaling_backend))
            .await
        {
            tracing::warn!(error = %e, "failed to send hello");
            return HandshakeOutcome::Retry;
        }

        let mut other_frames = 0usize;
        loop {
            let msg = match self.recv_timeout(signaling::MSG_RECEIVE_TIMEOUT).await {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    tracing::error!(
                        timeout_secs = signaling::MSG_RECEIVE_TIMEOUT.as_secs(),
                        "no message received during handshake, aborting"
                    );
                    return HandshakeOutcome::Failure(HandshakeFailure::Timeout);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "socket error during handshake");
                    return HandshakeOutcome::Retry;
                }
            };

            match msg.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "welcome" => continue,
                "hello" => {
                    let session_id = msg["hello"]["sessionid"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    let resume_id = msg["hello"]["resumeid"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    return HandshakeOutcome::Established {
                        session_id,
                        resume_id,
                    };
                }
                "error" => {
                    let code = msg["error"]["code"].as_str().unwrap_or("").to_string();
                    tracing::error!(
                        code = %code,
                        message = msg["error"]["message"].as_str().unwrap_or(""),
                        "signaling error during handshake"
                    );
                    return match code.as_str() {
                        "duplicate_session" => {
                            HandshakeOutcome::Failure(HandshakeFailure::DuplicateSession)
                        }
                        "room_join_failed" => HandshakeOutcome::Retry,
                        _ => HandshakeOutcome::Failure(HandshakeFailure::Rejected(code)),
                    };
                }
                "bye" => return HandshakeOutcome::Failure(HandshakeFailure::Bye),
                _ => {
                    other_frames += 1;
                    if other_frames > signaling::HANDSHAKE_MAX_MESSAGES {
                        tracing::error!("too many frames without a hello, reconnecting");
                        return HandshakeOutcome::Retry;
                    }
                }
            }
        }
    }

    /// Short-resume handshake for an existing session.
    pub async fn resume(&self, resume_id: &str) -> ResumeOutcome {
        if let Err(e) = self.send(messages::hello_resume(resume_id)).await {
            tracing::warn!(error = %e, "failed to send resume hello");
            return ResumeOutcome::Failed;
        }

        let mut frames = 0usize;
        while frames < signaling::HANDSHAKE_MAX_MESSAGES {
            let msg = match self.recv_timeout(signaling::MSG_RECEIVE_TIMEOUT).await {
                Ok(Some(msg)) => msg,
                _ => return ResumeOutcome::Failed,
            };

            match msg.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "hello" => {
                    let session_id = msg["hello"]["sessionid"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    return ResumeOutcome::Resumed { session_id };
                }
                "error" => {
                    let code = msg["error"]["code"].as_str().unwrap_or("");
                    tracing::error!(code, "signaling error during short resume");
                    return match code {
                        "no_such_session" => ResumeOutcome::Expired,
                        "too_many_requests" => ResumeOutcome::RateLimited,
                        _ => ResumeOutcome::Failed,
                    };
                }
                _ => frames += 1,
            }
        }
        ResumeOutcome::Failed
    }

    pub async fn send_incall(&self) -> Result<(), TransportError> {
        self.send(messages::incall()).await
    }

    pub async fn send_join(
        &self,
        room_token: &str,
        session_id: &str,
    ) -> Result<(), TransportError> {
        self.send(messages::join_room(room_token, session_id)).await
    }

    pub async fn send_request_offer(&self, publisher: &str) -> Result<(), TransportError> {
        self.send(messages::request_offer(publisher)).await
    }

    pub async fn send_answer(
        &self,
        publisher: &str,
        offer_sid: &str,
        sdp: &str,
    ) -> Result<(), TransportError> {
        self.send(messages::answer(publisher, offer_sid, sdp)).await
    }

    pub async fn send_candidate(
        &self,
        publisher: &str,
        offer_sid: &str,
        candidate: &str,
    ) -> Result<(), TransportError> {
        self.send(messages::candidate(publisher, offer_sid, candidate))
            .await
    }

    pub async fn send_bye(&self) -> Result<(), TransportError> {
        self.send(messages::bye()).await
    }

    pub async fn send_transcript(
        &self,
        recipient: &str,
        transcript: &Transcript,
    ) -> Result<(), TransportError> {
        self.send(messages::transcript(recipient, transcript)).await
    }
}
