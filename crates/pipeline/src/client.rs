//! Speech service WebSocket client
//!
//! Owns one socket per speaker. The send and receive halves run as separate
//! tasks so audio can flow while results stream back; both halves are torn
//! down on every exit path, including drop.

use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;

use lt_config::constants::stt;

use crate::protocol::{SttConfig, SttMessage};
use crate::PipelineError;

/// Handle for pushing audio chunks upstream.
///
/// Clonable so the sender task can live apart from the receive loop. `send`
/// fails with [`PipelineError::Closed`] once the stream is gone.
#[derive(Clone, Debug)]
pub struct SttSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl SttSender {
    /// Transmit one chunk as a single binary frame.
    pub async fn send(&self, chunk: Vec<u8>) -> Result<(), PipelineError> {
        self.tx.send(chunk).await.map_err(|_| PipelineError::Closed)
    }
}

/// A live stream to the speech service.
#[derive(Debug)]
pub struct SttStream {
    sender: SttSender,
    messages: mpsc::Receiver<SttMessage>,
    send_task: JoinHandle<()>,
    recv_task: JoinHandle<()>,
}

impl SttStream {
    /// Connect to the configured speech service endpoint.
    ///
    /// Fails with [`PipelineError::NotConfigured`] before any network I/O
    /// when credentials are missing. The connect timeout covers a cold start
    /// of the remote service.
    pub async fn connect(config: &SttConfig) -> Result<Self, PipelineError> {
        if !config.is_configured() {
            return Err(PipelineError::NotConfigured);
        }
        Self::connect_url(&config.url(), config).await
    }

    pub(crate) async fn connect_url(url: &str, config: &SttConfig) -> Result<Self, PipelineError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| PipelineError::Connect(e.to_string()))?;
        for (name, value) in config.headers() {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| PipelineError::Connect(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        tracing::debug!(url, "connecting to speech service");
        let (ws, _) = tokio::time::timeout(config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| {
                PipelineError::Connect(format!(
                    "timed out after {}s",
                    config.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| PipelineError::Connect(e.to_string()))?;
        tracing::debug!(url, "connected to speech service");

        let (mut sink, mut stream) = ws.split();
        let last_rx = Arc::new(Mutex::new(Instant::now()));

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let last_rx_send = last_rx.clone();
        let send_task = tokio::spawn(async move {
            let mut ping = tokio::time::interval(stt::PING_INTERVAL);
            ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ping.tick().await;
            loop {
                tokio::select! {
                    chunk = audio_rx.recv() => match chunk {
                        Some(bytes) => {
                            if sink.send(Message::Binary(bytes)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    _ = ping.tick() => {
                        if last_rx_send.lock().elapsed() > stt::PING_INTERVAL + stt::PING_TIMEOUT {
                            tracing::warn!("speech service unresponsive to pings, closing");
                            let _ = sink.close().await;
                            break;
                        }
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (msg_tx, messages) = mpsc::channel::<SttMessage>(64);
        let last_rx_recv = last_rx;
        let recv_task = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        *last_rx_recv.lock() = Instant::now();
                        if msg_tx.send(SttMessage::parse(&text)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                        *last_rx_recv.lock() = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "speech service socket error");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            sender: SttSender { tx: audio_tx },
            messages,
            send_task,
            recv_task,
        })
    }

    /// A clonable sender for the audio half.
    pub fn sender(&self) -> SttSender {
        self.sender.clone()
    }

    /// Next parsed message; `None` once the peer has closed.
    pub async fn recv(&mut self) -> Option<SttMessage> {
        self.messages.recv().await
    }
}

impl Drop for SttStream {
    fn drop(&mut self) {
        self.send_task.abort();
        self.recv_task.abort();
    }
}
