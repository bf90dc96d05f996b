//! Speech service protocol
//!
//! Pure data transformations: message parsing and endpoint construction.
//! No I/O and no state.

use std::time::Duration;

use lt_config::Settings;

/// The payload of one inbound speech service message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttMessageKind {
    /// Partial transcription text.
    Token { text: String },
    /// Voice activity ended; the current utterance is complete.
    VadEnd,
    /// Service-side error.
    Error { message: String },
    /// Keepalive.
    Ping,
    /// Unrecognized message type; ignored but preserved.
    Unknown,
}

/// A parsed message from the speech service.
///
/// The raw frame text is kept on every variant for logging and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SttMessage {
    kind: SttMessageKind,
    raw: String,
}

impl SttMessage {
    /// Parse one text frame. Never fails: malformed JSON becomes an
    /// [`SttMessageKind::Error`] carrying a truncated copy of the input.
    pub fn parse(raw: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => {
                let mut preview: String = raw.chars().take(100).collect();
                if raw.chars().count() > 100 {
                    preview.push_str("...");
                }
                return Self {
                    kind: SttMessageKind::Error {
                        message: format!("Invalid JSON: {preview}"),
                    },
                    raw: raw.to_string(),
                };
            }
        };

        let kind = match value.get("type").and_then(|t| t.as_str()).unwrap_or("") {
            "token" => SttMessageKind::Token {
                text: value
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .to_string(),
            },
            "vad_end" => SttMessageKind::VadEnd,
            "error" => SttMessageKind::Error {
                message: value
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("Unknown error")
                    .to_string(),
            },
            "ping" => SttMessageKind::Ping,
            _ => SttMessageKind::Unknown,
        };

        Self {
            kind,
            raw: raw.to_string(),
        }
    }

    pub fn kind(&self) -> &SttMessageKind {
        &self.kind
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, SttMessageKind::Error { .. })
    }
}

/// Connection parameters for the speech service.
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub workspace: String,
    pub key: String,
    pub secret: String,
    pub host_suffix: String,
    pub connect_timeout: Duration,
}

impl SttConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            workspace: settings.stt_workspace.clone(),
            key: settings.stt_key.clone(),
            secret: settings.stt_secret.clone(),
            host_suffix: settings.stt_host_suffix.clone(),
            connect_timeout: Duration::from_secs(settings.stt_connect_timeout_secs),
        }
    }

    /// The streaming endpoint for this workspace.
    pub fn url(&self) -> String {
        format!("wss://{}--{}/v1/stream", self.workspace, self.host_suffix)
    }

    /// Authentication headers for the WebSocket upgrade request.
    pub fn headers(&self) -> [(&'static str, String); 2] {
        [
            ("Modal-Key", self.key.clone()),
            ("Modal-Secret", self.secret.clone()),
        ]
    }

    /// All required credentials are present.
    pub fn is_configured(&self) -> bool {
        !self.workspace.is_empty() && !self.key.is_empty() && !self.secret.is_empty()
    }
}
