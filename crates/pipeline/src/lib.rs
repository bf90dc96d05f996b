//! Streaming speech-to-text pipeline
//!
//! One pipeline per speaker: audio frames come in from a WebRTC track, get
//! downmixed/resampled/normalized, and stream out over a WebSocket to the
//! speech service; token and VAD-end messages come back and are folded into
//! partial and final transcripts.

pub mod client;
pub mod protocol;
pub mod session;

pub use client::{SttSender, SttStream};
pub use protocol::{SttConfig, SttMessage, SttMessageKind};
pub use session::{TranscriptionSession, TranscriptAccumulator};

use thiserror::Error;

/// Errors from the transcription pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Speech service credentials are missing; checked before any I/O.
    #[error("speech-to-text service is not configured")]
    NotConfigured,

    /// The initial WebSocket connect failed or timed out.
    #[error("failed to connect to speech-to-text service: {0}")]
    Connect(String),

    /// The service reported an error or the stream broke mid-session.
    #[error("speech-to-text stream failed: {0}")]
    StreamFailed(String),

    /// The stream was closed and no more audio can be sent.
    #[error("speech-to-text stream closed")]
    Closed,

    #[error(transparent)]
    Audio(#[from] lt_core::AudioError),
}
