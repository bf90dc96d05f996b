//! Fixed protocol and processing constants
//!
//! Tunables that operators may need to change live in [`crate::Settings`];
//! everything here is part of the wire contract or the processing model.

/// Audio processing constants.
pub mod audio {
    /// Sample rate WebRTC tracks are decoded at.
    pub const WEBRTC_SAMPLE_RATE: u32 = 48_000;

    /// Sample rate the speech service expects.
    pub const STT_SAMPLE_RATE: u32 = 24_000;

    /// Minimum buffered audio before a chunk is flushed upstream.
    pub const MIN_BUFFER_MS: u64 = 200;

    /// Bound on queued frames per track; late frames are dropped beyond it.
    pub const FRAME_QUEUE_DEPTH: usize = 100;
}

/// Speech-to-text service constants.
pub mod stt {
    use std::time::Duration;

    /// WebSocket-layer keepalive ping interval.
    pub const PING_INTERVAL: Duration = Duration::from_secs(30);

    /// Time after an unanswered ping before the stream is considered dead.
    pub const PING_TIMEOUT: Duration = Duration::from_secs(10);

    /// Partial transcripts are emitted once the accumulator grows past this.
    pub const PARTIAL_EMIT_CHARS: usize = 50;

    /// Host suffix of the deployed speech service; overridable in settings.
    pub const DEFAULT_HOST_SUFFIX: &str =
        "kyutai-stt-rust-kyutaisttrustservice-serve.modal.run";
}

/// HPB signaling constants.
pub mod signaling {
    use std::time::Duration;

    /// Timeout for each message read during the connect handshake.
    pub const MSG_RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

    /// Frames tolerated during a handshake before giving up on it.
    pub const HANDSHAKE_MAX_MESSAGES: usize = 10;

    /// Upper bound on one transcript fan-out round.
    pub const TRANSCRIPT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

    /// Poll interval of the fan-out consumer while disconnected.
    pub const CONSUMER_IDLE_POLL: Duration = Duration::from_secs(2);

    /// Capacity of the per-room transcript outbox.
    pub const TRANSCRIPT_OUTBOX_DEPTH: usize = 256;
}

/// Server process constants.
pub mod server {
    use std::time::Duration;

    pub const DEFAULT_PORT: u16 = 23_000;

    /// Bound on closing one room during process shutdown.
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Memory watchdog constants.
pub mod watchdog {
    use std::time::Duration;

    pub const CHECK_INTERVAL: Duration = Duration::from_secs(5);

    /// Warn when available memory drops below this.
    pub const MIN_AVAILABLE_MEMORY_MB: u64 = 100;

    /// Shut down when available memory drops below this.
    pub const CRITICAL_AVAILABLE_MEMORY_MB: u64 = 50;
}
