//! HPB signaling and WebRTC transport
//!
//! The room orchestrator in this crate is the heart of the bridge: one per
//! Talk room, it drives the signaling connection, subscribes to every
//! audible participant over WebRTC, feeds their audio into per-speaker
//! transcription pipelines and fans the resulting transcripts out to the
//! registered recipients.

pub mod codec;
pub mod messages;
pub mod room;
pub mod signaling;
pub mod subscriber;
pub mod util;

pub use room::{RoomHandle, RoomOrchestrator};
pub use signaling::SignalingClient;
pub use subscriber::{PeerSubscriber, SubscriberEvents};

use thiserror::Error;

/// Errors from the signaling and WebRTC layers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The HPB rate limited us; terminal for the room.
    #[error("rate limited by the signaling server")]
    RateLimited,

    /// Another session with our identity already exists; terminal.
    #[error("duplicate session on the signaling server")]
    DuplicateSession,

    #[error("failed to connect to the signaling server: {0}")]
    Connect(String),

    #[error("signaling socket error: {0}")]
    Socket(String),

    /// The socket is not open (never connected, or already torn down).
    #[error("signaling connection is not open")]
    NotConnected,

    #[error("webrtc error: {0}")]
    WebRtc(String),

    #[error("opus decode error: {0}")]
    Codec(String),
}
