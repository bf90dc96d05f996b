//! Core error types

use thiserror::Error;

/// Errors from the pure audio processing functions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    /// Stereo input must contain interleaved L,R pairs.
    #[error("stereo audio must have an even number of samples, got {0}")]
    InvalidShape(usize),

    /// Sample rates must be positive.
    #[error("sample rates must be positive, got {src} -> {dst}")]
    InvalidRate { src: u32, dst: u32 },
}
