//! Configuration for the live transcription bridge
//!
//! Settings are layered: `LT_`-prefixed environment variables over an
//! optional config file over built-in defaults.

pub mod constants;
pub mod settings;

pub use settings::{load_settings, Settings};

use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("missing required option: {0}")]
    MissingOption(&'static str),
}
