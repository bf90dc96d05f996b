//! Core types for the live transcription bridge
//!
//! This crate provides the foundational pieces shared by the other crates:
//! - Pure audio sample processing (stereo downmix, resampling, PCM packing)
//! - Transcript and call-state types
//! - HPB signaling settings (STUN/TURN)
//! - Language metadata

pub mod audio;
pub mod error;
pub mod language;
pub mod transcript;
pub mod types;

pub use audio::{
    float32_to_int16, int16_to_float32, pack_webrtc_frame, resample_f32, resample_i16,
    stereo_to_mono, AudioFrame,
};
pub use error::AudioError;
pub use language::{is_supported, supported_languages, LanguageInfo, DEFAULT_LANGUAGE};
pub use transcript::Transcript;
pub use types::{call_flag, HpbSettings, ReconnectMethod, SigConnectResult, StunServer, TurnServer};
