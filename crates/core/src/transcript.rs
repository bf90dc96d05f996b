//! Transcript types

use serde::{Deserialize, Serialize};

/// A transcription result addressed to the recipients of one room.
///
/// Partial transcripts (`is_final == false`) carry the speaker's running
/// accumulator; final transcripts carry the trimmed utterance and reset it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub is_final: bool,
    pub lang_id: String,
    pub message: String,
    pub speaker_session_id: String,
}

impl Transcript {
    pub fn partial(lang_id: &str, message: &str, speaker_session_id: &str) -> Self {
        Self {
            is_final: false,
            lang_id: lang_id.to_string(),
            message: message.to_string(),
            speaker_session_id: speaker_session_id.to_string(),
        }
    }

    pub fn final_result(lang_id: &str, message: &str, speaker_session_id: &str) -> Self {
        Self {
            is_final: true,
            lang_id: lang_id.to_string(),
            message: message.to_string(),
            speaker_session_id: speaker_session_id.to_string(),
        }
    }
}
