//! Per-speaker transcription session
//!
//! Glues one audio frame source to one speech service stream: frames are
//! packed into chunks, chunks stream upstream, and token/VAD-end messages
//! fold into partial and final transcripts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use lt_config::constants::{audio as audio_consts, stt};
use lt_core::audio::{pack_webrtc_frame, AudioFrame};
use lt_core::Transcript;

use crate::client::{SttSender, SttStream};
use crate::protocol::{SttConfig, SttMessage, SttMessageKind};
use crate::PipelineError;

/// Folds speech service messages into transcripts for one speaker.
///
/// Token text accumulates until either the accumulator grows past the
/// partial-emission threshold (partial transcript, accumulator kept) or a
/// VAD end arrives (final transcript, accumulator cleared).
pub struct TranscriptAccumulator {
    speaker_session_id: String,
    language: Arc<Mutex<String>>,
    buffer: String,
}

impl TranscriptAccumulator {
    pub fn new(speaker_session_id: impl Into<String>, language: Arc<Mutex<String>>) -> Self {
        Self {
            speaker_session_id: speaker_session_id.into(),
            language,
            buffer: String::new(),
        }
    }

    /// Apply one message; a returned transcript is ready for fan-out.
    pub fn on_message(&mut self, msg: &SttMessage) -> Result<Option<Transcript>, PipelineError> {
        match msg.kind() {
            SttMessageKind::Token { text } => {
                self.buffer.push_str(text);
                if self.buffer.chars().count() > stt::PARTIAL_EMIT_CHARS {
                    let lang = self.language.lock().clone();
                    return Ok(Some(Transcript::partial(
                        &lang,
                        &self.buffer,
                        &self.speaker_session_id,
                    )));
                }
                Ok(None)
            }
            SttMessageKind::VadEnd => {
                let trimmed = self.buffer.trim().to_string();
                self.buffer.clear();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                let lang = self.language.lock().clone();
                Ok(Some(Transcript::final_result(
                    &lang,
                    &trimmed,
                    &self.speaker_session_id,
                )))
            }
            SttMessageKind::Error { message } => {
                Err(PipelineError::StreamFailed(message.clone()))
            }
            SttMessageKind::Ping | SttMessageKind::Unknown => Ok(None),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// One transcription session for one speaker.
pub struct TranscriptionSession {
    speaker_session_id: String,
    config: SttConfig,
    language: Arc<Mutex<String>>,
    min_buffer_ms: u64,
    stale_timeout: Duration,
}

impl TranscriptionSession {
    pub fn new(
        speaker_session_id: impl Into<String>,
        config: SttConfig,
        language: Arc<Mutex<String>>,
        stale_timeout: Duration,
    ) -> Self {
        Self {
            speaker_session_id: speaker_session_id.into(),
            config,
            language,
            min_buffer_ms: audio_consts::MIN_BUFFER_MS,
            stale_timeout,
        }
    }

    /// Connect to the speech service.
    ///
    /// Kept separate from [`Self::run`] so the caller can hold off the audio
    /// source until the service is ready; a cold start can take most of the
    /// connect timeout.
    pub async fn connect(&self) -> Result<SttStream, PipelineError> {
        SttStream::connect(&self.config).await
    }

    /// Run the session to completion over an established stream: pump frames
    /// upstream and transcripts downstream. Returns when the peer closes the
    /// stream or a service error ends it.
    pub async fn run(
        self,
        mut stream: SttStream,
        frames: mpsc::Receiver<AudioFrame>,
        transcripts: mpsc::Sender<Transcript>,
    ) -> Result<(), PipelineError> {
        tracing::info!(
            speaker = %self.speaker_session_id,
            "started transcription session"
        );

        // First send instant with no response yet; cleared on every inbound
        // message, re-armed on the next chunk.
        let unanswered_since: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));

        let send_task = tokio::spawn(send_audio_loop(
            frames,
            stream.sender(),
            self.min_buffer_ms,
            unanswered_since.clone(),
        ));

        let stale_task = tokio::spawn(stale_watch(
            self.speaker_session_id.clone(),
            self.stale_timeout,
            unanswered_since.clone(),
        ));

        let mut accumulator =
            TranscriptAccumulator::new(self.speaker_session_id.clone(), self.language.clone());
        let result = loop {
            match stream.recv().await {
                Some(msg) => {
                    *unanswered_since.lock() = None;
                    match accumulator.on_message(&msg) {
                        Ok(Some(transcript)) => {
                            if transcripts.send(transcript).await.is_err() {
                                // Orchestrator went away; nothing left to do.
                                break Ok(());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(
                                speaker = %self.speaker_session_id,
                                error = %e,
                                "speech service reported an error"
                            );
                            break Err(e);
                        }
                    }
                }
                None => break Ok(()),
            }
        };

        send_task.abort();
        stale_task.abort();
        tracing::info!(
            speaker = %self.speaker_session_id,
            ok = result.is_ok(),
            "transcription session ended"
        );
        result
    }
}

/// Pack and buffer frames; flush one chunk upstream per `min_buffer_ms` of
/// accumulated audio. Stops when the frame source or the stream closes.
async fn send_audio_loop(
    mut frames: mpsc::Receiver<AudioFrame>,
    sender: SttSender,
    min_buffer_ms: u64,
    unanswered_since: Arc<Mutex<Option<Instant>>>,
) {
    let mut buffer: Vec<u8> = Vec::new();
    let mut buffered_ms = 0.0f64;

    while let Some(frame) = frames.recv().await {
        let packed = match pack_webrtc_frame(
            &frame.data,
            frame.sample_rate,
            audio_consts::STT_SAMPLE_RATE,
            frame.is_stereo(),
        ) {
            Ok(packed) => packed,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed audio frame");
                continue;
            }
        };

        let samples = packed.len() / 4;
        buffered_ms += samples as f64 * 1000.0 / audio_consts::STT_SAMPLE_RATE as f64;
        buffer.extend_from_slice(&packed);

        if buffered_ms >= min_buffer_ms as f64 {
            let chunk = std::mem::take(&mut buffer);
            buffered_ms = 0.0;
            if sender.send(chunk).await.is_err() {
                return;
            }
            let mut unanswered = unanswered_since.lock();
            if unanswered.is_none() {
                *unanswered = Some(Instant::now());
            }
        }
    }

    if !buffer.is_empty() {
        let _ = sender.send(buffer).await;
    }
}

/// Warn when audio has been flowing upstream for longer than the stale
/// threshold without any message back. Observability only; never tears the
/// session down.
async fn stale_watch(
    speaker_session_id: String,
    stale_timeout: Duration,
    unanswered_since: Arc<Mutex<Option<Instant>>>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let mut unanswered = unanswered_since.lock();
        if let Some(since) = *unanswered {
            if since.elapsed() > stale_timeout {
                tracing::warn!(
                    speaker = %speaker_session_id,
                    stale_secs = since.elapsed().as_secs(),
                    "audio is being sent but no speech results are coming back"
                );
                *unanswered = Some(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SttMessage;

    fn accumulator() -> TranscriptAccumulator {
        TranscriptAccumulator::new("spkr-1", Arc::new(Mutex::new("en".to_string())))
    }

    #[test]
    fn short_tokens_emit_nothing() {
        let mut acc = accumulator();
        let msg = SttMessage::parse(r#"{"type":"token","text":"hello "}"#);
        assert!(acc.on_message(&msg).unwrap().is_none());
        assert!(!acc.is_empty());
    }

    #[test]
    fn partial_then_final_transcript() {
        let mut acc = accumulator();
        let token = SttMessage::parse(r#"{"type":"token","text":"abcdefghij"}"#);

        let mut emitted = Vec::new();
        for _ in 0..6 {
            if let Some(t) = acc.on_message(&token).unwrap() {
                emitted.push(t);
            }
        }
        // One partial after the sixth token pushes the accumulator past 50.
        assert_eq!(emitted.len(), 1);
        assert!(!emitted[0].is_final);
        assert_eq!(emitted[0].message.len(), 60);
        assert_eq!(emitted[0].speaker_session_id, "spkr-1");

        let vad_end = SttMessage::parse(r#"{"type":"vad_end"}"#);
        let final_t = acc.on_message(&vad_end).unwrap().expect("final transcript");
        assert!(final_t.is_final);
        assert_eq!(final_t.message.len(), 60);
        assert!(acc.is_empty());
    }

    #[test]
    fn final_transcript_is_trimmed() {
        let mut acc = accumulator();
        let token = SttMessage::parse(r#"{"type":"token","text":"  bonjour  "}"#);
        acc.on_message(&token).unwrap();

        let vad_end = SttMessage::parse(r#"{"type":"vad_end"}"#);
        let final_t = acc.on_message(&vad_end).unwrap().unwrap();
        assert_eq!(final_t.message, "bonjour");
    }

    #[test]
    fn whitespace_only_utterance_is_dropped() {
        let mut acc = accumulator();
        let token = SttMessage::parse(r#"{"type":"token","text":"   "}"#);
        acc.on_message(&token).unwrap();

        let vad_end = SttMessage::parse(r#"{"type":"vad_end"}"#);
        assert!(acc.on_message(&vad_end).unwrap().is_none());
        assert!(acc.is_empty());
    }

    #[test]
    fn language_changes_apply_to_later_transcripts() {
        let language = Arc::new(Mutex::new("en".to_string()));
        let mut acc = TranscriptAccumulator::new("spkr-1", language.clone());

        let token = SttMessage::parse(r#"{"type":"token","text":"salut"}"#);
        acc.on_message(&token).unwrap();
        *language.lock() = "fr".to_string();

        let vad_end = SttMessage::parse(r#"{"type":"vad_end"}"#);
        let final_t = acc.on_message(&vad_end).unwrap().unwrap();
        assert_eq!(final_t.lang_id, "fr");
    }

    #[test]
    fn service_error_fails_the_stream() {
        let mut acc = accumulator();
        let err = SttMessage::parse(r#"{"type":"error","message":"model crashed"}"#);
        match acc.on_message(&err) {
            Err(PipelineError::StreamFailed(m)) => assert_eq!(m, "model crashed"),
            other => panic!("expected StreamFailed, got {other:?}"),
        }
    }

    #[test]
    fn pings_and_unknowns_are_ignored() {
        let mut acc = accumulator();
        for raw in [r#"{"type":"ping"}"#, r#"{"type":"mystery"}"#] {
            let msg = SttMessage::parse(raw);
            assert!(acc.on_message(&msg).unwrap().is_none());
        }
        assert!(acc.is_empty());
    }
}
