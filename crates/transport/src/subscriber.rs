//! WebRTC subscriber for one publishing participant
//!
//! Answer-side only: the publisher sends the offer (via the HPB), we answer
//! as `recvonly`, decode the incoming Opus track to PCM and feed it to the
//! speaker's transcription pipeline.
//!
//! The subscriber talks to the rest of the room through the narrow
//! [`SubscriberEvents`] capability instead of holding the orchestrator,
//! which would otherwise form a reference cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

use lt_config::constants::audio as audio_consts;
use lt_core::audio::AudioFrame;
use lt_core::HpbSettings;

use crate::codec::OpusDecoder;
use crate::TransportError;

/// How long to wait for ICE gathering before answering with whatever
/// candidates we have.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimal capability a subscriber needs from its room.
#[async_trait]
pub trait SubscriberEvents: Send + Sync {
    /// Send our SDP answer back to the publisher.
    async fn send_answer(&self, speaker: &str, offer_sid: &str, sdp: &str);

    /// Send one local ICE candidate to the publisher.
    async fn send_candidate(&self, speaker: &str, offer_sid: &str, candidate: &str);

    /// The peer connection failed or closed; the room should drop us.
    async fn subscriber_closed(&self, speaker: &str);

    /// Start the speaker's transcription pipeline consuming `frames`.
    /// Returns false when it could not start; the track is then dropped.
    async fn start_transcriber(&self, speaker: &str, frames: mpsc::Receiver<AudioFrame>) -> bool;
}

/// Answer-side peer connection for one publisher.
pub struct PeerSubscriber {
    speaker_session_id: String,
    pc: Arc<RTCPeerConnection>,
}

impl PeerSubscriber {
    /// Build the peer connection and install its event handlers. The SDP
    /// exchange happens separately in [`Self::complete`] so the room can
    /// register the subscriber before candidates start flowing.
    pub async fn new(
        speaker_session_id: String,
        hpb_settings: &HpbSettings,
        events: Arc<dyn SubscriberEvents>,
    ) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_codec(
                RTCRtpCodecParameters {
                    capability: RTCRtpCodecCapability {
                        mime_type: MIME_TYPE_OPUS.to_owned(),
                        clock_rate: audio_consts::WEBRTC_SAMPLE_RATE,
                        channels: 2,
                        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                        rtcp_feedback: vec![],
                    },
                    payload_type: 111,
                    stats_id: String::new(),
                },
                RTPCodecType::Audio,
            )
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_configuration(hpb_settings))
                .await
                .map_err(|e| TransportError::WebRtc(e.to_string()))?,
        );

        pc.add_transceiver_from_kind(
            RTPCodecType::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        let events_state = events.clone();
        let speaker_state = speaker_session_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events_state.clone();
            let speaker = speaker_state.clone();
            Box::pin(async move {
                tracing::debug!(speaker = %speaker, ?state, "peer connection state changed");
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    events.subscriber_closed(&speaker).await;
                }
            })
        }));

        let events_track = events;
        let speaker_track = speaker_session_id.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let events = events_track.clone();
            let speaker = speaker_track.clone();
            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    return;
                }
                tracing::debug!(speaker = %speaker, "receiving audio track");

                // The pipeline connects to the speech service before any
                // frames are queued, so a cold start cannot back the queue
                // up with stale audio.
                let (frames_tx, frames_rx) = mpsc::channel(audio_consts::FRAME_QUEUE_DEPTH);
                if !events.start_transcriber(&speaker, frames_rx).await {
                    tracing::error!(speaker = %speaker, "transcriber failed to start, dropping track");
                    return;
                }

                let decoder = match OpusDecoder::new(audio_consts::WEBRTC_SAMPLE_RATE, 2) {
                    Ok(decoder) => decoder,
                    Err(e) => {
                        tracing::error!(speaker = %speaker, error = %e, "failed to create opus decoder");
                        return;
                    }
                };

                tokio::spawn(read_track(track, decoder, frames_tx, speaker));
            })
        }));

        Ok(Self {
            speaker_session_id,
            pc,
        })
    }

    pub fn speaker_session_id(&self) -> &str {
        &self.speaker_session_id
    }

    /// Whether the connection can still carry media.
    pub fn is_live(&self) -> bool {
        !matches!(
            self.pc.connection_state(),
            RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
        )
    }

    /// Run the SDP exchange for an incoming offer: remote description,
    /// answer, local description, then the answer and each local
    /// `a=candidate:` line go back through `events`.
    pub async fn complete(
        &self,
        offer_sid: &str,
        offer_sdp: &str,
        events: &Arc<dyn SubscriberEvents>,
    ) -> Result<(), TransportError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        let (gather_tx, gather_rx) = oneshot::channel::<()>();
        let gather_tx = Arc::new(parking_lot::Mutex::new(Some(gather_tx)));
        self.pc
            .on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
                if state == RTCIceGathererState::Complete {
                    if let Some(tx) = gather_tx.lock().take() {
                        let _ = tx.send(());
                    }
                }
                Box::pin(async {})
            }));

        // Gathering starts here.
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))?;

        if tokio::time::timeout(ICE_GATHER_TIMEOUT, gather_rx)
            .await
            .is_err()
        {
            tracing::warn!(
                speaker = %self.speaker_session_id,
                "ICE gathering timed out, answering with partial candidates"
            );
        }

        let local_sdp = self
            .pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .ok_or_else(|| TransportError::WebRtc("missing local description".into()))?;

        events
            .send_answer(&self.speaker_session_id, offer_sid, &local_sdp)
            .await;
        for line in local_sdp.lines() {
            if line.starts_with("a=candidate:") {
                events
                    .send_candidate(&self.speaker_session_id, offer_sid, &line[2..])
                    .await;
            }
        }

        Ok(())
    }

    /// Add a remote ICE candidate relayed through the signaling server.
    pub async fn add_ice_candidate(
        &self,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate,
                sdp_mid,
                sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| TransportError::WebRtc(e.to_string()))
    }

    pub async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!(
                speaker = %self.speaker_session_id,
                error = %e,
                "error closing peer connection"
            );
        }
    }
}

/// Pull RTP from the track, decode, and queue PCM frames. Frames are
/// dropped when the queue is full; the loop ends when the track or the
/// pipeline goes away.
async fn read_track(
    track: Arc<TrackRemote>,
    decoder: OpusDecoder,
    frames_tx: mpsc::Sender<AudioFrame>,
    speaker: String,
) {
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                let samples = match decoder.decode(&packet.payload) {
                    Ok(samples) => samples,
                    Err(e) => {
                        tracing::debug!(speaker = %speaker, error = %e, "opus decode error");
                        continue;
                    }
                };
                let data: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
                let frame = AudioFrame::new(data, decoder.sample_rate(), decoder.channels());
                match frames_tx.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::trace!(speaker = %speaker, "frame queue full, dropping frame");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Err(e) => {
                tracing::debug!(speaker = %speaker, error = %e, "audio track ended");
                break;
            }
        }
    }
}

/// ICE servers from the signaling settings payload: plain STUN plus TURN
/// with credentials.
fn rtc_configuration(settings: &HpbSettings) -> RTCConfiguration {
    let mut ice_servers: Vec<RTCIceServer> = settings
        .stunservers
        .iter()
        .map(|s| RTCIceServer {
            urls: s.urls.clone(),
            ..Default::default()
        })
        .collect();
    ice_servers.extend(settings.turnservers.iter().map(|t| RTCIceServer {
        urls: t.urls.clone(),
        username: t.username.clone(),
        credential: t.credential.clone(),
        ..Default::default()
    }));

    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}
