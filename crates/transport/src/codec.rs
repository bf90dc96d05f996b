//! Opus payload decoding for subscribed tracks

use audiopus::coder::Decoder;
use audiopus::{Channels, SampleRate};
use parking_lot::Mutex;

use crate::TransportError;

/// Decodes RTP Opus payloads into interleaved int16 PCM.
///
/// One decoder per subscribed track; Opus decoders are stateful, so payloads
/// must be fed in arrival order.
pub struct OpusDecoder {
    decoder: Mutex<Decoder>,
    channels: usize,
    sample_rate: u32,
}

impl OpusDecoder {
    /// 120 ms at 48 kHz, the largest frame Opus allows.
    const MAX_FRAME_SAMPLES: usize = 5760;

    pub fn new(sample_rate: u32, channels: u8) -> Result<Self, TransportError> {
        let rate = match sample_rate {
            8000 => SampleRate::Hz8000,
            12000 => SampleRate::Hz12000,
            16000 => SampleRate::Hz16000,
            24000 => SampleRate::Hz24000,
            48000 => SampleRate::Hz48000,
            other => {
                return Err(TransportError::Codec(format!(
                    "unsupported opus sample rate: {other}"
                )))
            }
        };
        let chans = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => {
                return Err(TransportError::Codec(format!(
                    "unsupported channel count: {other}"
                )))
            }
        };

        let decoder = Decoder::new(rate, chans)
            .map_err(|e| TransportError::Codec(format!("failed to create decoder: {e}")))?;

        Ok(Self {
            decoder: Mutex::new(decoder),
            channels: channels as usize,
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u8 {
        self.channels as u8
    }

    /// Decode one payload into interleaved PCM.
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<i16>, TransportError> {
        let mut output = vec![0i16; Self::MAX_FRAME_SAMPLES * self.channels];

        let samples_per_channel = {
            let mut decoder = self.decoder.lock();
            let packet = payload
                .try_into()
                .map_err(|e| TransportError::Codec(format!("invalid opus packet: {e}")))?;
            let signals = (&mut output[..])
                .try_into()
                .map_err(|e| TransportError::Codec(format!("invalid output buffer: {e}")))?;
            decoder
                .decode(Some(packet), signals, false)
                .map_err(|e| TransportError::Codec(e.to_string()))?
        };

        output.truncate(samples_per_channel * self.channels);
        Ok(output)
    }
}
