//! Pure audio sample processing
//!
//! Every function in this module is a total function over sample buffers with
//! no I/O and no shared state, so the whole DSP path can be tested in
//! isolation.
//!
//! The speech service consumes mono float32 PCM at its own rate; WebRTC
//! delivers interleaved int16 PCM, usually 48 kHz stereo. [`pack_webrtc_frame`]
//! is the end-to-end conversion between the two.

use bytes::Bytes;
use rustfft::{num_complex::Complex, FftPlanner};

use crate::error::AudioError;

/// One decoded PCM payload from a WebRTC track.
///
/// `data` holds interleaved little-endian int16 samples; the sample rate and
/// channel count come from the decoder and are fixed for the lifetime of a
/// track.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub data: Bytes,
    pub sample_rate: u32,
    pub channels: u8,
}

impl AudioFrame {
    pub fn new(data: impl Into<Bytes>, sample_rate: u32, channels: u8) -> Self {
        Self {
            data: data.into(),
            sample_rate,
            channels,
        }
    }

    pub fn is_stereo(&self) -> bool {
        self.channels == 2
    }
}

/// Downmix interleaved stereo to mono by averaging each L,R pair.
///
/// The mean is taken in a 32-bit accumulator so the 16-bit sample width is
/// preserved without overflow. Fails with [`AudioError::InvalidShape`] when
/// the input length is odd.
pub fn stereo_to_mono(samples: &[i16]) -> Result<Vec<i16>, AudioError> {
    if samples.is_empty() {
        return Ok(Vec::new());
    }
    if samples.len() % 2 != 0 {
        return Err(AudioError::InvalidShape(samples.len()));
    }

    Ok(samples
        .chunks_exact(2)
        .map(|pair| ((pair[0] as i32 + pair[1] as i32) / 2) as i16)
        .collect())
}

/// Convert int16 PCM to float32 normalized into `[-1.0, 1.0]`.
pub fn int16_to_float32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Convert normalized float32 PCM back to int16, clamping to the int16 range.
pub fn float32_to_int16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32768.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Resample int16 PCM from `src_rate` to `dst_rate`.
///
/// Identity when the rates match. The output has exactly
/// `round(len * dst_rate / src_rate)` samples, clamped back into the int16
/// range.
pub fn resample_i16(samples: &[i16], src_rate: u32, dst_rate: u32) -> Result<Vec<i16>, AudioError> {
    if src_rate == 0 || dst_rate == 0 {
        return Err(AudioError::InvalidRate {
            src: src_rate,
            dst: dst_rate,
        });
    }
    if src_rate == dst_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let input: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
    let output = resample_spectrum(&input, src_rate, dst_rate);
    Ok(output
        .into_iter()
        .map(|s| s.clamp(-32768.0, 32767.0) as i16)
        .collect())
}

/// Resample float32 PCM from `src_rate` to `dst_rate`.
///
/// Same contract as [`resample_i16`], without clamping.
pub fn resample_f32(samples: &[f32], src_rate: u32, dst_rate: u32) -> Result<Vec<f32>, AudioError> {
    if src_rate == 0 || dst_rate == 0 {
        return Err(AudioError::InvalidRate {
            src: src_rate,
            dst: dst_rate,
        });
    }
    if src_rate == dst_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let input: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
    Ok(resample_spectrum(&input, src_rate, dst_rate)
        .into_iter()
        .map(|s| s as f32)
        .collect())
}

/// FFT-domain resampler: forward transform, truncate or zero-pad the
/// spectrum to the target length, inverse transform.
///
/// The Nyquist bin is folded on downsampling and split on upsampling so that
/// real input stays real up to rounding error.
fn resample_spectrum(input: &[f64], src_rate: u32, dst_rate: u32) -> Vec<f64> {
    let n = input.len();
    let m = (n as f64 * dst_rate as f64 / src_rate as f64).round() as usize;
    if m == 0 {
        return Vec::new();
    }

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(n);
    let mut spectrum: Vec<Complex<f64>> =
        input.iter().map(|&s| Complex::new(s, 0.0)).collect();
    forward.process(&mut spectrum);

    let mut resized = vec![Complex::new(0.0, 0.0); m];
    let keep = n.min(m);
    let nyq = keep / 2 + 1;
    resized[..nyq].copy_from_slice(&spectrum[..nyq]);
    if keep > 2 {
        let tail = keep - nyq;
        resized[m - tail..].copy_from_slice(&spectrum[n - tail..]);
    }
    if keep % 2 == 0 {
        let half = keep / 2;
        if m < n {
            // Fold the aliased negative-frequency Nyquist bin.
            resized[half] += spectrum[n - half];
        } else if m > n {
            resized[half] *= 0.5;
            resized[m - half] = resized[half];
        }
    }

    let inverse = planner.plan_fft_inverse(m);
    inverse.process(&mut resized);

    // rustfft leaves the inverse unnormalized (scale 1/m); the spectrum
    // resize contributes m/n, so the combined factor is 1/n.
    let scale = 1.0 / n as f64;
    resized.into_iter().map(|c| c.re * scale).collect()
}

/// Convert one WebRTC PCM payload into the upstream speech format.
///
/// Complete pipeline: int16 LE bytes -> mono -> resample -> float32 LE bytes.
/// A trailing odd byte is dropped; the stereo downmix only applies when the
/// sample count is even.
pub fn pack_webrtc_frame(
    frame: &[u8],
    src_rate: u32,
    dst_rate: u32,
    is_stereo: bool,
) -> Result<Vec<u8>, AudioError> {
    let mut samples: Vec<i16> = frame
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();

    if is_stereo && samples.len() % 2 == 0 {
        samples = stereo_to_mono(&samples)?;
    }

    if src_rate != dst_rate {
        samples = resample_i16(&samples, src_rate, dst_rate)?;
    }

    Ok(int16_to_float32(&samples)
        .into_iter()
        .flat_map(|s| s.to_le_bytes())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_downmix_averages_pairs() {
        let stereo = [100i16, 200, 300, 400];
        let mono = stereo_to_mono(&stereo).unwrap();
        assert_eq!(mono, vec![150, 350]);
    }

    #[test]
    fn stereo_downmix_truncates_toward_zero() {
        // numpy's mean().astype(int16) truncates; integer division matches.
        assert_eq!(stereo_to_mono(&[-3, -4]).unwrap(), vec![-3]);
        assert_eq!(stereo_to_mono(&[3, 4]).unwrap(), vec![3]);
    }

    #[test]
    fn stereo_downmix_rejects_odd_length() {
        assert_eq!(
            stereo_to_mono(&[1, 2, 3]),
            Err(AudioError::InvalidShape(3))
        );
    }

    #[test]
    fn stereo_downmix_empty_is_empty() {
        assert_eq!(stereo_to_mono(&[]).unwrap(), Vec::<i16>::new());
    }

    #[test]
    fn stereo_downmix_does_not_overflow() {
        let mono = stereo_to_mono(&[i16::MAX, i16::MAX, i16::MIN, i16::MIN]).unwrap();
        assert_eq!(mono, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn int16_float32_roundtrip_is_identity() {
        let samples: Vec<i16> = vec![0, 1, -1, 1000, -1000, 16384, -16384, 32767, -32768];
        let roundtrip = float32_to_int16(&int16_to_float32(&samples));
        assert_eq!(roundtrip, samples);
    }

    #[test]
    fn float32_to_int16_clamps() {
        assert_eq!(float32_to_int16(&[1.5, -1.5]), vec![32767, -32768]);
    }

    #[test]
    fn int16_to_float32_range() {
        let converted = int16_to_float32(&[32767, -32768]);
        assert!(converted[0] < 1.0);
        assert_eq!(converted[1], -1.0);
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let samples = vec![1i16, 2, 3, 4];
        assert_eq!(resample_i16(&samples, 48000, 48000).unwrap(), samples);
    }

    #[test]
    fn resample_empty_is_empty() {
        assert_eq!(resample_i16(&[], 48000, 24000).unwrap(), Vec::<i16>::new());
    }

    #[test]
    fn resample_rejects_zero_rate() {
        assert!(matches!(
            resample_i16(&[0; 10], 0, 24000),
            Err(AudioError::InvalidRate { .. })
        ));
        assert!(matches!(
            resample_f32(&[0.0; 10], 48000, 0),
            Err(AudioError::InvalidRate { .. })
        ));
    }

    #[test]
    fn resample_output_length_is_rounded_ratio() {
        for (len, src, dst) in [
            (4800usize, 48000u32, 24000u32),
            (4800, 48000, 16000),
            (1000, 24000, 48000),
            (441, 44100, 48000),
            (7, 48000, 24000),
        ] {
            let samples = vec![0i16; len];
            let out = resample_i16(&samples, src, dst).unwrap();
            let expected = (len as f64 * dst as f64 / src as f64).round() as usize;
            assert_eq!(out.len(), expected, "len={len} {src}->{dst}");
        }
    }

    #[test]
    fn resample_preserves_constant_signal() {
        let samples = vec![1500i16; 960];
        let out = resample_i16(&samples, 48000, 24000).unwrap();
        assert_eq!(out.len(), 480);
        for s in out {
            assert!((s - 1500).abs() <= 1, "got {s}");
        }
    }

    #[test]
    fn resample_upsamples_constant_signal() {
        let samples = vec![0.25f32; 480];
        let out = resample_f32(&samples, 24000, 48000).unwrap();
        assert_eq!(out.len(), 960);
        for s in out {
            assert!((s - 0.25).abs() < 1e-3, "got {s}");
        }
    }

    #[test]
    fn pack_webrtc_frame_full_pipeline() {
        // 1920 interleaved samples: L=1000, R=2000 at 48 kHz stereo.
        let mut pcm = Vec::with_capacity(1920 * 2);
        for _ in 0..960 {
            pcm.extend_from_slice(&1000i16.to_le_bytes());
            pcm.extend_from_slice(&2000i16.to_le_bytes());
        }

        let packed = pack_webrtc_frame(&pcm, 48000, 24000, true).unwrap();
        assert_eq!(packed.len(), 480 * 4);

        let expected = 1500.0 / 32768.0;
        for chunk in packed.chunks_exact(4) {
            let sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            assert!(
                (sample - expected).abs() < 0.01,
                "sample {sample} not near {expected}"
            );
        }
    }

    #[test]
    fn pack_webrtc_frame_drops_trailing_odd_byte() {
        let pcm = [0u8, 0, 0];
        let packed = pack_webrtc_frame(&pcm, 24000, 24000, false).unwrap();
        assert_eq!(packed.len(), 4);
    }
}
