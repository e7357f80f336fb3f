//! Audio frame codec
//!
//! Converts between the hardware sample format (interleaved `f32` at the
//! device rate) and the wire format (16-bit little-endian mono PCM). Every
//! conversion allocates a fresh buffer; nothing aliases the caller's input.

use std::time::Duration;

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use thiserror::Error;

/// Sample rate for outbound (captured) wire audio
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Sample rate for inbound (playback) wire audio
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

const BYTES_PER_SAMPLE: usize = 2;

/// Errors produced by the audio codec
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// PCM16 payload length is not a whole number of samples
    #[error("odd PCM16 payload length: {0} bytes")]
    OddByteLength(usize),

    /// Sample rate or channel layout cannot be converted
    #[error("invalid audio format: {0}")]
    InvalidFormat(String),

    /// Resampler failed
    #[error("resample failed: {0}")]
    Resample(String),
}

/// Interleaved 16-bit signed PCM samples with an explicit format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Create a frame from samples already in PCM16
    #[must_use]
    pub const fn new(samples: Vec<i16>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
        }
    }

    /// Reinterpret little-endian PCM16 bytes as a frame
    ///
    /// # Errors
    ///
    /// Returns `CodecError::OddByteLength` if `bytes` is not a multiple of
    /// two, or `InvalidFormat` for a zero rate or channel count
    pub fn from_le_bytes(
        bytes: &[u8],
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, CodecError> {
        if sample_rate == 0 || channels == 0 {
            return Err(CodecError::InvalidFormat(format!(
                "{sample_rate} Hz / {channels} channels"
            )));
        }
        if bytes.len() % BYTES_PER_SAMPLE != 0 {
            return Err(CodecError::OddByteLength(bytes.len()));
        }

        let samples = bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Ok(Self::new(samples, sample_rate, channels))
    }

    /// Serialize to little-endian PCM16 bytes
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    /// Interleaved samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Consume the frame, returning its samples
    #[must_use]
    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of interleaved samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Payload size on the wire
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.samples.len() * BYTES_PER_SAMPLE
    }

    /// Playback duration of the frame
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() / usize::from(self.channels.max(1));
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate.max(1)))
    }
}

/// Encode a hardware capture buffer into a 16 kHz mono wire frame
///
/// Interleaved channels are averaged to mono, then resampled. The output
/// holds `round(input_frames * 16000 / sample_rate)` samples. Returns
/// `Ok(None)` when there is nothing to send.
///
/// # Errors
///
/// Returns error for a zero rate/channel count or if the resampler fails
pub fn encode_capture(
    samples: &[f32],
    sample_rate: u32,
    channels: u16,
) -> Result<Option<AudioFrame>, CodecError> {
    if sample_rate == 0 || channels == 0 {
        return Err(CodecError::InvalidFormat(format!(
            "{sample_rate} Hz / {channels} channels"
        )));
    }
    if samples.is_empty() {
        return Ok(None);
    }

    let mono = downmix(samples, usize::from(channels));
    let target_len = resampled_len(mono.len(), sample_rate, CAPTURE_SAMPLE_RATE);
    if target_len == 0 {
        return Ok(None);
    }

    let resampled = if sample_rate == CAPTURE_SAMPLE_RATE {
        mono
    } else {
        resample(&mono, sample_rate, CAPTURE_SAMPLE_RATE, target_len)?
    };

    let pcm = resampled.iter().copied().map(f32_to_i16).collect();
    Ok(Some(AudioFrame::new(pcm, CAPTURE_SAMPLE_RATE, 1)))
}

/// Decode an inbound wire payload (24 kHz mono PCM16) into a frame
///
/// # Errors
///
/// Returns `CodecError::OddByteLength` for a malformed payload
pub fn decode_playback(bytes: &[u8]) -> Result<AudioFrame, CodecError> {
    AudioFrame::from_le_bytes(bytes, PLAYBACK_SAMPLE_RATE, 1)
}

/// Convert an `f32` sample in [-1.0, 1.0] to PCM16
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0).round() as i16
}

/// Convert a PCM16 sample to `f32` in [-1.0, 1.0)
#[must_use]
pub fn i16_to_f32(sample: i16) -> f32 {
    f32::from(sample) / 32768.0
}

/// Output length for a rate conversion, rounded to the nearest sample
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn resampled_len(input_len: usize, from_rate: u32, to_rate: u32) -> usize {
    let ratio = f64::from(to_rate) / f64::from(from_rate);
    (input_len as f64 * ratio).round() as usize
}

#[allow(clippy::cast_precision_loss)]
fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample one mono buffer with a fresh resampler
///
/// The resampler is flushed with a chunk of silence so its output delay can
/// be trimmed, then the result is fitted to `target_len`.
fn resample(
    samples: &[f32],
    from_rate: u32,
    to_rate: u32,
    target_len: usize,
) -> Result<Vec<f32>, CodecError> {
    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler =
        FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Linear, samples.len(), 1)
            .map_err(|e| CodecError::Resample(format!("resampler init failed: {e}")))?;

    let delay = resampler.output_delay();
    let mut output = resampler
        .process(&[samples], None)
        .map_err(|e| CodecError::Resample(e.to_string()))?
        .swap_remove(0);

    let tail = resampler
        .process_partial(None::<&[&[f32]]>, None)
        .map_err(|e| CodecError::Resample(e.to_string()))?
        .swap_remove(0);
    output.extend_from_slice(&tail);

    output.drain(..delay.min(output.len()));
    output.resize(target_len, 0.0);
    Ok(output)
}
