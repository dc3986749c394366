//! PCM wire codec.
//!
//! The live model exchanges audio as base64-wrapped 16-bit little-endian PCM.
//! Everything here is pure and rate-agnostic: capture and playback pass their
//! own sample rate and channel count.

use crate::defaults;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes per 16-bit sample.
const BYTES_PER_SAMPLE: usize = 2;

/// Errors produced while turning an inbound payload into samples.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload has odd length {len}, expected whole 16-bit samples")]
    OddLength { len: usize },

    #[error("{samples} samples do not divide evenly into {channels} channels")]
    PartialFrame { samples: usize, channels: u16 },

    #[error("chunk of {frames} frames is shorter than the {min_frames}-frame minimum")]
    Truncated { frames: usize, min_frames: usize },

    #[error("channel count must be at least 1")]
    InvalidChannels,

    #[error("sample rate must be non-zero")]
    InvalidSampleRate,
}

/// A transport-ready media payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    /// Base64 of the little-endian PCM bytes.
    pub data: String,
    /// e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
}

/// Decoded, de-interleaved audio normalized to [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Builds a buffer from per-channel sample vectors.
    ///
    /// All channels must have the same length; the shortest length wins otherwise.
    pub fn new(sample_rate: u32, mut channels: Vec<Vec<f32>>) -> Self {
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        for channel in &mut channels {
            channel.truncate(frames);
        }
        Self {
            sample_rate,
            channels,
        }
    }

    /// Single-channel convenience constructor.
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self::new(sample_rate, vec![samples])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn number_of_channels(&self) -> usize {
        self.channels.len()
    }

    /// Frames per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Playback length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn channel_data(&self, channel: usize) -> Option<&[f32]> {
        self.channels.get(channel).map(Vec::as_slice)
    }

    /// Averages all channels into one.
    pub fn to_mono(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            n => (0..self.frames())
                .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() / n as f32)
                .collect(),
        }
    }
}

/// Quantizes one float sample to 16-bit PCM, clamping out-of-range input.
pub fn quantize(sample: f32) -> i16 {
    // NaN saturates to 0 through the `as` cast.
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// Inverse of [`quantize`]; `i16::MIN` is pinned to -1.0.
pub fn dequantize(value: i16) -> f32 {
    (value as f32 / i16::MAX as f32).max(-1.0)
}

/// Converts float samples to little-endian 16-bit PCM bytes.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        bytes.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    bytes
}

/// Encodes a captured frame as a transport payload tagged with its rate.
pub fn encode(samples: &[f32], sample_rate: u32) -> MediaBlob {
    MediaBlob {
        data: BASE64.encode(float_to_pcm16(samples)),
        mime_type: format!("{}{}", defaults::PCM_MIME_PREFIX, sample_rate),
    }
}

/// Unwraps the base64 layer of an inbound payload.
pub fn base64_to_bytes(payload: &str) -> Result<Vec<u8>, DecodeError> {
    Ok(BASE64.decode(payload.trim())?)
}

/// Decodes interleaved little-endian 16-bit PCM into a normalized buffer.
pub fn decode(bytes: &[u8], sample_rate: u32, channels: u16) -> Result<AudioBuffer, DecodeError> {
    if channels == 0 {
        return Err(DecodeError::InvalidChannels);
    }
    if sample_rate == 0 {
        return Err(DecodeError::InvalidSampleRate);
    }
    if bytes.len() % BYTES_PER_SAMPLE != 0 {
        return Err(DecodeError::OddLength { len: bytes.len() });
    }

    let total_samples = bytes.len() / BYTES_PER_SAMPLE;
    let channel_count = channels as usize;
    if total_samples % channel_count != 0 {
        return Err(DecodeError::PartialFrame {
            samples: total_samples,
            channels,
        });
    }

    let frames = total_samples / channel_count;
    let mut data = vec![Vec::with_capacity(frames); channel_count];
    for (i, pair) in bytes.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        data[i % channel_count].push(dequantize(value));
    }

    Ok(AudioBuffer::new(sample_rate, data))
}

/// Decodes a base64 payload straight into a buffer.
pub fn decode_base64(
    payload: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<AudioBuffer, DecodeError> {
    let bytes = base64_to_bytes(payload)?;
    decode(&bytes, sample_rate, channels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, amplitude: f32) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 16000.0).sin())
            .collect()
    }

    #[test]
    fn quantize_scales_and_rounds() {
        assert_eq!(quantize(0.0), 0);
        assert_eq!(quantize(1.0), i16::MAX);
        assert_eq!(quantize(-1.0), -i16::MAX);
        assert_eq!(quantize(0.5), 16384);
    }

    #[test]
    fn quantize_clamps_out_of_range() {
        assert_eq!(quantize(3.5), i16::MAX);
        assert_eq!(quantize(-7.0), -i16::MAX);
        assert_eq!(quantize(f32::NAN), 0);
    }

    #[test]
    fn dequantize_stays_in_range() {
        assert_eq!(dequantize(i16::MAX), 1.0);
        assert_eq!(dequantize(i16::MIN), -1.0);
        assert_eq!(dequantize(0), 0.0);
    }

    #[test]
    fn pcm16_is_little_endian() {
        let bytes = float_to_pcm16(&[1.0, -1.0]);
        assert_eq!(bytes, vec![0xFF, 0x7F, 0x01, 0x80]);
    }

    #[test]
    fn encode_tags_mime_type_with_rate() {
        let blob = encode(&[0.0; 4], 16000);
        assert_eq!(blob.mime_type, "audio/pcm;rate=16000");
        assert_eq!(blob.data, "AAAAAAAAAAA=");
    }

    #[test]
    fn blob_serializes_camel_case() {
        let json = serde_json::to_string(&encode(&[0.0], 16000)).unwrap();
        assert!(json.contains("\"mimeType\":\"audio/pcm;rate=16000\""), "{}", json);
    }

    #[test]
    fn roundtrip_within_one_quantization_step() {
        let step = 1.0 / 32767.0;
        for len in [1usize, 2, 4095, 4096, 48000] {
            let input = sine(len, 0.9);
            let blob = encode(&input, 16000);
            let buffer = decode_base64(&blob.data, 16000, 1).unwrap();
            let output = buffer.channel_data(0).unwrap();
            assert_eq!(output.len(), len);
            for (a, b) in input.iter().zip(output) {
                assert!((a - b).abs() <= step, "len {}: {} vs {}", len, a, b);
            }
        }
    }

    #[test]
    fn roundtrip_full_scale_edges() {
        let input = [1.0f32, -1.0, 0.0, 0.25, -0.25];
        let buffer = decode(&float_to_pcm16(&input), 24000, 1).unwrap();
        for (a, b) in input.iter().zip(buffer.channel_data(0).unwrap()) {
            assert!((a - b).abs() <= 1.0 / 32767.0);
        }
    }

    #[test]
    fn decode_rejects_odd_length() {
        let result = decode(&[0x00, 0x01, 0x02], 24000, 1);
        assert_eq!(result, Err(DecodeError::OddLength { len: 3 }));
    }

    #[test]
    fn decode_rejects_partial_frame() {
        let result = decode(&[0u8; 6], 24000, 2);
        assert_eq!(
            result,
            Err(DecodeError::PartialFrame {
                samples: 3,
                channels: 2
            })
        );
    }

    #[test]
    fn decode_rejects_zero_channels_and_rate() {
        assert_eq!(decode(&[0u8; 2], 24000, 0), Err(DecodeError::InvalidChannels));
        assert_eq!(decode(&[0u8; 2], 0, 1), Err(DecodeError::InvalidSampleRate));
    }

    #[test]
    fn decode_deinterleaves_channels() {
        let bytes = float_to_pcm16(&[0.5, -0.5, 0.25, -0.25]);
        let buffer = decode(&bytes, 24000, 2).unwrap();
        assert_eq!(buffer.number_of_channels(), 2);
        assert_eq!(buffer.frames(), 2);
        assert!(buffer.channel_data(0).unwrap()[1] > 0.2);
        assert!(buffer.channel_data(1).unwrap()[1] < -0.2);
    }

    #[test]
    fn decode_base64_rejects_garbage() {
        assert!(matches!(
            decode_base64("not base64!!", 24000, 1),
            Err(DecodeError::Base64(_))
        ));
    }

    #[test]
    fn duration_follows_sample_rate() {
        let buffer = AudioBuffer::mono(24000, vec![0.0; 12000]);
        assert!((buffer.duration() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn to_mono_averages_channels() {
        let buffer = AudioBuffer::new(24000, vec![vec![1.0, 0.0], vec![0.0, 0.0]]);
        assert_eq!(buffer.to_mono(), vec![0.5, 0.0]);
    }

    #[test]
    fn empty_payload_decodes_to_empty_buffer() {
        let buffer = decode(&[], 24000, 1).unwrap();
        assert_eq!(buffer.frames(), 0);
        assert_eq!(buffer.duration(), 0.0);
    }
}
