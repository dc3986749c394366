//! Sample conversions between device formats and the wire format.

use crate::error::{Result, VoxliveError};
use rubato::{FftFixedIn, Resampler};
use tracing::debug;

/// Mix interleaved multi-channel audio down to mono by averaging channels.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampler for one self-contained buffer.
///
/// Good enough for speech playback chunks; live streams go through
/// [`StreamResampler`] instead.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len =
        (samples.len() as u64 * to_rate as u64).div_ceil(from_rate as u64) as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as f32
            }
        })
        .collect()
}

/// Convert an i16 device sample to a normalized float.
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// Down-mix and resample a live capture stream, one device block at a time.
///
/// Input is buffered into the resampler's fixed chunk size, so the output
/// only depends on the concatenated stream and never on how the device
/// happened to slice it.
pub struct StreamResampler {
    channels: usize,
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
    out: Vec<f32>,
}

impl StreamResampler {
    pub fn new(channels: usize, from_rate: u32, to_rate: u32) -> Result<Self> {
        let resampler = if from_rate == to_rate {
            None
        } else {
            let resampler = FftFixedIn::<f32>::new(
                from_rate as usize,
                to_rate as usize,
                RESAMPLER_CHUNK_SIZE,
                1,
                1,
            )
            .map_err(|e| VoxliveError::AudioDevice {
                message: format!("Failed to create {from_rate}->{to_rate} Hz resampler: {e}"),
            })?;
            Some(resampler)
        };
        Ok(Self {
            channels: channels.max(1),
            resampler,
            pending: Vec::with_capacity(RESAMPLER_CHUNK_SIZE * 2),
            out: Vec::new(),
        })
    }

    /// Feeds one interleaved device block; returns the mono samples ready so far.
    pub fn process(&mut self, interleaved: &[f32]) -> &[f32] {
        if self.channels == 1 {
            self.pending.extend_from_slice(interleaved);
        } else {
            self.pending
                .extend_from_slice(&downmix(interleaved, self.channels));
        }

        self.out.clear();
        let Some(resampler) = self.resampler.as_mut() else {
            self.out.append(&mut self.pending);
            return &self.out;
        };

        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            match resampler.process(&[&self.pending[..needed]], None) {
                Ok(chunks) => {
                    if let Some(mono) = chunks.first() {
                        self.out.extend_from_slice(mono);
                    }
                }
                Err(e) => debug!("resampler dropped a chunk: {}", e),
            }
            self.pending.drain(..needed);
        }
        &self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resample_identity_same_rate() {
        let samples = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&samples, 16000, 16000), samples);
    }

    #[test]
    fn resample_upsample_interpolates() {
        let samples = vec![0.0, 0.5, 1.0];
        let resampled = resample(&samples, 8000, 16000);
        assert_eq!(resampled.len(), 6);
        assert_eq!(resampled[0], 0.0);
        assert!(resampled[1] > 0.0 && resampled[1] < 0.5);
        assert_eq!(resampled[2], 0.5);
    }

    #[test]
    fn resample_48k_to_16k_thirds_length() {
        let samples = vec![0.0; 4800];
        assert_eq!(resample(&samples, 48000, 16000).len(), 1600);
    }

    #[test]
    fn resample_16k_to_24k_grows_by_half() {
        let samples = vec![0.25; 1600];
        let resampled = resample(&samples, 16000, 24000);
        assert_eq!(resampled.len(), 2400);
        assert!(resampled.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn resample_handles_edge_cases() {
        assert!(resample(&[], 16000, 8000).is_empty());
        assert_eq!(resample(&[0.5], 16000, 8000), vec![0.5]);
    }

    #[test]
    fn downmix_averages_stereo() {
        let stereo = vec![-0.5, 0.5, 0.25, 0.75];
        assert_eq!(downmix(&stereo, 2), vec![0.0, 0.5]);
    }

    #[test]
    fn downmix_mono_is_identity() {
        let mono = vec![0.1, 0.2];
        assert_eq!(downmix(&mono, 1), mono);
    }

    #[test]
    fn i16_conversion_is_normalized() {
        assert_eq!(i16_to_f32(i16::MAX), 1.0);
        assert_eq!(i16_to_f32(0), 0.0);
    }

    fn sine(len: usize, rate: f32) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 440.0 * std::f32::consts::TAU / rate).sin() * 0.5)
            .collect()
    }

    fn run_blocks(input: &[f32], block: usize) -> Vec<f32> {
        let mut resampler = StreamResampler::new(1, 48000, 16000).unwrap();
        let mut out = Vec::new();
        for chunk in input.chunks(block) {
            out.extend_from_slice(resampler.process(chunk));
        }
        out
    }

    #[test]
    fn stream_resampler_passes_through_at_same_rate() {
        let mut resampler = StreamResampler::new(2, 16000, 16000).unwrap();
        assert_eq!(resampler.process(&[-0.5, 0.5, 0.25, 0.75]).to_vec(), vec![0.0, 0.5]);
        assert!(resampler.process(&[]).is_empty());
    }

    #[test]
    fn stream_resampler_output_ignores_device_block_size() {
        let input = sine(48000, 48000.0);
        let by_512 = run_blocks(&input, 512);
        let by_441 = run_blocks(&input, 441);
        let whole = run_blocks(&input, input.len());

        assert_eq!(by_512, by_441);
        assert_eq!(by_512, whole);
    }

    #[test]
    fn stream_resampler_keeps_the_rate_ratio() {
        let input = sine(48000, 48000.0);
        let out = run_blocks(&input, 512);
        // Only whole resampler chunks are emitted; the tail waits for more input.
        assert!(out.len() <= 16000, "got {}", out.len());
        assert!(out.len() >= 16000 - RESAMPLER_CHUNK_SIZE / 2, "got {}", out.len());
    }

    #[test]
    fn stream_resampler_downmixes_before_resampling() {
        let mut resampler = StreamResampler::new(2, 48000, 16000).unwrap();
        let stereo: Vec<f32> = sine(4800, 48000.0)
            .into_iter()
            .flat_map(|s| [s, s])
            .collect();
        let out = resampler.process(&stereo).to_vec();
        assert!(!out.is_empty());
        assert!(out.len() <= 1600);
    }
}
