//! Voice Activity Detection (VAD) module.
//!
//! Classifies each captured frame by its RMS energy against two cutoffs: a
//! low one that drives the "user is speaking" indicator and a higher one that
//! interrupts assistant playback (barge-in).

use crate::defaults;
use crate::error::{Result, VoxliveError};

/// Configuration for Voice Activity Detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// RMS level above which the user counts as speaking (0.0 to 1.0).
    pub speaking_threshold: f32,
    /// RMS level above which user speech interrupts playback (0.0 to 1.0).
    pub barge_in_threshold: f32,
    /// Consecutive loud frames required before barge-in fires.
    pub barge_in_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speaking_threshold: defaults::SPEAKING_THRESHOLD,
            barge_in_threshold: defaults::BARGE_IN_THRESHOLD,
            barge_in_frames: defaults::BARGE_IN_FRAMES,
        }
    }
}

impl VadConfig {
    /// Checks threshold ordering and ranges.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("vad.speaking_threshold", self.speaking_threshold),
            ("vad.barge_in_threshold", self.barge_in_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(VoxliveError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: format!("must be in (0, 1], got {}", value),
                });
            }
        }
        if self.barge_in_threshold <= self.speaking_threshold {
            return Err(VoxliveError::ConfigInvalidValue {
                key: "vad.barge_in_threshold".to_string(),
                message: format!(
                    "must be greater than speaking threshold {}",
                    self.speaking_threshold
                ),
            });
        }
        if self.barge_in_frames == 0 {
            return Err(VoxliveError::ConfigInvalidValue {
                key: "vad.barge_in_frames".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Per-frame classification result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    /// RMS level of the frame (0.0 to 1.0).
    pub rms: f32,
    /// Frame is above the speaking threshold.
    pub is_user_speaking: bool,
    /// Frame should interrupt assistant playback.
    pub is_barge_in: bool,
}

/// Energy-based voice activity detector.
///
/// With `barge_in_frames == 1` every frame is judged on its own; larger values
/// require a run of loud frames while the assistant is speaking.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    config: VadConfig,
    loud_run: u32,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            loud_run: 0,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Classifies one captured frame.
    ///
    /// # Arguments
    /// * `frame` - Normalized float samples
    /// * `assistant_speaking` - Whether assistant audio is currently scheduled
    pub fn classify(&mut self, frame: &[f32], assistant_speaking: bool) -> VadDecision {
        let rms = calculate_rms(frame);
        let loud = rms > self.config.barge_in_threshold;

        if loud && assistant_speaking {
            self.loud_run = self.loud_run.saturating_add(1);
        } else {
            self.loud_run = 0;
        }

        let is_barge_in = loud && assistant_speaking && self.loud_run >= self.config.barge_in_frames;
        if is_barge_in {
            self.loud_run = 0;
        }

        VadDecision {
            rms,
            is_user_speaking: rms > self.config.speaking_threshold,
            is_barge_in,
        }
    }

    /// Forgets any partial run of loud frames.
    pub fn reset(&mut self) {
        self.loud_run = 0;
    }
}

/// Calculates the Root Mean Square (RMS) of normalized float samples.
///
/// # Returns
/// - 0.0 for silence or an empty frame
/// - ~0.707 for a full-scale sine wave
/// - 1.0 for a full-scale square wave
pub fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let s = sample as f64;
            s * s
        })
        .sum();

    (sum_squares / samples.len() as f64).sqrt() as f32
}
