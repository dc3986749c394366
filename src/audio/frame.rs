//! Fixed-size frame processor.
//!
//! Devices deliver audio in whatever block size they like; the session engine
//! wants exactly `frame_size` samples per callback.

use crate::error::{Result, VoxliveError};

/// Callback that receives one complete frame.
pub type FrameCallback = Box<dyn FnMut(Vec<f32>) + Send + 'static>;

/// Re-chunks a stream of samples into fixed-size frames.
pub struct FrameProcessor {
    frame_size: usize,
    pending: Vec<f32>,
    callback: Option<FrameCallback>,
    frames_emitted: u64,
}

impl FrameProcessor {
    /// Creates a processor; `frame_size` must be a non-zero power of two.
    pub fn new(frame_size: usize, callback: FrameCallback) -> Result<Self> {
        validate_frame_size(frame_size)?;
        Ok(Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
            callback: Some(callback),
            frames_emitted: 0,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Whether a callback is still attached.
    pub fn is_connected(&self) -> bool {
        self.callback.is_some()
    }

    /// Appends samples and fires the callback for every completed frame.
    pub fn push(&mut self, samples: &[f32]) {
        let Some(callback) = self.callback.as_mut() else {
            return;
        };

        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                let frame = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                callback(frame);
                self.frames_emitted += 1;
            }
        }
    }

    /// Drops the callback and any partial frame. Later pushes are ignored.
    pub fn disconnect(&mut self) {
        self.callback = None;
        self.pending.clear();
    }
}

/// Checks that a frame size is a non-zero power of two.
pub fn validate_frame_size(frame_size: usize) -> Result<()> {
    if frame_size == 0 || !frame_size.is_power_of_two() {
        return Err(VoxliveError::ConfigInvalidValue {
            key: "audio.frame_size".to_string(),
            message: format!("must be a power of two, got {}", frame_size),
        });
    }
    Ok(())
}
