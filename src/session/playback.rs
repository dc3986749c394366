//! Gapless scheduling of inbound audio chunks on the output device clock.

use crate::audio::codec::{self, DecodeError};
use crate::audio::device::{BufferId, OutputContext};
use crate::defaults;
use crate::error::Result;
use tracing::debug;

/// Where a chunk landed on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: BufferId,
    pub start: f64,
    pub duration: f64,
    /// The cursor had fallen behind the clock and was re-anchored.
    pub underrun: bool,
}

/// Owns the playback queue and the `next_start_time` cursor.
///
/// Buffers are scheduled back to back: each one starts exactly where the
/// previous one ends unless the queue ran dry, in which case the cursor jumps
/// to `now + lead_gap`.
pub struct PlaybackScheduler {
    sample_rate: u32,
    lead_gap: f64,
    min_frames: usize,
    queue: Vec<BufferId>,
    next_start_time: f64,
    next_id: u64,
    assistant_speaking: bool,
    flushes: u64,
}

impl PlaybackScheduler {
    pub fn new(sample_rate: u32, lead_gap_ms: u32) -> Self {
        let min_frames = (sample_rate as u64 * defaults::MIN_CHUNK_MS as u64).div_ceil(1000);
        Self {
            sample_rate,
            lead_gap: lead_gap_ms as f64 / 1000.0,
            min_frames: min_frames.max(1) as usize,
            queue: Vec::new(),
            next_start_time: 0.0,
            next_id: 0,
            assistant_speaking: false,
            flushes: 0,
        }
    }

    /// Decodes a base64 chunk and schedules it after everything already queued.
    ///
    /// On any error the chunk is dropped and the cursor is left untouched.
    pub fn enqueue(
        &mut self,
        ctx: &mut dyn OutputContext,
        payload: &str,
    ) -> Result<ScheduledChunk> {
        let buffer = codec::decode_base64(payload, self.sample_rate, 1)?;
        if buffer.frames() < self.min_frames {
            return Err(DecodeError::Truncated {
                frames: buffer.frames(),
                min_frames: self.min_frames,
            }
            .into());
        }

        let now = ctx.current_time();
        let underrun = self.next_start_time < now;
        let start = if underrun {
            now + self.lead_gap
        } else {
            self.next_start_time
        };

        self.next_id += 1;
        let id = BufferId(self.next_id);
        ctx.start_buffer(id, &buffer, start)?;

        let duration = buffer.duration();
        self.queue.push(id);
        self.next_start_time = start + duration;
        self.assistant_speaking = true;

        debug!(%id, start, duration, underrun, queued = self.queue.len(), "scheduled chunk");
        Ok(ScheduledChunk {
            id,
            start,
            duration,
            underrun,
        })
    }

    /// Stops everything in flight and re-anchors the cursor to the device clock.
    ///
    /// With nothing queued this only moves the cursor.
    pub fn flush(&mut self, ctx: &mut dyn OutputContext) {
        let stopped = self.queue.len();
        for id in self.queue.drain(..) {
            ctx.stop_buffer(id);
        }
        self.next_start_time = ctx.current_time();
        self.assistant_speaking = false;
        self.flushes += 1;
        if stopped > 0 {
            debug!(stopped, "flushed playback queue");
        }
    }

    /// Natural completion of one buffer. Returns false for unknown ids,
    /// e.g. buffers that were already flushed.
    pub fn on_buffer_ended(&mut self, id: BufferId) -> bool {
        let Some(pos) = self.queue.iter().position(|queued| *queued == id) else {
            return false;
        };
        self.queue.remove(pos);
        if self.queue.is_empty() {
            self.assistant_speaking = false;
        }
        true
    }

    /// Forgets the queue without touching the device and moves the cursor to `now`.
    pub fn reset(&mut self, now: f64) {
        self.queue.clear();
        self.next_start_time = now;
        self.assistant_speaking = false;
    }

    pub fn assistant_speaking(&self) -> bool {
        self.assistant_speaking
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn queued(&self) -> &[BufferId] {
        &self.queue
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of `flush()` calls so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
