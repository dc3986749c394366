//! Scheduled playback over a CPAL output stream.
//!
//! The output callback mixes every buffer whose scheduled window overlaps the
//! block being rendered. The running frame counter is the device clock, so a
//! buffer scheduled at `t` starts on exactly frame `t * rate`.
//!
//! The clock the session sees runs one block ahead of what has been rendered.
//! A buffer scheduled at "now" then lands in a block the callback has not
//! started yet instead of one it is already past.

use crate::audio::capture::SendableStream;
use crate::audio::codec::AudioBuffer;
use crate::audio::convert::resample;
use crate::audio::device::{BufferId, CompletionCallback, ContextState, OutputContext};
use crate::error::{Result, VoxliveError};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Commands sent from the session loop to the audio callback.
#[derive(Debug)]
pub enum MixerCommand {
    Start {
        id: BufferId,
        start_frame: u64,
        samples: Vec<f32>,
    },
    Stop(BufferId),
}

struct Voice {
    id: BufferId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Frame counters shared between the output callback and the session.
#[derive(Debug, Default)]
pub struct MixerClock {
    rendered: AtomicU64,
    block: AtomicU64,
}

impl MixerClock {
    /// Frames already handed to the device.
    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Acquire)
    }

    /// Earliest frame a newly scheduled buffer can still start on intact.
    pub fn schedulable(&self) -> u64 {
        self.rendered() + self.block.load(Ordering::Acquire)
    }
}

/// Realtime mixer state owned by the output callback.
pub struct Mixer {
    commands: Receiver<MixerCommand>,
    voices: Vec<Voice>,
    clock: Arc<MixerClock>,
    channels: usize,
    on_ended: CompletionCallback,
}

impl Mixer {
    pub fn new(
        commands: Receiver<MixerCommand>,
        clock: Arc<MixerClock>,
        channels: usize,
        on_ended: CompletionCallback,
    ) -> Self {
        Self {
            commands,
            voices: Vec::new(),
            clock,
            channels: channels.max(1),
            on_ended,
        }
    }

    fn drain_commands(&mut self, block_start: u64) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                MixerCommand::Start {
                    id,
                    start_frame,
                    samples,
                } => {
                    if start_frame < block_start {
                        debug!(
                            %id,
                            late_frames = block_start - start_frame,
                            "buffer arrived late, head clipped"
                        );
                    }
                    self.voices.push(Voice {
                        id,
                        start_frame,
                        samples,
                    })
                }
                MixerCommand::Stop(id) => self.voices.retain(|v| v.id != id),
            }
        }
    }

    /// Renders one interleaved block and advances the clock.
    pub fn render(&mut self, out: &mut [f32]) {
        let block_start = self.clock.rendered();
        self.drain_commands(block_start);
        out.fill(0.0);

        let frames = (out.len() / self.channels) as u64;
        let block_end = block_start + frames;

        for voice in &self.voices {
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            for frame in from..to {
                let sample = voice.samples[(frame - voice.start_frame) as usize];
                let base = (frame - block_start) as usize * self.channels;
                for slot in &mut out[base..base + self.channels] {
                    *slot += sample;
                }
            }
        }
        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }

        self.clock.block.store(frames, Ordering::Release);
        self.clock.rendered.store(block_end, Ordering::Release);

        let on_ended = Arc::clone(&self.on_ended);
        self.voices.retain(|voice| {
            if voice.end_frame() <= block_end {
                on_ended(voice.id);
                false
            } else {
                true
            }
        });
    }
}

/// Playback-rate context over one CPAL output device.
pub struct CpalOutputContext {
    stream: Option<SendableStream>,
    commands: Sender<MixerCommand>,
    clock: Arc<MixerClock>,
    device_rate: u32,
    sample_rate: u32,
    state: ContextState,
}

impl CpalOutputContext {
    /// Opens the device in the suspended state.
    ///
    /// Tries f32 at the playback rate first, then falls back to the device's
    /// default config; buffers are resampled to whatever rate the device runs at.
    pub fn new(device: cpal::Device, sample_rate: u32, on_ended: CompletionCallback) -> Result<Self> {
        let (tx, rx) = unbounded();
        let clock = Arc::new(MixerClock::default());

        let preferred = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_callback = |err| {
            warn!("Audio output stream error: {}", err);
        };

        let mut mixer = Mixer::new(rx.clone(), Arc::clone(&clock), 1, Arc::clone(&on_ended));
        let (stream, device_rate) = match device.build_output_stream(
            &preferred,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| mixer.render(data),
            err_callback,
            None,
        ) {
            Ok(stream) => (stream, sample_rate),
            Err(e) => {
                debug!("preferred output config rejected: {}", e);
                Self::build_native(&device, rx, Arc::clone(&clock), on_ended)?
            }
        };

        // Contexts start suspended; the clock only runs after resume().
        if let Err(e) = stream.pause() {
            debug!("pausing new output stream failed: {}", e);
        }

        Ok(Self {
            stream: Some(SendableStream(stream)),
            commands: tx,
            clock,
            device_rate,
            sample_rate,
            state: ContextState::Suspended,
        })
    }

    fn build_native(
        device: &cpal::Device,
        rx: Receiver<MixerCommand>,
        clock: Arc<MixerClock>,
        on_ended: CompletionCallback,
    ) -> Result<(cpal::Stream, u32)> {
        use cpal::SampleFormat;

        let default_config =
            device
                .default_output_config()
                .map_err(|e| VoxliveError::AudioDevice {
                    message: format!("Failed to query default output config: {}", e),
                })?;
        let native_rate = default_config.sample_rate().0;
        let channels = default_config.channels() as usize;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        info!(
            channels,
            rate = native_rate,
            format = ?default_config.sample_format(),
            "using native output format"
        );

        let err_callback = |err| {
            warn!("Audio output stream error: {}", err);
        };
        let mut mixer = Mixer::new(rx, clock, channels, on_ended);

        let stream = match default_config.sample_format() {
            SampleFormat::F32 => device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| mixer.render(data),
                    err_callback,
                    None,
                )
                .map_err(|e| VoxliveError::AudioDevice {
                    message: format!("Failed to build native f32 output stream: {}", e),
                })?,
            SampleFormat::I16 => {
                let mut scratch: Vec<f32> = Vec::new();
                device
                    .build_output_stream(
                        &stream_config,
                        move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                            scratch.resize(data.len(), 0.0);
                            mixer.render(&mut scratch);
                            for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                                *out = (s * i16::MAX as f32) as i16;
                            }
                        },
                        err_callback,
                        None,
                    )
                    .map_err(|e| VoxliveError::AudioDevice {
                        message: format!("Failed to build native i16 output stream: {}", e),
                    })?
            }
            fmt => {
                return Err(VoxliveError::AudioDevice {
                    message: format!("Unsupported output sample format: {:?}", fmt),
                });
            }
        };
        Ok((stream, native_rate))
    }
}

#[async_trait]
impl OutputContext for CpalOutputContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn state(&self) -> ContextState {
        self.state
    }

    async fn resume(&mut self) -> Result<()> {
        let stream = self.stream.as_ref().ok_or_else(|| VoxliveError::AudioDevice {
            message: "output context is closed".to_string(),
        })?;
        stream.0.play().map_err(|e| VoxliveError::AudioDevice {
            message: format!("Failed to start output stream: {}", e),
        })?;
        self.state = ContextState::Running;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take()
            && let Err(e) = stream.0.pause()
        {
            debug!("pausing output stream on close failed: {}", e);
        }
        self.state = ContextState::Closed;
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.clock.schedulable() as f64 / self.device_rate as f64
    }

    fn start_buffer(&mut self, id: BufferId, buffer: &AudioBuffer, when: f64) -> Result<()> {
        if self.state == ContextState::Closed {
            return Err(VoxliveError::AudioDevice {
                message: "output context is closed".to_string(),
            });
        }
        let samples = resample(&buffer.to_mono(), buffer.sample_rate(), self.device_rate);
        let start_frame = (when.max(0.0) * self.device_rate as f64).round() as u64;
        self.commands
            .send(MixerCommand::Start {
                id,
                start_frame,
                samples,
            })
            .map_err(|e| VoxliveError::AudioDevice {
                message: format!("Output mixer is gone: {}", e),
            })
    }

    fn stop_buffer(&mut self, id: BufferId) {
        if self.commands.send(MixerCommand::Stop(id)).is_err() {
            debug!(%id, "stop ignored, output mixer is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn mixer(channels: usize) -> (Mixer, Sender<MixerCommand>, Arc<MixerClock>, Arc<Mutex<Vec<BufferId>>>) {
        let (tx, rx) = unbounded();
        let clock = Arc::new(MixerClock::default());
        let ended = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ended);
        let mixer = Mixer::new(
            rx,
            Arc::clone(&clock),
            channels,
            Arc::new(move |id| sink.lock().unwrap().push(id)),
        );
        (mixer, tx, clock, ended)
    }

    #[test]
    fn render_advances_clock_in_frames() {
        let (mut mixer, _tx, clock, _) = mixer(2);
        let mut out = vec![0.0; 8];
        mixer.render(&mut out);
        assert_eq!(clock.rendered(), 4);
        assert_eq!(clock.schedulable(), 8);
    }

    #[test]
    fn buffer_scheduled_at_reported_now_survives_a_render() {
        let (mut mixer, tx, clock, _) = mixer(1);
        let mut out = vec![0.0; 4];
        mixer.render(&mut out);

        // The session reads "now", then the callback renders once more
        // before the start command is drained.
        let start_frame = clock.schedulable();
        mixer.render(&mut out);
        tx.send(MixerCommand::Start {
            id: BufferId(1),
            start_frame,
            samples: vec![0.1, 0.2, 0.3, 0.4],
        })
        .unwrap();

        mixer.render(&mut out);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn buffer_starts_on_its_scheduled_frame() {
        let (mut mixer, tx, _, ended) = mixer(1);
        tx.send(MixerCommand::Start {
            id: BufferId(1),
            start_frame: 2,
            samples: vec![0.5, 0.5],
        })
        .unwrap();

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5]);
        assert_eq!(*ended.lock().unwrap(), vec![BufferId(1)]);
    }

    #[test]
    fn contiguous_buffers_span_blocks() {
        let (mut mixer, tx, _, ended) = mixer(1);
        tx.send(MixerCommand::Start {
            id: BufferId(1),
            start_frame: 0,
            samples: vec![0.1; 3],
        })
        .unwrap();
        tx.send(MixerCommand::Start {
            id: BufferId(2),
            start_frame: 3,
            samples: vec![0.2; 3],
        })
        .unwrap();

        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.1, 0.2]);
        assert_eq!(*ended.lock().unwrap(), vec![BufferId(1)]);

        mixer.render(&mut out);
        assert_eq!(out, vec![0.2, 0.2, 0.0, 0.0]);
        assert_eq!(*ended.lock().unwrap(), vec![BufferId(1), BufferId(2)]);
    }

    #[test]
    fn stopped_buffer_is_silent_and_not_reported() {
        let (mut mixer, tx, _, ended) = mixer(1);
        tx.send(MixerCommand::Start {
            id: BufferId(1),
            start_frame: 0,
            samples: vec![0.5; 8],
        })
        .unwrap();
        let mut out = vec![0.0; 4];
        mixer.render(&mut out);

        tx.send(MixerCommand::Stop(BufferId(1))).unwrap();
        mixer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(ended.lock().unwrap().is_empty());
    }

    #[test]
    fn mono_voice_fills_every_channel() {
        let (mut mixer, tx, _, _) = mixer(2);
        tx.send(MixerCommand::Start {
            id: BufferId(1),
            start_frame: 0,
            samples: vec![0.25, 0.5],
        })
        .unwrap();
        let mut out = vec![0.0; 4];
        mixer.render(&mut out);
        assert_eq!(out, vec![0.25, 0.25, 0.5, 0.5]);
    }
}
