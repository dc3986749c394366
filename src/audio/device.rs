//! Device context traits for capture and playback.
//!
//! The session engine talks to audio hardware only through these traits so
//! the real CPAL backend and the in-memory mock are interchangeable.

use crate::audio::codec::AudioBuffer;
use crate::audio::frame::FrameProcessor;
use crate::defaults;
use crate::error::{Result, VoxliveError};
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Identity of one scheduled playback buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Invoked by an output context when a buffer finishes playing naturally.
///
/// Stopped buffers do not report completion.
pub type CompletionCallback = Arc<dyn Fn(BufferId) + Send + Sync>;

/// Lifecycle of a device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Created but not yet running; the clock does not advance.
    Suspended,
    Running,
    Closed,
}

/// Requested microphone processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MicrophoneConstraints {
    pub channel_count: u16,
    pub sample_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for MicrophoneConstraints {
    fn default() -> Self {
        Self {
            channel_count: 1,
            sample_rate: defaults::CAPTURE_SAMPLE_RATE,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Capture-rate device context.
#[async_trait]
pub trait CaptureContext: Send {
    fn sample_rate(&self) -> u32;

    fn state(&self) -> ContextState;

    async fn resume(&mut self) -> Result<()>;

    /// Acquires an exclusive microphone stream.
    async fn open_microphone(
        &mut self,
        constraints: &MicrophoneConstraints,
    ) -> Result<Box<dyn Microphone>>;

    /// Closing an already-closed context is not an error.
    async fn close(&mut self) -> Result<()>;
}

/// A live microphone stream.
pub trait Microphone: Send {
    /// Binds a frame processor to the stream's source.
    fn connect(&mut self, processor: FrameProcessor) -> Result<()>;

    /// Unbinds and drops the frame processor. Idempotent.
    fn disconnect(&mut self);

    /// Stops every track of the stream. Idempotent.
    fn stop(&mut self);

    /// Tracks that are still capturing.
    fn live_tracks(&self) -> usize;

    fn label(&self) -> &str;
}

/// Playback-rate device context with a monotonic clock in seconds.
#[async_trait]
pub trait OutputContext: Send {
    fn sample_rate(&self) -> u32;

    fn state(&self) -> ContextState;

    async fn resume(&mut self) -> Result<()>;

    /// Closing an already-closed context is not an error.
    async fn close(&mut self) -> Result<()>;

    /// Device clock in seconds.
    fn current_time(&self) -> f64;

    /// Schedules `buffer` to start at device time `when`.
    fn start_buffer(&mut self, id: BufferId, buffer: &AudioBuffer, when: f64) -> Result<()>;

    /// Stops a scheduled or playing buffer. Unknown ids are ignored.
    fn stop_buffer(&mut self, id: BufferId);
}

/// Factory for device contexts.
pub trait AudioBackend: Send + Sync {
    fn create_capture_context(&self, sample_rate: u32) -> Result<Box<dyn CaptureContext>>;

    fn create_output_context(
        &self,
        sample_rate: u32,
        on_ended: CompletionCallback,
    ) -> Result<Box<dyn OutputContext>>;
}

/// A buffer handed to the mock output context.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    pub start: f64,
    pub duration: f64,
}

#[derive(Default)]
struct ProbeState {
    clock: f64,
    capture_contexts: usize,
    output_contexts: usize,
    resumes: usize,
    closes: usize,
    microphones_opened: usize,
    live_tracks: usize,
    last_constraints: Option<MicrophoneConstraints>,
    processor: Option<FrameProcessor>,
    scheduled: Vec<ScheduledBuffer>,
    stopped: Vec<BufferId>,
    on_ended: Option<CompletionCallback>,
}

/// Shared view into everything the mock backend did.
#[derive(Default)]
pub struct MockAudioProbe {
    state: Mutex<ProbeState>,
}

impl MockAudioProbe {
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current output clock in seconds.
    pub fn clock(&self) -> f64 {
        self.lock().clock
    }

    pub fn set_clock(&self, seconds: f64) {
        self.lock().clock = seconds;
    }

    pub fn advance_clock(&self, seconds: f64) {
        self.lock().clock += seconds;
    }

    pub fn capture_contexts_created(&self) -> usize {
        self.lock().capture_contexts
    }

    pub fn output_contexts_created(&self) -> usize {
        self.lock().output_contexts
    }

    pub fn resumes(&self) -> usize {
        self.lock().resumes
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    pub fn microphones_opened(&self) -> usize {
        self.lock().microphones_opened
    }

    pub fn live_tracks(&self) -> usize {
        self.lock().live_tracks
    }

    pub fn last_constraints(&self) -> Option<MicrophoneConstraints> {
        self.lock().last_constraints
    }

    /// Whether a frame processor is currently bound to the microphone.
    pub fn processor_connected(&self) -> bool {
        self.lock().processor.is_some()
    }

    /// Every buffer ever scheduled, in scheduling order.
    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        self.lock().scheduled.clone()
    }

    /// Every buffer ever stopped, in stop order.
    pub fn stopped(&self) -> Vec<BufferId> {
        self.lock().stopped.clone()
    }

    /// Pushes samples into the bound frame processor as if the mic captured them.
    ///
    /// Returns false when nothing is connected.
    pub fn feed_microphone(&self, samples: &[f32]) -> bool {
        let mut state = self.lock();
        if state.live_tracks == 0 {
            return false;
        }
        match state.processor.as_mut() {
            Some(processor) => {
                processor.push(samples);
                true
            }
            None => false,
        }
    }

    /// Reports natural completion of a buffer.
    pub fn finish_buffer(&self, id: BufferId) {
        let callback = self.lock().on_ended.clone();
        if let Some(callback) = callback {
            callback(id);
        }
    }
}

/// In-memory audio backend for tests and headless runs.
#[derive(Clone, Default)]
pub struct MockAudioBackend {
    probe: Arc<MockAudioProbe>,
    fail_context: bool,
    fail_resume: bool,
    fail_microphone: bool,
}

impl MockAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context creation fails, as when no device exists.
    pub fn with_context_failure(mut self) -> Self {
        self.fail_context = true;
        self
    }

    /// Resuming a context fails.
    pub fn with_resume_failure(mut self) -> Self {
        self.fail_resume = true;
        self
    }

    /// Opening the microphone fails, as when permission is denied.
    pub fn with_microphone_failure(mut self) -> Self {
        self.fail_microphone = true;
        self
    }

    pub fn probe(&self) -> Arc<MockAudioProbe> {
        Arc::clone(&self.probe)
    }
}

impl AudioBackend for MockAudioBackend {
    fn create_capture_context(&self, sample_rate: u32) -> Result<Box<dyn CaptureContext>> {
        if self.fail_context {
            return Err(VoxliveError::AudioDeviceNotFound {
                device: "mock input".to_string(),
            });
        }
        self.probe.lock().capture_contexts += 1;
        Ok(Box::new(MockCaptureContext {
            probe: Arc::clone(&self.probe),
            sample_rate,
            state: ContextState::Suspended,
            fail_resume: self.fail_resume,
            fail_microphone: self.fail_microphone,
        }))
    }

    fn create_output_context(
        &self,
        sample_rate: u32,
        on_ended: CompletionCallback,
    ) -> Result<Box<dyn OutputContext>> {
        if self.fail_context {
            return Err(VoxliveError::AudioDeviceNotFound {
                device: "mock output".to_string(),
            });
        }
        {
            let mut state = self.probe.lock();
            state.output_contexts += 1;
            state.on_ended = Some(on_ended);
        }
        Ok(Box::new(MockOutputContext {
            probe: Arc::clone(&self.probe),
            sample_rate,
            state: ContextState::Suspended,
            fail_resume: self.fail_resume,
        }))
    }
}

struct MockCaptureContext {
    probe: Arc<MockAudioProbe>,
    sample_rate: u32,
    state: ContextState,
    fail_resume: bool,
    fail_microphone: bool,
}

#[async_trait]
impl CaptureContext for MockCaptureContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn state(&self) -> ContextState {
        self.state
    }

    async fn resume(&mut self) -> Result<()> {
        if self.fail_resume {
            return Err(VoxliveError::AudioDevice {
                message: "mock resume failure".to_string(),
            });
        }
        self.probe.lock().resumes += 1;
        self.state = ContextState::Running;
        Ok(())
    }

    async fn open_microphone(
        &mut self,
        constraints: &MicrophoneConstraints,
    ) -> Result<Box<dyn Microphone>> {
        if self.fail_microphone {
            return Err(VoxliveError::MicrophoneUnavailable {
                message: "permission denied".to_string(),
            });
        }
        let mut state = self.probe.lock();
        state.microphones_opened += 1;
        state.live_tracks += 1;
        state.last_constraints = Some(*constraints);
        Ok(Box::new(MockMicrophone {
            probe: Arc::clone(&self.probe),
            stopped: false,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        if self.state != ContextState::Closed {
            self.probe.lock().closes += 1;
            self.state = ContextState::Closed;
        }
        Ok(())
    }
}

struct MockMicrophone {
    probe: Arc<MockAudioProbe>,
    stopped: bool,
}

impl Microphone for MockMicrophone {
    fn connect(&mut self, processor: FrameProcessor) -> Result<()> {
        if self.stopped {
            return Err(VoxliveError::MicrophoneUnavailable {
                message: "track already stopped".to_string(),
            });
        }
        self.probe.lock().processor = Some(processor);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.probe.lock().processor = None;
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            let mut state = self.probe.lock();
            state.live_tracks = state.live_tracks.saturating_sub(1);
        }
    }

    fn live_tracks(&self) -> usize {
        usize::from(!self.stopped)
    }

    fn label(&self) -> &str {
        "mock microphone"
    }
}

struct MockOutputContext {
    probe: Arc<MockAudioProbe>,
    sample_rate: u32,
    state: ContextState,
    fail_resume: bool,
}

#[async_trait]
impl OutputContext for MockOutputContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn state(&self) -> ContextState {
        self.state
    }

    async fn resume(&mut self) -> Result<()> {
        if self.fail_resume {
            return Err(VoxliveError::AudioDevice {
                message: "mock resume failure".to_string(),
            });
        }
        self.probe.lock().resumes += 1;
        self.state = ContextState::Running;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.state != ContextState::Closed {
            self.probe.lock().closes += 1;
            self.state = ContextState::Closed;
        }
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.probe.clock()
    }

    fn start_buffer(&mut self, id: BufferId, buffer: &AudioBuffer, when: f64) -> Result<()> {
        if self.state == ContextState::Closed {
            return Err(VoxliveError::AudioDevice {
                message: "output context is closed".to_string(),
            });
        }
        self.probe.lock().scheduled.push(ScheduledBuffer {
            id,
            start: when,
            duration: buffer.duration(),
        });
        Ok(())
    }

    fn stop_buffer(&mut self, id: BufferId) {
        self.probe.lock().stopped.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn noop_completion() -> CompletionCallback {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn mock_capture_context_lifecycle() {
        let backend = MockAudioBackend::new();
        let probe = backend.probe();
        let mut ctx = backend.create_capture_context(16000).unwrap();

        assert_eq!(ctx.state(), ContextState::Suspended);
        ctx.resume().await.unwrap();
        assert_eq!(ctx.state(), ContextState::Running);

        let mut mic = ctx
            .open_microphone(&MicrophoneConstraints::default())
            .await
            .unwrap();
        assert_eq!(probe.live_tracks(), 1);
        assert_eq!(mic.live_tracks(), 1);

        mic.stop();
        mic.stop();
        assert_eq!(probe.live_tracks(), 0);

        ctx.close().await.unwrap();
        ctx.close().await.unwrap();
        assert_eq!(probe.closes(), 1);
    }

    #[tokio::test]
    async fn mock_microphone_failure() {
        let backend = MockAudioBackend::new().with_microphone_failure();
        let mut ctx = backend.create_capture_context(16000).unwrap();
        let result = ctx.open_microphone(&MicrophoneConstraints::default()).await;
        assert!(matches!(
            result,
            Err(VoxliveError::MicrophoneUnavailable { .. })
        ));
    }

    #[test]
    fn feed_microphone_reaches_connected_processor() {
        let backend = MockAudioBackend::new();
        let probe = backend.probe();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let mut ctx = backend.create_capture_context(16000).unwrap();
        let mut mic = runtime
            .block_on(ctx.open_microphone(&MicrophoneConstraints::default()))
            .unwrap();

        let frames = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&frames);
        let processor = FrameProcessor::new(
            4,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        mic.connect(processor).unwrap();

        assert!(probe.feed_microphone(&[0.0; 8]));
        assert_eq!(frames.load(Ordering::SeqCst), 2);

        mic.disconnect();
        assert!(!probe.feed_microphone(&[0.0; 8]));
    }

    #[test]
    fn mock_output_records_schedule_and_completion() {
        let backend = MockAudioBackend::new();
        let probe = backend.probe();
        let finished = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&finished);
        let mut ctx = backend
            .create_output_context(
                24000,
                Arc::new(move |id: BufferId| {
                    sink.store(id.0, Ordering::SeqCst);
                }),
            )
            .unwrap();

        probe.set_clock(2.0);
        assert_eq!(ctx.current_time(), 2.0);

        let buffer = AudioBuffer::mono(24000, vec![0.0; 2400]);
        ctx.start_buffer(BufferId(7), &buffer, 2.5).unwrap();
        let scheduled = probe.scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].start, 2.5);
        assert!((scheduled[0].duration - 0.1).abs() < 1e-9);

        probe.finish_buffer(BufferId(7));
        assert_eq!(finished.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn context_failure_reports_missing_device() {
        let backend = MockAudioBackend::new().with_context_failure();
        assert!(matches!(
            backend.create_output_context(24000, noop_completion()),
            Err(VoxliveError::AudioDeviceNotFound { .. })
        ));
    }

    #[test]
    fn buffer_id_display() {
        assert_eq!(BufferId(3).to_string(), "buf#3");
    }
}
