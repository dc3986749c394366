//! Microphone capture using CPAL (Cross-Platform Audio Library).

use crate::audio::convert::{StreamResampler, i16_to_f32};
use crate::audio::device::{
    AudioBackend, CaptureContext, CompletionCallback, ContextState, Microphone,
    MicrophoneConstraints, OutputContext,
};
use crate::audio::frame::FrameProcessor;
use crate::audio::output::CpalOutputContext;
use crate::error::{Result, VoxliveError};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long to wait for the first capture callback before falling back to the
/// device's native format.
const FIRST_CALLBACK_WAIT: Duration = Duration::from_millis(200);

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// This suppresses noisy ALSA/JACK/PipeWire messages that CPAL triggers
/// when probing audio backends.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2 (stderr).
/// Safe as long as no other thread is concurrently manipulating fd 2.
pub(crate) fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Suppress noisy JACK/ALSA error messages that occur during audio backend probing.
///
/// # Safety
/// This modifies environment variables which is safe when called before spawning threads.
pub fn suppress_audio_warnings() {
    // SAFETY: Called at startup before any threads are spawned
    unsafe {
        std::env::set_var("JACK_NO_START_SERVER", "1");
        std::env::set_var("JACK_NO_AUDIO_RESERVATION", "1");
        std::env::set_var("PIPEWIRE_DEBUG", "0");
        std::env::set_var("ALSA_DEBUG", "0");
        std::env::set_var("PW_LOG", "0");
    }
}

/// Preferred device names for PipeWire/PulseAudio environments.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns that are never useful for a voice session.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// Which side of the audio graph a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceDirection {
    Input,
    Output,
}

/// List usable devices, marking preferred ones with "\[recommended\]".
pub fn list_devices(direction: DeviceDirection) -> Result<Vec<String>> {
    let devices = with_suppressed_stderr(|| {
        let host = cpal::default_host();
        match direction {
            DeviceDirection::Input => host.input_devices().map(|d| d.collect::<Vec<_>>()),
            DeviceDirection::Output => host.output_devices().map(|d| d.collect::<Vec<_>>()),
        }
    })
    .map_err(|e| VoxliveError::AudioDevice {
        message: format!("Failed to enumerate devices: {}", e),
    })?;

    let mut names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name() {
            if should_filter_device(&name) {
                continue;
            }
            if is_preferred_device(&name) {
                names.push(format!("{} [recommended]", name));
            } else {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// Find a device by name, or the best default (PipeWire, then Pulse, then system default).
pub(crate) fn find_device(direction: DeviceDirection, name: Option<&str>) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = match direction {
            DeviceDirection::Input => host.input_devices(),
            DeviceDirection::Output => host.output_devices(),
        }
        .map_err(|e| VoxliveError::AudioDevice {
            message: format!("Failed to enumerate devices: {}", e),
        })?;

        let mut preferred = None;
        for device in devices {
            let Ok(device_name) = device.name() else {
                continue;
            };
            match name {
                Some(wanted) if device_name == wanted => return Ok(device),
                None if preferred.is_none() && is_preferred_device(&device_name) => {
                    preferred = Some(device);
                }
                _ => {}
            }
        }

        if let Some(wanted) = name {
            return Err(VoxliveError::AudioDeviceNotFound {
                device: wanted.to_string(),
            });
        }

        preferred
            .or_else(|| match direction {
                DeviceDirection::Input => host.default_input_device(),
                DeviceDirection::Output => host.default_output_device(),
            })
            .ok_or_else(|| VoxliveError::AudioDeviceNotFound {
                device: "default".to_string(),
            })
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is owned by exactly one context or microphone and is
/// only touched from the session event loop.
pub(crate) struct SendableStream(pub(crate) cpal::Stream);

unsafe impl Send for SendableStream {}

/// Audio backend over the system's default CPAL host.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    input_device: Option<String>,
    output_device: Option<String>,
}

impl CpalBackend {
    /// # Arguments
    /// * `input_device` - Optional capture device name; None picks the best default
    /// * `output_device` - Optional playback device name; None picks the best default
    pub fn new(input_device: Option<String>, output_device: Option<String>) -> Self {
        Self {
            input_device,
            output_device,
        }
    }
}

impl AudioBackend for CpalBackend {
    fn create_capture_context(&self, sample_rate: u32) -> Result<Box<dyn CaptureContext>> {
        let device = find_device(DeviceDirection::Input, self.input_device.as_deref())?;
        Ok(Box::new(CpalCaptureContext {
            device,
            sample_rate,
            state: ContextState::Suspended,
        }))
    }

    fn create_output_context(
        &self,
        sample_rate: u32,
        on_ended: CompletionCallback,
    ) -> Result<Box<dyn OutputContext>> {
        let device = find_device(DeviceDirection::Output, self.output_device.as_deref())?;
        Ok(Box::new(CpalOutputContext::new(device, sample_rate, on_ended)?))
    }
}

/// Capture-rate context bound to one CPAL input device.
pub struct CpalCaptureContext {
    device: cpal::Device,
    sample_rate: u32,
    state: ContextState,
}

/// Where the input callback delivers converted samples.
type ProcessorSlot = Arc<Mutex<Option<FrameProcessor>>>;

impl CpalCaptureContext {
    /// Build the input stream.
    ///
    /// Tries in order:
    /// 1. f32/mono at the capture rate
    /// 2. i16/mono at the capture rate
    /// 3. Device default config with software down-mix and resampling
    fn build_stream(&self, slot: &ProcessorSlot, counter: &Arc<AtomicU64>) -> Result<cpal::Stream> {
        let preferred_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_callback = |err| {
            warn!("Audio input stream error: {}", err);
        };

        let processors = Arc::clone(slot);
        let count = Arc::clone(counter);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                count.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut guard) = processors.lock()
                    && let Some(processor) = guard.as_mut()
                {
                    processor.push(data);
                }
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        let processors = Arc::clone(slot);
        let count = Arc::clone(counter);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                count.fetch_add(1, Ordering::Relaxed);
                let converted: Vec<f32> = data.iter().map(|&s| i16_to_f32(s)).collect();
                if let Ok(mut guard) = processors.lock()
                    && let Some(processor) = guard.as_mut()
                {
                    processor.push(&converted);
                }
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        self.build_stream_native(slot, counter)
    }

    /// Build a stream at the device's native config, converting in software.
    fn build_stream_native(
        &self,
        slot: &ProcessorSlot,
        counter: &Arc<AtomicU64>,
    ) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            self.device
                .default_input_config()
                .map_err(|e| VoxliveError::MicrophoneUnavailable {
                    message: format!("Failed to query default input config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let native_channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        info!(
            channels = native_channels,
            rate = native_rate,
            format = ?default_config.sample_format(),
            "using native input format, converting in software"
        );

        let err_callback = |err| {
            warn!("Audio input stream error: {}", err);
        };
        let processors = Arc::clone(slot);
        let count = Arc::clone(counter);
        let mut resampler = StreamResampler::new(native_channels, native_rate, target_rate)?;

        match default_config.sample_format() {
            SampleFormat::F32 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        count.fetch_add(1, Ordering::Relaxed);
                        let converted = resampler.process(data);
                        if let Ok(mut guard) = processors.lock()
                            && let Some(processor) = guard.as_mut()
                        {
                            processor.push(converted);
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| VoxliveError::MicrophoneUnavailable {
                    message: format!("Failed to build native f32 stream: {}", e),
                }),
            SampleFormat::I16 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        count.fetch_add(1, Ordering::Relaxed);
                        let floats: Vec<f32> = data.iter().map(|&s| i16_to_f32(s)).collect();
                        let converted = resampler.process(&floats);
                        if let Ok(mut guard) = processors.lock()
                            && let Some(processor) = guard.as_mut()
                        {
                            processor.push(converted);
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| VoxliveError::MicrophoneUnavailable {
                    message: format!("Failed to build native i16 stream: {}", e),
                }),
            fmt => Err(VoxliveError::MicrophoneUnavailable {
                message: format!(
                    "Unsupported native sample format: {:?}. Try another input device.",
                    fmt
                ),
            }),
        }
    }
}

#[async_trait]
impl CaptureContext for CpalCaptureContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn state(&self) -> ContextState {
        self.state
    }

    async fn resume(&mut self) -> Result<()> {
        if self.state == ContextState::Closed {
            return Err(VoxliveError::AudioDevice {
                message: "capture context is closed".to_string(),
            });
        }
        self.state = ContextState::Running;
        Ok(())
    }

    async fn open_microphone(
        &mut self,
        constraints: &MicrophoneConstraints,
    ) -> Result<Box<dyn Microphone>> {
        if self.state != ContextState::Running {
            return Err(VoxliveError::AudioDevice {
                message: "capture context is not running".to_string(),
            });
        }
        // CPAL exposes raw device audio; processing is up to the platform mixer.
        debug!(
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "microphone processing requested from platform"
        );

        let slot: ProcessorSlot = Arc::new(Mutex::new(None));
        let counter = Arc::new(AtomicU64::new(0));
        let label = self.device.name().unwrap_or_else(|_| "unknown".to_string());

        let stream = SendableStream(self.build_stream(&slot, &counter)?);
        stream.0.play().map_err(|e| VoxliveError::MicrophoneUnavailable {
            message: format!("Failed to start audio stream: {}", e),
        })?;

        // Some PipeWire-ALSA setups accept non-native configs but never deliver data.
        tokio::time::sleep(FIRST_CALLBACK_WAIT).await;

        let stream = if counter.load(Ordering::Relaxed) == 0 {
            drop(stream);
            let native = SendableStream(self.build_stream_native(&slot, &counter)?);
            native
                .0
                .play()
                .map_err(|e| VoxliveError::MicrophoneUnavailable {
                    message: format!("Failed to start native audio stream: {}", e),
                })?;
            native
        } else {
            stream
        };

        info!(device = %label, rate = self.sample_rate, "microphone opened");
        Ok(Box::new(CpalMicrophone {
            stream: Some(stream),
            slot,
            label,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        self.state = ContextState::Closed;
        Ok(())
    }
}

/// A running CPAL input stream feeding an optional frame processor.
pub struct CpalMicrophone {
    stream: Option<SendableStream>,
    slot: ProcessorSlot,
    label: String,
}

impl Microphone for CpalMicrophone {
    fn connect(&mut self, processor: FrameProcessor) -> Result<()> {
        if self.stream.is_none() {
            return Err(VoxliveError::MicrophoneUnavailable {
                message: "track already stopped".to_string(),
            });
        }
        let mut guard = self.slot.lock().map_err(|e| VoxliveError::AudioDevice {
            message: format!("Failed to lock frame processor: {}", e),
        })?;
        *guard = Some(processor);
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Ok(mut guard) = self.slot.lock()
            && let Some(mut processor) = guard.take()
        {
            processor.disconnect();
        }
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take()
            && let Err(e) = stream.0.pause()
        {
            debug!("pausing input stream failed: {}", e);
        }
    }

    fn live_tracks(&self) -> usize {
        usize::from(self.stream.is_some())
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.disconnect();
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_filter_device() {
        assert!(should_filter_device("surround51"));
        assert!(should_filter_device("front:CARD=PCH"));
        assert!(should_filter_device("Digital Output S/PDIF"));
        assert!(!should_filter_device("pipewire"));
        assert!(!should_filter_device("Built-in Audio"));
    }

    #[test]
    fn test_is_preferred_device() {
        assert!(is_preferred_device("pipewire"));
        assert!(is_preferred_device("PipeWire"));
        assert!(is_preferred_device("PulseAudio"));
        assert!(!is_preferred_device("hw:0,0"));
        assert!(!is_preferred_device("default"));
    }

    #[test]
    fn test_unknown_input_device_is_reported() {
        let backend = CpalBackend::new(Some("NonExistentDevice12345".to_string()), None);
        match backend.create_capture_context(16000) {
            Err(VoxliveError::AudioDeviceNotFound { device }) => {
                assert_eq!(device, "NonExistentDevice12345");
            }
            Err(VoxliveError::AudioDevice { .. }) => {} // no audio host at all
            Err(other) => panic!("Expected AudioDeviceNotFound, got {:?}", other),
            Ok(_) => panic!("Expected AudioDeviceNotFound"),
        }
    }

    #[test]
    #[ignore] // Requires audio hardware
    fn test_list_input_devices_filters_surround() {
        let devices = list_devices(DeviceDirection::Input).expect("Failed to list devices");
        for device in &devices {
            assert!(!device.to_lowercase().contains("surround"), "{}", device);
        }
    }

    #[tokio::test]
    #[ignore] // Requires audio hardware
    async fn test_open_and_stop_microphone() {
        let backend = CpalBackend::default();
        let mut ctx = backend.create_capture_context(16000).expect("input context");
        ctx.resume().await.expect("resume");
        let mut mic = ctx
            .open_microphone(&MicrophoneConstraints::default())
            .await
            .expect("microphone");
        assert_eq!(mic.live_tracks(), 1);
        mic.stop();
        mic.stop();
        assert_eq!(mic.live_tracks(), 0);
        ctx.close().await.expect("close");
    }
}
