use crate::audio::device::MicrophoneConstraints;
use crate::audio::frame::validate_frame_size;
use crate::audio::vad::VadConfig;
use crate::defaults;
use crate::error::{Result, VoxliveError};
use crate::session::state::Language;
use crate::transport::LiveSetup;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub transport: TransportConfig,
    pub audio: AudioConfig,
    pub vad: VadSection,
}

/// Conversation configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub language: Language,
    pub system_instruction: String,
}

/// Remote model configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub endpoint: String,
    /// Give up on a connect that has not opened after this long. Unset waits forever.
    pub connect_timeout_ms: Option<u64>,
}

/// Capture and playback device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub capture_rate: u32,
    pub playback_rate: u32,
    pub frame_size: usize,
    pub lead_gap_ms: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

/// Voice activity thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadSection {
    pub speaking_threshold: f32,
    pub barge_in_threshold: f32,
    pub barge_in_frames: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            language: Language::default(),
            system_instruction: defaults::DEFAULT_SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: defaults::DEFAULT_MODEL.to_string(),
            voice: defaults::DEFAULT_VOICE.to_string(),
            endpoint: defaults::DEFAULT_ENDPOINT.to_string(),
            connect_timeout_ms: None,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            capture_rate: defaults::CAPTURE_SAMPLE_RATE,
            playback_rate: defaults::PLAYBACK_SAMPLE_RATE,
            frame_size: defaults::FRAME_SIZE,
            lead_gap_ms: defaults::LEAD_GAP_MS,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl Default for VadSection {
    fn default() -> Self {
        Self {
            speaking_threshold: defaults::SPEAKING_THRESHOLD,
            barge_in_threshold: defaults::BARGE_IN_THRESHOLD,
            barge_in_frames: defaults::BARGE_IN_FRAMES,
        }
    }
}

impl VadSection {
    pub fn to_vad_config(&self) -> VadConfig {
        VadConfig {
            speaking_threshold: self.speaking_threshold,
            barge_in_threshold: self.barge_in_threshold,
            barge_in_frames: self.barge_in_frames,
        }
    }
}

impl AudioConfig {
    pub fn microphone_constraints(&self) -> MicrophoneConstraints {
        MicrophoneConstraints {
            channel_count: 1,
            sample_rate: self.capture_rate,
            echo_cancellation: self.echo_cancellation,
            noise_suppression: self.noise_suppression,
            auto_gain_control: self.auto_gain_control,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only a missing file falls back to defaults; invalid TOML is an error.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(VoxliveError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXLIVE_API_KEY, GEMINI_API_KEY, API_KEY (first non-empty wins) → transport.api_key
    /// - VOXLIVE_MODEL → transport.model
    /// - VOXLIVE_VOICE → transport.voice
    /// - VOXLIVE_LANGUAGE → session.language
    /// - VOXLIVE_INPUT_DEVICE → audio.input_device
    /// - VOXLIVE_OUTPUT_DEVICE → audio.output_device
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(key) = defaults::API_KEY_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|value| !value.is_empty())
        {
            self.transport.api_key = Some(key);
        }

        if let Ok(model) = std::env::var("VOXLIVE_MODEL")
            && !model.is_empty()
        {
            self.transport.model = model;
        }

        if let Ok(voice) = std::env::var("VOXLIVE_VOICE")
            && !voice.is_empty()
        {
            self.transport.voice = voice;
        }

        if let Ok(language) = std::env::var("VOXLIVE_LANGUAGE")
            && !language.is_empty()
        {
            match language.parse() {
                Ok(language) => self.session.language = language,
                Err(e) => warn!("Ignoring VOXLIVE_LANGUAGE: {}", e),
            }
        }

        if let Ok(device) = std::env::var("VOXLIVE_INPUT_DEVICE")
            && !device.is_empty()
        {
            self.audio.input_device = Some(device);
        }

        if let Ok(device) = std::env::var("VOXLIVE_OUTPUT_DEVICE")
            && !device.is_empty()
        {
            self.audio.output_device = Some(device);
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxlive/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("voxlive")
            .join("config.toml")
    }

    /// Rejects values the session engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (key, rate) in [
            ("audio.capture_rate", self.audio.capture_rate),
            ("audio.playback_rate", self.audio.playback_rate),
        ] {
            if rate == 0 {
                return Err(VoxliveError::ConfigInvalidValue {
                    key: key.to_string(),
                    message: "must be non-zero".to_string(),
                });
            }
        }
        validate_frame_size(self.audio.frame_size)?;
        self.vad.to_vad_config().validate()?;
        if self.transport.model.trim().is_empty() {
            return Err(VoxliveError::ConfigInvalidValue {
                key: "transport.model".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.transport.connect_timeout_ms == Some(0) {
            return Err(VoxliveError::ConfigInvalidValue {
                key: "transport.connect_timeout_ms".to_string(),
                message: "must be positive; omit it to disable the timeout".to_string(),
            });
        }
        Ok(())
    }

    /// The API key, or `ConfigMissing` when none is configured.
    pub fn require_api_key(&self) -> Result<&str> {
        match self.transport.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(VoxliveError::ConfigMissing {
                key: "transport.api_key".to_string(),
            }),
        }
    }

    /// Setup payload for a session in `language`.
    pub fn live_setup(&self, language: Language) -> LiveSetup {
        LiveSetup {
            model: self.transport.model.clone(),
            voice: self.transport.voice.clone(),
            system_instruction: language.system_instruction(&self.session.system_instruction),
        }
    }

    /// Copy safe to print: the API key is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(key) = copy.transport.api_key.as_mut() {
            let tail: String = key
                .chars()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            *key = if key.chars().count() > 8 {
                format!("****{}", tail)
            } else {
                "****".to_string()
            };
        }
        copy
    }
}
