//! Error types for voxlive.

use crate::audio::codec::DecodeError;
use thiserror::Error;

/// User-visible text shown after a transport failure.
pub const TRANSPORT_ERROR_MESSAGE: &str = "Connection disrupted. Please reconnect.";

#[derive(Error, Debug)]
pub enum VoxliveError {
    // Configuration errors
    #[error("Missing required configuration: {key}")]
    ConfigMissing { key: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Audio device errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio device error: {message}")]
    AudioDevice { message: String },

    #[error("Microphone unavailable: {message}")]
    MicrophoneUnavailable { message: String },

    // Inbound audio errors
    #[error("Audio decode failed: {0}")]
    Decode(#[from] DecodeError),

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Transport closed")]
    TransportClosed,

    // Lifecycle errors
    #[error("Cannot {operation} while session is {state}")]
    InvalidState { operation: String, state: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse failure classes, used to decide how a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing or invalid configuration; nothing was touched.
    Config,
    /// Microphone or device context failure; session is torn down.
    Device,
    /// One inbound chunk was unreadable; handled locally.
    Decode,
    /// Remote stream failure; session is torn down.
    Transport,
    /// Remote stream ended; session is torn down without an error message.
    TransportClosed,
    /// Everything else.
    Internal,
}

impl VoxliveError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            VoxliveError::ConfigMissing { .. }
            | VoxliveError::ConfigInvalidValue { .. }
            | VoxliveError::Config(_) => ErrorCategory::Config,
            VoxliveError::AudioDeviceNotFound { .. }
            | VoxliveError::AudioDevice { .. }
            | VoxliveError::MicrophoneUnavailable { .. } => ErrorCategory::Device,
            VoxliveError::Decode(_) => ErrorCategory::Decode,
            VoxliveError::Transport { .. } => ErrorCategory::Transport,
            VoxliveError::TransportClosed => ErrorCategory::TransportClosed,
            VoxliveError::InvalidState { .. } | VoxliveError::Io(_) | VoxliveError::Other(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Text suitable for the presentation layer's error banner.
    pub fn user_message(&self) -> String {
        match self.category() {
            ErrorCategory::Transport => TRANSPORT_ERROR_MESSAGE.to_string(),
            _ => self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, VoxliveError>;
