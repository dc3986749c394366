//! voxlive - Full-duplex voice sessions with a live speech model
//!
//! Captures the microphone, streams it to the model, plays the spoken reply
//! gaplessly and cuts playback off the moment the user talks over it.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod session;
pub mod transport;

// Device seams
pub use audio::device::{AudioBackend, CaptureContext, Microphone, OutputContext};
pub use transport::{TransportConnector, TransportEvent, TransportHandle};

// Session engine
pub use session::{
    Language, PlaybackScheduler, SessionCommand, SessionController, SessionHandle, SessionRunner,
    SessionState, SessionStatus,
};

// Error handling
pub use error::{ErrorCategory, Result, VoxliveError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn version_string_carries_hash_only_when_built_from_git() {
        let ver = version_string();
        match option_env!("GIT_HASH") {
            Some(hash) if !hash.is_empty() => assert_eq!(ver.split('+').nth(1), Some(hash)),
            _ => assert_eq!(ver, env!("CARGO_PKG_VERSION")),
        }
    }
}
