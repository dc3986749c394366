//! Command-line interface for voxlive
//!
//! Provides argument parsing using clap derive macros.

use crate::config::Config;
use crate::session::state::Language;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Talk to a live speech model from the terminal
#[derive(Parser, Debug)]
#[command(
    name = "voxlive",
    version,
    about = "Full-duplex voice sessions with a live speech model"
)]
pub struct Cli {
    /// Subcommand to execute (default: run a session)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress status output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Audio input device name
    #[arg(long, value_name = "DEVICE")]
    pub input_device: Option<String>,

    /// Audio output device name
    #[arg(long, value_name = "DEVICE")]
    pub output_device: Option<String>,

    /// Response language (telugu, english)
    #[arg(long, short = 'l', value_name = "LANG")]
    pub language: Option<Language>,

    /// Live model id
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Prebuilt voice name (e.g., Kore)
    #[arg(long, value_name = "VOICE")]
    pub voice: Option<String>,

    /// Give up if the model has not answered the connect within this long. Examples: 10s, 1m
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub connect_timeout: Option<Duration>,

    /// End the session after this long instead of waiting for Ctrl+C. Examples: 30s, 5m
    #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
    pub duration: Option<Duration>,
}

/// Parse a duration string.
///
/// Supports any duration format accepted by `humantime`, plus bare numbers
/// meaning seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// List available audio input and output devices
    Devices,

    /// Print the effective configuration (API key redacted)
    Config,
}

impl Cli {
    /// Folds command-line overrides into `config`; flags win over file and env.
    pub fn apply_overrides(&self, mut config: Config) -> Config {
        if let Some(device) = &self.input_device {
            config.audio.input_device = Some(device.clone());
        }
        if let Some(device) = &self.output_device {
            config.audio.output_device = Some(device.clone());
        }
        if let Some(language) = self.language {
            config.session.language = language;
        }
        if let Some(model) = &self.model {
            config.transport.model = model.clone();
        }
        if let Some(voice) = &self.voice {
            config.transport.voice = voice.clone();
        }
        if let Some(timeout) = self.connect_timeout {
            config.transport.connect_timeout_ms = Some(timeout.as_millis() as u64);
        }
        config
    }

    /// Default `tracing` filter for the verbosity level.
    pub fn log_filter(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "warn",
            (false, 1) => "voxlive=debug,info",
            (false, _) => "voxlive=trace,debug",
        }
    }
}
