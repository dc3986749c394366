//! Default configuration constants for voxlive.
//!
//! Shared by the config layer and the session engine so both agree on the
//! wire contract of the live speech model.

/// Capture sample rate in Hz.
///
/// The live model accepts 16kHz mono PCM as input.
pub const CAPTURE_SAMPLE_RATE: u32 = 16000;

/// Playback sample rate in Hz.
///
/// The live model replies with 24kHz mono PCM.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Number of samples handed to the frame processor per callback.
///
/// 4096 samples at 16kHz is 256ms of audio per outbound frame.
pub const FRAME_SIZE: usize = 4096;

/// RMS level above which the user is considered to be speaking.
///
/// Only drives the "listening" indicator; sits just above a quiet room's
/// noise floor.
pub const SPEAKING_THRESHOLD: f32 = 0.005;

/// RMS level above which user speech interrupts assistant playback.
///
/// Four times the speaking threshold, so breathing and keyboard noise do not
/// cut the assistant off.
pub const BARGE_IN_THRESHOLD: f32 = 0.02;

/// Consecutive loud frames needed before a barge-in fires.
pub const BARGE_IN_FRAMES: u32 = 1;

/// Lead gap in milliseconds applied when playback re-anchors after an underrun.
pub const LEAD_GAP_MS: u32 = 50;

/// Inbound chunks shorter than this many milliseconds are treated as truncated.
pub const MIN_CHUNK_MS: u32 = 1;

/// Default live model.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice.
pub const DEFAULT_VOICE: &str = "Kore";

/// Default websocket endpoint for the live API.
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default system instruction when none is configured.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a helpful, polite voice assistant. \
Keep answers short and conversational, and stop talking when the user interrupts.";

/// MIME type prefix for outbound PCM frames.
pub const PCM_MIME_PREFIX: &str = "audio/pcm;rate=";

/// Environment variables checked, in order, for the API key.
pub const API_KEY_VARS: &[&str] = &["VOXLIVE_API_KEY", "GEMINI_API_KEY", "API_KEY"];
