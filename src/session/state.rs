//! Session lifecycle, language selection and the status snapshot published to
//! the presentation layer.

use crate::error::VoxliveError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of the single active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Transient; teardown routes back to `Idle`.
    Closed,
    /// Transient; teardown routes back to `Idle` and keeps the message.
    Error,
}

impl SessionState {
    /// Whether `start()` is allowed without tearing anything down first.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Closed | Self::Error)
    }

    /// Connecting or connected.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Preferred response language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Telugu,
    English,
}

impl Language {
    /// Sentence appended to the system instruction.
    pub fn prompt_context(self) -> &'static str {
        match self {
            Self::Telugu => {
                "The user prefers to speak in Telugu. Respond primarily in Telugu, \
                 but you can mix in English terms if common (Tanglish)."
            }
            Self::English => {
                "The user prefers to speak in English. Respond in clear Indian English."
            }
        }
    }

    /// Combines a base instruction with this language's context.
    pub fn system_instruction(self, base: &str) -> String {
        let base = base.trim();
        if base.is_empty() {
            self.prompt_context().to_string()
        } else {
            format!("{}\n\n{}", base, self.prompt_context())
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Telugu => f.write_str("telugu"),
            Self::English => f.write_str("english"),
        }
    }
}

impl FromStr for Language {
    type Err = VoxliveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telugu" | "te" => Ok(Self::Telugu),
            "english" | "en" => Ok(Self::English),
            other => Err(VoxliveError::ConfigInvalidValue {
                key: "session.language".to_string(),
                message: format!("unknown language '{}', expected telugu or english", other),
            }),
        }
    }
}

/// Generation counter distinguishing one `start()` from the next.
///
/// Events tagged with an older id belong to a session that was already torn
/// down and are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Everything the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub language: Language,
    pub assistant_speaking: bool,
    pub user_speaking: bool,
    /// Last user-visible error, cleared on the next `start()`.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_allowed_from_terminal_states() {
        assert!(SessionState::Idle.can_start());
        assert!(SessionState::Closed.can_start());
        assert!(SessionState::Error.can_start());
        assert!(!SessionState::Connecting.can_start());
        assert!(!SessionState::Connected.can_start());
    }

    #[test]
    fn language_parses_names_and_codes() {
        assert_eq!("Telugu".parse::<Language>().unwrap(), Language::Telugu);
        assert_eq!("en".parse::<Language>().unwrap(), Language::English);
        assert!(matches!(
            "french".parse::<Language>(),
            Err(VoxliveError::ConfigInvalidValue { .. })
        ));
    }

    #[test]
    fn system_instruction_appends_language_context() {
        let combined = Language::English.system_instruction("Be brief.");
        assert!(combined.starts_with("Be brief."));
        assert!(combined.ends_with("Respond in clear Indian English."));

        let bare = Language::Telugu.system_instruction("  ");
        assert!(bare.contains("Tanglish"));
    }

    #[test]
    fn status_defaults_to_idle() {
        let status = SessionStatus::default();
        assert_eq!(status.state, SessionState::Idle);
        assert!(!status.assistant_speaking);
        assert!(status.error.is_none());
    }

    #[test]
    fn session_id_increments() {
        assert_eq!(SessionId(4).next(), SessionId(5));
        assert_eq!(SessionId(1).to_string(), "session#1");
    }
}
