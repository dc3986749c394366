//! JSON messages exchanged with the live speech model.
//!
//! Only the fields the session engine reads are modelled; everything else in
//! a server message is ignored by serde.

use crate::audio::codec::MediaBlob;
use serde::{Deserialize, Serialize};

/// Parameters of one live session, sent as the first client message.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSetup {
    pub model: String,
    pub voice: String,
    /// Full instruction, language context included.
    pub system_instruction: String,
}

impl LiveSetup {
    pub fn to_message(&self) -> ClientMessage {
        let model = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        ClientMessage::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec![Modality::Audio],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![Part {
                    text: Some(self.system_instruction.clone()),
                    inline_data: None,
                }],
            },
        })
    }
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn realtime_audio(blob: &MediaBlob) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![blob.clone()],
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<Modality>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaBlob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<MediaBlob>,
}

/// One message from the server.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

impl ServerMessage {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Server message carrying only audio parts, for tests and mocks.
    pub fn audio(payloads: &[&str]) -> Self {
        let parts = payloads
            .iter()
            .map(|data| Part {
                text: None,
                inline_data: Some(MediaBlob {
                    data: data.to_string(),
                    mime_type: "audio/pcm;rate=24000".to_string(),
                }),
            })
            .collect();
        Self {
            setup_complete: None,
            server_content: Some(ServerContent {
                model_turn: Some(Content { parts }),
                ..ServerContent::default()
            }),
        }
    }

    /// Server message with only the `interrupted` flag set.
    pub fn interruption() -> Self {
        Self {
            setup_complete: None,
            server_content: Some(ServerContent {
                interrupted: true,
                ..ServerContent::default()
            }),
        }
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Base64 audio payloads of every inline-data part, in order.
    pub fn audio_payloads(&self) -> Vec<&str> {
        self.server_content
            .as_ref()
            .and_then(|content| content.model_turn.as_ref())
            .map(|turn| {
                turn.parts
                    .iter()
                    .filter_map(|part| part.inline_data.as_ref())
                    .filter(|blob| blob.mime_type.starts_with("audio/"))
                    .map(|blob| blob.data.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .is_some_and(|content| content.interrupted)
    }

    pub fn turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .is_some_and(|content| content.turn_complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn setup_message_shape() {
        let setup = LiveSetup {
            model: "gemini-test".to_string(),
            voice: "Kore".to_string(),
            system_instruction: "Be brief.".to_string(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&setup.to_message().to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/gemini-test",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": {
                                "prebuiltVoiceConfig": { "voiceName": "Kore" }
                            }
                        }
                    },
                    "systemInstruction": { "parts": [{ "text": "Be brief." }] }
                }
            })
        );
    }

    #[test]
    fn model_prefix_not_doubled() {
        let setup = LiveSetup {
            model: "models/x".to_string(),
            voice: "Kore".to_string(),
            system_instruction: String::new(),
        };
        let ClientMessage::Setup(inner) = setup.to_message() else {
            panic!("expected setup");
        };
        assert_eq!(inner.model, "models/x");
    }

    #[test]
    fn realtime_input_shape() {
        let blob = MediaBlob {
            data: "AAAA".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&ClientMessage::realtime_audio(&blob).to_json().unwrap())
                .unwrap();
        assert_eq!(
            value,
            json!({
                "realtimeInput": {
                    "mediaChunks": [{ "data": "AAAA", "mimeType": "audio/pcm;rate=16000" }]
                }
            })
        );
    }

    #[test]
    fn parses_audio_parts_in_order() {
        let msg = ServerMessage::from_json(
            r#"{"serverContent":{"modelTurn":{"parts":[
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}},
                {"text":"hello"},
                {"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"BBBB"}}
            ]}}}"#,
        )
        .unwrap();
        assert_eq!(msg.audio_payloads(), vec!["AAAA", "BBBB"]);
        assert!(!msg.interrupted());
        assert!(!msg.is_setup_complete());
    }

    #[test]
    fn parses_interrupted_and_turn_complete() {
        let msg =
            ServerMessage::from_json(r#"{"serverContent":{"interrupted":true,"turnComplete":true}}"#)
                .unwrap();
        assert!(msg.interrupted());
        assert!(msg.turn_complete());
        assert!(msg.audio_payloads().is_empty());
    }

    #[test]
    fn parses_setup_complete_and_ignores_unknown_fields() {
        let msg = ServerMessage::from_json(r#"{"setupComplete":{},"usageMetadata":{"x":1}}"#)
            .unwrap();
        assert!(msg.is_setup_complete());
    }
}
