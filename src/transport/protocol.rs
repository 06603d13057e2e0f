//! JSON messages of the Gemini Live bidirectional streaming API.
//!
//! Client → server:
//! ```text
//! { "setup": { "model", "generationConfig": { "responseModalities", "speechConfig" },
//!              "systemInstruction": { "parts": [{ "text" }] } } }
//! { "realtimeInput": { "mediaChunks": [{ "mimeType", "data" }] } }
//! ```
//! Server → client (fields other than these are ignored):
//! ```text
//! { "setupComplete": {} }
//! { "serverContent": { "interrupted", "turnComplete",
//!                      "modelTurn": { "parts": [{ "inlineData": { "mimeType", "data" } }] } } }
//! { "goAway": { "timeLeft" } }
//! ```

use serde::{Deserialize, Serialize};

use crate::codec::EncodedFrame;
use crate::error::{ParleyError, Result};

use super::{ServerEvent, SessionSetup};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

impl From<&SessionSetup> for SetupMessage {
    fn from(setup: &SessionSetup) -> Self {
        let model = if setup.model.starts_with("models/") {
            setup.model.clone()
        } else {
            format!("models/{}", setup.model)
        };

        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: setup.modalities.iter().map(|m| m.as_str()).collect(),
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: setup.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: setup.instructions.clone(),
                    }],
                },
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [MediaChunk<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk<'a> {
    mime_type: &'a str,
    data: &'a str,
}

impl<'a> From<&'a EncodedFrame> for RealtimeInputMessage<'a> {
    fn from(frame: &'a EncodedFrame) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: [MediaChunk {
                    mime_type: frame.mime_type,
                    data: &frame.data,
                }],
            },
        }
    }
}

/// One inbound server message.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
    model_turn: Option<ModelTurn>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

impl ServerMessage {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ParleyError::Runtime(format!("malformed server message: {e}")))
    }

    #[must_use]
    pub const fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into events, in the order they must be handled.
    ///
    /// An interruption supersedes any audio in the same message.
    #[must_use]
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if let Some(content) = self.server_content {
            if content.interrupted {
                return vec![ServerEvent::Interrupted];
            }

            let audio = content
                .model_turn
                .into_iter()
                .flat_map(|turn| turn.parts)
                .filter_map(|part| part.inline_data)
                .map(|inline| ServerEvent::Audio {
                    data: inline.data,
                    mime_type: inline.mime_type,
                });
            events.extend(audio);

            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if let Some(go_away) = self.go_away {
            events.push(ServerEvent::GoAway {
                time_left: go_away.time_left,
            });
        }

        if events.is_empty() && self.setup_complete.is_none() {
            events.push(ServerEvent::Other);
        }

        events
    }
}
