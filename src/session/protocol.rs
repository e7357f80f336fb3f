//! Live session wire messages
//!
//! Outbound messages are serialized with `serde`. Inbound documents are
//! decoded into one tagged [`InboundMessage`] variant per recognized shape,
//! with [`InboundMessage::Unrecognized`] for everything else so unknown
//! traffic is never fatal.
//!
//! | Inbound JSON | Variant |
//! |--------------|---------|
//! | `setupComplete` | `SetupComplete` |
//! | `serverContent.interrupted: true` | `Interrupted` |
//! | `serverContent.modelTurn.parts[].inlineData` (`audio/pcm*`) | `ModelAudio` (carries `turnComplete`) |
//! | `serverContent.turnComplete: true` / `turnComplete: true` | `TurnComplete` |
//! | `serverContent.inputTranscription` | `InputTranscription` |
//! | `serverContent.modelTurn.parts[].text` | `ModelText` |
//! | `serverContent.generationComplete: true` | `GenerationComplete` |
//! | `goAway` | `GoAway` |

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::voice::AudioFrame;

const AUDIO_MIME_TYPE: &str = "audio/pcm";

// =============================================================================
// Outgoing Messages (Client to Server)
// =============================================================================

/// Messages sent to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum OutboundMessage {
    /// Session handshake, sent once
    Setup(Setup),
    /// Captured microphone audio
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub voice_name: String,
}

/// Instruction content made of text parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    /// Base64-encoded PCM16 mono at 16 kHz
    pub data: String,
}

impl OutboundMessage {
    /// Build the handshake message
    #[must_use]
    pub fn setup(model: &str, voice: &str, instruction: String) -> Self {
        Self::Setup(Setup {
            model: model.to_string(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        voice_name: voice.to_string(),
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart { text: instruction }],
            },
        })
    }

    /// Wrap one encoded capture frame
    #[must_use]
    pub fn audio(frame: &AudioFrame) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: AUDIO_MIME_TYPE.to_string(),
                data: BASE64.encode(frame.to_le_bytes()),
            }],
        })
    }

    /// Serialize to a single-line JSON document
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Instruction text of a setup message
    #[must_use]
    pub fn system_instruction(&self) -> Option<&str> {
        match self {
            Self::Setup(setup) => setup
                .system_instruction
                .parts
                .first()
                .map(|part| part.text.as_str()),
            Self::RealtimeInput(_) => None,
        }
    }

    #[must_use]
    pub const fn is_audio(&self) -> bool {
        matches!(self, Self::RealtimeInput(_))
    }
}

// =============================================================================
// Incoming Messages (Server to Client)
// =============================================================================

/// A recognized inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Handshake acknowledged
    SetupComplete,
    /// User barged in over the current response
    Interrupted,
    /// Response audio (raw PCM16 bytes, all audio parts concatenated)
    ///
    /// `turn_complete` is set when the same message also ends the turn.
    ModelAudio { data: Vec<u8>, turn_complete: bool },
    /// Response turn finished
    TurnComplete,
    /// Transcription of the user's speech
    InputTranscription { text: String, finished: bool },
    /// Text-only response content
    ModelText { text: String },
    /// Backend finished generating (audio may still be streaming)
    GenerationComplete,
    /// Backend will close the connection soon
    GoAway { time_left: Option<String> },
    /// Anything else, including malformed JSON
    Unrecognized { reason: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<RawServerContent>,
    turn_complete: Option<bool>,
    go_away: Option<RawGoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerContent {
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
    #[serde(default)]
    generation_complete: bool,
    model_turn: Option<RawContent>,
    input_transcription: Option<RawTranscription>,
}

#[derive(Debug, Default, Deserialize)]
struct RawContent {
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPart {
    text: Option<String>,
    inline_data: Option<RawBlob>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlob {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finished: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawGoAway {
    time_left: Option<String>,
}

impl InboundMessage {
    /// Parse a JSON document; never fails
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let value = match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) if value.is_object() => value,
            Ok(_) => {
                return Self::Unrecognized {
                    reason: "not a JSON object".to_string(),
                };
            }
            Err(e) => {
                return Self::Unrecognized {
                    reason: format!("malformed JSON: {e}"),
                };
            }
        };

        match serde_json::from_value::<RawInbound>(value) {
            Ok(raw) => Self::classify(raw),
            Err(e) => Self::Unrecognized {
                reason: format!("unexpected message shape: {e}"),
            },
        }
    }

    /// Parse a binary frame carrying a UTF-8 JSON document
    #[must_use]
    pub fn parse_bytes(bytes: &[u8]) -> Self {
        std::str::from_utf8(bytes).map_or_else(
            |_| Self::Unrecognized {
                reason: format!("binary frame is not UTF-8 ({} bytes)", bytes.len()),
            },
            Self::parse,
        )
    }

    fn classify(raw: RawInbound) -> Self {
        if raw.setup_complete.is_some() {
            return Self::SetupComplete;
        }

        if let Some(content) = raw.server_content {
            if content.interrupted {
                return Self::Interrupted;
            }

            let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
            match decode_audio_parts(&parts) {
                Ok(Some(data)) => {
                    return Self::ModelAudio {
                        data,
                        turn_complete: content.turn_complete,
                    };
                }
                Ok(None) => {}
                Err(reason) => return Self::Unrecognized { reason },
            }

            if content.turn_complete {
                return Self::TurnComplete;
            }
            if let Some(transcription) = content.input_transcription {
                return Self::InputTranscription {
                    text: transcription.text,
                    finished: transcription.finished,
                };
            }

            let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();
            if !text.is_empty() {
                return Self::ModelText { text };
            }
            if content.generation_complete {
                return Self::GenerationComplete;
            }
        }

        if raw.turn_complete == Some(true) {
            return Self::TurnComplete;
        }

        if let Some(go_away) = raw.go_away {
            return Self::GoAway {
                time_left: go_away.time_left,
            };
        }

        Self::Unrecognized {
            reason: "no recognized top-level key".to_string(),
        }
    }
}

/// Concatenate every `audio/pcm` inline part, `Ok(None)` if there are none
fn decode_audio_parts(parts: &[RawPart]) -> Result<Option<Vec<u8>>, String> {
    let mut audio: Option<Vec<u8>> = None;

    for blob in parts.iter().filter_map(|p| p.inline_data.as_ref()) {
        if !blob.mime_type.starts_with(AUDIO_MIME_TYPE) {
            continue;
        }
        let bytes = BASE64
            .decode(blob.data.as_bytes())
            .map_err(|e| format!("invalid base64 audio: {e}"))?;
        audio.get_or_insert_with(Vec::new).extend_from_slice(&bytes);
    }

    Ok(audio)
}
