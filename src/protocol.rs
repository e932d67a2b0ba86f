//! Session server protocol types
//!
//! JSON messages exchanged with the session server over the websocket.
//! Every message carries an `action` field naming its kind.
//!
//! # Turn Flow
//!
//! 1. Client sends `stt_options` and `tts_options` after the transport opens
//! 2. On trigger, client sends `audio_start`, N × `audio_data`, `audio_end`
//! 3. Server answers with `stt_transcript`, `text`, `response`
//! 4. Server streams the spoken answer as `audio_start`, N × `audio_data`, `audio_end`

use crate::error::ProtocolError;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use serde_json::Value;

/// Content type of captured and synthesized audio
pub const AUDIO_CONTENT_TYPE: &str = "audio/l16; rate=16000; channels=1";

/// Recognition options sent once per connection
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SttOptions {
    pub engine: String,
    pub content_type: String,
    pub inactivity_timeout: i32,
    pub smart_formatting: bool,
}

impl SttOptions {
    pub fn new(engine: &str) -> Self {
        Self {
            engine: engine.to_string(),
            content_type: AUDIO_CONTENT_TYPE.to_string(),
            inactivity_timeout: -1,
            smart_formatting: true,
        }
    }
}

/// Synthesis options sent once per connection
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TtsOptions {
    pub engine: String,
    pub accept: String,
    pub voice: String,
}

impl TtsOptions {
    pub fn new(engine: &str, voice: &str) -> Self {
        Self {
            engine: engine.to_string(),
            accept: AUDIO_CONTENT_TYPE.to_string(),
            voice: voice.to_string(),
        }
    }
}

/// Per-capture options carried by `audio_start`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AudioStartOptions {
    pub stt: Value,
}

// ============================================================================
// Client Actions (sent TO the server)
// ============================================================================

/// Messages sent from the client to the session server
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    SttOptions {
        id: String,
        options: SttOptions,
    },

    TtsOptions {
        id: String,
        options: TtsOptions,
        /// "url" asks the server for a link to synthesized audio
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<String>,
    },

    AudioStart {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<AudioStartOptions>,
    },

    AudioData {
        id: String,
        encoding: String,
        /// Base64-encoded PCM bytes
        data: String,
    },

    AudioEnd {
        id: String,
    },

    Tts {
        id: String,
        options: Value,
        text: String,
    },
}

impl ClientAction {
    pub fn stt_options(engine: &str) -> Self {
        Self::SttOptions {
            id: new_id(),
            options: SttOptions::new(engine),
        }
    }

    pub fn tts_options(engine: &str, voice: &str, url_mode: bool) -> Self {
        Self::TtsOptions {
            id: new_id(),
            options: TtsOptions::new(engine, voice),
            audio: url_mode.then(|| "url".to_string()),
        }
    }

    /// Start a new capture with a fresh turn id
    pub fn audio_start(stt: Option<Value>) -> Self {
        Self::AudioStart {
            id: new_id(),
            options: stt.map(|stt| AudioStartOptions { stt }),
        }
    }

    pub fn audio_data(id: &str, bytes: &[u8]) -> Self {
        Self::AudioData {
            id: id.to_string(),
            encoding: "base64".to_string(),
            data: STANDARD.encode(bytes),
        }
    }

    pub fn audio_end(id: &str) -> Self {
        Self::AudioEnd { id: id.to_string() }
    }

    pub fn tts(text: &str, options: Value) -> Self {
        Self::Tts {
            id: new_id(),
            options,
            text: text.to_string(),
        }
    }

    /// Turn or request id carried by this action
    pub fn id(&self) -> &str {
        match self {
            Self::SttOptions { id, .. }
            | Self::TtsOptions { id, .. }
            | Self::AudioStart { id, .. }
            | Self::AudioData { id, .. }
            | Self::AudioEnd { id }
            | Self::Tts { id, .. } => id,
        }
    }

    /// Action name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Self::SttOptions { .. } => "stt_options",
            Self::TtsOptions { .. } => "tts_options",
            Self::AudioStart { .. } => "audio_start",
            Self::AudioData { .. } => "audio_data",
            Self::AudioEnd { .. } => "audio_end",
            Self::Tts { .. } => "tts",
        }
    }

    /// Serialize to the JSON text frame sent on the wire
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// Server Actions (received FROM the server)
// ============================================================================

/// Follow-up instruction attached to a `text` action
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Prompt {
    /// Wait for the next trigger after the answer plays
    #[default]
    None,
    /// Open the microphone again after the answer plays
    Simple,
    /// Open the microphone again with these recognition options
    WithOptions(Value),
}

impl Prompt {
    pub fn should_prompt(&self) -> bool {
        !matches!(self, Prompt::None)
    }

    pub fn stt_options(&self) -> Option<Value> {
        match self {
            Prompt::WithOptions(options) => Some(options.clone()),
            _ => None,
        }
    }

    fn from_value(value: Option<&Value>) -> Self {
        match value {
            Some(Value::Bool(true)) => Prompt::Simple,
            Some(options @ Value::Object(_)) => Prompt::WithOptions(options.clone()),
            _ => Prompt::None,
        }
    }
}

/// Local device command carried by a `command` card
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCommand {
    PlaybackResume,
    PlaybackStop,
    VolumeDecrease,
    VolumeIncrease,
    VolumeMute,
    VolumeUnmute,
    Unknown { feature: String, action: String },
}

impl LocalCommand {
    fn parse(feature: &str, action: &str) -> Self {
        let feature = feature.to_uppercase();
        let action = action.to_uppercase();

        match (feature.as_str(), action.as_str()) {
            ("PLAYBACK", "RESUME") => LocalCommand::PlaybackResume,
            ("PLAYBACK", "STOP") | ("PLAYBACK", "MUTE") => LocalCommand::PlaybackStop,
            ("VOLUME", "DECREASE") => LocalCommand::VolumeDecrease,
            ("VOLUME", "INCREASE") => LocalCommand::VolumeIncrease,
            ("VOLUME", "MUTE") => LocalCommand::VolumeMute,
            ("VOLUME", "UNMUTE") => LocalCommand::VolumeUnmute,
            _ => LocalCommand::Unknown { feature, action },
        }
    }
}

/// Card attached to a `response` action
#[derive(Debug, Clone, PartialEq)]
pub enum Card {
    /// A `command` card with a feature/action pair
    Command(LocalCommand),
    /// Any other card (display content, or a command card without content)
    Other,
}

/// Messages received from the session server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerAction {
    Error {
        message: String,
    },
    SttTranscript {
        transcript: String,
        confidence: f64,
        transaction_id: String,
    },
    Text {
        speech: String,
        voice: Option<String>,
        prompt: Prompt,
    },
    Response {
        card: Option<Card>,
        text: String,
    },
    AudioStart {
        id: String,
    },
    AudioData {
        id: String,
        bytes: Vec<u8>,
    },
    AudioEnd {
        id: String,
    },
    /// Any action this client does not handle
    Unknown {
        action: String,
    },
}

impl ServerAction {
    /// Parse a JSON text frame from the server
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .filter(|a| !a.is_empty())
            .ok_or(ProtocolError::MissingField("action"))?;

        let parsed = match action {
            "error" => ServerAction::Error {
                message: error_message(value),
            },

            "stt_transcript" => ServerAction::SttTranscript {
                transcript: opt_str(value, "transcript"),
                confidence: value
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0),
                transaction_id: opt_str(value, "transactionId"),
            },

            "text" => ServerAction::Text {
                speech: opt_str(value, "speech"),
                voice: value
                    .get("voice")
                    .and_then(Value::as_str)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string),
                prompt: Prompt::from_value(value.get("prompt")),
            },

            "response" => {
                let data = value
                    .get("data")
                    .filter(|d| d.is_object())
                    .ok_or(ProtocolError::MissingField("data"))?;

                let card = data.get("card").filter(|c| c.is_object()).map(parse_card);

                // data.speech.text on newer servers, data.say on older ones
                let text = match data.get("speech").filter(|s| s.is_object()) {
                    Some(speech) => opt_str(speech, "text"),
                    None => opt_str(data, "say"),
                };

                ServerAction::Response { card, text }
            }

            "audio_start" => ServerAction::AudioStart {
                id: required_str(value, "id")?,
            },

            "audio_data" => {
                let id = required_str(value, "id")?;
                let data = value
                    .get("data")
                    .filter(|d| d.is_object())
                    .ok_or(ProtocolError::MissingField("data"))?;
                let bytes = data
                    .get("data")
                    .ok_or(ProtocolError::MissingField("data.data"))?;
                ServerAction::AudioData {
                    id,
                    bytes: byte_array(bytes)?,
                }
            }

            "audio_end" => ServerAction::AudioEnd {
                id: required_str(value, "id")?,
            },

            other => ServerAction::Unknown {
                action: other.to_string(),
            },
        };

        Ok(parsed)
    }

    /// Action name as it appears on the wire
    pub fn name(&self) -> &str {
        match self {
            ServerAction::Error { .. } => "error",
            ServerAction::SttTranscript { .. } => "stt_transcript",
            ServerAction::Text { .. } => "text",
            ServerAction::Response { .. } => "response",
            ServerAction::AudioStart { .. } => "audio_start",
            ServerAction::AudioData { .. } => "audio_data",
            ServerAction::AudioEnd { .. } => "audio_end",
            ServerAction::Unknown { action } => action,
        }
    }
}

fn opt_str(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn required_str(value: &Value, key: &'static str) -> Result<String, ProtocolError> {
    match value.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ProtocolError::UnexpectedType {
            field: key,
            expected: "string",
        }),
        None => Err(ProtocolError::MissingField(key)),
    }
}

fn error_message(value: &Value) -> String {
    let message = match value.get("error") {
        Some(Value::Object(err)) => err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        Some(Value::String(s)) => Some(s.clone()),
        _ => value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    message
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "<< no error message available >>".to_string())
}

fn parse_card(card: &Value) -> Card {
    let is_command = card
        .get("type")
        .and_then(Value::as_str)
        .map(|t| t.eq_ignore_ascii_case("command"))
        .unwrap_or(false);

    if !is_command {
        return Card::Other;
    }

    match card.get("content").filter(|c| c.is_object()) {
        Some(content) => {
            let feature = content
                .get("feature")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN");
            let action = content
                .get("action")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN");
            Card::Command(LocalCommand::parse(feature, action))
        }
        None => Card::Other,
    }
}

/// Decode a JSON array of byte values (signed or unsigned) into raw bytes
fn byte_array(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    let items = value.as_array().ok_or(ProtocolError::UnexpectedType {
        field: "data.data",
        expected: "array of bytes",
    })?;

    items
        .iter()
        .map(|item| {
            item.as_i64()
                .map(|b| b as u8)
                .ok_or(ProtocolError::UnexpectedType {
                    field: "data.data",
                    expected: "array of bytes",
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_value(action: &ClientAction) -> Value {
        serde_json::from_str(&action.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_stt_options_shape() {
        let value = to_value(&ClientAction::stt_options("watson"));
        assert_eq!(value["action"], "stt_options");
        assert!(value["id"].as_str().is_some());
        assert_eq!(value["options"]["engine"], "watson");
        assert_eq!(value["options"]["content_type"], AUDIO_CONTENT_TYPE);
        assert_eq!(value["options"]["inactivity_timeout"], -1);
        assert_eq!(value["options"]["smart_formatting"], true);
    }

    #[test]
    fn test_tts_options_url_mode() {
        let streamed = to_value(&ClientAction::tts_options("watson", "en-US_LisaVoice", false));
        assert_eq!(streamed["action"], "tts_options");
        assert_eq!(streamed["options"]["voice"], "en-US_LisaVoice");
        assert_eq!(streamed["options"]["accept"], AUDIO_CONTENT_TYPE);
        assert!(streamed.get("audio").is_none());

        let url = to_value(&ClientAction::tts_options("watson", "en-US_LisaVoice", true));
        assert_eq!(url["audio"], "url");
    }

    #[test]
    fn test_audio_start_fresh_ids() {
        let a = ClientAction::audio_start(None);
        let b = ClientAction::audio_start(None);
        assert_ne!(a.id(), b.id());

        let value = to_value(&a);
        assert_eq!(value["action"], "audio_start");
        assert!(value.get("options").is_none());

        let with_stt = to_value(&ClientAction::audio_start(Some(json!({"model": "x"}))));
        assert_eq!(with_stt["options"]["stt"]["model"], "x");
    }

    #[test]
    fn test_audio_data_base64() {
        let value = to_value(&ClientAction::audio_data("turn-1", &[0, 1, 2, 255]));
        assert_eq!(value["action"], "audio_data");
        assert_eq!(value["id"], "turn-1");
        assert_eq!(value["encoding"], "base64");
        let decoded = STANDARD.decode(value["data"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, vec![0, 1, 2, 255]);
    }

    #[test]
    fn test_audio_end_and_tts() {
        let end = to_value(&ClientAction::audio_end("turn-1"));
        assert_eq!(end, json!({"action": "audio_end", "id": "turn-1"}));

        let tts = to_value(&ClientAction::tts("hello", json!({"voice": "v"})));
        assert_eq!(tts["action"], "tts");
        assert_eq!(tts["text"], "hello");
        assert_eq!(tts["options"]["voice"], "v");
    }

    #[test]
    fn test_parse_error_variants() {
        let nested = ServerAction::parse(r#"{"action":"error","error":{"message":"bad"}}"#).unwrap();
        assert_eq!(nested, ServerAction::Error { message: "bad".into() });

        let flat = ServerAction::parse(r#"{"action":"error","error":"worse"}"#).unwrap();
        assert_eq!(flat, ServerAction::Error { message: "worse".into() });

        let empty = ServerAction::parse(r#"{"action":"error"}"#).unwrap();
        assert_eq!(
            empty,
            ServerAction::Error {
                message: "<< no error message available >>".into()
            }
        );
    }

    #[test]
    fn test_parse_text_prompt_forms() {
        let simple = ServerAction::parse(r#"{"action":"text","speech":"hi","prompt":true}"#).unwrap();
        match simple {
            ServerAction::Text { prompt, voice, .. } => {
                assert_eq!(prompt, Prompt::Simple);
                assert!(voice.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        let complex = ServerAction::parse(
            r#"{"action":"text","speech":"hi","voice":"http://x/a.raw","prompt":{"model":"m"}}"#,
        )
        .unwrap();
        match complex {
            ServerAction::Text { prompt, voice, .. } => {
                assert!(prompt.should_prompt());
                assert_eq!(prompt.stt_options(), Some(json!({"model": "m"})));
                assert_eq!(voice.as_deref(), Some("http://x/a.raw"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let none = ServerAction::parse(r#"{"action":"text","prompt":false}"#).unwrap();
        assert!(matches!(none, ServerAction::Text { prompt: Prompt::None, .. }));
    }

    #[test]
    fn test_parse_response_cards() {
        let stop = ServerAction::parse(
            r#"{"action":"response","data":{"card":{"type":"command","content":{"feature":"playback","action":"stop"}},"speech":{"text":"ok"}}}"#,
        )
        .unwrap();
        assert_eq!(
            stop,
            ServerAction::Response {
                card: Some(Card::Command(LocalCommand::PlaybackStop)),
                text: "ok".into()
            }
        );

        let volume = ServerAction::parse(
            r#"{"action":"response","data":{"card":{"type":"COMMAND","content":{"feature":"VOLUME","action":"UNMUTE"}},"say":"done"}}"#,
        )
        .unwrap();
        assert_eq!(
            volume,
            ServerAction::Response {
                card: Some(Card::Command(LocalCommand::VolumeUnmute)),
                text: "done".into()
            }
        );

        let display = ServerAction::parse(
            r#"{"action":"response","data":{"card":{"type":"image"},"say":"look"}}"#,
        )
        .unwrap();
        assert!(matches!(display, ServerAction::Response { card: Some(Card::Other), .. }));

        let bare = ServerAction::parse(r#"{"action":"response","data":{"say":"plain"}}"#).unwrap();
        assert!(matches!(bare, ServerAction::Response { card: None, .. }));
    }

    #[test]
    fn test_parse_response_without_data_is_error() {
        let err = ServerAction::parse(r#"{"action":"response"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingField("data")));
    }

    #[test]
    fn test_parse_audio_data_signed_bytes() {
        let action = ServerAction::parse(
            r#"{"action":"audio_data","id":"X","data":{"data":[0,127,-128,-1,255]}}"#,
        )
        .unwrap();
        assert_eq!(
            action,
            ServerAction::AudioData {
                id: "X".into(),
                bytes: vec![0, 127, 128, 255, 255]
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            ServerAction::parse("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            ServerAction::parse(r#"{"id":"X"}"#),
            Err(ProtocolError::MissingField("action"))
        ));
        assert!(matches!(
            ServerAction::parse(r#"{"action":"audio_start"}"#),
            Err(ProtocolError::MissingField("id"))
        ));
        assert!(matches!(
            ServerAction::parse(r#"{"action":"audio_end","id":7}"#),
            Err(ProtocolError::UnexpectedType { field: "id", .. })
        ));
        assert!(ServerAction::parse(r#"{"action":"audio_data","id":"X","data":{"data":"zz"}}"#).is_err());
    }

    #[test]
    fn test_parse_unknown_action() {
        let action = ServerAction::parse(r#"{"action":"heartbeat"}"#).unwrap();
        assert_eq!(action.name(), "heartbeat");
        assert!(matches!(action, ServerAction::Unknown { .. }));
    }
}
