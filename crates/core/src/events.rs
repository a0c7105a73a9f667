//! Event vocabulary of the duplex model stream.
//!
//! Outbound events are serialized as `{"event": {"<name>": {...}}}` with
//! camelCase fields. Inbound events are classified into the small
//! [`ModelOutput`] vocabulary the rest of the crate works with; anything
//! unrecognized is dropped.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Marker the model embeds in a text fragment when the user talks over it.
pub const INTERRUPTION_MARKER: &str = r#"{ "interrupted" : true }"#;

/// PCM sample rate used for both directions.
pub const SAMPLE_RATE_HZ: u32 = 16_000;
pub const SAMPLE_SIZE_BITS: u16 = 16;
pub const CHANNEL_COUNT: u16 = 1;

/// Sampling parameters sent with `sessionStart`.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    pub max_tokens: u32,
    pub top_p: f32,
    pub temperature: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            top_p: 0.9,
            temperature: 0.7,
        }
    }
}

/// Speaker role attached to content blocks.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    Text,
    Audio,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TextConfiguration {
    pub media_type: String,
}

impl Default for TextConfiguration {
    fn default() -> Self {
        Self {
            media_type: "text/plain".to_string(),
        }
    }
}

/// 16 kHz, 16-bit, mono linear PCM carried as base64.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfiguration {
    pub media_type: String,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u16,
    pub channel_count: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    pub encoding: String,
    pub audio_type: String,
}

impl AudioConfiguration {
    pub fn input() -> Self {
        Self {
            media_type: "audio/lpcm".to_string(),
            sample_rate_hertz: SAMPLE_RATE_HZ,
            sample_size_bits: SAMPLE_SIZE_BITS,
            channel_count: CHANNEL_COUNT,
            voice_id: None,
            encoding: "base64".to_string(),
            audio_type: "SPEECH".to_string(),
        }
    }

    pub fn output(voice_id: &str) -> Self {
        Self {
            voice_id: Some(voice_id.to_string()),
            ..Self::input()
        }
    }
}

/// Events sent to the model.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InputEvent {
    SessionStart {
        inference_configuration: InferenceConfig,
    },
    PromptStart {
        prompt_name: String,
        text_output_configuration: TextConfiguration,
        audio_output_configuration: AudioConfiguration,
    },
    ContentStart {
        prompt_name: String,
        content_name: String,
        #[serde(rename = "type")]
        kind: ContentType,
        interactive: bool,
        role: Role,
        #[serde(skip_serializing_if = "Option::is_none")]
        text_input_configuration: Option<TextConfiguration>,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio_input_configuration: Option<AudioConfiguration>,
    },
    TextInput {
        prompt_name: String,
        content_name: String,
        content: String,
    },
    AudioInput {
        prompt_name: String,
        content_name: String,
        content: String,
    },
    ContentEnd {
        prompt_name: String,
        content_name: String,
    },
    PromptEnd {
        prompt_name: String,
    },
    SessionEnd {},
}

#[derive(Serialize)]
struct Envelope<'a> {
    event: &'a InputEvent,
}

impl InputEvent {
    pub fn prompt_start(prompt_name: &str, voice_id: &str) -> Self {
        Self::PromptStart {
            prompt_name: prompt_name.to_string(),
            text_output_configuration: TextConfiguration::default(),
            audio_output_configuration: AudioConfiguration::output(voice_id),
        }
    }

    pub fn system_content_start(prompt_name: &str, content_name: &str) -> Self {
        Self::ContentStart {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.to_string(),
            kind: ContentType::Text,
            interactive: true,
            role: Role::System,
            text_input_configuration: Some(TextConfiguration::default()),
            audio_input_configuration: None,
        }
    }

    pub fn audio_content_start(prompt_name: &str, content_name: &str) -> Self {
        Self::ContentStart {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.to_string(),
            kind: ContentType::Audio,
            interactive: true,
            role: Role::User,
            text_input_configuration: None,
            audio_input_configuration: Some(AudioConfiguration::input()),
        }
    }

    pub fn audio_input(prompt_name: &str, content_name: &str, pcm: &[u8]) -> Self {
        Self::AudioInput {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.to_string(),
            content: base64::engine::general_purpose::STANDARD.encode(pcm),
        }
    }

    pub fn content_end(prompt_name: &str, content_name: &str) -> Self {
        Self::ContentEnd {
            prompt_name: prompt_name.to_string(),
            content_name: content_name.to_string(),
        }
    }

    pub fn prompt_end(prompt_name: &str) -> Self {
        Self::PromptEnd {
            prompt_name: prompt_name.to_string(),
        }
    }

    /// Serializes the event inside its `{"event": ...}` envelope.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Envelope { event: self })
    }
}

/// Normalized signal read from the model stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelOutput {
    /// A content block began; later text without an explicit role belongs to `role`.
    ContentStarted { role: Role, speculative: bool },
    Text { role: Option<Role>, text: String },
    /// The user interrupted the assistant.
    BargeIn,
    Audio(Vec<u8>),
    ContentEnded,
    Completion,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentStartOutput {
    role: Option<Role>,
    additional_model_fields: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerationFields {
    generation_stage: Option<String>,
}

#[derive(Deserialize)]
struct TextOutput {
    #[serde(default)]
    content: String,
    role: Option<Role>,
}

#[derive(Deserialize)]
struct AudioOutput {
    #[serde(default)]
    content: String,
}

/// Classifies one raw event from the model. Returns `None` for anything
/// that is not part of the vocabulary, including malformed payloads.
pub fn classify(raw: &str) -> Option<ModelOutput> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Ignoring non-JSON model event");
            return None;
        }
    };
    let event = value.get("event")?.as_object()?;

    if let Some(body) = event.get("contentStart") {
        let start: ContentStartOutput = serde_json::from_value(body.clone()).ok()?;
        let speculative = start
            .additional_model_fields
            .as_deref()
            .and_then(|fields| serde_json::from_str::<GenerationFields>(fields).ok())
            .and_then(|fields| fields.generation_stage)
            .is_some_and(|stage| stage == "SPECULATIVE");
        return Some(ModelOutput::ContentStarted {
            role: start.role.unwrap_or(Role::Assistant),
            speculative,
        });
    }

    if let Some(body) = event.get("textOutput") {
        let output: TextOutput = serde_json::from_value(body.clone()).ok()?;
        if output.content.contains(INTERRUPTION_MARKER) {
            return Some(ModelOutput::BargeIn);
        }
        return Some(ModelOutput::Text {
            role: output.role,
            text: output.content,
        });
    }

    if let Some(body) = event.get("audioOutput") {
        let output: AudioOutput = serde_json::from_value(body.clone()).ok()?;
        if output.content.is_empty() {
            return None;
        }
        return match base64::engine::general_purpose::STANDARD.decode(&output.content) {
            Ok(pcm) => Some(ModelOutput::Audio(pcm)),
            Err(e) => {
                warn!(error = %e, "Dropping audio fragment with invalid base64");
                None
            }
        };
    }

    if event.contains_key("contentEnd") {
        return Some(ModelOutput::ContentEnded);
    }
    if event.contains_key("completionEnd") {
        return Some(ModelOutput::Completion);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire(event: &InputEvent) -> Value {
        serde_json::from_str(&event.to_wire().unwrap()).unwrap()
    }

    #[test]
    fn test_session_start_wire_format() {
        let event = InputEvent::SessionStart {
            inference_configuration: InferenceConfig::default(),
        };
        let value = wire(&event);
        let config = &value["event"]["sessionStart"]["inferenceConfiguration"];
        assert_eq!(config["maxTokens"], 1024);
        assert!((config["topP"].as_f64().unwrap() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_prompt_start_declares_output_formats() {
        let value = wire(&InputEvent::prompt_start("p1", "matthew"));
        let body = &value["event"]["promptStart"];
        assert_eq!(body["promptName"], "p1");
        assert_eq!(body["textOutputConfiguration"]["mediaType"], "text/plain");
        let audio = &body["audioOutputConfiguration"];
        assert_eq!(audio["mediaType"], "audio/lpcm");
        assert_eq!(audio["sampleRateHertz"], 16000);
        assert_eq!(audio["sampleSizeBits"], 16);
        assert_eq!(audio["channelCount"], 1);
        assert_eq!(audio["voiceId"], "matthew");
        assert_eq!(audio["encoding"], "base64");
    }

    #[test]
    fn test_audio_content_start_has_input_configuration_only() {
        let value = wire(&InputEvent::audio_content_start("p1", "c1"));
        let body = &value["event"]["contentStart"];
        assert_eq!(body["type"], "AUDIO");
        assert_eq!(body["role"], "USER");
        assert_eq!(body["interactive"], true);
        assert!(body.get("textInputConfiguration").is_none());
        assert_eq!(body["audioInputConfiguration"]["sampleRateHertz"], 16000);
        assert!(body["audioInputConfiguration"].get("voiceId").is_none());
    }

    #[test]
    fn test_audio_input_is_base64() {
        let value = wire(&InputEvent::audio_input("p1", "c1", &[1, 2, 3]));
        assert_eq!(value["event"]["audioInput"]["content"], "AQID");
        assert_eq!(value["event"]["audioInput"]["contentName"], "c1");
    }

    #[test]
    fn test_session_end_is_empty_object() {
        let value = wire(&InputEvent::SessionEnd {});
        assert_eq!(value, json!({"event": {"sessionEnd": {}}}));
    }

    #[test]
    fn test_classify_content_start_with_speculative_stage() {
        let raw = json!({"event": {"contentStart": {
            "role": "ASSISTANT",
            "additionalModelFields": "{\"generationStage\":\"SPECULATIVE\"}"
        }}})
        .to_string();
        assert_eq!(
            classify(&raw),
            Some(ModelOutput::ContentStarted {
                role: Role::Assistant,
                speculative: true
            })
        );
    }

    #[test]
    fn test_classify_text_and_barge_in() {
        let text = json!({"event": {"textOutput": {"content": "Hello there"}}}).to_string();
        assert_eq!(
            classify(&text),
            Some(ModelOutput::Text {
                role: None,
                text: "Hello there".to_string()
            })
        );

        let interrupted =
            json!({"event": {"textOutput": {"content": "{ \"interrupted\" : true }"}}}).to_string();
        assert_eq!(classify(&interrupted), Some(ModelOutput::BargeIn));
    }

    #[test]
    fn test_classify_audio_decodes_payload() {
        let raw = json!({"event": {"audioOutput": {"content": "AQID"}}}).to_string();
        assert_eq!(classify(&raw), Some(ModelOutput::Audio(vec![1, 2, 3])));

        let bad = json!({"event": {"audioOutput": {"content": "***"}}}).to_string();
        assert_eq!(classify(&bad), None);
    }

    #[test]
    fn test_classify_end_markers_and_unknown() {
        let end = json!({"event": {"contentEnd": {"stopReason": "END_TURN"}}}).to_string();
        assert_eq!(classify(&end), Some(ModelOutput::ContentEnded));
        let done = json!({"event": {"completionEnd": {}}}).to_string();
        assert_eq!(classify(&done), Some(ModelOutput::Completion));
        let usage = json!({"event": {"usageEvent": {"totalTokens": 3}}}).to_string();
        assert_eq!(classify(&usage), None);
        assert_eq!(classify("not json"), None);
    }
}
