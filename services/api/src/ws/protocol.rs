//! Defines the WebSocket message protocol between the voice client and the gateway.

use serde::{Deserialize, Serialize};

/// Messages sent from the client to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Authenticates the connection and starts a voice session.
    InitializeSession {
        #[serde(default)]
        auth_token: Option<String>,
    },
    /// A chunk of 16 kHz mono PCM16 audio, base64 encoded.
    AudioInput {
        #[serde(default)]
        audio_data: String,
        #[serde(default)]
        end_of_utterance: bool,
    },
    EndSession,
    Ping,
    /// Any type this server does not know about.
    #[serde(other)]
    Unknown,
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    ConnectionEstablished {
        connection_id: String,
        timestamp: String,
    },
    SessionInitialized {
        session_id: String,
    },
    /// Synthesized speech for one turn (base64 encoded PCM16).
    AudioOutput {
        audio: String,
        session_id: String,
    },
    /// The assistant's text for one turn.
    Transcript {
        text: String,
        session_id: String,
    },
    /// Marks the end of one turn's output.
    InferenceComplete {
        session_id: String,
    },
    SessionEnded {
        session_id: String,
    },
    Error {
        error: String,
    },
    Heartbeat {
        timestamp: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_parse_camel_case_fields() {
        let init: ClientMessage =
            serde_json::from_str(r#"{"type":"initialize_session","authToken":"abc"}"#).unwrap();
        assert_eq!(
            init,
            ClientMessage::InitializeSession {
                auth_token: Some("abc".to_string())
            }
        );

        let audio: ClientMessage = serde_json::from_str(
            r#"{"type":"audio_input","audioData":"AAA=","endOfUtterance":true}"#,
        )
        .unwrap();
        assert_eq!(
            audio,
            ClientMessage::AudioInput {
                audio_data: "AAA=".to_string(),
                end_of_utterance: true
            }
        );

        let end: ClientMessage = serde_json::from_str(r#"{"type":"end_session"}"#).unwrap();
        assert_eq!(end, ClientMessage::EndSession);
    }

    #[test]
    fn test_missing_optional_fields_take_defaults() {
        let init: ClientMessage =
            serde_json::from_str(r#"{"type":"initialize_session"}"#).unwrap();
        assert_eq!(init, ClientMessage::InitializeSession { auth_token: None });

        let audio: ClientMessage = serde_json::from_str(r#"{"type":"audio_input"}"#).unwrap();
        assert_eq!(
            audio,
            ClientMessage::AudioInput {
                audio_data: String::new(),
                end_of_utterance: false
            }
        );
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"set_volume","level":3}"#).unwrap();
        assert_eq!(msg, ClientMessage::Unknown);
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"no_type":1}"#).is_err());
    }

    #[test]
    fn test_server_messages_serialize_with_type_tag() {
        let cases = [
            (
                ServerMessage::SessionInitialized {
                    session_id: "s1".to_string(),
                },
                json!({"type": "session_initialized", "sessionId": "s1"}),
            ),
            (
                ServerMessage::AudioOutput {
                    audio: "AAA=".to_string(),
                    session_id: "s1".to_string(),
                },
                json!({"type": "audio_output", "audio": "AAA=", "sessionId": "s1"}),
            ),
            (
                ServerMessage::error("Session not initialized"),
                json!({"type": "error", "error": "Session not initialized"}),
            ),
            (ServerMessage::Pong, json!({"type": "pong"})),
            (
                ServerMessage::ConnectionEstablished {
                    connection_id: "conn_1_2".to_string(),
                    timestamp: "t".to_string(),
                },
                json!({"type": "connection_established", "connectionId": "conn_1_2", "timestamp": "t"}),
            ),
        ];
        for (msg, expected) in cases {
            assert_eq!(serde_json::to_value(&msg).unwrap(), expected);
        }
    }
}
