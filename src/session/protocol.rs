//! Client wire protocol: JSON text frames of shape `{type, payload}`.
//!
//! Audio travels base64-encoded in `payload.chunk` in both directions.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentStatus;

pub const NOT_INITIALIZED: &str = "Session not initialized. Send init_session first.";
pub const ALREADY_INITIALIZED: &str = "Session already initialized.";
pub const MISSING_AGENT_TYPE: &str = "Missing agentType in init_session payload.";
pub const INVALID_JSON: &str = "Invalid JSON received";
pub const WELCOME: &str = "WebSocket connection established. Please send init_session to start.";

// ─── Inbound ─────────────────────────────────────────────────────────────────

/// A decoded client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    InitSession {
        agent_type: String,
        config: Option<Value>,
    },
    TextInput {
        text: String,
    },
    AudioChunk {
        chunk: Vec<u8>,
    },
    EndAudioStream,
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InitSession { .. } => "init_session",
            Self::TextInput { .. } => "text_input",
            Self::AudioChunk { .. } => "audio_chunk",
            Self::EndAudioStream => "end_audio_stream",
        }
    }
}

/// Why an inbound frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidJson,
    UnknownType(String),
    MissingAgentType,
    InvalidPayload(&'static str),
}

impl ProtocolError {
    /// Text sent back to the client in `error_message`.
    pub fn reply(&self) -> String {
        match self {
            Self::InvalidJson => INVALID_JSON.to_string(),
            Self::UnknownType(kind) => format!("Unknown message type: {kind}"),
            Self::MissingAgentType => MISSING_AGENT_TYPE.to_string(),
            Self::InvalidPayload(kind) => format!("Invalid payload for {kind}"),
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct InitPayload {
    #[serde(default, rename = "agentType")]
    agent_type: Option<String>,
    #[serde(default)]
    config: Option<Value>,
}

/// Decode one text frame from the client.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;

    match envelope.kind.as_str() {
        "init_session" => {
            let init: InitPayload =
                serde_json::from_value(envelope.payload).unwrap_or(InitPayload {
                    agent_type: None,
                    config: None,
                });
            let agent_type = init
                .agent_type
                .filter(|t| !t.trim().is_empty())
                .ok_or(ProtocolError::MissingAgentType)?;
            Ok(ClientMessage::InitSession {
                agent_type,
                config: init.config.filter(|c| !c.is_null()),
            })
        }
        "text_input" => envelope
            .payload
            .get("text")
            .and_then(Value::as_str)
            .map(|text| ClientMessage::TextInput {
                text: text.to_string(),
            })
            .ok_or(ProtocolError::InvalidPayload("text_input")),
        "audio_chunk" => envelope
            .payload
            .get("chunk")
            .and_then(Value::as_str)
            .and_then(|encoded| BASE64.decode(encoded).ok())
            .map(|chunk| ClientMessage::AudioChunk { chunk })
            .ok_or(ProtocolError::InvalidPayload("audio_chunk")),
        "end_audio_stream" => Ok(ClientMessage::EndAudioStream),
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

// ─── Outbound ────────────────────────────────────────────────────────────────

/// A message sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        message: String,
    },
    SessionConfirmed {
        #[serde(skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    StatusUpdate {
        status: AgentStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        context: Option<String>,
    },
    TextResponse {
        text: String,
    },
    AudioResponseChunk {
        /// Base64 audio.
        chunk: String,
    },
    ErrorMessage {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

impl ServerMessage {
    pub fn welcome() -> Self {
        Self::Welcome {
            message: WELCOME.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::ErrorMessage {
            message: message.into(),
            details: None,
        }
    }

    pub fn audio(chunk: &[u8]) -> Self {
        Self::AudioResponseChunk {
            chunk: BASE64.encode(chunk),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error_message","payload":{"message":"serialization failed"}}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_init_session() {
        let msg = parse_client_message(
            r#"{"type": "init_session", "payload": {"agentType": "Echo", "config": {"a": 1}}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::InitSession {
                agent_type: "Echo".into(),
                config: Some(json!({"a": 1})),
            }
        );
    }

    #[test]
    fn test_init_without_agent_type() {
        let err = parse_client_message(r#"{"type": "init_session", "payload": {}}"#).unwrap_err();
        assert_eq!(err.reply(), MISSING_AGENT_TYPE);
        let err = parse_client_message(r#"{"type": "init_session"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::MissingAgentType);
    }

    #[test]
    fn test_invalid_json_and_unknown_type() {
        assert_eq!(
            parse_client_message("not json").unwrap_err().reply(),
            "Invalid JSON received"
        );
        assert_eq!(
            parse_client_message(r#"{"type": "dance", "payload": {}}"#)
                .unwrap_err()
                .reply(),
            "Unknown message type: dance"
        );
    }

    #[test]
    fn test_audio_chunk_base64() {
        let msg = parse_client_message(r#"{"type": "audio_chunk", "payload": {"chunk": "AQID"}}"#)
            .unwrap();
        assert_eq!(msg, ClientMessage::AudioChunk { chunk: vec![1, 2, 3] });

        let err = parse_client_message(r#"{"type": "audio_chunk", "payload": {"chunk": "***"}}"#)
            .unwrap_err();
        assert_eq!(err.reply(), "Invalid payload for audio_chunk");
    }

    #[test]
    fn test_text_input_requires_text() {
        let err = parse_client_message(r#"{"type": "text_input", "payload": {"txt": "x"}}"#)
            .unwrap_err();
        assert_eq!(err, ProtocolError::InvalidPayload("text_input"));
    }

    #[test]
    fn test_outbound_shapes() {
        let v: Value = serde_json::from_str(
            &ServerMessage::SessionConfirmed { warning: None }.to_json(),
        )
        .unwrap();
        assert_eq!(v, json!({"type": "session_confirmed", "payload": {}}));

        let v: Value = serde_json::from_str(&ServerMessage::audio(&[1, 2, 3]).to_json()).unwrap();
        assert_eq!(v, json!({"type": "audio_response_chunk", "payload": {"chunk": "AQID"}}));

        let v: Value = serde_json::from_str(
            &ServerMessage::StatusUpdate {
                status: AgentStatus::Idle,
                context: Some("Waiting for input.".into()),
            }
            .to_json(),
        )
        .unwrap();
        assert_eq!(v["payload"]["status"], "idle");
        assert_eq!(v["payload"]["context"], "Waiting for input.");
    }
}
