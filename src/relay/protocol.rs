//! Wire protocol for the worker back-channel.
//!
//! One bidirectional JSON-framed stream per worker. Every frame carries a
//! `type` discriminator; unknown worker frames are logged and ignored.

use serde::{Deserialize, Serialize};

use crate::types::ChatMessage;

/// Close code: auth handshake did not complete in time.
pub const CLOSE_AUTH_TIMEOUT: u16 = 4001;
/// Close code: first frame was not an auth frame.
pub const CLOSE_EXPECTED_AUTH: u16 = 4002;
/// Close code: auth frame missing required fields.
pub const CLOSE_MISSING_FIELDS: u16 = 4003;
/// Close code: auth timestamp outside the allowed drift window.
pub const CLOSE_TIMESTAMP_DRIFT: u16 = 4004;
/// Close code: signature did not verify under the declared address.
pub const CLOSE_INVALID_SIGNATURE: u16 = 4005;
/// Close code: a newer connection for the same address took over.
pub const CLOSE_REPLACED: u16 = 4010;

/// Frames received from a worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// Must be the first frame on the socket. Fields are optional so a
    /// partial frame can be rejected with the missing-fields close code
    /// instead of a parse error.
    Auth {
        address: Option<String>,
        model: Option<String>,
        timestamp: Option<i64>,
        signature: Option<String>,
    },
    Response {
        id: String,
        #[serde(default)]
        choices: Vec<RelayChoice>,
    },
    Chunk {
        id: String,
        #[serde(default)]
        content: String,
    },
    Done {
        id: String,
        #[serde(default)]
        usage: Option<RelayUsage>,
    },
    Error {
        id: String,
        #[serde(default)]
        message: String,
    },
    Ping,
    /// Anything with an unrecognized discriminator.
    #[serde(other)]
    Unknown,
}

/// Frames sent to a worker.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayFrame {
    AuthOk,
    AuthError {
        message: String,
    },
    Request {
        id: String,
        messages: Vec<ChatMessage>,
        #[serde(rename = "maxTokens", skip_serializing_if = "Option::is_none")]
        max_tokens: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        temperature: Option<f32>,
        #[serde(rename = "topP", skip_serializing_if = "Option::is_none")]
        top_p: Option<f32>,
        stream: bool,
    },
    Pong,
}

/// One choice in a worker's unary response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayChoice {
    #[serde(default)]
    pub message: RelayChoiceMessage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

/// Token counts attached to a worker's `done` frame. Numeric fields are
/// optional; workers report what they can.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u32>,
    #[serde(default)]
    pub completion_tokens: Option<u32>,
    #[serde(default)]
    pub total_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_auth_frame() {
        let raw = r#"{"type":"auth","address":"0xAbC","model":"llama","timestamp":1700000000000,"signature":"0xdead"}"#;
        let frame: WorkerFrame = serde_json::from_str(raw).unwrap();
        match frame {
            WorkerFrame::Auth {
                address,
                model,
                timestamp,
                signature,
            } => {
                assert_eq!(address.as_deref(), Some("0xAbC"));
                assert_eq!(model.as_deref(), Some("llama"));
                assert_eq!(timestamp, Some(1700000000000));
                assert!(signature.is_some());
            }
            other => panic!("expected auth frame, got {other:?}"),
        }
    }

    #[test]
    fn test_parses_chunk_and_done() {
        let chunk: WorkerFrame =
            serde_json::from_str(r#"{"type":"chunk","id":"r1","content":"Hello"}"#).unwrap();
        assert!(matches!(chunk, WorkerFrame::Chunk { ref id, ref content } if id == "r1" && content == "Hello"));

        let done: WorkerFrame =
            serde_json::from_str(r#"{"type":"done","id":"r1","usage":{"totalTokens":42}}"#)
                .unwrap();
        match done {
            WorkerFrame::Done { usage, .. } => {
                assert_eq!(usage.unwrap().total_tokens, Some(42));
            }
            other => panic!("expected done frame, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_not_fatal() {
        let frame: WorkerFrame =
            serde_json::from_str(r#"{"type":"telemetry","load":0.7}"#).unwrap();
        assert!(matches!(frame, WorkerFrame::Unknown));
    }

    #[test]
    fn test_request_frame_uses_camel_case_params() {
        let frame = GatewayFrame::Request {
            id: "r1".to_string(),
            messages: vec![ChatMessage::new("user", "hi")],
            max_tokens: Some(64),
            temperature: Some(0.7),
            top_p: None,
            stream: true,
        };
        let raw = serde_json::to_string(&frame).unwrap();
        assert!(raw.contains(r#""type":"request""#));
        assert!(raw.contains(r#""maxTokens":64"#));
        assert!(!raw.contains("topP"));
    }
}
