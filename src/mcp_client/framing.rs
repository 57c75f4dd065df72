//! Line-delimited JSON framing for stdio transports.
//!
//! One JSON object per line. The decoder is a pure function over bytes so it
//! can be tested without a subprocess; [`LineFramer`] keeps the partial tail
//! between reads.

use serde_json::Value;

use super::errors::McpError;
use super::types::JsonRpcError;

// ─── Inbound Messages ───────────────────────────────────────────────────────

/// A parsed message received from a tool server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Answer to one of our requests.
    Response {
        id: String,
        outcome: Result<Value, ResponseFailure>,
    },
    /// Server-initiated message with no `id`.
    Notification { method: String, params: Value },
    /// Server-initiated request. Not supported by this client.
    Request { id: String, method: String },
}

/// Why a response counts as a rejection.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFailure {
    /// Explicit JSON-RPC `error` member.
    Rpc(JsonRpcError),
    /// A `result` whose `isError` flag is set.
    Tool { message: String },
}

impl ResponseFailure {
    pub fn into_error(self) -> McpError {
        match self {
            Self::Rpc(err) => McpError::ServerError {
                code: err.code,
                message: err.message,
                data: err.data,
            },
            Self::Tool { message } => McpError::ToolFailed { message },
        }
    }
}

/// Outcome of decoding one complete line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(InboundMessage),
    Malformed { line: String, reason: String },
}

// ─── Decoding ───────────────────────────────────────────────────────────────

/// Split `input` into complete lines and decode each one.
///
/// Returns the decoded frames and the bytes after the last newline, which
/// belong to a message that has not fully arrived yet. Blank lines are skipped.
pub fn decode_frames(input: &[u8]) -> (Vec<Frame>, Vec<u8>) {
    let Some(last_newline) = input.iter().rposition(|b| *b == b'\n') else {
        return (Vec::new(), input.to_vec());
    };

    let frames = input[..last_newline]
        .split(|b| *b == b'\n')
        .filter_map(decode_line)
        .collect();

    (frames, input[last_newline + 1..].to_vec())
}

fn decode_line(raw: &[u8]) -> Option<Frame> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let frame = match serde_json::from_str::<Value>(line) {
        Ok(value) => match classify(value) {
            Ok(msg) => Frame::Message(msg),
            Err(reason) => Frame::Malformed {
                line: line.to_string(),
                reason,
            },
        },
        Err(e) => Frame::Malformed {
            line: line.to_string(),
            reason: format!("invalid JSON: {e}"),
        },
    };
    Some(frame)
}

/// Classify a parsed JSON value as response, notification or request.
pub fn classify(value: Value) -> Result<InboundMessage, String> {
    let Value::Object(mut obj) = value else {
        return Err("message is not a JSON object".into());
    };

    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(other) => return Err(format!("unsupported id type: {other}")),
    };
    let method = match obj.remove("method") {
        Some(Value::String(m)) => Some(m),
        _ => None,
    };

    match (id, method) {
        (Some(id), Some(method)) => Ok(InboundMessage::Request { id, method }),
        (Some(id), None) => {
            let outcome = match obj.remove("error") {
                Some(err) if !err.is_null() => {
                    let err: JsonRpcError = serde_json::from_value(err)
                        .map_err(|e| format!("malformed error object: {e}"))?;
                    Err(ResponseFailure::Rpc(err))
                }
                _ => {
                    let result = obj.remove("result").unwrap_or(Value::Null);
                    if result.get("isError").and_then(Value::as_bool) == Some(true) {
                        Err(ResponseFailure::Tool {
                            message: tool_error_message(&result),
                        })
                    } else {
                        Ok(result)
                    }
                }
            };
            Ok(InboundMessage::Response { id, outcome })
        }
        (None, Some(method)) => Ok(InboundMessage::Notification {
            method,
            params: obj.remove("params").unwrap_or(Value::Null),
        }),
        (None, None) => Err("message has neither id nor method".into()),
    }
}

/// Best human-readable message from an `isError` result.
fn tool_error_message(result: &Value) -> String {
    if let Some(msg) = result.get("message").and_then(Value::as_str) {
        return msg.to_string();
    }
    result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| {
            items
                .iter()
                .find_map(|item| item.get("text").and_then(Value::as_str))
        })
        .map(str::to_string)
        .unwrap_or_else(|| "Tool execution failed".to_string())
}

// ─── LineFramer ─────────────────────────────────────────────────────────────

/// Accumulates bytes across reads and yields complete frames.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        if !chunk.contains(&b'\n') {
            return Vec::new();
        }
        let (frames, rest) = decode_frames(&self.buffer);
        self.buffer = rest;
        frames
    }

    /// Bytes of an incomplete trailing message.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
