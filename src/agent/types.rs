//! Agent output events and tool outcomes.

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::mcp_client::McpError;

// ─── Status ──────────────────────────────────────────────────────────────────

/// Coarse agent state reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Ready,
    Idle,
    Processing,
    ReceivingAudio,
    ProcessingText,
    ProcessingAudio,
    Error,
    Shutdown,
}

// ─── Events ──────────────────────────────────────────────────────────────────

/// A tool call an agent wants the session to perform on its behalf.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub request_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolRequest {
    /// Whether every routing field is present.
    pub fn is_well_formed(&self) -> bool {
        !self.request_id.trim().is_empty()
            && !self.server_name.trim().is_empty()
            && !self.tool_name.trim().is_empty()
    }
}

/// Everything an agent can emit.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    StatusUpdate {
        status: AgentStatus,
        context: Option<String>,
    },
    TextResponse(String),
    AudioResponseChunk(Vec<u8>),
    RequestTool(ToolRequest),
    Error {
        message: String,
        details: Option<String>,
    },
}

/// Sending half handed to an agent at construction.
///
/// Emission never blocks; events sent after the session is gone are dropped.
#[derive(Debug, Clone)]
pub struct AgentEvents {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl AgentEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: AgentEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("agent event dropped, session gone");
        }
    }

    pub fn status(&self, status: AgentStatus, context: Option<&str>) {
        self.emit(AgentEvent::StatusUpdate {
            status,
            context: context.map(str::to_string),
        });
    }

    pub fn text(&self, text: impl Into<String>) {
        self.emit(AgentEvent::TextResponse(text.into()));
    }

    pub fn audio(&self, chunk: Vec<u8>) {
        self.emit(AgentEvent::AudioResponseChunk(chunk));
    }

    pub fn error(&self, message: impl Into<String>, details: Option<String>) {
        self.emit(AgentEvent::Error {
            message: message.into(),
            details,
        });
    }

    /// Ask the session to call a tool. Returns the generated request id.
    pub fn request_tool(&self, server_name: &str, tool_name: &str, arguments: Value) -> String {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.emit(AgentEvent::RequestTool(ToolRequest {
            request_id: request_id.clone(),
            server_name: server_name.to_string(),
            tool_name: tool_name.to_string(),
            arguments,
        }));
        request_id
    }
}

// ─── Tool Outcome ────────────────────────────────────────────────────────────

/// Result handed back to an agent for one tool request.
pub type ToolOutcome = Result<Value, ToolFailure>;

/// Why a tool request produced no result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolFailure {
    pub message: String,
    pub code: Option<i64>,
}

impl ToolFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// `{isError: true, message, code?}`, the shape agents and clients see.
    pub fn to_json(&self) -> Value {
        let mut v = json!({ "isError": true, "message": self.message });
        if let Some(code) = self.code {
            v["code"] = json!(code);
        }
        v
    }
}

impl From<&McpError> for ToolFailure {
    fn from(e: &McpError) -> Self {
        Self {
            message: e.to_string(),
            code: e.code(),
        }
    }
}

impl From<McpError> for ToolFailure {
    fn from(e: McpError) -> Self {
        Self::from(&e)
    }
}
