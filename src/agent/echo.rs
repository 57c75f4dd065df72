//! Echo agent: repeats text and audio back to the client.
//!
//! Also understands `/tool <server> <tool> [json-args]`, which turns the
//! message into a tool request so the session's tool bridge can be exercised
//! from any client.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value;

use super::errors::AgentError;
use super::types::{AgentEvents, AgentStatus, ToolOutcome};
use super::VoiceAgent;

pub const AGENT_TYPE: &str = "Echo";

const TOOL_COMMAND: &str = "/tool";

pub struct EchoAgent {
    events: AgentEvents,
    config: Value,
    initialized: bool,
    audio_bytes: usize,
    pending_tools: HashSet<String>,
}

impl EchoAgent {
    pub fn new(events: AgentEvents) -> Self {
        Self {
            events,
            config: Value::Null,
            initialized: false,
            audio_bytes: 0,
            pending_tools: HashSet::new(),
        }
    }

    fn prefix(&self) -> &str {
        self.config
            .get("prefix")
            .and_then(Value::as_str)
            .unwrap_or("Echo: ")
    }

    fn ensure_initialized(&self) -> Result<(), AgentError> {
        if self.initialized {
            Ok(())
        } else {
            Err(AgentError::NotInitialized)
        }
    }

    fn request_tool(&mut self, command: &str) -> Result<(), AgentError> {
        let (server, tool, args) = parse_tool_command(command)?;
        self.events
            .status(AgentStatus::Processing, Some("Calling tool..."));
        let request_id = self.events.request_tool(server, tool, args);
        tracing::debug!(request_id = %request_id, server, tool, "echo agent requested tool");
        self.events.text(format!(
            "Echo Agent: requested '{tool}' on '{server}' (request {request_id})."
        ));
        self.pending_tools.insert(request_id);
        Ok(())
    }
}

/// Split `/tool <server> <tool> [json-args]` into its parts.
fn parse_tool_command(command: &str) -> Result<(&str, &str, Value), AgentError> {
    let invalid = |reason: &str| AgentError::InvalidInput {
        reason: format!("{reason}; usage: {TOOL_COMMAND} <server> <tool> [json-args]"),
    };

    let rest = command
        .strip_prefix(TOOL_COMMAND)
        .map(str::trim_start)
        .ok_or_else(|| invalid("not a tool command"))?;
    let (server, rest) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| invalid("missing tool name"))?;
    let rest = rest.trim_start();
    let (tool, args) = match rest.split_once(char::is_whitespace) {
        Some((tool, args)) => (tool, args.trim()),
        None => (rest, ""),
    };
    if tool.is_empty() {
        return Err(invalid("missing tool name"));
    }

    let args = if args.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(args).map_err(|e| invalid(&format!("arguments are not JSON ({e})")))?
    };
    Ok((server, tool, args))
}

#[async_trait]
impl VoiceAgent for EchoAgent {
    fn agent_type(&self) -> &'static str {
        AGENT_TYPE
    }

    async fn initialize(&mut self, config: Value) -> Result<(), AgentError> {
        if !(config.is_object() || config.is_null()) {
            return Err(AgentError::InvalidConfig {
                reason: "config must be an object".into(),
            });
        }
        self.config = config;
        self.initialized = true;
        self.events.status(AgentStatus::Idle, Some("Echo Agent ready."));
        tracing::info!("echo agent initialized");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), AgentError> {
        self.initialized = false;
        self.pending_tools.clear();
        self.events
            .status(AgentStatus::Shutdown, Some("Echo Agent shut down."));
        Ok(())
    }

    async fn process_text_message(&mut self, text: &str) -> Result<(), AgentError> {
        self.ensure_initialized()?;
        let trimmed = text.trim();
        if trimmed == TOOL_COMMAND || trimmed.starts_with(&format!("{TOOL_COMMAND} ")) {
            return self.request_tool(trimmed);
        }

        self.events
            .status(AgentStatus::Processing, Some("Echoing text..."));
        self.events.text(format!("{}{text}", self.prefix()));
        self.events.status(AgentStatus::Idle, Some("Waiting for input."));
        Ok(())
    }

    async fn process_audio_chunk(&mut self, chunk: Vec<u8>) -> Result<(), AgentError> {
        self.ensure_initialized()?;
        self.audio_bytes += chunk.len();
        self.events.audio(chunk);
        Ok(())
    }

    async fn end_audio_stream(&mut self) -> Result<(), AgentError> {
        self.ensure_initialized()?;
        tracing::debug!(bytes = self.audio_bytes, "echo agent audio stream ended");
        self.audio_bytes = 0;
        self.events.text("Echo Agent: Audio stream ended.");
        self.events.status(AgentStatus::Idle, Some("Waiting for input."));
        Ok(())
    }

    async fn provide_tool_result(
        &mut self,
        request_id: &str,
        outcome: ToolOutcome,
    ) -> Result<(), AgentError> {
        if !self.pending_tools.remove(request_id) {
            return Err(AgentError::UnknownToolRequest {
                request_id: request_id.to_string(),
            });
        }
        match outcome {
            Ok(result) => self.events.text(format!(
                "Echo Agent: Received result for tool request {request_id}: {result}"
            )),
            Err(failure) => self.events.text(format!(
                "Echo Agent: Received error for tool request {request_id}: {}",
                failure.message
            )),
        }
        self.events.status(AgentStatus::Idle, Some("Waiting for input."));
        Ok(())
    }
}
