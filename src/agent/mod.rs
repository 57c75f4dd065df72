//! Voice agents: the pluggable component a session drives.
//!
//! An agent receives client input through [`VoiceAgent`] and talks back
//! through the [`AgentEvents`] it was built with. Agents are selected by a
//! string tag through [`AgentRegistry`].

pub mod echo;
pub mod errors;
pub mod types;
pub mod ultravox_kokoro;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

pub use errors::AgentError;
pub use types::{AgentEvent, AgentEvents, AgentStatus, ToolFailure, ToolOutcome, ToolRequest};

// ─── VoiceAgent ──────────────────────────────────────────────────────────────

/// Capability set every agent implements.
///
/// Calls for one agent are never concurrent: the owning session awaits each
/// one before handling its next input.
#[async_trait]
pub trait VoiceAgent: Send + Sync {
    /// Registry tag of this implementation.
    fn agent_type(&self) -> &'static str;

    async fn initialize(&mut self, config: Value) -> Result<(), AgentError>;

    async fn shutdown(&mut self) -> Result<(), AgentError>;

    async fn process_text_message(&mut self, text: &str) -> Result<(), AgentError>;

    async fn process_audio_chunk(&mut self, chunk: Vec<u8>) -> Result<(), AgentError>;

    async fn end_audio_stream(&mut self) -> Result<(), AgentError>;

    /// Deliver the outcome of a tool request this agent emitted.
    async fn provide_tool_result(
        &mut self,
        request_id: &str,
        outcome: ToolOutcome,
    ) -> Result<(), AgentError>;
}

// ─── AgentRegistry ───────────────────────────────────────────────────────────

/// Builds an agent wired to the given event sender.
pub type AgentFactory = fn(AgentEvents) -> Box<dyn VoiceAgent>;

/// Maps agent type tags to factories.
#[derive(Clone)]
pub struct AgentRegistry {
    factories: HashMap<String, AgentFactory>,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the agents that ship with the server.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(echo::AGENT_TYPE, |events| Box::new(echo::EchoAgent::new(events)));
        registry.register(ultravox_kokoro::AGENT_TYPE, |events| {
            Box::new(ultravox_kokoro::UltraVoxKokoroAgent::new(events))
        });
        registry
    }

    /// Add a factory under `agent_type`, replacing any earlier one.
    pub fn register(&mut self, agent_type: &str, factory: AgentFactory) {
        if self.contains(agent_type) {
            tracing::warn!(agent_type, "agent type registered twice, replacing factory");
        }
        self.factories.insert(agent_type.to_string(), factory);
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.factories.contains_key(agent_type)
    }

    /// Construct an uninitialized agent of `agent_type`.
    pub fn create(
        &self,
        agent_type: &str,
        events: AgentEvents,
    ) -> Result<Box<dyn VoiceAgent>, AgentError> {
        let factory = self
            .factories
            .get(agent_type)
            .ok_or_else(|| AgentError::UnknownAgentType {
                agent_type: agent_type.to_string(),
            })?;
        Ok(factory(events))
    }

    /// Registered tags, sorted.
    pub fn agent_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
