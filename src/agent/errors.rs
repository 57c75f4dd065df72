//! Agent error types.

use thiserror::Error;

/// Errors an agent operation can report to its session.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No factory is registered under this tag.
    #[error("unknown agent type '{agent_type}'")]
    UnknownAgentType { agent_type: String },

    /// An operation arrived before `initialize` succeeded.
    #[error("agent not initialized")]
    NotInitialized,

    /// The agent config object is missing fields or has the wrong shape.
    #[error("invalid agent config: {reason}")]
    InvalidConfig { reason: String },

    /// The client sent input the agent cannot interpret.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// A backing service could not be reached.
    #[error("{service} unavailable at {endpoint}: {reason}")]
    ServiceUnavailable {
        service: String,
        endpoint: String,
        reason: String,
    },

    /// Non-2xx response from a backing service.
    #[error("{service} returned HTTP {status}: {body}")]
    HttpError {
        service: String,
        status: u16,
        body: String,
    },

    /// A tool result arrived for a request this agent never made.
    #[error("no pending tool request '{request_id}'")]
    UnknownToolRequest { request_id: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}
