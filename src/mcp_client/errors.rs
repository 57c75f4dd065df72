//! Tool client error types.

use thiserror::Error;

use super::types::ConnectionStatus;

/// Errors that can occur during tool client operations.
///
/// `Clone` so that a single transport failure can reject every pending
/// request scoped to the failing server.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// Configuration error (missing or malformed server config file).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The capability negotiation or discovery handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// The descriptor names a transport that has no implementation yet.
    #[error("connection type '{transport}' for server '{name}' is not yet implemented")]
    UnsupportedTransport { name: String, transport: String },

    /// I/O failure on the channel to a server.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Malformed frame received from a server. Logged and dropped.
    #[error("protocol error from server '{server}': {reason}")]
    ProtocolError { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Server answered with a result flagged `isError`.
    #[error("tool error: {message}")]
    ToolFailed { message: String },

    /// No descriptor with this name is configured (or it is disabled).
    #[error("MCP server '{name}' not configured or found.")]
    UnknownServer { name: String },

    /// The server exists but its connection is not usable.
    #[error("MCP server '{name}' is not connected (status: {status}).")]
    NotConnected {
        name: String,
        status: ConnectionStatus,
        reason: Option<String>,
    },

    /// Tool name is not in the server's registry.
    #[error("Tool '{tool}' not found on server '{server}'.")]
    UnknownTool { server: String, tool: String },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// Resource URI could not be routed to a server.
    #[error("Invalid resource URI '{uri}': {reason}")]
    InvalidResourceUri { uri: String, reason: String },

    /// A correlated request passed its deadline.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The server is being torn down; pending work was cancelled.
    #[error("server '{name}' unavailable: {reason}")]
    ServerUnavailable { name: String, reason: String },

    /// The server process exited while requests were outstanding.
    #[error("server process exited for '{name}' ({detail})")]
    ServerExited { name: String, detail: String },
}

impl McpError {
    /// Numeric code carried to callers alongside the message, when one exists.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::ServerError { code, .. } => Some(*code),
            Self::InvalidArguments { .. } => Some(super::types::error_codes::INVALID_PARAMS),
            _ => None,
        }
    }

    /// Whether this failure came from the transport rather than the server's answer.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailed { .. }
                | Self::TransportError { .. }
                | Self::ServerExited { .. }
                | Self::ServerUnavailable { .. }
        )
    }
}
