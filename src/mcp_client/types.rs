//! Shared types for the tool client.
//!
//! JSON-RPC message types, server descriptors and the tool/resource
//! structures returned by discovery.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request. Missing params become `{}`.
    pub fn new(id: &str, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.to_string(),
            method: method.to_string(),
            params: params.unwrap_or_else(|| serde_json::json!({})),
        }
    }
}

/// JSON-RPC 2.0 notification (no `id`, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── Server Descriptors ─────────────────────────────────────────────────────

/// How the client reaches a tool server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawned child process speaking line-delimited JSON over stdio.
    #[default]
    #[serde(alias = "stdio")]
    Process,
    Http,
    #[serde(alias = "ws")]
    Websocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Process => "process",
            Self::Http => "http",
            Self::Websocket => "websocket",
        };
        f.write_str(s)
    }
}

/// Static configuration for one tool server, as read from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    #[serde(default, alias = "type")]
    pub transport: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    /// Working directory for process transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Address for network transports.
    #[serde(default, alias = "url", skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

impl ServerDescriptor {
    /// Program and arguments to spawn.
    ///
    /// When `args` is empty the `command` string may carry the whole command
    /// line (`"node \"my server.js\" --stdio"`); it is split here.
    pub fn command_line(&self) -> Option<(String, Vec<String>)> {
        let command = self.command.as_deref()?.trim();
        if command.is_empty() {
            return None;
        }
        if !self.args.is_empty() {
            return Some((command.to_string(), self.args.clone()));
        }
        let mut parts = split_command_line(command).into_iter();
        let program = parts.next()?;
        Some((program, parts.collect()))
    }
}

/// On-disk shape of the server config file.
///
/// Both a bare array and `{ "servers": [...] }` are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServersFile {
    List(Vec<ServerDescriptor>),
    Wrapped { servers: Vec<ServerDescriptor> },
}

impl ServersFile {
    pub fn into_descriptors(self) -> Vec<ServerDescriptor> {
        match self {
            Self::List(list) => list,
            Self::Wrapped { servers } => servers,
        }
    }

    /// Rebuild a file of the same shape around new descriptors.
    pub fn with_descriptors(&self, servers: Vec<ServerDescriptor>) -> Self {
        match self {
            Self::List(_) => Self::List(servers),
            Self::Wrapped { .. } => Self::Wrapped { servers },
        }
    }
}

/// Split a command line on whitespace, keeping double-quoted groups together.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    parts.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        parts.push(current);
    }
    parts
}

// ─── Connection State ───────────────────────────────────────────────────────

/// Runtime status of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

// ─── Discovery Payloads ─────────────────────────────────────────────────────

/// A callable tool exposed by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

/// A readable resource exposed by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// `tools/list` result. Servers answer with either a bare array or `{tools}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolsListResult {
    Wrapped { tools: Vec<ToolDescriptor> },
    Bare(Vec<ToolDescriptor>),
}

impl ToolsListResult {
    pub fn into_tools(self) -> Vec<ToolDescriptor> {
        match self {
            Self::Wrapped { tools } => tools,
            Self::Bare(tools) => tools,
        }
    }
}

/// `resources/list` result, same two shapes as [`ToolsListResult`].
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ResourcesListResult {
    Wrapped { resources: Vec<ResourceDescriptor> },
    Bare(Vec<ResourceDescriptor>),
}

impl ResourcesListResult {
    pub fn into_resources(self) -> Vec<ResourceDescriptor> {
        match self {
            Self::Wrapped { resources } => resources,
            Self::Bare(resources) => resources,
        }
    }
}

/// Capability negotiation (`initialize`) response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Standard Error Codes ───────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
