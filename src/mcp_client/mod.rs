//! Tool client: line-delimited JSON-RPC to external tool servers.
//!
//! This module handles:
//! - Spawning tool server child processes and supervising their exit
//! - Framing and classifying inbound messages
//! - Correlating responses with outstanding requests, with timeouts
//! - Capability negotiation and tool/resource discovery
//! - Tool call routing and validation, resource reads, graceful shutdown
//!
//! Sessions reach tool servers only through [`McpClient`].

pub mod client;
pub mod correlator;
pub mod discovery;
pub mod errors;
pub mod framing;
pub mod lifecycle;
pub mod registry;
pub mod transport;
pub mod types;
pub mod uri;

// Re-exports for convenience
pub use client::{McpClient, ServerStatus};
pub use errors::McpError;
pub use lifecycle::{Connection, ConnectionSnapshot};
pub use registry::ToolRegistry;
pub use types::{ConnectionStatus, ServerDescriptor, ToolDescriptor, TransportKind};
