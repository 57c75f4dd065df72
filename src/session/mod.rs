//! Client sessions: wire protocol, per-connection orchestration and the
//! WebSocket endpoint.

pub mod orchestrator;
pub mod protocol;
pub mod ws;

pub use orchestrator::{Session, SessionContext, SessionState, ToolCompletion};
pub use protocol::{ClientMessage, ServerMessage};
