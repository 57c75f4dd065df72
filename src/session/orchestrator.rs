//! Per-connection session state machine.
//!
//! A [`Session`] owns at most one agent. Inbound client messages are handled
//! one at a time in receipt order. Agent output travels on its own relay task
//! so client delivery never waits on agent processing. Tool requests run on
//! bridge tasks whose outcomes come back to the session as [`ToolCompletion`]s
//! and are handed to the agent exactly once.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::agent::{
    AgentEvent, AgentEvents, AgentRegistry, ToolFailure, ToolOutcome, ToolRequest, VoiceAgent,
};
use crate::mcp_client::McpClient;
use crate::settings::SettingsStore;

use super::protocol::{
    parse_client_message, ClientMessage, ProtocolError, ServerMessage, ALREADY_INITIALIZED,
    NOT_INITIALIZED,
};

pub const MANAGER_UNAVAILABLE: &str = "Tool client manager is not initialized.";
pub const INVALID_TOOL_REQUEST: &str = "Invalid tool request payload from agent.";

// ─── Context ─────────────────────────────────────────────────────────────────

/// Shared services a session draws on.
#[derive(Clone)]
pub struct SessionContext {
    pub agents: Arc<AgentRegistry>,
    /// `None` when the tool client manager failed to start.
    pub tools: Option<Arc<McpClient>>,
    pub settings: Arc<SettingsStore>,
}

/// Outcome of one bridged tool request.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCompletion {
    pub request_id: String,
    pub outcome: ToolOutcome,
}

// ─── Tool Bridge ─────────────────────────────────────────────────────────────

/// Forwards agent tool requests to the tool client manager.
#[derive(Clone)]
struct ToolBridge {
    session_id: String,
    tools: Option<Arc<McpClient>>,
    completions: mpsc::UnboundedSender<ToolCompletion>,
}

impl ToolBridge {
    /// Every request yields exactly one completion, including refusals.
    fn dispatch(&self, request: ToolRequest) {
        if !request.is_well_formed() {
            tracing::warn!(
                session_id = %self.session_id,
                request_id = %request.request_id,
                "malformed tool request from agent"
            );
            self.complete(request.request_id, Err(ToolFailure::new(INVALID_TOOL_REQUEST)));
            return;
        }

        let Some(tools) = self.tools.clone() else {
            tracing::warn!(
                session_id = %self.session_id,
                request_id = %request.request_id,
                "tool request with no tool client manager"
            );
            self.complete(request.request_id, Err(ToolFailure::new(MANAGER_UNAVAILABLE)));
            return;
        };

        tracing::info!(
            session_id = %self.session_id,
            request_id = %request.request_id,
            server = %request.server_name,
            tool = %request.tool_name,
            "bridging tool request"
        );
        let bridge = self.clone();
        tokio::spawn(async move {
            let outcome = tools
                .call_tool(&request.server_name, &request.tool_name, request.arguments)
                .await
                .map_err(ToolFailure::from);
            bridge.complete(request.request_id, outcome);
        });
    }

    fn complete(&self, request_id: String, outcome: ToolOutcome) {
        if self
            .completions
            .send(ToolCompletion {
                request_id,
                outcome,
            })
            .is_err()
        {
            tracing::debug!(session_id = %self.session_id, "tool result discarded, session gone");
        }
    }
}

// ─── Relay ───────────────────────────────────────────────────────────────────

fn to_server_message(event: AgentEvent) -> Result<ServerMessage, ToolRequest> {
    match event {
        AgentEvent::StatusUpdate { status, context } => {
            Ok(ServerMessage::StatusUpdate { status, context })
        }
        AgentEvent::TextResponse(text) => Ok(ServerMessage::TextResponse { text }),
        AgentEvent::AudioResponseChunk(chunk) => Ok(ServerMessage::audio(&chunk)),
        AgentEvent::Error { message, details } => {
            Ok(ServerMessage::ErrorMessage { message, details })
        }
        AgentEvent::RequestTool(request) => Err(request),
    }
}

/// Drain agent events until the agent is dropped.
async fn relay_events(
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
    outbound: mpsc::Sender<ServerMessage>,
    bridge: ToolBridge,
) {
    while let Some(event) = events.recv().await {
        match to_server_message(event) {
            Ok(msg) => {
                if outbound.send(msg).await.is_err() {
                    tracing::debug!(session_id = %bridge.session_id, "client gone, relay stopped");
                    break;
                }
            }
            Err(request) => bridge.dispatch(request),
        }
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

pub enum SessionState {
    Uninitialized,
    Active(Box<dyn VoiceAgent>),
    Closed,
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Active(_) => "active",
            Self::Closed => "closed",
        }
    }
}

pub struct Session {
    id: String,
    ctx: SessionContext,
    state: SessionState,
    outbound: mpsc::Sender<ServerMessage>,
    completions: mpsc::UnboundedSender<ToolCompletion>,
}

impl Session {
    /// A fresh session plus the stream its tool completions arrive on.
    pub fn new(
        ctx: SessionContext,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<ToolCompletion>) {
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let session = Self {
            id: uuid::Uuid::new_v4().to_string(),
            ctx,
            state: SessionState::Uninitialized,
            outbound,
            completions,
        };
        (session, completions_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Active(_))
    }

    pub async fn send(&self, msg: ServerMessage) {
        if self.outbound.send(msg).await.is_err() {
            tracing::debug!(session_id = %self.id, "outbound channel closed");
        }
    }

    async fn reply_error(&self, message: impl Into<String>, details: Option<String>) {
        self.send(ServerMessage::ErrorMessage {
            message: message.into(),
            details,
        })
        .await;
    }

    /// Handle one raw text frame from the client.
    pub async fn handle_text(&mut self, text: &str) {
        if matches!(self.state, SessionState::Closed) {
            tracing::debug!(session_id = %self.id, "frame after close ignored");
            return;
        }
        match parse_client_message(text) {
            Ok(msg) => self.handle_message(msg).await,
            Err(e) => self.reject_frame(e).await,
        }
    }

    async fn reject_frame(&self, err: ProtocolError) {
        let reply = match (&self.state, &err) {
            (_, ProtocolError::InvalidJson) => err.reply(),
            (SessionState::Active(_), ProtocolError::MissingAgentType) => {
                ALREADY_INITIALIZED.to_string()
            }
            (SessionState::Uninitialized, ProtocolError::UnknownType(_))
            | (SessionState::Uninitialized, ProtocolError::InvalidPayload(_)) => {
                NOT_INITIALIZED.to_string()
            }
            _ => err.reply(),
        };
        tracing::debug!(session_id = %self.id, error = ?err, "rejected client frame");
        self.reply_error(reply, None).await;
    }

    /// Route one decoded client message.
    pub async fn handle_message(&mut self, msg: ClientMessage) {
        if matches!(self.state, SessionState::Closed) {
            return;
        }
        let kind = msg.kind();
        if let ClientMessage::InitSession { agent_type, config } = msg {
            if self.is_active() {
                self.reply_error(ALREADY_INITIALIZED, None).await;
            } else {
                self.init(agent_type, config).await;
            }
            return;
        }

        let SessionState::Active(agent) = &mut self.state else {
            self.reply_error(NOT_INITIALIZED, None).await;
            return;
        };
        let result = match msg {
            ClientMessage::TextInput { text } => agent.process_text_message(&text).await,
            ClientMessage::AudioChunk { chunk } => agent.process_audio_chunk(chunk).await,
            ClientMessage::EndAudioStream => agent.end_audio_stream().await,
            ClientMessage::InitSession { .. } => return,
        };

        if let Err(e) = result {
            tracing::warn!(session_id = %self.id, kind, error = %e, "agent failed to handle message");
            self.reply_error(format!("Agent error: {e}"), None).await;
        }
    }

    async fn init(&mut self, agent_type: String, config: Option<Value>) {
        let config = config
            .or_else(|| self.ctx.settings.agent_config(&agent_type))
            .unwrap_or_else(|| Value::Object(Default::default()));

        let (events, events_rx) = AgentEvents::channel();
        let created = self.ctx.agents.create(&agent_type, events);
        let initialized = match created {
            Ok(mut agent) => match agent.initialize(config).await {
                Ok(()) => Ok(agent),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        let agent = match initialized {
            Ok(agent) => agent,
            Err(e) => {
                tracing::warn!(session_id = %self.id, agent_type = %agent_type, error = %e, "session init failed");
                self.reply_error(
                    format!("Failed to initialize session with agent {agent_type}. Error: {e}"),
                    None,
                )
                .await;
                return;
            }
        };

        let warning = self
            .ctx
            .tools
            .is_none()
            .then(|| format!("{MANAGER_UNAVAILABLE} Tool requests will fail."));
        self.send(ServerMessage::SessionConfirmed { warning }).await;

        let bridge = ToolBridge {
            session_id: self.id.clone(),
            tools: self.ctx.tools.clone(),
            completions: self.completions.clone(),
        };
        tokio::spawn(relay_events(events_rx, self.outbound.clone(), bridge));

        tracing::info!(session_id = %self.id, agent_type = %agent_type, "session active");
        self.state = SessionState::Active(agent);
    }

    /// Hand a bridged tool outcome to the agent.
    pub async fn handle_tool_completion(&mut self, completion: ToolCompletion) {
        let SessionState::Active(agent) = &mut self.state else {
            tracing::debug!(
                session_id = %self.id,
                request_id = %completion.request_id,
                "tool result discarded, no active agent"
            );
            return;
        };

        let request_id = completion.request_id;
        if let Err(e) = agent
            .provide_tool_result(&request_id, completion.outcome)
            .await
        {
            tracing::warn!(session_id = %self.id, request_id = %request_id, error = %e, "agent refused tool result");
            self.reply_error(
                format!("Agent cannot process tool result for request {request_id}."),
                Some(e.to_string()),
            )
            .await;
        }
    }

    /// Shut the agent down and enter the terminal state.
    pub async fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Active(mut agent) = previous {
            match agent.shutdown().await {
                Ok(()) => tracing::info!(session_id = %self.id, "agent shut down"),
                Err(e) => {
                    tracing::error!(session_id = %self.id, error = %e, "agent shutdown failed")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        session: Session,
        outbound: mpsc::Receiver<ServerMessage>,
        completions: mpsc::UnboundedReceiver<ToolCompletion>,
        _dir: tempfile::TempDir,
    }

    fn harness(tools: Option<Arc<McpClient>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsStore::load(dir.path().join("settings.json"));
        let ctx = SessionContext {
            agents: Arc::new(AgentRegistry::with_builtin()),
            tools,
            settings: Arc::new(settings),
        };
        let (tx, outbound) = mpsc::channel(64);
        let (session, completions) = Session::new(ctx, tx);
        Harness {
            session,
            outbound,
            completions,
            _dir: dir,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbound closed")
    }

    async fn next_text(rx: &mut mpsc::Receiver<ServerMessage>) -> String {
        loop {
            if let ServerMessage::TextResponse { text } = next(rx).await {
                return text;
            }
        }
    }

    #[tokio::test]
    async fn test_messages_before_init_are_rejected() {
        let mut h = harness(None);
        h.session
            .handle_text(r#"{"type": "text_input", "payload": {"text": "hi"}}"#)
            .await;
        assert_eq!(next(&mut h.outbound).await, ServerMessage::error(NOT_INITIALIZED));

        h.session
            .handle_text(r#"{"type": "dance", "payload": {}}"#)
            .await;
        assert_eq!(next(&mut h.outbound).await, ServerMessage::error(NOT_INITIALIZED));
        assert_eq!(h.session.state().name(), "uninitialized");
    }

    #[tokio::test]
    async fn test_invalid_json_reply() {
        let mut h = harness(None);
        h.session.handle_text("{{{").await;
        assert_eq!(
            next(&mut h.outbound).await,
            ServerMessage::error("Invalid JSON received")
        );
    }

    #[tokio::test]
    async fn test_init_then_echo() {
        let mut h = harness(None);
        h.session
            .handle_text(r#"{"type": "init_session", "payload": {"agentType": "Echo"}}"#)
            .await;
        match next(&mut h.outbound).await {
            ServerMessage::SessionConfirmed { warning } => {
                assert!(warning.unwrap().contains(MANAGER_UNAVAILABLE))
            }
            other => panic!("expected session_confirmed, got {other:?}"),
        }
        assert_eq!(
            next(&mut h.outbound).await,
            ServerMessage::StatusUpdate {
                status: AgentStatus::Idle,
                context: Some("Echo Agent ready.".into()),
            }
        );

        h.session
            .handle_message(ClientMessage::TextInput { text: "hello".into() })
            .await;
        assert_eq!(next_text(&mut h.outbound).await, "Echo: hello");
    }

    #[tokio::test]
    async fn test_second_init_rejected() {
        let mut h = harness(None);
        let init = ClientMessage::InitSession {
            agent_type: "Echo".into(),
            config: None,
        };
        h.session.handle_message(init.clone()).await;
        h.session.handle_message(init).await;
        loop {
            if let ServerMessage::ErrorMessage { message, .. } = next(&mut h.outbound).await {
                assert_eq!(message, ALREADY_INITIALIZED);
                break;
            }
        }
        assert!(h.session.is_active());
    }

    #[tokio::test]
    async fn test_failed_init_keeps_session_uninitialized() {
        let mut h = harness(None);
        h.session
            .handle_message(ClientMessage::InitSession {
                agent_type: "Parrot".into(),
                config: None,
            })
            .await;
        match next(&mut h.outbound).await {
            ServerMessage::ErrorMessage { message, .. } => assert_eq!(
                message,
                "Failed to initialize session with agent Parrot. Error: unknown agent type 'Parrot'"
            ),
            other => panic!("unexpected {other:?}"),
        }

        h.session
            .handle_message(ClientMessage::InitSession {
                agent_type: "Echo".into(),
                config: Some(json!([1, 2])),
            })
            .await;
        assert!(matches!(
            next(&mut h.outbound).await,
            ServerMessage::ErrorMessage { .. }
        ));
        assert!(!h.session.is_active());
    }

    #[tokio::test]
    async fn test_config_falls_back_to_settings() {
        let mut h = harness(None);
        h.session
            .ctx
            .settings
            .save(json!({"theme": "dark", "voice_agent_config": {"Echo": {"prefix": "~ "}}}))
            .unwrap();
        h.session
            .handle_message(ClientMessage::InitSession {
                agent_type: "Echo".into(),
                config: None,
            })
            .await;
        h.session
            .handle_message(ClientMessage::TextInput { text: "x".into() })
            .await;
        assert_eq!(next_text(&mut h.outbound).await, "~ x");
    }

    #[tokio::test]
    async fn test_tool_request_without_manager_completes_with_error() {
        let mut h = harness(None);
        h.session
            .handle_message(ClientMessage::InitSession {
                agent_type: "Echo".into(),
                config: None,
            })
            .await;
        h.session
            .handle_message(ClientMessage::TextInput {
                text: "/tool fs read_file {\"path\": \"/x\"}".into(),
            })
            .await;

        let completion = tokio::time::timeout(Duration::from_secs(2), h.completions.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            completion.outcome,
            Err(ToolFailure::new(MANAGER_UNAVAILABLE))
        );

        let request_id = completion.request_id.clone();
        h.session.handle_tool_completion(completion).await;
        loop {
            let text = next_text(&mut h.outbound).await;
            if text.contains("Received error") {
                assert!(text.contains(&request_id));
                assert!(text.contains(MANAGER_UNAVAILABLE));
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_tool_request_gets_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bridge = ToolBridge {
            session_id: "s".into(),
            tools: None,
            completions: tx,
        };
        bridge.dispatch(ToolRequest {
            request_id: "r1".into(),
            server_name: String::new(),
            tool_name: "read_file".into(),
            arguments: Value::Null,
        });
        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.request_id, "r1");
        assert_eq!(completion.outcome, Err(ToolFailure::new(INVALID_TOOL_REQUEST)));
    }

    #[tokio::test]
    async fn test_unknown_tool_result_is_reported() {
        let mut h = harness(None);
        h.session
            .handle_message(ClientMessage::InitSession {
                agent_type: "Echo".into(),
                config: None,
            })
            .await;
        h.session
            .handle_tool_completion(ToolCompletion {
                request_id: "nope".into(),
                outcome: Ok(json!(1)),
            })
            .await;
        loop {
            if let ServerMessage::ErrorMessage { message, details } = next(&mut h.outbound).await {
                assert_eq!(message, "Agent cannot process tool result for request nope.");
                assert!(details.is_some());
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_close_shuts_agent_down_and_is_terminal() {
        let mut h = harness(None);
        h.session
            .handle_message(ClientMessage::InitSession {
                agent_type: "Echo".into(),
                config: None,
            })
            .await;
        h.session.close().await;
        assert_eq!(h.session.state().name(), "closed");

        let mut saw_shutdown = false;
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_millis(500), h.outbound.recv()).await
        {
            if let ServerMessage::StatusUpdate {
                status: AgentStatus::Shutdown,
                ..
            } = msg
            {
                saw_shutdown = true;
                break;
            }
        }
        assert!(saw_shutdown);

        h.session
            .handle_text(r#"{"type": "text_input", "payload": {"text": "hi"}}"#)
            .await;
        assert!(
            tokio::time::timeout(Duration::from_millis(200), h.outbound.recv())
                .await
                .map(|m| m.is_none())
                .unwrap_or(true)
        );
    }
}
