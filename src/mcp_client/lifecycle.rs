//! Per-server connection state and lifecycle.
//!
//! A [`Connection`] owns one server's transport, status and tool registry.
//! The status is shared with the transport's supervisor task so an
//! unexpected process exit is visible to callers immediately.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::correlator::RequestCorrelator;
use super::errors::McpError;
use super::registry::ToolRegistry;
use super::transport::{encode_line, Transport};
use super::types::{
    ConnectionStatus, JsonRpcNotification, JsonRpcRequest, ResourceDescriptor, ServerDescriptor,
    ToolDescriptor, TransportKind,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Time a server gets to exit after the shutdown notification before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ─── LinkState ───────────────────────────────────────────────────────────────

/// Mutable status shared between a connection and its transport tasks.
#[derive(Debug, Clone)]
pub struct LinkState {
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    /// Set once a deliberate shutdown starts, so the exit is not reported as a failure.
    pub closing: bool,
    pub changed_at: DateTime<Utc>,
}

pub type SharedLinkState = Arc<Mutex<LinkState>>;

impl LinkState {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            last_error: None,
            closing: false,
            changed_at: Utc::now(),
        }
    }

    pub fn shared() -> SharedLinkState {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn set_status(&mut self, status: ConnectionStatus) {
        self.status = status;
        self.changed_at = Utc::now();
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a connection, for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub name: String,
    pub transport: TransportKind,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub changed_at: DateTime<Utc>,
}

// ─── Connection ──────────────────────────────────────────────────────────────

/// One server's live connection.
pub struct Connection {
    descriptor: ServerDescriptor,
    state: SharedLinkState,
    capabilities: RwLock<Value>,
    registry: RwLock<ToolRegistry>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
}

impl Connection {
    /// Create a connection in the `Connecting` state. Nothing is spawned yet.
    pub fn new(descriptor: ServerDescriptor) -> Self {
        let registry = ToolRegistry::new(&descriptor.name);
        Self {
            descriptor,
            state: LinkState::shared(),
            capabilities: RwLock::new(Value::Null),
            registry: RwLock::new(registry),
            transport: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn shared_state(&self) -> SharedLinkState {
        Arc::clone(&self.state)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lock_state().status
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    pub fn capabilities(&self) -> Value {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run `f` against the current registry.
    pub fn with_registry<R>(&self, f: impl FnOnce(&ToolRegistry) -> R) -> R {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        f(&registry)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let state = self.lock_state().clone();
        let (tools, resources) =
            self.with_registry(|r| (r.tools().to_vec(), r.resources().to_vec()));
        ConnectionSnapshot {
            name: self.descriptor.name.clone(),
            transport: self.descriptor.transport,
            status: state.status,
            last_error: state.last_error,
            tools,
            resources,
            changed_at: state.changed_at,
        }
    }

    pub(crate) fn attach(&self, transport: Arc<dyn Transport>) {
        *self.transport.write().unwrap_or_else(PoisonError::into_inner) = Some(transport);
    }

    pub(crate) fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn detach(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Install discovery results and mark the connection usable.
    ///
    /// Returns false if the connection left `Connecting` in the meantime
    /// (process exit or shutdown), in which case nothing is installed.
    pub(crate) fn mark_connected(&self, registry: ToolRegistry, capabilities: Value) -> bool {
        let mut state = self.lock_state();
        if state.status != ConnectionStatus::Connecting || state.closing {
            return false;
        }
        *self.registry.write().unwrap_or_else(PoisonError::into_inner) = registry;
        *self.capabilities.write().unwrap_or_else(PoisonError::into_inner) = capabilities;
        state.set_status(ConnectionStatus::Connected);
        state.last_error = None;
        true
    }

    /// Swap in a freshly discovered registry. Only a connected server is updated.
    pub(crate) fn replace_registry(&self, registry: ToolRegistry) -> bool {
        let state = self.lock_state();
        if state.status != ConnectionStatus::Connected {
            return false;
        }
        *self.registry.write().unwrap_or_else(PoisonError::into_inner) = registry;
        true
    }

    pub(crate) fn mark_error(&self, reason: &str) {
        let mut state = self.lock_state();
        state.set_status(ConnectionStatus::Error);
        state.last_error = Some(reason.to_string());
    }

    /// Send a request and wait for its correlated outcome.
    pub async fn request(
        &self,
        correlator: &Arc<RequestCorrelator>,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let transport = self.transport().ok_or_else(|| McpError::NotConnected {
            name: self.descriptor.name.clone(),
            status: self.status(),
            reason: self.last_error(),
        })?;

        let pending = correlator.register(&self.descriptor.name, method);
        let line = encode_line(
            &self.descriptor.name,
            &JsonRpcRequest::new(pending.id(), method, params),
        )?;

        if let Err(e) = transport.send_line(line).await {
            tracing::warn!(server = %self.descriptor.name, method, error = %e, "request write failed");
            correlator.reject(pending.id(), e);
        }
        pending.wait(timeout).await
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let transport = self.transport().ok_or_else(|| McpError::NotConnected {
            name: self.descriptor.name.clone(),
            status: self.status(),
            reason: self.last_error(),
        })?;
        let line = encode_line(&self.descriptor.name, &JsonRpcNotification::new(method, params))?;
        transport.send_line(line).await
    }

    /// Tear the connection down after a failed connect, keeping `Error` status.
    pub(crate) async fn abort(&self, reason: &str) {
        self.mark_error(reason);
        self.lock_state().closing = true;
        if let Some(transport) = self.detach() {
            transport.close(Duration::ZERO).await;
        }
    }

    /// Deliberately stop the server.
    ///
    /// Pending requests to it are rejected first, then the transport is
    /// closed with `grace` for the process to exit on its own.
    pub async fn shutdown(&self, correlator: &RequestCorrelator, grace: Duration) {
        {
            let mut state = self.lock_state();
            state.closing = true;
            state.set_status(ConnectionStatus::Disconnected);
        }

        let name = self.descriptor.name.clone();
        let rejected = correlator.reject_server(&name, || McpError::ServerUnavailable {
            name: name.clone(),
            reason: "server is shutting down".into(),
        });
        if rejected > 0 {
            tracing::info!(server = %name, rejected, "rejected pending requests on shutdown");
        }

        if let Some(transport) = self.detach() {
            transport.close(grace).await;
        }
        *self.registry.write().unwrap_or_else(PoisonError::into_inner) = ToolRegistry::new(&name);
        tracing::info!(server = %name, "connection closed");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
