//! Tool client manager: high-level interface for tool execution.
//!
//! Owns the server descriptors, one [`Connection`] per enabled server and the
//! shared [`RequestCorrelator`]. Shared across sessions behind an `Arc`; every
//! method takes `&self` and no lock is held across an await.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Value};

use super::correlator::RequestCorrelator;
use super::discovery;
use super::errors::McpError;
use super::lifecycle::{Connection, ConnectionSnapshot, SHUTDOWN_GRACE};
use super::types::{ConnectionStatus, ServerDescriptor, ServersFile, TransportKind};
use super::uri::ResourceUri;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for every correlated request (ms).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

// ─── Status Reporting ────────────────────────────────────────────────────────

/// One row of the server status listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub transport: TransportKind,
    pub enabled: bool,
    pub status: ConnectionStatus,
    pub tool_count: usize,
    pub resource_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed_at: Option<DateTime<Utc>>,
}

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Manages every configured tool server and routes tool calls to them.
pub struct McpClient {
    config_path: PathBuf,
    descriptors: RwLock<Vec<ServerDescriptor>>,
    /// Shape of the config file as last read, reused when saving.
    file_shape: Mutex<ServersFile>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
    correlator: Arc<RequestCorrelator>,
    request_timeout: Duration,
    /// Serializes connect/replace so there is at most one connection per name.
    connect_lock: tokio::sync::Mutex<()>,
    /// Set by `shutdown_all`; no connection is created afterwards.
    shut_down: AtomicBool,
}

impl McpClient {
    /// Create a manager for the config file at `config_path`. Nothing is read yet.
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            descriptors: RwLock::new(Vec::new()),
            file_shape: Mutex::new(ServersFile::List(Vec::new())),
            connections: RwLock::new(HashMap::new()),
            correlator: Arc::new(RequestCorrelator::new()),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            connect_lock: tokio::sync::Mutex::new(()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    // ─── Configuration ───────────────────────────────────────────────────

    /// Read the server config file.
    ///
    /// A missing file is created holding an empty list. Malformed content
    /// leaves the manager with no descriptors and returns `ConfigError`.
    pub fn load_config(&self) -> Result<usize, McpError> {
        if !self.config_path.exists() {
            tracing::info!(path = %self.config_path.display(), "server config missing, creating empty list");
            self.set_descriptors(ServersFile::List(Vec::new()));
            self.persist()?;
            return Ok(0);
        }

        let parsed = std::fs::read_to_string(&self.config_path)
            .map_err(|e| McpError::ConfigError {
                reason: format!("cannot read {}: {e}", self.config_path.display()),
            })
            .and_then(|content| {
                serde_json::from_str::<ServersFile>(&content).map_err(|e| McpError::ConfigError {
                    reason: format!("invalid server config {}: {e}", self.config_path.display()),
                })
            });

        match parsed {
            Ok(file) => {
                let count = self.set_descriptors(file);
                tracing::info!(path = %self.config_path.display(), servers = count, "loaded server config");
                Ok(count)
            }
            Err(e) => {
                self.set_descriptors(ServersFile::List(Vec::new()));
                tracing::error!(error = %e, "failed to load server config");
                Err(e)
            }
        }
    }

    /// Snapshot of the configured descriptors.
    pub fn descriptors(&self) -> Vec<ServerDescriptor> {
        self.descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn descriptor(&self, name: &str) -> Option<ServerDescriptor> {
        self.descriptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|d| d.name == name)
            .cloned()
    }

    fn set_descriptors(&self, file: ServersFile) -> usize {
        let shape = file.with_descriptors(Vec::new());
        let list = file.into_descriptors();
        let count = list.len();
        *self.descriptors.write().unwrap_or_else(PoisonError::into_inner) = list;
        *self.file_shape.lock().unwrap_or_else(PoisonError::into_inner) = shape;
        count
    }

    /// Write the descriptors back in the shape the file was read in.
    fn persist(&self) -> Result<(), McpError> {
        let file = self
            .file_shape
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .with_descriptors(self.descriptors());
        let json = serde_json::to_string_pretty(&file).map_err(|e| McpError::ConfigError {
            reason: format!("failed to serialize server config: {e}"),
        })?;

        let io_err = |e: std::io::Error| McpError::ConfigError {
            reason: format!("failed to write {}: {e}", self.config_path.display()),
        };
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let tmp = self.config_path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &self.config_path).map_err(io_err)?;
        Ok(())
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every enabled server that is not already connecting or connected.
    ///
    /// Servers are attempted concurrently and independently. Returns the
    /// servers that failed (partial startup is fine).
    pub async fn initialize_connections(&self) -> Vec<(String, McpError)> {
        let _guard = self.connect_lock.lock().await;
        if self.is_shut_down() {
            tracing::debug!("tool client shut down, not connecting");
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for descriptor in self.descriptors() {
            if !descriptor.enabled {
                tracing::debug!(server = %descriptor.name, "server disabled, skipping");
                continue;
            }
            if descriptor.name.trim().is_empty() {
                tracing::warn!("server descriptor without a name, skipping");
                continue;
            }
            if !seen.insert(descriptor.name.clone()) {
                tracing::warn!(server = %descriptor.name, "duplicate server name, skipping");
                continue;
            }
            if let Some(existing) = self.connection(&descriptor.name) {
                match existing.status() {
                    ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                        tracing::debug!(server = %descriptor.name, "already initialized, skipping");
                        continue;
                    }
                    ConnectionStatus::Error | ConnectionStatus::Disconnected => {
                        existing.shutdown(&self.correlator, Duration::ZERO).await;
                    }
                }
            }
            pending.push(self.insert_connection(descriptor));
        }

        let results = join_all(
            pending
                .iter()
                .map(|conn| discovery::connect(conn, &self.correlator, self.request_timeout)),
        )
        .await;

        let failures: Vec<(String, McpError)> = pending
            .iter()
            .zip(results)
            .filter_map(|(conn, result)| result.err().map(|e| (conn.name().to_string(), e)))
            .collect();

        tracing::info!(
            attempted = pending.len(),
            failed = failures.len(),
            "tool server initialization finished"
        );
        failures
    }

    /// Replace one server's connection with a fresh one, whatever its state.
    pub async fn reconnect_server(&self, name: &str) -> Result<(), McpError> {
        let _guard = self.connect_lock.lock().await;
        if self.is_shut_down() {
            return Err(McpError::ServerUnavailable {
                name: name.to_string(),
                reason: "tool client shut down".into(),
            });
        }

        let descriptor = self
            .descriptor(name)
            .filter(|d| d.enabled)
            .ok_or_else(|| McpError::UnknownServer {
                name: name.to_string(),
            })?;

        if let Some(existing) = self.connection(name) {
            existing.shutdown(&self.correlator, SHUTDOWN_GRACE).await;
        }
        let conn = self.insert_connection(descriptor);
        discovery::connect(&conn, &self.correlator, self.request_timeout).await
    }

    /// Re-run discovery on a connected server.
    pub async fn refresh_server(&self, name: &str) -> Result<ConnectionSnapshot, McpError> {
        let conn = self.usable_connection(name)?;
        let registry = discovery::rediscover(&conn, &self.correlator, self.request_timeout).await?;
        let tools = registry.len();
        if !conn.replace_registry(registry) {
            return Err(McpError::NotConnected {
                name: name.to_string(),
                status: conn.status(),
                reason: conn.last_error(),
            });
        }
        tracing::info!(server = %name, tools, "refreshed server registry");
        Ok(conn.snapshot())
    }

    /// Enable or disable a server, persist the change, and connect or stop it.
    pub async fn set_server_enabled(&self, name: &str, enabled: bool) -> Result<(), McpError> {
        {
            let mut descriptors = self.descriptors.write().unwrap_or_else(PoisonError::into_inner);
            let descriptor = descriptors
                .iter_mut()
                .find(|d| d.name == name)
                .ok_or_else(|| McpError::UnknownServer {
                    name: name.to_string(),
                })?;
            descriptor.enabled = enabled;
        }
        self.persist()?;
        tracing::info!(server = %name, enabled, "server toggled");

        if enabled {
            self.reconnect_server(name).await
        } else {
            self.shutdown_server(name).await;
            Ok(())
        }
    }

    /// Stop one server and forget its connection.
    pub async fn shutdown_server(&self, name: &str) {
        let _guard = self.connect_lock.lock().await;
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if let Some(conn) = removed {
            conn.shutdown(&self.correlator, SHUTDOWN_GRACE).await;
        }
    }

    /// Stop every server and cancel all outstanding work.
    ///
    /// Waits at most a little past the shutdown grace period in total.
    pub async fn shutdown_all(&self) {
        // Waits out any connect in flight; later ones see the flag and bail.
        let _guard = self.connect_lock.lock().await;
        self.shut_down.store(true, Ordering::SeqCst);

        let conns: Vec<Arc<Connection>> = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, c)| c)
            .collect();

        tracing::info!(servers = conns.len(), "shutting down tool servers");
        let all = join_all(
            conns
                .iter()
                .map(|conn| conn.shutdown(&self.correlator, SHUTDOWN_GRACE)),
        );
        if tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(2), all)
            .await
            .is_err()
        {
            tracing::warn!("tool server shutdown did not finish in time");
        }

        let leftover = self.correlator.reject_all(|server| McpError::ServerUnavailable {
            name: server.to_string(),
            reason: "tool client shut down".into(),
        });
        if leftover > 0 {
            tracing::warn!(leftover, "rejected requests left after shutdown");
        }
    }

    /// Whether `shutdown_all` has run.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn insert_connection(&self, descriptor: ServerDescriptor) -> Arc<Connection> {
        let conn = Arc::new(Connection::new(descriptor));
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(conn.name().to_string(), Arc::clone(&conn));
        conn
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Call `tool` on `server`.
    ///
    /// Unknown servers, unusable connections, unknown tools and structurally
    /// invalid arguments fail before anything is sent.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        let conn = self.usable_connection(server)?;
        conn.with_registry(|r| r.validate_tool_call(tool, &arguments))?;

        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let params = json!({ "name": tool, "arguments": arguments });

        let start = Instant::now();
        let result = conn
            .request(&self.correlator, "tools/call", Some(params), self.request_timeout)
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => tracing::info!(server, tool, elapsed_ms, "tool call succeeded"),
            Err(e) if e.is_transport_failure() => {
                tracing::error!(server, tool, elapsed_ms, error = %e, "tool call lost its transport")
            }
            Err(e) => tracing::warn!(server, tool, elapsed_ms, error = %e, "tool call failed"),
        }
        result
    }

    /// Read a resource. The URI's host names the server.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpError> {
        let parsed = ResourceUri::parse(uri)?;
        if self.descriptor(&parsed.server).is_none() {
            return Err(McpError::InvalidResourceUri {
                uri: uri.to_string(),
                reason: format!("no configured server named '{}'", parsed.server),
            });
        }
        let conn = self.usable_connection(&parsed.server)?;
        conn.request(
            &self.correlator,
            "resources/read",
            Some(json!({ "uri": parsed.as_str() })),
            self.request_timeout,
        )
        .await
    }

    fn usable_connection(&self, name: &str) -> Result<Arc<Connection>, McpError> {
        let conn = self.connection(name).ok_or_else(|| McpError::UnknownServer {
            name: name.to_string(),
        })?;
        match conn.status() {
            ConnectionStatus::Connected => Ok(conn),
            status => Err(McpError::NotConnected {
                name: name.to_string(),
                status,
                reason: conn.last_error(),
            }),
        }
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn connection_status(&self, name: &str) -> Option<ConnectionStatus> {
        self.connection(name).map(|c| c.status())
    }

    /// Status of every configured server, in config order.
    pub fn server_statuses(&self) -> Vec<ServerStatus> {
        self.descriptors()
            .into_iter()
            .map(|d| match self.connection(&d.name) {
                Some(conn) => {
                    let snap = conn.snapshot();
                    ServerStatus {
                        name: d.name,
                        transport: d.transport,
                        enabled: d.enabled,
                        status: snap.status,
                        tool_count: snap.tools.len(),
                        resource_count: snap.resources.len(),
                        last_error: snap.last_error,
                        changed_at: Some(snap.changed_at),
                    }
                }
                None => ServerStatus {
                    name: d.name,
                    transport: d.transport,
                    enabled: d.enabled,
                    status: ConnectionStatus::Disconnected,
                    tool_count: 0,
                    resource_count: 0,
                    last_error: None,
                    changed_at: None,
                },
            })
            .collect()
    }

    /// Number of requests still waiting on a server.
    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
