//! HTTP surface: the session WebSocket, tool server and settings APIs, and
//! the static browser client.

use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::agent::AgentRegistry;
use crate::config::AppConfig;
use crate::mcp_client::{ConnectionSnapshot, McpClient, McpError, ServerStatus};
use crate::session::orchestrator::MANAGER_UNAVAILABLE;
use crate::session::{ws, SessionContext};
use crate::settings::{Settings, SettingsError, SettingsStore};

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SettingsStore>,
    /// `None` when the tool server config could not be loaded.
    pub tools: Option<Arc<McpClient>>,
    pub agents: Arc<AgentRegistry>,
}

impl AppState {
    pub fn session_context(&self) -> SessionContext {
        SessionContext {
            agents: Arc::clone(&self.agents),
            tools: self.tools.clone(),
            settings: Arc::clone(&self.settings),
        }
    }

    fn tools(&self) -> Result<&Arc<McpClient>, ApiError> {
        self.tools
            .as_ref()
            .ok_or_else(|| ApiError::Unavailable(MANAGER_UNAVAILABLE.to_string()))
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl From<McpError> for ApiError {
    fn from(e: McpError) -> Self {
        match e {
            McpError::UnknownServer { .. } => Self::NotFound(e.to_string()),
            McpError::NotConnected { .. } => Self::Conflict(e.to_string()),
            McpError::ConfigError { .. } => Self::Internal(e.to_string()),
            _ => Self::Unavailable(e.to_string()),
        }
    }
}

impl From<SettingsError> for ApiError {
    fn from(e: SettingsError) -> Self {
        match e {
            SettingsError::Invalid { .. } => Self::BadRequest(e.to_string()),
            SettingsError::Io { .. } => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "success": false, "error": self.to_string() }));
        (status, body).into_response()
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn list_servers(State(state): State<AppState>) -> Result<Json<Vec<ServerStatus>>, ApiError> {
    Ok(Json(state.tools()?.server_statuses()))
}

/// Flip `enabled` for one server. A failed connect shows up in the returned
/// status rather than as an HTTP error.
async fn toggle_server(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Json<ServerStatus>, ApiError> {
    let tools = state.tools()?;
    let descriptor = tools.descriptor(&name).ok_or_else(|| McpError::UnknownServer {
        name: name.clone(),
    })?;

    match tools.set_server_enabled(&name, !descriptor.enabled).await {
        Ok(()) => {}
        Err(e @ (McpError::UnknownServer { .. } | McpError::ConfigError { .. })) => {
            return Err(e.into())
        }
        Err(e) => tracing::warn!(server = %name, error = %e, "server did not come up after toggle"),
    }

    tools
        .server_statuses()
        .into_iter()
        .find(|s| s.name == name)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("MCP server '{name}' not configured or found.")))
}

async fn refresh_server(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Json<ConnectionSnapshot>, ApiError> {
    Ok(Json(state.tools()?.refresh_server(&name).await?))
}

async fn get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.settings.get())
}

async fn save_settings(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    state.settings.save(body)?;
    Ok(Json(json!({ "success": true })))
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn router(state: AppState, static_dir: &Path) -> Router {
    let router = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/mcp/servers", get(list_servers))
        .route("/api/mcp/servers/{name}/toggle", post(toggle_server))
        .route("/api/mcp/servers/{name}/refresh", post(refresh_server))
        .route("/api/settings", get(get_settings).post(save_settings));

    let router = if static_dir.is_dir() {
        tracing::info!(path = %static_dir.display(), "serving client static files");
        router.fallback_service(ServeDir::new(static_dir))
    } else {
        tracing::info!(path = %static_dir.display(), "static directory not found, skipping static file serving");
        router
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Load the tool server config and start connecting in the background.
///
/// A config that cannot be read leaves the server running without a tool
/// client manager.
fn start_tools(config: &AppConfig, settings: &SettingsStore) -> Option<Arc<McpClient>> {
    let path = config.resolve_mcp_config(settings.mcp_config_path());
    let client = McpClient::new(&path).with_request_timeout(config.tool_timeout);

    match client.load_config() {
        Ok(count) => {
            tracing::info!(path = %path.display(), servers = count, "tool server config loaded");
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "tool client manager unavailable");
            return None;
        }
    }

    let client = Arc::new(client);
    let background = Arc::clone(&client);
    tokio::spawn(async move {
        let failures = background.initialize_connections().await;
        for (name, err) in &failures {
            tracing::warn!(server = %name, error = %err, "tool server failed to start (non-fatal)");
        }
        let connected = background
            .server_statuses()
            .iter()
            .filter(|s| s.status == crate::mcp_client::ConnectionStatus::Connected)
            .count();
        tracing::info!(connected, failed = failures.len(), "tool servers initialized");
    });
    Some(client)
}

/// Serve until SIGINT/SIGTERM, then stop all tool servers.
pub async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let settings = Arc::new(SettingsStore::load(&config.settings_path));
    tracing::info!(path = %settings.path().display(), "settings loaded");

    let tools = start_tools(&config, &settings);
    let agents = Arc::new(AgentRegistry::with_builtin());
    tracing::info!(agent_types = ?agents.agent_types(), "voice agents registered");
    let state = AppState {
        settings,
        tools: tools.clone(),
        agents,
    };
    let app = router(state, &config.static_dir);

    let listener = TcpListener::bind(config.bind_addr).await.map_err(|e| {
        anyhow::anyhow!("failed to bind {}: {e}", config.bind_addr)
    })?;
    tracing::info!(addr = %config.bind_addr, "vox server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(tools) = tools {
        tools.shutdown_all().await;
    }
    tracing::info!("vox server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
