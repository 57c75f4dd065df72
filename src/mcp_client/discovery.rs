//! Connect chain: transport open, capability negotiation, tool and resource discovery.
//!
//! A connection only becomes `Connected` once every step succeeded and its
//! registry is installed. Any failure tears the transport down and leaves the
//! connection in `Error` with the cause recorded.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use super::correlator::RequestCorrelator;
use super::errors::McpError;
use super::lifecycle::Connection;
use super::registry::ToolRegistry;
use super::transport;
use super::types::{
    error_codes, InitializeResult, ResourceDescriptor, ResourcesListResult, ToolDescriptor,
    ToolsListResult,
};

/// Protocol revision sent during capability negotiation.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name sent during capability negotiation.
pub const CLIENT_NAME: &str = "vox-server";

/// Open the transport for `conn` and run the handshake.
pub async fn connect(
    conn: &Connection,
    correlator: &Arc<RequestCorrelator>,
    timeout: Duration,
) -> Result<(), McpError> {
    let name = conn.name().to_string();

    let transport = match transport::open(
        conn.descriptor(),
        Arc::clone(correlator),
        conn.shared_state(),
    ) {
        Ok(t) => t,
        Err(e) => {
            conn.mark_error(&e.to_string());
            tracing::error!(server = %name, error = %e, "failed to open transport");
            return Err(e);
        }
    };
    conn.attach(transport);

    match handshake(conn, correlator, timeout).await {
        Ok((registry, capabilities)) => {
            let (tools, resources) = (registry.len(), registry.resources().len());
            if conn.mark_connected(registry, capabilities) {
                tracing::info!(server = %name, tools, resources, "tool server connected");
                Ok(())
            } else {
                let reason = conn
                    .last_error()
                    .unwrap_or_else(|| "connection closed during initialization".into());
                Err(McpError::InitFailed { name, reason })
            }
        }
        Err(e) => {
            let stderr = conn.transport().and_then(|t| t.diagnostics());
            let reason = format!("{e}{}", format_stderr_suffix(stderr.as_deref()));
            tracing::error!(server = %name, reason = %reason, "tool server initialization failed");
            conn.abort(&reason).await;
            Err(McpError::InitFailed { name, reason })
        }
    }
}

/// Re-run tool and resource discovery on a connected server and swap the
/// registry in one step.
pub async fn rediscover(
    conn: &Connection,
    correlator: &Arc<RequestCorrelator>,
    timeout: Duration,
) -> Result<ToolRegistry, McpError> {
    let tools = list_tools(conn, correlator, timeout).await?;
    let resources = list_resources(conn, correlator, timeout).await?;
    Ok(ToolRegistry::build(conn.name(), tools, resources))
}

async fn handshake(
    conn: &Connection,
    correlator: &Arc<RequestCorrelator>,
    timeout: Duration,
) -> Result<(ToolRegistry, Value), McpError> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    });
    let raw = conn
        .request(correlator, "initialize", Some(params), timeout)
        .await?;

    let init: InitializeResult = serde_json::from_value(raw.clone()).unwrap_or_else(|e| {
        tracing::debug!(server = %conn.name(), error = %e, "non-standard initialize result");
        InitializeResult::default()
    });
    if let Some(info) = &init.server_info {
        tracing::debug!(
            server = %conn.name(),
            remote_name = ?info.name,
            remote_version = ?info.version,
            protocol = ?init.protocol_version,
            "negotiated capabilities"
        );
    }
    let capabilities = if init.capabilities.is_null() {
        raw
    } else {
        init.capabilities
    };

    conn.notify("notifications/initialized", None).await?;

    let registry = rediscover(conn, correlator, timeout).await?;
    Ok((registry, capabilities))
}

async fn list_tools(
    conn: &Connection,
    correlator: &Arc<RequestCorrelator>,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let raw = conn
        .request(correlator, "tools/list", Some(json!({})), timeout)
        .await?;
    let parsed: ToolsListResult =
        serde_json::from_value(raw).map_err(|e| McpError::ProtocolError {
            server: conn.name().to_string(),
            reason: format!("invalid tools/list response: {e}"),
        })?;
    Ok(parsed.into_tools())
}

async fn list_resources(
    conn: &Connection,
    correlator: &Arc<RequestCorrelator>,
    timeout: Duration,
) -> Result<Vec<ResourceDescriptor>, McpError> {
    let raw = match conn
        .request(correlator, "resources/list", Some(json!({})), timeout)
        .await
    {
        Ok(raw) => raw,
        Err(McpError::ServerError { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
            tracing::debug!(server = %conn.name(), "server has no resources/list, assuming none");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };
    let parsed: ResourcesListResult =
        serde_json::from_value(raw).map_err(|e| McpError::ProtocolError {
            server: conn.name().to_string(),
            reason: format!("invalid resources/list response: {e}"),
        })?;
    Ok(parsed.into_resources())
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: Option<&str>) -> String {
    match stderr.map(str::trim) {
        Some(s) if !s.is_empty() => format!(" | stderr: {s}"),
        _ => String::new(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::transport::Transport;
    use crate::mcp_client::types::{ConnectionStatus, ServerDescriptor, TransportKind};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted server: answers by method name, records every line it receives.
    struct ScriptedTransport {
        correlator: Arc<RequestCorrelator>,
        answers: fn(&str) -> Result<Value, McpError>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send_line(&self, line: String) -> Result<(), McpError> {
            let msg: Value = serde_json::from_str(&line).unwrap();
            let method = msg["method"].as_str().unwrap_or_default().to_string();
            self.seen.lock().unwrap().push(method.clone());
            if let Some(id) = msg.get("id").and_then(Value::as_str) {
                self.correlator.complete(id, (self.answers)(&method));
            }
            Ok(())
        }

        async fn close(&self, _grace: Duration) {}

        fn kind(&self) -> TransportKind {
            TransportKind::Process
        }

        fn diagnostics(&self) -> Option<String> {
            Some("boom on stderr".into())
        }
    }

    fn conn() -> Connection {
        let d: ServerDescriptor =
            serde_json::from_value(json!({"name": "scripted", "command": "x", "enabled": true}))
                .unwrap();
        Connection::new(d)
    }

    fn tools_only(method: &str) -> Result<Value, McpError> {
        match method {
            "initialize" => Ok(json!({"protocolVersion": PROTOCOL_VERSION, "capabilities": {"tools": {}}})),
            "tools/list" => Ok(json!({"tools": [{"name": "echo", "inputSchema": {}}]})),
            _ => Err(McpError::ServerError {
                code: error_codes::METHOD_NOT_FOUND,
                message: "Method not found".into(),
                data: None,
            }),
        }
    }

    fn broken_tools(method: &str) -> Result<Value, McpError> {
        match method {
            "initialize" => Ok(json!({})),
            _ => Err(McpError::ServerError {
                code: error_codes::INTERNAL_ERROR,
                message: "kaput".into(),
                data: None,
            }),
        }
    }

    #[tokio::test]
    async fn test_handshake_tolerates_missing_resources_list() {
        let correlator = Arc::new(RequestCorrelator::new());
        let conn = conn();
        let transport = Arc::new(ScriptedTransport {
            correlator: Arc::clone(&correlator),
            answers: tools_only,
            seen: Mutex::new(Vec::new()),
        });
        conn.attach(transport.clone());

        let (registry, caps) = handshake(&conn, &correlator, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(registry.tool_names(), vec!["echo"]);
        assert!(registry.resources().is_empty());
        assert!(caps.get("tools").is_some());

        let seen = transport.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec!["initialize", "notifications/initialized", "tools/list", "resources/list"]
        );
    }

    #[tokio::test]
    async fn test_handshake_fails_on_tools_list_error() {
        let correlator = Arc::new(RequestCorrelator::new());
        let conn = conn();
        conn.attach(Arc::new(ScriptedTransport {
            correlator: Arc::clone(&correlator),
            answers: broken_tools,
            seen: Mutex::new(Vec::new()),
        }));

        let result = handshake(&conn, &correlator, Duration::from_secs(1)).await;
        assert!(result.is_err());
        assert_eq!(conn.status(), ConnectionStatus::Connecting);
    }

    #[tokio::test]
    async fn test_connect_unsupported_transport_sets_error() {
        let correlator = Arc::new(RequestCorrelator::new());
        let d: ServerDescriptor = serde_json::from_value(
            json!({"name": "web", "transport": "http", "url": "http://localhost:1", "enabled": true}),
        )
        .unwrap();
        let conn = Connection::new(d);
        let err = connect(&conn, &correlator, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnsupportedTransport { .. }));
        assert_eq!(conn.status(), ConnectionStatus::Error);
        assert!(conn.last_error().unwrap().contains("not yet implemented"));
    }

    #[test]
    fn test_stderr_suffix() {
        assert_eq!(format_stderr_suffix(None), "");
        assert_eq!(format_stderr_suffix(Some("  ")), "");
        assert_eq!(format_stderr_suffix(Some("oops\n")), " | stderr: oops");
    }
}
