//! Request correlation across all tool servers.
//!
//! Every outgoing request gets a fresh id and a pending entry holding a
//! one-shot completion channel. Whoever removes the entry first (a response,
//! the timeout, a server exit or shutdown) completes it; every later attempt
//! finds nothing and is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use super::errors::McpError;

type Completion = Result<Value, McpError>;

struct PendingEntry {
    server: String,
    method: String,
    tx: oneshot::Sender<Completion>,
}

/// Pending request table shared by every connection of a manager.
#[derive(Default)]
pub struct RequestCorrelator {
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request to `server` and return its handle.
    ///
    /// The handle's id is what goes on the wire.
    pub fn register(self: &Arc<Self>, server: &str, method: &str) -> PendingRequest {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            id.clone(),
            PendingEntry {
                server: server.to_string(),
                method: method.to_string(),
                tx,
            },
        );
        PendingRequest {
            id,
            server: server.to_string(),
            method: method.to_string(),
            rx,
            correlator: Arc::clone(self),
        }
    }

    /// Complete a pending request. Returns false if the id is unknown or
    /// was already completed.
    pub fn complete(&self, id: &str, outcome: Completion) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        // Receiver may be gone if the waiter was cancelled.
        let _ = entry.tx.send(outcome);
        true
    }

    pub fn resolve(&self, id: &str, value: Value) -> bool {
        self.complete(id, Ok(value))
    }

    pub fn reject(&self, id: &str, err: McpError) -> bool {
        self.complete(id, Err(err))
    }

    /// Reject every pending request addressed to `server`.
    pub fn reject_server<F>(&self, server: &str, make_err: F) -> usize
    where
        F: Fn() -> McpError,
    {
        let drained: Vec<PendingEntry> = {
            let mut pending = self.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, e)| e.server == server)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = drained.len();
        for entry in drained {
            tracing::debug!(server = %entry.server, method = %entry.method, "rejecting pending request");
            let _ = entry.tx.send(Err(make_err()));
        }
        count
    }

    /// Reject every pending request regardless of server.
    pub fn reject_all<F>(&self, make_err: F) -> usize
    where
        F: Fn(&str) -> McpError,
    {
        let drained: Vec<PendingEntry> = self.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(make_err(&entry.server)));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn pending_for(&self, server: &str) -> usize {
        self.lock().values().filter(|e| e.server == server).count()
    }

    fn expire(&self, id: &str, timeout: Duration) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        let err = McpError::Timeout {
            server: entry.server,
            method: entry.method,
            timeout_ms: timeout.as_millis() as u64,
        };
        let _ = entry.tx.send(Err(err));
        true
    }

    fn forget(&self, id: &str) {
        self.lock().remove(id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ─── PendingRequest ─────────────────────────────────────────────────────────

/// Caller's side of one registered request.
///
/// Dropping it without waiting removes the entry.
pub struct PendingRequest {
    id: String,
    server: String,
    method: String,
    rx: oneshot::Receiver<Completion>,
    correlator: Arc<RequestCorrelator>,
}

impl PendingRequest {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the outcome, failing with `Timeout` once `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Completion {
        let received = match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(received) => received,
            Err(_) => {
                if self.correlator.expire(&self.id, timeout) {
                    tracing::warn!(
                        server = %self.server,
                        method = %self.method,
                        timeout_ms = timeout.as_millis() as u64,
                        "request timed out"
                    );
                }
                // Either our timeout or a completion that raced it is already queued.
                (&mut self.rx).await
            }
        };
        received.unwrap_or_else(|_| Err(self.dropped()))
    }

    fn dropped(&self) -> McpError {
        McpError::ServerUnavailable {
            name: self.server.clone(),
            reason: "request abandoned".into(),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.correlator.forget(&self.id);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_delivers_value() {
        let c = Arc::new(RequestCorrelator::new());
        let req = c.register("fs", "tools/call");
        let id = req.id().to_string();
        assert_eq!(c.pending_count(), 1);

        assert!(c.resolve(&id, json!({"ok": true})));
        let value = req.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let c = Arc::new(RequestCorrelator::new());
        let a = c.register("fs", "x");
        let b = c.register("fs", "x");
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_noop() {
        let c = Arc::new(RequestCorrelator::new());
        let req = c.register("slow", "tools/call");
        let id = req.id().to_string();

        let err = req.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { ref server, .. } if server == "slow"));
        assert_eq!(c.pending_count(), 0);

        assert!(!c.resolve(&id, json!("late")));
        assert!(!c.reject(&id, McpError::ToolFailed { message: "late".into() }));
    }

    #[tokio::test]
    async fn test_reject_server_only_touches_that_server() {
        let c = Arc::new(RequestCorrelator::new());
        let a1 = c.register("a", "tools/call");
        let a2 = c.register("a", "tools/call");
        let b = c.register("b", "tools/call");

        let n = c.reject_server("a", || McpError::ServerExited {
            name: "a".into(),
            detail: "code: 1".into(),
        });
        assert_eq!(n, 2);
        assert_eq!(c.pending_for("a"), 0);
        assert_eq!(c.pending_for("b"), 1);

        for req in [a1, a2] {
            let err = req.wait(Duration::from_secs(1)).await.unwrap_err();
            assert!(matches!(err, McpError::ServerExited { .. }));
        }
        drop(b);
        assert_eq!(c.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_reject_all_uses_entry_server() {
        let c = Arc::new(RequestCorrelator::new());
        let req = c.register("fs", "resources/read");
        c.reject_all(|server| McpError::ServerUnavailable {
            name: server.to_string(),
            reason: "shutting down".into(),
        });
        let err = req.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, McpError::ServerUnavailable { ref name, .. } if name == "fs"));
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let c = Arc::new(RequestCorrelator::new());
        let req = c.register("fs", "tools/call");
        let id = req.id().to_string();
        assert!(c.reject(&id, McpError::ToolFailed { message: "first".into() }));
        assert!(!c.resolve(&id, json!(1)));
        let err = req.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, McpError::ToolFailed { ref message } if message == "first"));
    }
}
