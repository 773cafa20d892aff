//! JSON-RPC plumbing shared by the stdio and SSE transports.
//!
//! Both transports run a background reader that classifies every incoming
//! message and routes responses to the caller waiting on that request id, so
//! any number of requests may be in flight on one connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcResponse};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// A bidirectional JSON-RPC channel to one server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its response.
    ///
    /// Dropping the returned future abandons the request.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<serde_json::Value>)
        -> Result<(), McpError>;

    /// Release the underlying process or socket. Safe to call more than once.
    async fn close(&self) -> Result<(), McpError>;
}

// ─── Pending Requests ────────────────────────────────────────────────────────

/// Response channels keyed by request id.
#[derive(Clone)]
pub struct PendingRequests {
    server_name: Arc<str>,
    inner: Arc<Mutex<PendingState>>,
}

#[derive(Default)]
struct PendingState {
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    /// Set once the stream ended; later registrations fail immediately.
    closed_reason: Option<String>,
}

impl PendingRequests {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: Arc::from(server_name),
            inner: Arc::new(Mutex::new(PendingState::default())),
        }
    }

    /// Register a waiter for `id`. The entry is removed when the guard drops.
    pub fn register(&self, id: u64) -> Result<PendingGuard, McpError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if let Some(reason) = &state.closed_reason {
            return Err(self.transport_error(reason.clone()));
        }
        state.waiters.insert(id, tx);
        Ok(PendingGuard {
            id,
            pending: self.clone(),
            rx: Some(rx),
        })
    }

    /// Route a response to its waiter. Returns `false` if nobody is waiting.
    pub fn complete(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.as_u64() else {
            return false;
        };
        let waiter = self.lock().waiters.remove(&id);
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Fail every current and future waiter.
    pub fn close(&self, reason: &str) {
        let mut state = self.lock();
        if state.closed_reason.is_none() {
            state.closed_reason = Some(reason.to_string());
        }
        // Dropping the senders wakes the receivers with `RecvError`.
        state.waiters.clear();
    }

    fn remove(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    fn closed_reason(&self) -> String {
        self.lock()
            .closed_reason
            .clone()
            .unwrap_or_else(|| "connection closed".to_string())
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::Transport {
            server: self.server_name.to_string(),
            reason,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingState> {
        // A panic while holding this lock cannot leave the map half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A registered waiter. Await [`PendingGuard::wait`] for the response.
pub struct PendingGuard {
    id: u64,
    pending: PendingRequests,
    rx: Option<oneshot::Receiver<JsonRpcResponse>>,
}

impl PendingGuard {
    pub async fn wait(mut self) -> Result<JsonRpcResponse, McpError> {
        let Some(rx) = self.rx.take() else {
            return Err(self.pending.transport_error("request already awaited".into()));
        };
        match rx.await {
            Ok(resp) => Ok(resp),
            Err(_) => Err(self.pending.transport_error(self.pending.closed_reason())),
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

// ─── Incoming Messages ───────────────────────────────────────────────────────

/// A message received from a server, classified by shape.
#[derive(Debug)]
pub enum IncomingMessage {
    Response(JsonRpcResponse),
    Notification {
        method: String,
    },
    /// Server-initiated request that expects a reply.
    Request {
        id: serde_json::Value,
        method: String,
    },
}

impl IncomingMessage {
    /// Classify one JSON text. `None` for non-JSON noise (e.g. log lines on stdout).
    pub fn parse(text: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let obj = value.as_object()?;
        let method = obj.get("method").and_then(|m| m.as_str()).map(str::to_string);
        let id = obj.get("id").cloned().filter(|id| !id.is_null());

        match (method, id) {
            (Some(method), Some(id)) => Some(IncomingMessage::Request { id, method }),
            (Some(method), None) => Some(IncomingMessage::Notification { method }),
            (None, _) if obj.contains_key("result") || obj.contains_key("error") => {
                serde_json::from_value(value).ok().map(IncomingMessage::Response)
            }
            _ => None,
        }
    }
}

/// Reply for a server-initiated request: `ping` succeeds, everything else is unknown.
pub fn reply_to_server_request(id: serde_json::Value, method: &str) -> JsonRpcResponse {
    if method == "ping" {
        JsonRpcResponse::success(id, serde_json::json!({}))
    } else {
        JsonRpcResponse::failure(
            id,
            error_codes::METHOD_NOT_FOUND,
            &format!("client does not handle '{method}'"),
        )
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::Server {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::Server {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
