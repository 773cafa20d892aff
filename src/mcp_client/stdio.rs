//! JSON-RPC over stdio transport.
//!
//! Spawns an MCP server child process and speaks line-delimited JSON-RPC
//! over its stdin/stdout (one JSON object per line). A background reader
//! dispatches responses by id; stderr is forwarded into the log.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::StdioConnection;
use super::encoding::TextCodec;
use super::errors::McpError;
use super::transport::{
    next_request_id, reply_to_server_request, IncomingMessage, PendingRequests, Transport,
};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for graceful exit after stdin is closed, before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Environment ─────────────────────────────────────────────────────────────

/// Merge per-server overrides onto a copy of the ambient environment.
///
/// The inherited `PATH` survives unless `overrides` sets it explicitly.
pub fn merge_environment<I>(ambient: I, overrides: &HashMap<String, String>) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: HashMap<String, String> = ambient.into_iter().collect();
    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
    env
}

// ─── Line Writer ─────────────────────────────────────────────────────────────

/// Serialises messages onto the child's stdin, one per line.
struct LineWriter {
    server_name: String,
    codec: TextCodec,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
}

impl LineWriter {
    async fn send<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let mut json = serde_json::to_string(message).map_err(|e| self.error(format!(
            "failed to serialize message: {e}"
        )))?;
        json.push('\n');

        let bytes = self.codec.encode(&json).ok_or_else(|| {
            self.error(format!("message not representable in {}", self.codec.name()))
        })?;

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| self.error("stdin already closed".into()))?;
        stdin
            .write_all(&bytes)
            .await
            .map_err(|e| self.error(format!("failed to write to stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| self.error(format!("failed to flush stdin: {e}")))
    }

    /// Close stdin, signalling EOF to the server.
    async fn shutdown(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
    }

    fn error(&self, reason: String) -> McpError {
        McpError::Transport {
            server: self.server_name.clone(),
            reason,
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Arc<LineWriter>,
    pending: PendingRequests,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Spawn the configured command and wire its stdio for JSON-RPC.
    ///
    /// The connection timeout caps process creation and pipe capture only;
    /// the handshake has its own deadline. If the cap is exceeded (or `cancel`
    /// fires) the child is killed before returning.
    pub async fn spawn(
        name: &str,
        config: &StdioConnection,
        cancel: &CancellationToken,
    ) -> Result<Self, McpError> {
        let codec = TextCodec::new(config.encoding_label(), config.encoding_error_handler)
            .ok_or_else(|| McpError::Config {
                reason: format!(
                    "server '{name}': unknown encoding '{}'",
                    config.encoding_label()
                ),
            })?;

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.env_clear();
        cmd.envs(merge_environment(std::env::vars(), &config.env));
        if let Some(dir) = config.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let timeout = config.connection_timeout();
        let started = Instant::now();
        tracing::debug!(
            server = name,
            command = %config.command,
            args = ?config.args,
            "spawning stdio server"
        );

        let mut child = cmd.spawn().map_err(|e| McpError::ConnectionFailed {
            server: name.to_string(),
            reason: format!("failed to spawn '{}': {e}", config.command),
        })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill().await;
                return Err(McpError::ConnectionFailed {
                    server: name.to_string(),
                    reason: "failed to capture stdio pipes".into(),
                });
            }
        };
        let stderr = child.stderr.take();

        check_established(name, &mut child, cancel, started, timeout).await?;

        let transport = Self::from_pipes(name, codec, stdin, stdout, stderr);
        *transport.child.lock().await = Some(child);
        Ok(transport)
    }

    /// Build a transport over already-captured pipes and start its reader.
    fn from_pipes(
        name: &str,
        codec: TextCodec,
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: Option<ChildStderr>,
    ) -> Self {
        let writer = Arc::new(LineWriter {
            server_name: name.to_string(),
            codec,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
        });
        let pending = PendingRequests::new(name);

        let mut tasks = vec![tokio::spawn(read_loop(
            name.to_string(),
            codec,
            stdout,
            pending.clone(),
            Arc::clone(&writer),
        ))];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(forward_stderr(name.to_string(), codec, stderr)));
        }

        Self {
            server_name: name.to_string(),
            writer,
            pending,
            child: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(tasks),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let guard = self.pending.register(id)?;
        self.writer.send(&JsonRpcRequest::new(id, method, params)).await?;
        guard.wait().await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.writer.send(&JsonRpcNotification::new(method, params)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.pending.close("connection closed");
        self.writer.shutdown().await;

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.server_name, %status, "stdio server exited");
                }
                _ => {
                    tracing::debug!(server = %self.server_name, "stdio server did not exit, killing");
                    if let Err(e) = child.kill().await {
                        return Err(McpError::Transport {
                            server: self.server_name.clone(),
                            reason: format!("failed to kill server process: {e}"),
                        });
                    }
                }
            }
        }

        let tasks: Vec<_> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for task in tasks {
            task.abort();
        }
        Ok(())
    }
}

/// Kill `child` and fail if setup was cancelled or ran past `timeout`.
async fn check_established(
    name: &str,
    child: &mut Child,
    cancel: &CancellationToken,
    started: Instant,
    timeout: Duration,
) -> Result<(), McpError> {
    let err = if cancel.is_cancelled() {
        McpError::Cancelled {
            server: name.to_string(),
        }
    } else if started.elapsed() > timeout {
        McpError::ConnectionTimeout {
            server: name.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else {
        return Ok(());
    };
    let _ = child.kill().await;
    Err(err)
}

// ─── Background Tasks ────────────────────────────────────────────────────────

async fn read_loop(
    server: String,
    codec: TextCodec,
    stdout: ChildStdout,
    pending: PendingRequests,
    writer: Arc<LineWriter>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::debug!(server = %server, "server stdout closed");
                pending.close("server stdout closed (process may have exited)");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "failed to read from stdout");
                pending.close(&format!("failed to read from stdout: {e}"));
                return;
            }
        }

        let Some(line) = codec.decode(&buf) else {
            tracing::warn!(server = %server, encoding = codec.name(), "malformed bytes on stdout");
            pending.close(&format!("malformed {} bytes from server", codec.name()));
            return;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match IncomingMessage::parse(trimmed) {
            Some(IncomingMessage::Response(resp)) => {
                if !pending.complete(resp) {
                    tracing::debug!(server = %server, "dropping response with no waiter");
                }
            }
            Some(IncomingMessage::Notification { method }) => {
                tracing::debug!(server = %server, method = %method, "server notification");
            }
            Some(IncomingMessage::Request { id, method }) => {
                let reply = reply_to_server_request(id, &method);
                if let Err(e) = writer.send(&reply).await {
                    tracing::warn!(server = %server, method = %method, error = %e, "failed to answer server request");
                }
            }
            None => {
                // Not JSON-RPC, probably server log output on stdout.
                tracing::debug!(server = %server, line = %trimmed, "ignoring non-JSON-RPC output");
            }
        }
    }
}

/// Drain stderr into the log until EOF.
///
/// Undecodable lines are logged lossily; the pipe must stay open so the
/// server never sees EPIPE on its diagnostics.
async fn forward_stderr(server: String, codec: TextCodec, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "failed to read from stderr");
                return;
            }
        }

        let line = codec
            .decode(&buf)
            .unwrap_or_else(|| String::from_utf8_lossy(&buf));
        let line = line.trim_end();
        if !line.is_empty() {
            tracing::debug!(server = %server, stderr = %line, "server stderr");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ambient() -> Vec<(String, String)> {
        vec![
            ("PATH".to_string(), "/usr/bin:/bin".to_string()),
            ("HOME".to_string(), "/home/u".to_string()),
        ]
    }

    #[test]
    fn test_merge_keeps_inherited_path() {
        let overrides = HashMap::from([("API_KEY".to_string(), "k".to_string())]);
        let env = merge_environment(ambient(), &overrides);
        assert_eq!(env["PATH"], "/usr/bin:/bin");
        assert_eq!(env["API_KEY"], "k");
        assert_eq!(env["HOME"], "/home/u");
    }

    #[test]
    fn test_merge_explicit_path_wins() {
        let overrides = HashMap::from([("PATH".to_string(), "/opt/bin".to_string())]);
        let env = merge_environment(ambient(), &overrides);
        assert_eq!(env["PATH"], "/opt/bin");
    }

    #[tokio::test]
    async fn test_spawn_missing_command_fails() {
        let config = StdioConnection::new("/nonexistent/definitely-not-a-server");
        let err = StdioTransport::spawn("ghost", &config, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::ConnectionFailed { ref server, .. } if server == "ghost"));
    }

    #[tokio::test]
    async fn test_spawn_unknown_encoding_fails() {
        let mut config = StdioConnection::new("cat");
        config.encoding = Some("klingon-8".into());
        let err = StdioTransport::spawn("x", &config, &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::Config { .. }));
    }

    #[tokio::test]
    async fn test_spawn_when_cancelled_kills_child() {
        let token = CancellationToken::new();
        token.cancel();
        let config = StdioConnection::new("cat");
        let err = StdioTransport::spawn("x", &config, &token).await.err().unwrap();
        assert!(matches!(err, McpError::Cancelled { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_establishment_past_deadline_kills_child() {
        let mut child = Command::new("sleep")
            .arg("5")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let started = Instant::now()
            .checked_sub(Duration::from_secs(1))
            .unwrap_or_else(Instant::now);

        let err = check_established(
            "slow",
            &mut child,
            &CancellationToken::new(),
            started,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();

        assert!(
            matches!(err, McpError::ConnectionTimeout { ref server, timeout_ms: 10 } if server == "slow")
        );
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_establishment_within_deadline_keeps_child() {
        let mut child = Command::new("sleep")
            .arg("5")
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        check_established(
            "fast",
            &mut child,
            &CancellationToken::new(),
            Instant::now(),
            Duration::from_secs(30),
        )
        .await
        .unwrap();

        assert!(child.try_wait().unwrap().is_none());
        child.kill().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_survives_non_utf8_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("alive");
        let script = format!(
            "printf '\\377\\n' >&2; sleep 0.3; echo still here >&2; touch '{}'",
            marker.display()
        );
        let mut config = StdioConnection::new("sh");
        config.args = vec!["-c".into(), script];

        let transport = StdioTransport::spawn("noisy", &config, &CancellationToken::new())
            .await
            .unwrap();

        let mut alive = false;
        for _ in 0..50 {
            if marker.exists() {
                alive = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(alive, "server died after writing non-UTF-8 to stderr");

        let _ = transport.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_fails_when_server_exits() {
        // `true` exits immediately; stdout closes and the waiter is released.
        let config = StdioConnection::new("true");
        let transport = StdioTransport::spawn("short-lived", &config, &CancellationToken::new())
            .await
            .unwrap();
        let err = transport.request("initialize", None).await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
        transport.close().await.unwrap();
        transport.close().await.unwrap();
    }
}
