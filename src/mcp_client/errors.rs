//! MCP client error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Per-server setup
//! failures carry the server name so the aggregate `Startup` error can name
//! every server that failed.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Transport or process failure while establishing a connection.
    #[error("failed to connect to server '{server}': {reason}")]
    ConnectionFailed {
        server: String,
        reason: String,
    },

    /// Connection establishment exceeded its hard cap.
    #[error("connecting to server '{server}' timed out after {timeout_ms}ms")]
    ConnectionTimeout {
        server: String,
        timeout_ms: u64,
    },

    /// The `initialize` handshake failed.
    #[error("server '{server}' initialization failed: {reason}")]
    HandshakeFailed {
        server: String,
        reason: String,
    },

    /// The `tools/list` request failed.
    #[error("failed to list tools for server '{server}': {reason}")]
    CapabilityListFailed {
        server: String,
        reason: String,
    },

    /// Every argument resolution strategy was exhausted.
    #[error(
        "failed to parse tool input '{input}': not valid JSON and other parsing attempts failed: {reason}"
    )]
    ArgumentParse {
        tool: String,
        input: String,
        reason: String,
    },

    /// The remote tool reported `isError`. `message` may be empty.
    #[error("tool {tool} execution failed: {message}")]
    RemoteExecution {
        tool: String,
        message: String,
    },

    /// Operation against a server name with no live connection.
    #[error("no active session for server: {server}")]
    NoActiveSession {
        server: String,
    },

    /// `start()` was called while already starting or running.
    #[error("client already started")]
    AlreadyStarted,

    /// `start()` was called after `close()`.
    #[error("client is closed")]
    ClientClosed,

    /// JSON-RPC communication error (malformed message, I/O error, closed stream).
    #[error("transport error for server '{server}': {reason}")]
    Transport {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request did not complete within its deadline.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: String,
        timeout_ms: u64,
    },

    /// Setup was abandoned because the client is shutting down.
    #[error("setup of server '{server}' was cancelled")]
    Cancelled {
        server: String,
    },

    /// Configuration error (bad descriptor, unreadable config file).
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },

    /// A prompt message could not be converted to a chat message.
    #[error("unsupported prompt message {what}")]
    UnsupportedPrompt {
        what: String,
    },

    /// One or more servers failed during `start()`.
    #[error("failed to start {} server(s): {}", .failures.len(), describe_failures(.failures))]
    Startup {
        failures: Vec<(String, McpError)>,
    },
}

impl McpError {
    /// Names of the servers in a `Startup` error, sorted. Empty for other variants.
    pub fn failed_servers(&self) -> Vec<&str> {
        match self {
            McpError::Startup { failures } => {
                let mut names: Vec<&str> = failures.iter().map(|(n, _)| n.as_str()).collect();
                names.sort_unstable();
                names
            }
            _ => Vec::new(),
        }
    }
}

fn describe_failures(failures: &[(String, McpError)]) -> String {
    let mut parts: Vec<String> = failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect();
    parts.sort();
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_error_names_every_server() {
        let err = McpError::Startup {
            failures: vec![
                (
                    "zeta".into(),
                    McpError::HandshakeFailed {
                        server: "zeta".into(),
                        reason: "boom".into(),
                    },
                ),
                (
                    "alpha".into(),
                    McpError::ConnectionTimeout {
                        server: "alpha".into(),
                        timeout_ms: 30_000,
                    },
                ),
            ],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("failed to start 2 server(s)"));
        assert!(msg.contains("alpha: connecting to server 'alpha' timed out after 30000ms"));
        assert!(msg.contains("zeta: server 'zeta' initialization failed: boom"));
        assert_eq!(err.failed_servers(), vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_argument_parse_message_contains_input() {
        let err = McpError::ArgumentParse {
            tool: "t".into(),
            input: "not json".into(),
            reason: "expected value at line 1 column 1".into(),
        };
        assert!(err.to_string().contains("'not json'"));
    }

    #[test]
    fn test_failed_servers_empty_for_other_variants() {
        assert!(McpError::AlreadyStarted.failed_servers().is_empty());
    }
}
