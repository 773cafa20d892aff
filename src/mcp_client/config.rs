//! Connection descriptors and servers-config loading.
//!
//! A servers config maps server names to one of two connection variants,
//! tagged by `transport`. Timeouts are given in milliseconds and fall back to
//! the defaults below when omitted.
//!
//! ```yaml
//! servers:
//!   math:
//!     transport: stdio
//!     command: ./math_server
//!     env: { RUST_LOG: debug }
//!   search:
//!     transport: sse
//!     url: http://localhost:8080/sse
//!     headers: { Authorization: "Bearer ${SEARCH_TOKEN}" }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::errors::McpError;

// ─── Defaults ────────────────────────────────────────────────────────────────

pub const DEFAULT_ENCODING: &str = "utf-8";

/// Hard cap on establishing a stdio connection.
pub const DEFAULT_STDIO_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP timeout for opening the SSE stream and for each POST.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum silence on an open SSE stream before it is considered dead.
pub const DEFAULT_SSE_READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for the `initialize` handshake, unless a descriptor overrides it.
pub const DEFAULT_INITIALIZATION_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Descriptors ─────────────────────────────────────────────────────────────

/// How malformed bytes from a stdio server are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingErrorHandler {
    /// A line with malformed bytes is a transport error.
    #[default]
    Strict,
    /// Malformed bytes are dropped.
    Ignore,
    /// Malformed bytes become U+FFFD.
    Replace,
}

/// Parameters for a server reached by spawning a subprocess.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StdioConnection {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides merged onto the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub encoding_error_handler: EncodingErrorHandler,
    #[serde(default)]
    pub connection_timeout_ms: Option<u64>,
    #[serde(default)]
    pub initialization_timeout_ms: Option<u64>,
}

impl StdioConnection {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn encoding_label(&self) -> &str {
        self.encoding.as_deref().unwrap_or(DEFAULT_ENCODING)
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_STDIO_CONNECTION_TIMEOUT)
    }
}

/// Parameters for a server reached over HTTP server-sent events.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SseConnection {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub sse_read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub initialization_timeout_ms: Option<u64>,
}

impl SseConnection {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn http_timeout(&self) -> Duration {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT)
    }

    pub fn read_timeout(&self) -> Duration {
        self.sse_read_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_SSE_READ_TIMEOUT)
    }
}

/// How to reach one server. Immutable once handed to the client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Stdio(StdioConnection),
    Sse(SseConnection),
}

impl ConnectionConfig {
    /// Handshake timeout: the descriptor's override, else the default.
    pub fn initialization_timeout(&self) -> Duration {
        let override_ms = match self {
            ConnectionConfig::Stdio(c) => c.initialization_timeout_ms,
            ConnectionConfig::Sse(c) => c.initialization_timeout_ms,
        };
        override_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_INITIALIZATION_TIMEOUT)
    }

    /// Transport label for logging.
    pub fn transport_name(&self) -> &'static str {
        match self {
            ConnectionConfig::Stdio(_) => "stdio",
            ConnectionConfig::Sse(_) => "sse",
        }
    }
}

impl From<StdioConnection> for ConnectionConfig {
    fn from(c: StdioConnection) -> Self {
        ConnectionConfig::Stdio(c)
    }
}

impl From<SseConnection> for ConnectionConfig {
    fn from(c: SseConnection) -> Self {
        ConnectionConfig::Sse(c)
    }
}

/// Top-level servers configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServersConfig {
    #[serde(default)]
    pub servers: HashMap<String, ConnectionConfig>,
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Load and parse a servers configuration file.
///
/// `.json` files are parsed as JSON, anything else as YAML. `${VAR}` and
/// `${VAR:-default}` are interpolated from the environment first.
pub fn load_servers_config(path: &Path) -> Result<ServersConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::Config {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let config: ServersConfig = if is_json {
        serde_json::from_str(&interpolated).map_err(|e| McpError::Config {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::Config {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &ServersConfig) -> Result<(), McpError> {
    for (name, conn) in &config.servers {
        let missing = match conn {
            ConnectionConfig::Stdio(c) => c.command.trim().is_empty().then_some("command"),
            ConnectionConfig::Sse(c) => c.url.trim().is_empty().then_some("url"),
        };
        if let Some(field) = missing {
            return Err(McpError::Config {
                reason: format!("server '{name}' is missing '{field}'"),
            });
        }
    }
    Ok(())
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
