pub mod mcp_client;

pub use mcp_client::{
    load_servers_config, ConnectionConfig, McpError, McpTool, MultiServerClient, ServersConfig,
    Tool, ToolHook,
};

/// Return the platform-standard config directory for mcp-multiclient.
///
/// - macOS: `~/Library/Application Support/mcp-multiclient/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-multiclient\`
/// - Linux: `$XDG_CONFIG_HOME/mcp-multiclient/` (fallback `~/.config/...`)
///
/// Falls back to `~/.mcp-multiclient/` only if none of the above can be resolved.
pub fn config_dir() -> std::path::PathBuf {
    if let Some(dir) = dirs::config_dir() {
        return dir.join("mcp-multiclient");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".mcp-multiclient")
}

/// Default servers file: `servers.yaml` in [`config_dir`].
pub fn default_servers_config() -> std::path::PathBuf {
    config_dir().join("servers.yaml")
}

/// Initialize the tracing subscriber: writes logs to stderr.
///
/// Stdout is left alone so a process can itself serve MCP over stdio.
/// `RUST_LOG` overrides the default filter; `MCP_LOG_FORMAT=json` switches to
/// one JSON object per event.
pub fn init_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_multiclient=info,warn"));

    let json = std::env::var("MCP_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    // `try_init` so tests and embedding hosts that already set a subscriber are fine.
    let _ = if json {
        builder.json().with_ansi(false).try_init()
    } else {
        builder.try_init()
    };

    tracing::debug!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "tracing initialized");
}
