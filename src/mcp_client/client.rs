//! Multi-server MCP client: high-level interface over many servers.
//!
//! Starts every configured server concurrently, keeps the connections of the
//! ones that came up, and exposes their tools as one flat list. A server that
//! fails to connect, handshake, or list its tools is reported in the
//! aggregate error from [`MultiServerClient::start`] and never affects its
//! siblings.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::config::{ConnectionConfig, ServersConfig};
use super::connection::{Connection, ConnectionFactory, TransportFactory};
use super::errors::McpError;
use super::loader::initialize_and_load;
use super::prompt::{load_prompt, ChatMessage};
use super::registry::ToolRegistry;
use super::tool::{McpTool, ToolHook};
use super::types::{ClientCapabilities, Implementation, PromptArguments};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for tool call execution (ms).
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Identity sent in `initialize` when the caller leaves a field empty.
pub const DEFAULT_CLIENT_NAME: &str = "mcp-multiclient";
pub const DEFAULT_CLIENT_VERSION: &str = "0.1.0";

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle phase. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Created,
    Starting,
    Running,
    Closed,
}

/// Shared cancellation plus a tracker for the setup tasks.
#[derive(Clone)]
struct TaskGroup {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

struct ClientState {
    phase: ClientPhase,
    /// Connections that are currently open, usable or not.
    live: HashMap<String, Arc<dyn Connection>>,
    /// Tools of servers whose full setup succeeded.
    registry: ToolRegistry,
    group: Option<TaskGroup>,
}

type SharedState = Arc<RwLock<ClientState>>;

fn read(state: &SharedState) -> RwLockReadGuard<'_, ClientState> {
    state.read().unwrap_or_else(|e| e.into_inner())
}

fn write(state: &SharedState) -> RwLockWriteGuard<'_, ClientState> {
    state.write().unwrap_or_else(|e| e.into_inner())
}

// ─── MultiServerClient ───────────────────────────────────────────────────────

/// Client that manages connections to several MCP servers at once.
pub struct MultiServerClient {
    configs: HashMap<String, ConnectionConfig>,
    identity: Implementation,
    capabilities: ClientCapabilities,
    factory: Arc<dyn ConnectionFactory>,
    tool_hook: Option<Arc<dyn ToolHook>>,
    /// Tool call timeout in milliseconds.
    call_timeout_ms: u64,
    state: SharedState,
}

impl MultiServerClient {
    /// Create a client for `configs`. Nothing is started until [`start`](Self::start).
    pub fn new(
        configs: HashMap<String, ConnectionConfig>,
        mut identity: Implementation,
        capabilities: ClientCapabilities,
    ) -> Self {
        if identity.name.is_empty() {
            identity.name = DEFAULT_CLIENT_NAME.to_string();
        }
        if identity.version.is_empty() {
            identity.version = DEFAULT_CLIENT_VERSION.to_string();
        }

        Self {
            configs,
            identity,
            capabilities,
            factory: Arc::new(TransportFactory),
            tool_hook: None,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            state: Arc::new(RwLock::new(ClientState {
                phase: ClientPhase::Created,
                live: HashMap::new(),
                registry: ToolRegistry::new(),
                group: None,
            })),
        }
    }

    /// Create a client from a loaded servers file, with the default identity.
    pub fn from_config(config: ServersConfig) -> Self {
        Self::new(
            config.servers,
            Implementation::default(),
            ClientCapabilities::default(),
        )
    }

    /// Replace how connections are opened.
    pub fn with_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Attach a hook to every tool this client loads.
    pub fn with_tool_hook(mut self, hook: Arc<dyn ToolHook>) -> Self {
        self.tool_hook = Some(hook);
        self
    }

    /// Set the tool call timeout in milliseconds.
    pub fn set_call_timeout(&mut self, timeout_ms: u64) {
        self.call_timeout_ms = timeout_ms;
    }

    pub fn identity(&self) -> &Implementation {
        &self.identity
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect, handshake, and load tools for every configured server.
    ///
    /// Blocks until every server's setup has finished. Servers that came up
    /// stay up even when others failed; the error lists each failure.
    pub async fn start(&self) -> Result<(), McpError> {
        let group = {
            let mut state = write(&self.state);
            match state.phase {
                ClientPhase::Created => {}
                ClientPhase::Starting | ClientPhase::Running => return Err(McpError::AlreadyStarted),
                ClientPhase::Closed => return Err(McpError::ClientClosed),
            }
            let group = TaskGroup {
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            };
            state.phase = ClientPhase::Starting;
            state.group = Some(group.clone());
            group
        };

        tracing::info!(servers = self.configs.len(), "starting MCP servers");

        let handles: Vec<_> = self
            .configs
            .iter()
            .map(|(name, config)| {
                let setup = ServerSetup {
                    name: name.clone(),
                    config: config.clone(),
                    factory: Arc::clone(&self.factory),
                    identity: self.identity.clone(),
                    capabilities: self.capabilities.clone(),
                    tool_hook: self.tool_hook.clone(),
                    call_timeout: Duration::from_millis(self.call_timeout_ms),
                    state: Arc::clone(&self.state),
                    cancel: group.cancel.clone(),
                };
                (name.clone(), group.tracker.spawn(setup.run()))
            })
            .collect();
        group.tracker.close();

        let results = join_all(
            handles
                .into_iter()
                .map(|(name, handle)| async move { (name, handle.await) }),
        )
        .await;

        let mut failures = Vec::new();
        for (name, joined) in results {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.push((name, e)),
                Err(join_err) => {
                    let err = McpError::ConnectionFailed {
                        server: name.clone(),
                        reason: format!("setup task failed: {join_err}"),
                    };
                    failures.push((name, err));
                }
            }
        }

        let running = {
            let mut state = write(&self.state);
            if state.phase == ClientPhase::Starting {
                state.phase = ClientPhase::Running;
            }
            state.registry.server_names().len()
        };

        if failures.is_empty() {
            tracing::info!(running, "all MCP servers started");
            Ok(())
        } else {
            let err = McpError::Startup { failures };
            tracing::error!(running, failed = ?err.failed_servers(), "some MCP servers failed to start");
            Err(err)
        }
    }

    /// Shut down every live connection and wait for setup tasks to finish.
    ///
    /// Safe to call at any time and any number of times. Every connection is
    /// closed even if some fail; the first failure is returned.
    pub async fn close(&self) -> Result<(), McpError> {
        let group = {
            let mut state = write(&self.state);
            state.phase = ClientPhase::Closed;
            state.group.take()
        };

        if let Some(group) = &group {
            group.cancel.cancel();
        }

        // Taken after cancelling: setup tasks re-check the token under the lock
        // before registering, so nothing can be added behind this drain.
        let connections: Vec<(String, Arc<dyn Connection>)> = {
            let mut state = write(&self.state);
            state.registry.clear();
            state.live.drain().collect()
        };

        let mut first_error = None;
        let closing = connections.len();
        for (name, conn) in connections {
            if let Err(e) = conn.close().await {
                tracing::warn!(server = %name, error = %e, "failed to close connection");
                first_error.get_or_insert(e);
            } else {
                tracing::debug!(server = %name, "connection closed");
            }
        }

        if let Some(group) = group {
            group.tracker.close();
            group.tracker.wait().await;
        }

        if closing > 0 {
            tracing::info!(closed = closing, "MCP client closed");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ─── Tools & Prompts ─────────────────────────────────────────────────

    /// Every loaded tool across all servers, in no particular order.
    pub fn get_tools(&self) -> Vec<Arc<McpTool>> {
        read(&self.state).registry.all_tools()
    }

    /// Tools loaded from one server.
    pub fn tools_for_server(&self, server_name: &str) -> Vec<Arc<McpTool>> {
        read(&self.state).registry.tools_for_server(server_name)
    }

    pub fn get_tool(&self, server_name: &str, tool_name: &str) -> Option<Arc<McpTool>> {
        read(&self.state).registry.get_tool(server_name, tool_name)
    }

    /// `(server, tool, description)` for every loaded tool, sorted.
    pub fn tool_summary(&self) -> Vec<(String, String, String)> {
        read(&self.state).registry.summary()
    }

    /// Fetch a prompt from a live server and convert it to chat messages.
    pub async fn get_prompt(
        &self,
        server_name: &str,
        prompt_name: &str,
        arguments: PromptArguments,
    ) -> Result<Vec<ChatMessage>, McpError> {
        let conn = read(&self.state)
            .live
            .get(server_name)
            .cloned()
            .ok_or_else(|| McpError::NoActiveSession {
                server: server_name.to_string(),
            })?;

        load_prompt(conn.as_ref(), server_name, prompt_name, arguments).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn state(&self) -> ClientPhase {
        read(&self.state).phase
    }

    /// Get the number of registered tools.
    pub fn tool_count(&self) -> usize {
        read(&self.state).registry.len()
    }

    /// Names of servers with an open connection, sorted.
    pub fn running_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.state).live.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get names of all configured servers (including those that failed to start).
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Per-server Setup ────────────────────────────────────────────────────────

/// Everything one setup task needs, owned so the task is `'static`.
struct ServerSetup {
    name: String,
    config: ConnectionConfig,
    factory: Arc<dyn ConnectionFactory>,
    identity: Implementation,
    capabilities: ClientCapabilities,
    tool_hook: Option<Arc<dyn ToolHook>>,
    call_timeout: Duration,
    state: SharedState,
    cancel: CancellationToken,
}

impl ServerSetup {
    async fn run(self) -> Result<(), McpError> {
        let name = self.name.as_str();
        tracing::debug!(server = name, transport = self.config.transport_name(), "connecting");

        let conn = tokio::select! {
            _ = self.cancel.cancelled() => return Err(self.cancelled()),
            conn = self.factory.connect(name, &self.config, &self.cancel) => conn,
        }
        .inspect_err(|e| tracing::error!(server = name, error = %e, "failed to connect"))?;

        let registered = {
            let mut state = write(&self.state);
            if self.cancel.is_cancelled() {
                false
            } else {
                state.live.insert(self.name.clone(), Arc::clone(&conn));
                true
            }
        };
        if !registered {
            let _ = conn.close().await;
            return Err(self.cancelled());
        }
        tracing::debug!(server = name, "connected");

        let timeout = self.config.initialization_timeout();
        let loaded = tokio::select! {
            _ = self.cancel.cancelled() => Err(self.cancelled()),
            loaded = initialize_and_load(name, &conn, &self.identity, &self.capabilities, timeout) => loaded,
        };

        let tools = match loaded {
            Ok(tools) => tools,
            Err(e) => {
                tracing::error!(server = name, error = %e, "failed to initialize server");
                // If `close()` already drained the map, it owns closing too.
                let removed = write(&self.state).live.remove(name).is_some();
                if removed {
                    if let Err(close_err) = conn.close().await {
                        tracing::warn!(server = name, error = %close_err, "failed to close connection");
                    }
                }
                return Err(e);
            }
        };

        let tools: Vec<Arc<McpTool>> = tools
            .into_iter()
            .map(|tool| {
                let tool = tool.with_timeout(self.call_timeout);
                let tool = match &self.tool_hook {
                    Some(hook) => tool.with_hook(Arc::clone(hook)),
                    None => tool,
                };
                Arc::new(tool)
            })
            .collect();
        let count = tools.len();

        let stored = {
            let mut state = write(&self.state);
            if !self.cancel.is_cancelled() && state.live.contains_key(name) {
                state.registry.register_server_tools(name, tools);
                true
            } else {
                false
            }
        };
        if !stored {
            return Err(self.cancelled());
        }

        tracing::info!(server = name, tools = count, "server ready");
        Ok(())
    }

    fn cancelled(&self) -> McpError {
        McpError::Cancelled {
            server: self.name.clone(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
