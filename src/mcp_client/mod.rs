//! MCP Client: concurrent connections to many MCP servers.
//!
//! This module handles:
//! - Spawning stdio servers and opening SSE sessions
//! - JSON-RPC 2.0 request/response routing over either transport
//! - Per-server `initialize` handshake and tool discovery, run in parallel
//! - Adapting free-text tool input to structured arguments
//! - Converting server prompts into chat messages
//!
//! [`MultiServerClient`] is the entry point; the tools it returns can be
//! called directly and never talk back to the client.

pub mod client;
pub mod config;
pub mod connection;
pub mod encoding;
pub mod errors;
pub mod loader;
pub mod prompt;
pub mod registry;
pub mod sse;
pub mod stdio;
pub mod tool;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{ClientPhase, MultiServerClient};
pub use config::{
    load_servers_config, ConnectionConfig, EncodingErrorHandler, ServersConfig, SseConnection,
    StdioConnection,
};
pub use connection::{Connection, ConnectionFactory, TransportFactory};
pub use errors::McpError;
pub use prompt::ChatMessage;
pub use registry::ToolRegistry;
pub use tool::{McpTool, Tool, ToolHook, ToolOutcome};
pub use types::{ClientCapabilities, Implementation, PromptArguments};
