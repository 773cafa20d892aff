//! Live connections to MCP servers and the factory that opens them.
//!
//! A [`Connection`] speaks the MCP methods on top of any [`Transport`]. The
//! [`ConnectionFactory`] is the only place the two descriptor variants are
//! told apart.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::config::ConnectionConfig;
use super::errors::McpError;
use super::sse::SseTransport;
use super::stdio::StdioTransport;
use super::transport::{extract_result, Transport};
use super::types::{
    CallToolResult, GetPromptResult, InitializeParams, InitializeResult, ListToolsResult,
    PromptArguments, ToolDefinition,
};

// ─── Connection ──────────────────────────────────────────────────────────────

/// One server session. Safe to call concurrently from several tools.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run the `initialize` handshake and send `notifications/initialized`.
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult, McpError>;

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<CallToolResult, McpError>;

    async fn get_prompt(
        &self,
        name: &str,
        arguments: PromptArguments,
    ) -> Result<GetPromptResult, McpError>;

    async fn close(&self) -> Result<(), McpError>;
}

/// MCP methods over a JSON-RPC transport.
pub struct RpcConnection<T> {
    server_name: String,
    transport: T,
}

impl<T: Transport> RpcConnection<T> {
    pub fn new(server_name: &str, transport: T) -> Self {
        Self {
            server_name: server_name.to_string(),
            transport,
        }
    }

    async fn call<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<R, McpError> {
        let response = self.transport.request(method, params).await?;
        let result = extract_result(response)?;
        serde_json::from_value(result).map_err(|e| McpError::Transport {
            server: self.server_name.clone(),
            reason: format!("invalid {method} result: {e}"),
        })
    }
}

#[async_trait]
impl<T: Transport> Connection for RpcConnection<T> {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult, McpError> {
        let params = serde_json::to_value(&params).map_err(|e| McpError::Transport {
            server: self.server_name.clone(),
            reason: format!("failed to serialize initialize params: {e}"),
        })?;
        let result: InitializeResult = self.call("initialize", Some(params)).await?;
        self.transport
            .notify("notifications/initialized", None)
            .await?;
        Ok(result)
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
        let result: ListToolsResult = self.call("tools/list", None).await?;
        Ok(result.tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> Result<CallToolResult, McpError> {
        self.call(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: PromptArguments,
    ) -> Result<GetPromptResult, McpError> {
        self.call(
            "prompts/get",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.transport.close().await
    }
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Opens a live connection from a descriptor.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Connect to `name`. On failure nothing is left running.
    async fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Connection>, McpError>;
}

/// Default factory: stdio descriptors spawn a process, SSE descriptors open
/// an HTTP event stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportFactory;

#[async_trait]
impl ConnectionFactory for TransportFactory {
    async fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Connection>, McpError> {
        let conn: Arc<dyn Connection> = match config {
            ConnectionConfig::Stdio(stdio) => {
                let transport = StdioTransport::spawn(name, stdio, cancel).await?;
                Arc::new(RpcConnection::new(name, transport))
            }
            ConnectionConfig::Sse(sse) => {
                let transport = SseTransport::connect(name, sse, cancel).await?;
                Arc::new(RpcConnection::new(name, transport))
            }
        };
        Ok(conn)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
