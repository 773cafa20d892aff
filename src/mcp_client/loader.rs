//! Per-server handshake and tool discovery.

use std::sync::Arc;
use std::time::Duration;

use super::connection::Connection;
use super::errors::McpError;
use super::tool::McpTool;
use super::types::{ClientCapabilities, Implementation, InitializeParams, PROTOCOL_VERSION};

/// Run `initialize`, then `tools/list`, and wrap every tool for `connection`.
///
/// Each step is bounded by `timeout`. A failure names the server and the
/// step that failed.
pub async fn initialize_and_load(
    server: &str,
    connection: &Arc<dyn Connection>,
    identity: &Implementation,
    capabilities: &ClientCapabilities,
    timeout: Duration,
) -> Result<Vec<McpTool>, McpError> {
    let params = InitializeParams {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: capabilities.clone(),
        client_info: identity.clone(),
    };

    tracing::debug!(server, timeout_ms = timeout.as_millis() as u64, "sending initialize");
    let init = tokio::time::timeout(timeout, connection.initialize(params))
        .await
        .map_err(|_| McpError::HandshakeFailed {
            server: server.to_string(),
            reason: format!("timed out after {}ms", timeout.as_millis()),
        })?
        .map_err(|e| McpError::HandshakeFailed {
            server: server.to_string(),
            reason: e.to_string(),
        })?;

    tracing::debug!(
        server,
        server_info_name = %init.server_info.name,
        server_info_version = %init.server_info.version,
        protocol_version = %init.protocol_version,
        "initialize succeeded"
    );

    let definitions = tokio::time::timeout(timeout, connection.list_tools())
        .await
        .map_err(|_| McpError::CapabilityListFailed {
            server: server.to_string(),
            reason: format!("timed out after {}ms", timeout.as_millis()),
        })?
        .map_err(|e| McpError::CapabilityListFailed {
            server: server.to_string(),
            reason: e.to_string(),
        })?;

    tracing::debug!(server, count = definitions.len(), "loaded tools");

    Ok(definitions
        .into_iter()
        .map(|def| McpTool::new(server, def, Arc::clone(connection)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::tool::Tool;
    use crate::mcp_client::types::{
        CallToolResult, GetPromptResult, InitializeResult, PromptArguments, ToolDefinition,
    };
    use async_trait::async_trait;
    use serde_json::{json, Map, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct StepConnection {
        fail_initialize: bool,
        fail_list: bool,
        stall_initialize: bool,
        seen_identity: Mutex<Option<Implementation>>,
    }

    #[async_trait]
    impl Connection for StepConnection {
        async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult, McpError> {
            *self.seen_identity.lock().unwrap() = Some(params.client_info);
            if self.stall_initialize {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.fail_initialize {
                return Err(McpError::Server {
                    code: -32603,
                    message: "init exploded".into(),
                    data: None,
                });
            }
            Ok(serde_json::from_value(json!({"serverInfo": {"name": "x", "version": "1"}})).unwrap())
        }

        async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
            if self.fail_list {
                return Err(McpError::Server {
                    code: -32601,
                    message: "no tools capability".into(),
                    data: None,
                });
            }
            Ok(vec![
                serde_json::from_value(json!({"name": "add"})).unwrap(),
                serde_json::from_value(json!({"name": "echo"})).unwrap(),
            ])
        }

        async fn call_tool(&self, _: &str, _: Map<String, Value>) -> Result<CallToolResult, McpError> {
            unreachable!()
        }

        async fn get_prompt(&self, _: &str, _: PromptArguments) -> Result<GetPromptResult, McpError> {
            unreachable!()
        }

        async fn close(&self) -> Result<(), McpError> {
            Ok(())
        }
    }

    async fn load(conn: StepConnection, timeout: Duration) -> Result<Vec<McpTool>, McpError> {
        let conn: Arc<dyn Connection> = Arc::new(conn);
        initialize_and_load(
            "srv",
            &conn,
            &Implementation::new("client", "2.0"),
            &ClientCapabilities::default(),
            timeout,
        )
        .await
    }

    #[tokio::test]
    async fn test_loads_all_tools_bound_to_server() {
        let tools = load(StepConnection::default(), Duration::from_secs(1)).await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["add", "echo"]);
        assert!(tools.iter().all(|t| t.server_name() == "srv"));
    }

    #[tokio::test]
    async fn test_handshake_failure_is_wrapped() {
        let conn = StepConnection {
            fail_initialize: true,
            ..Default::default()
        };
        let err = load(conn, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, McpError::HandshakeFailed { ref server, .. } if server == "srv"));
        assert!(err.to_string().contains("init exploded"));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let conn = StepConnection {
            stall_initialize: true,
            ..Default::default()
        };
        let err = load(conn, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, McpError::HandshakeFailed { .. }));
        assert!(err.to_string().contains("timed out after 20ms"));
    }

    #[tokio::test]
    async fn test_list_failure_is_wrapped() {
        let conn = StepConnection {
            fail_list: true,
            ..Default::default()
        };
        let err = load(conn, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, McpError::CapabilityListFailed { .. }));
    }

    #[tokio::test]
    async fn test_identity_is_sent() {
        let conn = Arc::new(StepConnection::default());
        let dyn_conn: Arc<dyn Connection> = conn.clone();
        initialize_and_load(
            "srv",
            &dyn_conn,
            &Implementation::new("client", "2.0"),
            &ClientCapabilities::default(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(
            conn.seen_identity.lock().unwrap().clone(),
            Some(Implementation::new("client", "2.0"))
        );
    }
}
