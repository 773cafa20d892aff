//! Tool registry: loaded tools grouped by the server that provides them.
//!
//! Tool names are unique within one server only, so the registry is keyed by
//! server and never merges two servers' lists.

use std::collections::HashMap;
use std::sync::Arc;

use super::tool::{McpTool, Tool};

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Loaded tools across all servers.
///
/// A server is present only once its full setup succeeded.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// `server_name → tools`.
    by_server: HashMap<String, Vec<Arc<McpTool>>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tool list for a server.
    pub fn register_server_tools(&mut self, server_name: &str, tools: Vec<Arc<McpTool>>) {
        self.by_server.insert(server_name.to_string(), tools);
    }

    pub fn clear(&mut self) {
        self.by_server.clear();
    }

    /// Every tool across every server, in no particular order.
    pub fn all_tools(&self) -> Vec<Arc<McpTool>> {
        self.by_server.values().flatten().cloned().collect()
    }

    /// Tools for one server; empty if the server is not loaded.
    pub fn tools_for_server(&self, server_name: &str) -> Vec<Arc<McpTool>> {
        self.by_server.get(server_name).cloned().unwrap_or_default()
    }

    /// Look up a tool by server and tool name.
    pub fn get_tool(&self, server_name: &str, tool_name: &str) -> Option<Arc<McpTool>> {
        self.by_server
            .get(server_name)?
            .iter()
            .find(|t| t.name() == tool_name)
            .cloned()
    }

    /// Total number of tools.
    pub fn len(&self) -> usize {
        self.by_server.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Loaded server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_server.keys().cloned().collect();
        names.sort();
        names
    }

    /// `(server, tool, description)` triples sorted by server then tool.
    pub fn summary(&self) -> Vec<(String, String, String)> {
        let mut rows: Vec<_> = self
            .by_server
            .iter()
            .flat_map(|(server, tools)| {
                tools.iter().map(move |t| {
                    (
                        server.clone(),
                        t.name().to_string(),
                        t.description().to_string(),
                    )
                })
            })
            .collect();
        rows.sort();
        rows
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::connection::Connection;
    use crate::mcp_client::errors::McpError;
    use crate::mcp_client::types::{
        CallToolResult, GetPromptResult, InitializeParams, InitializeResult, PromptArguments,
        ToolDefinition,
    };
    use async_trait::async_trait;
    use serde_json::{Map, Value};

    struct Inert;

    #[async_trait]
    impl Connection for Inert {
        async fn initialize(&self, _: InitializeParams) -> Result<InitializeResult, McpError> {
            unreachable!()
        }
        async fn list_tools(&self) -> Result<Vec<ToolDefinition>, McpError> {
            unreachable!()
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

    fn tools(server: &str, names: &[&str]) -> Vec<Arc<McpTool>> {
        let conn: Arc<dyn Connection> = Arc::new(Inert);
        names
            .iter()
            .map(|n| {
                let def = ToolDefinition {
                    name: n.to_string(),
                    description: format!("{n} desc"),
                    input_schema: Value::Null,
                };
                Arc::new(McpTool::new(server, def, Arc::clone(&conn)))
            })
            .collect()
    }

    #[test]
    fn test_same_tool_name_on_two_servers() {
        let mut reg = ToolRegistry::new();
        reg.register_server_tools("math", tools("math", &["add", "echo"]));
        reg.register_server_tools("text", tools("text", &["echo"]));

        assert_eq!(reg.len(), 3);
        assert_eq!(reg.all_tools().len(), 3);
        assert_eq!(reg.get_tool("text", "echo").unwrap().server_name(), "text");
        assert!(reg.get_tool("text", "add").is_none());
        assert_eq!(reg.server_names(), vec!["math", "text"]);
    }

    #[test]
    fn test_replace_and_clear() {
        let mut reg = ToolRegistry::new();
        reg.register_server_tools("math", tools("math", &["add", "multiply"]));
        reg.register_server_tools("math", tools("math", &["add"]));
        reg.register_server_tools("text", tools("text", &["echo"]));
        assert_eq!(reg.tools_for_server("math").len(), 1);
        assert_eq!(reg.len(), 2);

        reg.clear();
        assert!(reg.is_empty());
        assert!(reg.tools_for_server("math").is_empty());
    }

    #[test]
    fn test_server_with_no_tools_is_still_loaded() {
        let mut reg = ToolRegistry::new();
        reg.register_server_tools("empty", Vec::new());
        assert_eq!(reg.server_names(), vec!["empty"]);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_summary_is_sorted() {
        let mut reg = ToolRegistry::new();
        reg.register_server_tools("b", tools("b", &["z", "y"]));
        reg.register_server_tools("a", tools("a", &["x"]));
        let summary = reg.summary();
        assert_eq!(summary[0], ("a".into(), "x".into(), "x desc".into()));
        assert_eq!(summary[1].1, "y");
        assert_eq!(summary[2].1, "z");
    }
}
