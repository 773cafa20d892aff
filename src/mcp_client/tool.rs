//! Tool invocation adapter.
//!
//! Wraps one remote tool behind a free-text `call(input) -> String` surface.
//! The input is resolved to structured arguments by trying, in order:
//!
//! 1. a JSON object, used verbatim;
//! 2. comma-separated numbers, when every declared parameter is a number and
//!    the piece count equals the number of required parameters. Pieces are
//!    assigned to the required names in lexicographic order, so `"3,5"`
//!    against required `{b, a}` yields `{a: 3, b: 5}`;
//! 3. the raw input as the value of the only parameter, when exactly one
//!    parameter is declared and it is a string.
//!
//! Failures never surface as `Err`: parse and transport failures become
//! `Error: ...` text, and a remote `isError` result is returned as its text.
//! An attached [`ToolHook`] still sees every failure as an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::connection::Connection;
use super::errors::McpError;
use super::types::{CallToolResult, Content, ParamKind, ToolDefinition, ToolSchema};

/// Default timeout for one tool invocation.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(30_000);

// ─── Traits ──────────────────────────────────────────────────────────────────

/// A named callable that takes free text and answers with text.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn call(&self, input: &str) -> String;
}

/// Observer for tool invocations.
///
/// `on_tool_start` fires first, then exactly one of `on_tool_error` or
/// `on_tool_end`.
pub trait ToolHook: Send + Sync {
    fn on_tool_start(&self, _tool: &str, _input: &str) {}
    fn on_tool_end(&self, _tool: &str, _output: &str) {}
    fn on_tool_error(&self, _tool: &str, _error: &McpError) {}
}

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// Output text plus the error signal hooks receive.
///
/// `output` can be empty while `error` is set: a remote error with no text.
#[derive(Debug)]
pub struct ToolOutcome {
    pub output: String,
    pub error: Option<McpError>,
}

impl ToolOutcome {
    fn ok(output: String) -> Self {
        Self {
            output,
            error: None,
        }
    }

    fn failed(output: String, error: McpError) -> Self {
        Self {
            output,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

// ─── McpTool ─────────────────────────────────────────────────────────────────

/// A remote tool bound to the connection it was discovered on.
pub struct McpTool {
    server_name: String,
    definition: ToolDefinition,
    schema: ToolSchema,
    connection: Arc<dyn Connection>,
    hook: Option<Arc<dyn ToolHook>>,
    timeout: Duration,
}

impl McpTool {
    pub fn new(server_name: &str, definition: ToolDefinition, connection: Arc<dyn Connection>) -> Self {
        let schema = ToolSchema::from_json_schema(&definition.input_schema);
        Self {
            server_name: server_name.to_string(),
            definition,
            schema,
            connection,
            hook: None,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ToolHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Server this tool was discovered on.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    /// The raw JSON Schema the server declared.
    pub fn input_schema(&self) -> &Value {
        &self.definition.input_schema
    }

    /// Invoke the tool, keeping the error signal alongside the output.
    pub async fn call_with_outcome(&self, input: &str) -> ToolOutcome {
        tracing::debug!(
            server = %self.server_name,
            tool = %self.definition.name,
            input = %input,
            "tool call received"
        );
        if let Some(hook) = &self.hook {
            hook.on_tool_start(self.name(), input);
        }

        let outcome = self.execute(input).await;

        if let Some(hook) = &self.hook {
            match &outcome.error {
                Some(err) => hook.on_tool_error(self.name(), err),
                None => hook.on_tool_end(self.name(), &outcome.output),
            }
        }
        outcome
    }

    async fn execute(&self, input: &str) -> ToolOutcome {
        let name = self.definition.name.as_str();

        let arguments = match resolve_arguments(name, &self.schema, input) {
            Ok(arguments) => arguments,
            Err(err) => {
                tracing::warn!(server = %self.server_name, tool = name, error = %err, "tool input rejected");
                return ToolOutcome::failed(format!("Error: {err}"), err);
            }
        };

        let call = self.connection.call_tool(name, arguments);
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                tracing::warn!(server = %self.server_name, tool = name, error = %err, "tool call failed");
                return ToolOutcome::failed(format!("Error calling tool {name}: {err}"), err);
            }
            Err(_) => {
                let err = McpError::Timeout {
                    operation: format!("tool call '{name}'"),
                    timeout_ms: self.timeout.as_millis() as u64,
                };
                tracing::warn!(server = %self.server_name, tool = name, error = %err, "tool call timed out");
                return ToolOutcome::failed(format!("Error calling tool {name}: {err}"), err);
            }
        };

        let output = render_result(&result);
        if result.is_error {
            tracing::warn!(server = %self.server_name, tool = name, output = %output, "tool reported an error");
            let err = McpError::RemoteExecution {
                tool: name.to_string(),
                message: output.clone(),
            };
            return ToolOutcome::failed(output, err);
        }

        tracing::debug!(server = %self.server_name, tool = name, "tool call succeeded");
        ToolOutcome::ok(output)
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    async fn call(&self, input: &str) -> String {
        self.call_with_outcome(input).await.output
    }
}

impl std::fmt::Debug for McpTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpTool")
            .field("server", &self.server_name)
            .field("name", &self.definition.name)
            .finish_non_exhaustive()
    }
}

// ─── Argument Resolution ─────────────────────────────────────────────────────

/// Resolve free-text `input` into tool arguments.
pub fn resolve_arguments(
    tool: &str,
    schema: &ToolSchema,
    input: &str,
) -> Result<Map<String, Value>, McpError> {
    let json_err = match serde_json::from_str::<Map<String, Value>>(input) {
        Ok(arguments) => return Ok(arguments),
        Err(e) => e,
    };

    if let Some(arguments) = positional_numbers(schema, input) {
        tracing::debug!(tool, "resolved input as comma-separated numbers");
        return Ok(arguments);
    }

    if let Some(param) = schema
        .single_param()
        .filter(|p| p.kind == ParamKind::String)
    {
        tracing::debug!(tool, param = %param.name, "using input as single string argument");
        let mut arguments = Map::new();
        arguments.insert(param.name.clone(), Value::String(input.to_string()));
        return Ok(arguments);
    }

    Err(McpError::ArgumentParse {
        tool: tool.to_string(),
        input: input.to_string(),
        reason: json_err.to_string(),
    })
}

fn positional_numbers(schema: &ToolSchema, input: &str) -> Option<Map<String, Value>> {
    if !schema.all_numbers() {
        return None;
    }
    let required = schema.required_names();
    let pieces: Vec<&str> = input.split(',').map(str::trim).collect();
    if pieces.len() != required.len() {
        return None;
    }

    let mut arguments = Map::new();
    for (name, piece) in required.iter().zip(pieces) {
        let number = piece.parse::<f64>().ok()?;
        // NaN and infinities are not representable in JSON.
        let number = serde_json::Number::from_f64(number)?;
        arguments.insert(name.clone(), Value::Number(number));
    }
    Some(arguments)
}

// ─── Rendering ───────────────────────────────────────────────────────────────

/// Join the text fragments of a result with `\n`. Other kinds are skipped.
pub fn render_result(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| match c {
            Content::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
