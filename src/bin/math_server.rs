//! Demo MCP server over stdio.
//!
//! Tools: `add` and `multiply` over numbers `a` and `b`, and `echo` with one
//! string parameter `text`. Prompt: `greet` with argument `name`.
//!
//! Set `MATH_SERVER_FAIL_INIT=1` to make `initialize` fail.

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use mcp_multiclient::mcp_client::types::{error_codes, JsonRpcResponse, PROTOCOL_VERSION};

const SERVER_NAME: &str = "math-server";

fn tool_list() -> Value {
    let number_pair = json!({
        "type": "object",
        "properties": {
            "a": {"type": "number", "description": "First number"},
            "b": {"type": "number", "description": "Second number"}
        },
        "required": ["a", "b"]
    });
    json!({
        "tools": [
            {"name": "add", "description": "Add two numbers", "inputSchema": number_pair},
            {"name": "multiply", "description": "Multiply two numbers", "inputSchema": number_pair},
            {
                "name": "echo",
                "description": "Echo the given text",
                "inputSchema": {
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }
            }
        ]
    })
}

fn text_result(text: String, is_error: bool) -> Value {
    json!({"content": [{"type": "text", "text": text}], "isError": is_error})
}

fn call_tool(params: &Value) -> Value {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or_default();
    let number = |key: &str| args.get(key).and_then(Value::as_f64);

    match name {
        "add" | "multiply" => match (number("a"), number("b")) {
            (Some(a), Some(b)) => {
                let value = if name == "add" { a + b } else { a * b };
                text_result(format!("{value:.6}"), false)
            }
            _ => text_result("invalid number arguments".into(), true),
        },
        "echo" => match args.get("text").and_then(Value::as_str) {
            Some(text) => text_result(text.to_string(), false),
            None => text_result("missing text".into(), true),
        },
        other => text_result(format!("unknown tool: {other}"), true),
    }
}

fn get_prompt(params: &Value) -> Option<Value> {
    if params.get("name").and_then(Value::as_str) != Some("greet") {
        return None;
    }
    let who = params
        .pointer("/arguments/name")
        .and_then(Value::as_str)
        .unwrap_or("world");
    Some(json!({
        "description": "Greeting conversation",
        "messages": [
            {"role": "user", "content": {"type": "text", "text": format!("Say hello to {who}.")}},
            {"role": "assistant", "content": {"type": "text", "text": format!("Hello, {who}!")}},
            {"role": "assistant", "content": {"type": "image", "data": "", "mimeType": "image/png"}}
        ]
    }))
}

fn handle(method: &str, id: Value, params: &Value, fail_init: bool) -> JsonRpcResponse {
    match method {
        "initialize" if fail_init => {
            JsonRpcResponse::failure(id, error_codes::INTERNAL_ERROR, "initialization disabled")
        }
        "initialize" => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}, "prompts": {}},
                "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")}
            }),
        ),
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => JsonRpcResponse::success(id, tool_list()),
        "tools/call" => JsonRpcResponse::success(id, call_tool(params)),
        "prompts/get" => match get_prompt(params) {
            Some(prompt) => JsonRpcResponse::success(id, prompt),
            None => JsonRpcResponse::failure(id, error_codes::INVALID_PARAMS, "unknown prompt"),
        },
        other => JsonRpcResponse::failure(
            id,
            error_codes::METHOD_NOT_FOUND,
            &format!("method not found: {other}"),
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mcp_multiclient::init_tracing();
    let fail_init = std::env::var("MATH_SERVER_FAIL_INIT").is_ok_and(|v| v == "1");
    tracing::info!(server = SERVER_NAME, fail_init, "serving MCP over stdio");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            tracing::warn!(line = %line, "ignoring malformed input");
            continue;
        };
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        let Some(id) = message.get("id").cloned().filter(|id| !id.is_null()) else {
            tracing::debug!(method, "notification");
            continue;
        };

        let params = message.get("params").cloned().unwrap_or_default();
        let response = handle(method, id, &params, fail_init);

        let mut out = serde_json::to_string(&response).context("failed to serialize response")?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await.context("failed to write stdout")?;
        stdout.flush().await.context("failed to flush stdout")?;
    }

    tracing::info!(server = SERVER_NAME, "stdin closed, exiting");
    Ok(())
}
