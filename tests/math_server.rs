//! End-to-end tests against the `math_server` demo binary over stdio.

use std::collections::HashMap;
use std::sync::Arc;

use mcp_multiclient::mcp_client::{
    ChatMessage, ClientCapabilities, ClientPhase, ConnectionConfig, Implementation,
    PromptArguments, StdioConnection,
};
use mcp_multiclient::{McpError, MultiServerClient, Tool};

fn math_server() -> StdioConnection {
    StdioConnection::new(env!("CARGO_BIN_EXE_math_server"))
}

fn client(servers: Vec<(&str, StdioConnection)>) -> MultiServerClient {
    let configs: HashMap<String, ConnectionConfig> = servers
        .into_iter()
        .map(|(name, conn)| (name.to_string(), conn.into()))
        .collect();
    MultiServerClient::new(
        configs,
        Implementation::new("integration", "1.0"),
        ClientCapabilities::default(),
    )
}

#[tokio::test]
async fn discovers_and_calls_tools() {
    let client = client(vec![("math", math_server())]);
    client.start().await.unwrap();

    let mut names: Vec<String> = client.get_tools().iter().map(|t| t.name().to_string()).collect();
    names.sort();
    assert_eq!(names, vec!["add", "echo", "multiply"]);

    let tools = client.tools_for_server("math");
    let add = tools.iter().find(|t| t.name() == "add").unwrap();
    let multiply = tools.iter().find(|t| t.name() == "multiply").unwrap();
    let echo = tools.iter().find(|t| t.name() == "echo").unwrap();

    assert_eq!(add.call("3,5").await, "8.000000");
    assert_eq!(multiply.call(r#"{"a": 7, "b": 6}"#).await, "42.000000");
    assert_eq!(echo.call("hello world").await, "hello world");

    // Neither piece is a number and there is no single string parameter.
    let output = add.call("three,five").await;
    assert!(output.starts_with("Error: failed to parse tool input 'three,five'"));

    client.close().await.unwrap();
    assert_eq!(client.state(), ClientPhase::Closed);
}

#[tokio::test]
async fn remote_error_is_returned_as_text() {
    let client = client(vec![("math", math_server())]);
    client.start().await.unwrap();

    let add = client
        .tools_for_server("math")
        .into_iter()
        .find(|t| t.name() == "add")
        .unwrap();
    let outcome = add.call_with_outcome(r#"{"a": "x", "b": 1}"#).await;
    assert_eq!(outcome.output, "invalid number arguments");
    assert!(matches!(outcome.error, Some(McpError::RemoteExecution { .. })));

    client.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_calls_share_one_connection() {
    let client = client(vec![("math", math_server())]);
    client.start().await.unwrap();

    let add = client
        .tools_for_server("math")
        .into_iter()
        .find(|t| t.name() == "add")
        .unwrap();

    let calls: Vec<_> = (0..20)
        .map(|i| {
            let add = Arc::clone(&add);
            tokio::spawn(async move { (i, add.call(&format!("{i},1")).await) })
        })
        .collect();
    for call in calls {
        let (i, output) = call.await.unwrap();
        assert_eq!(output, format!("{:.6}", i as f64 + 1.0));
    }

    client.close().await.unwrap();
}

#[tokio::test]
async fn failing_handshake_is_isolated() {
    let mut broken = math_server();
    broken
        .env
        .insert("MATH_SERVER_FAIL_INIT".into(), "1".into());
    let missing = StdioConnection::new("/nonexistent/mcp-server");

    let client = client(vec![
        ("math", math_server()),
        ("broken", broken),
        ("missing", missing),
    ]);

    let err = client.start().await.unwrap_err();
    assert_eq!(err.failed_servers(), vec!["broken", "missing"]);
    assert_eq!(client.running_servers(), vec!["math"]);
    assert_eq!(client.tool_count(), 3);

    client.close().await.unwrap();
    client.close().await.unwrap();
    assert!(client.running_servers().is_empty());
}

#[tokio::test]
async fn prompt_is_converted_and_unsupported_fragments_skipped() {
    let client = client(vec![("math", math_server())]);
    client.start().await.unwrap();

    let arguments = PromptArguments::from([("name".to_string(), "Ada".to_string())]);
    let messages = client.get_prompt("math", "greet", arguments).await.unwrap();
    assert_eq!(
        messages,
        vec![
            ChatMessage::Human("Say hello to Ada.".into()),
            ChatMessage::Ai("Hello, Ada!".into()),
        ]
    );

    let err = client
        .get_prompt("math", "nope", PromptArguments::new())
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Server { .. }));

    client.close().await.unwrap();
}
