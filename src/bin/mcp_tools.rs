//! Command-line driver for the multi-server client.
//!
//! ```bash
//! mcp_tools list
//! mcp_tools call math add '{"a": 1, "b": 2}'
//! mcp_tools --config ./servers.yaml prompt math greet name=Ada
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use mcp_multiclient::mcp_client::{ChatMessage, PromptArguments};
use mcp_multiclient::{load_servers_config, MultiServerClient, Tool};

#[derive(Parser, Debug)]
#[command(name = "mcp_tools", version, about = "Start MCP servers and use their tools")]
struct Args {
    /// Servers file (YAML or JSON).
    #[arg(long, default_value_os_t = mcp_multiclient::default_servers_config())]
    config: PathBuf,

    /// Per-call tool timeout in milliseconds.
    #[arg(long)]
    call_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every loaded tool (the default)
    List,

    /// Invoke one tool with a free-text instruction
    Call {
        server: String,
        tool: String,
        /// JSON object, comma-separated numbers, or plain text
        input: String,
    },

    /// Render a server prompt as chat messages
    Prompt {
        server: String,
        name: String,
        /// Prompt arguments as KEY=VALUE
        #[arg(value_parser = parse_key_value)]
        args: Vec<(String, String)>,
    },
}

fn parse_key_value(pair: &str) -> Result<(String, String), String> {
    pair.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("'{pair}' is not KEY=VALUE"))
}

async fn run(client: &MultiServerClient, command: Command) -> anyhow::Result<()> {
    match command {
        Command::List => {
            for (server, tool, description) in client.tool_summary() {
                println!("{server}\t{tool}\t{description}");
            }
        }
        Command::Call {
            server,
            tool,
            input,
        } => {
            let Some(found) = client.get_tool(&server, &tool) else {
                bail!("server '{server}' has no tool '{tool}'");
            };
            println!("{}", found.call(&input).await);
        }
        Command::Prompt { server, name, args } => {
            let arguments: PromptArguments = args.into_iter().collect();
            for message in client.get_prompt(&server, &name, arguments).await? {
                let role = match &message {
                    ChatMessage::Human(_) => "human",
                    ChatMessage::Ai(_) => "ai",
                };
                println!("{role}: {}", message.content());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    mcp_multiclient::init_tracing();

    let config = load_servers_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let mut client = MultiServerClient::from_config(config);
    if let Some(ms) = args.call_timeout_ms {
        client.set_call_timeout(ms);
    }
    if let Err(e) = client.start().await {
        // Partial startup is fine: keep going with the servers that came up.
        tracing::warn!(error = %e, "some servers failed to start");
    }
    if client.running_servers().is_empty() {
        client.close().await.ok();
        bail!("no MCP servers are running");
    }

    let result = run(&client, args.command.unwrap_or(Command::List)).await;
    client.close().await.context("closing MCP client")?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_list() {
        let args = Args::try_parse_from(["mcp_tools"]).unwrap();
        assert!(args.command.is_none());
        assert_eq!(args.config, mcp_multiclient::default_servers_config());
    }

    #[test]
    fn test_call_takes_three_positionals() {
        let args =
            Args::try_parse_from(["mcp_tools", "--config", "s.yaml", "call", "math", "add", "3,5"])
                .unwrap();
        assert_eq!(args.config, PathBuf::from("s.yaml"));
        match args.command {
            Some(Command::Call { server, tool, input }) => {
                assert_eq!((server.as_str(), tool.as_str(), input.as_str()), ("math", "add", "3,5"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_prompt_arguments_are_key_value() {
        let args =
            Args::try_parse_from(["mcp_tools", "prompt", "math", "greet", "name=Ada", "x=a=b"])
                .unwrap();
        match args.command {
            Some(Command::Prompt { args, .. }) => assert_eq!(
                args,
                vec![
                    ("name".to_string(), "Ada".to_string()),
                    ("x".to_string(), "a=b".to_string()),
                ]
            ),
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Args::try_parse_from(["mcp_tools", "prompt", "math", "greet", "oops"]).is_err());
    }

    #[test]
    fn test_config_flag_requires_a_value() {
        assert!(Args::try_parse_from(["mcp_tools", "--config"]).is_err());
    }
}
