//! Prompt conversion: MCP prompt messages to chat messages.

use super::connection::Connection;
use super::errors::McpError;
use super::types::{Content, PromptArguments, PromptMessage, Role};

/// A chat message produced from a prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatMessage {
    Human(String),
    Ai(String),
}

impl ChatMessage {
    pub fn content(&self) -> &str {
        match self {
            ChatMessage::Human(text) | ChatMessage::Ai(text) => text,
        }
    }
}

/// Convert one prompt message. Only text from `user` or `assistant` converts.
pub fn convert_prompt_message(message: &PromptMessage) -> Result<ChatMessage, McpError> {
    let text = match &message.content {
        Content::Text { text } => text.clone(),
        other => {
            return Err(McpError::UnsupportedPrompt {
                what: format!("content type: {}", other.kind()),
            })
        }
    };

    match message.role {
        Role::User => Ok(ChatMessage::Human(text)),
        Role::Assistant => Ok(ChatMessage::Ai(text)),
        Role::Other => Err(McpError::UnsupportedPrompt {
            what: "role".into(),
        }),
    }
}

/// Fetch a prompt and convert its messages, skipping the ones that don't convert.
pub async fn load_prompt(
    connection: &dyn Connection,
    server: &str,
    name: &str,
    arguments: PromptArguments,
) -> Result<Vec<ChatMessage>, McpError> {
    let result = connection.get_prompt(name, arguments).await?;

    let mut messages = Vec::with_capacity(result.messages.len());
    for (index, message) in result.messages.iter().enumerate() {
        match convert_prompt_message(message) {
            Ok(converted) => messages.push(converted),
            Err(e) => {
                tracing::warn!(server, prompt = name, index, error = %e, "skipping prompt message");
            }
        }
    }
    Ok(messages)
}
