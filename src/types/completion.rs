//! Request and response shapes of the chat completion endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Message, Role};

/// A `{role, content}` pair as sent to the completion endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author of the message.
    pub role: Role,

    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Creates a new chat message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Creates a user chat message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates an assistant chat message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

impl From<&Message> for ChatMessage {
    fn from(message: &Message) -> Self {
        Self::new(message.role, message.content.clone())
    }
}

/// Body of `POST {base}/v1/chat/completions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionRequest<'a> {
    /// Model name.
    pub model: &'a str,

    /// Full conversation history; the endpoint keeps no state between calls.
    pub messages: &'a [ChatMessage],

    /// Whether the response is an event stream.
    pub stream: bool,
}

/// Extracts the token text of one streamed chunk.
///
/// Reads `choices[0].delta.content`, falling back to `choices[0].text`.
pub fn extract_token_text(chunk: &Value) -> Option<&str> {
    chunk
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .or_else(|| chunk.pointer("/choices/0/text").and_then(Value::as_str))
}

/// Extracts the assistant text of a non-streaming response.
///
/// Reads `choices[0].message.content`, falling back to `choices[0].text`.
pub fn extract_message_text(response: &Value) -> Option<&str> {
    response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .or_else(|| response.pointer("/choices/0/text").and_then(Value::as_str))
}
