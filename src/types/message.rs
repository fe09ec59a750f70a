use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Identifier of a message, unique within its conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Author of a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Text typed by the person chatting.
    User,

    /// Text produced by the completion endpoint.
    Assistant,

    /// Instructions that frame the conversation.
    System,
}

impl Role {
    /// Returns the wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One turn of a conversation.
///
/// `streaming` is only ever true on the ephemeral message that is still
/// receiving tokens; committed messages always carry `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Identifier, unique within the conversation.
    pub id: MessageId,

    /// Author of the message.
    pub role: Role,

    /// Message text.
    pub content: String,

    /// When the message was created.
    #[serde(rename = "timestamp", with = "crate::utils::time")]
    pub created_at: OffsetDateTime,

    /// Whether tokens are still being appended.
    #[serde(rename = "isStreaming", default, skip_serializing_if = "std::ops::Not::not")]
    pub streaming: bool,
}

impl Message {
    /// Creates a new, committed message stamped with the current time.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            role,
            content: content.into(),
            created_at: crate::utils::time::now(),
            streaming: false,
        }
    }

    /// Creates a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Creates the empty assistant placeholder that accumulates streamed tokens.
    pub fn streaming_placeholder() -> Self {
        Self {
            streaming: true,
            ..Self::assistant(String::new())
        }
    }
}
