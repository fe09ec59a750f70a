use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{ChatMessage, Message, MessageId, Role};

/// Number of characters of the first message used for a new conversation's name.
const NAME_PREFIX_CHARS: usize = 30;

/// Identifier of a conversation, unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An ordered, named thread of messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Identifier, unique across the store.
    pub id: ConversationId,

    /// Short display label.
    pub name: String,

    /// Bumped on every message mutation.
    #[serde(with = "crate::utils::time")]
    pub last_updated: OffsetDateTime,

    /// Messages in send order.
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Creates an empty conversation.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ConversationId::generate(),
            name: name.into(),
            last_updated: crate::utils::time::now(),
            messages: Vec::new(),
        }
    }

    /// Derives a display name from the first message of a conversation.
    pub fn name_from_text(text: &str) -> String {
        let mut name: String = text.chars().take(NAME_PREFIX_CHARS).collect();
        if text.chars().count() > NAME_PREFIX_CHARS {
            name.push_str("...");
        }
        name
    }

    /// Returns the position of a message in this conversation.
    pub fn position_of(&self, message_id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == message_id)
    }

    /// Returns a message by identifier.
    pub fn message(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == message_id)
    }

    /// Returns the last message, if any.
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Returns the content of the first user message, if any.
    pub fn first_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Returns the history in the shape the completion endpoint expects.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(ChatMessage::from).collect()
    }

    pub(crate) fn touch(&mut self) {
        self.last_updated = crate::utils::time::now();
    }
}
