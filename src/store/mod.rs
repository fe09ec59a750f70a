//! The conversation store.
//!
//! Conversations are kept newest-first, the order they were created in.  Every
//! message mutation bumps `lastUpdated` together with the content; renaming
//! does not.

pub mod persistence;

use crate::error::{Error, Result};
use crate::types::{Conversation, ConversationId, Message, MessageId, Role};

pub use persistence::{
    FileStore, KeyValueStore, MemoryStore, PersistedState, STATE_KEY, load_state, save_state,
    try_load_state,
};

/// In-memory collection of conversations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
}

impl ConversationStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store over the given conversations, kept in the order given.
    pub fn from_conversations(conversations: Vec<Conversation>) -> Self {
        Self { conversations }
    }

    /// Returns the conversations, newest first.
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    /// Consumes the store and returns its conversations.
    pub fn into_conversations(self) -> Vec<Conversation> {
        self.conversations
    }

    /// Returns the number of conversations.
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Returns true if the store holds no conversations.
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Creates an empty conversation at the front of the store.
    pub fn create(&mut self, name: impl Into<String>) -> ConversationId {
        let conversation = Conversation::new(name);
        let id = conversation.id.clone();
        self.conversations.insert(0, conversation);
        id
    }

    /// Returns a conversation by identifier.
    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == id)
    }

    /// Returns true if a conversation with this identifier exists.
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.get(id).is_some()
    }

    fn get_mut(&mut self, id: &ConversationId) -> Result<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| Error::not_found("conversation", id.as_str()))
    }

    /// Removes a conversation and returns it.
    pub fn delete(&mut self, id: &ConversationId) -> Result<Conversation> {
        let index = self
            .conversations
            .iter()
            .position(|c| &c.id == id)
            .ok_or_else(|| Error::not_found("conversation", id.as_str()))?;
        Ok(self.conversations.remove(index))
    }

    /// Appends a committed message.
    ///
    /// The stored copy is never flagged as streaming.
    pub fn append(&mut self, id: &ConversationId, mut message: Message) -> Result<()> {
        let conversation = self.get_mut(id)?;
        message.streaming = false;
        conversation.messages.push(message);
        conversation.touch();
        Ok(())
    }

    /// Keeps messages `0..=index` and returns the ones discarded.
    pub fn truncate_after(&mut self, id: &ConversationId, index: usize) -> Result<Vec<Message>> {
        let conversation = self.get_mut(id)?;
        if index >= conversation.messages.len() {
            return Err(Error::validation(
                format!(
                    "message index {index} out of range for {} messages",
                    conversation.messages.len()
                ),
                Some("index".to_string()),
            ));
        }
        let discarded = conversation.messages.split_off(index + 1);
        conversation.touch();
        Ok(discarded)
    }

    /// Removes the last message if it was written by the assistant.
    pub fn remove_trailing_assistant(&mut self, id: &ConversationId) -> Result<Option<Message>> {
        let conversation = self.get_mut(id)?;
        if conversation.last_message().map(|m| m.role) != Some(Role::Assistant) {
            return Ok(None);
        }
        let removed = conversation.messages.pop();
        conversation.touch();
        Ok(removed)
    }

    /// Replaces the content of one message.
    pub fn update_content(
        &mut self,
        id: &ConversationId,
        message_id: &MessageId,
        content: impl Into<String>,
    ) -> Result<()> {
        let conversation = self.get_mut(id)?;
        let message = conversation
            .messages
            .iter_mut()
            .find(|m| &m.id == message_id)
            .ok_or_else(|| Error::not_found("message", message_id.as_str()))?;
        message.content = content.into();
        conversation.touch();
        Ok(())
    }

    /// Renames a conversation without touching `lastUpdated`.
    pub fn rename(&mut self, id: &ConversationId, name: impl Into<String>) -> Result<()> {
        self.get_mut(id)?.name = name.into();
        Ok(())
    }

    /// Finds the conversation holding a message and the message's position in it.
    pub fn find_message(&self, message_id: &MessageId) -> Option<(ConversationId, usize)> {
        self.conversations.iter().find_map(|c| {
            c.position_of(message_id)
                .map(|index| (c.id.clone(), index))
        })
    }

    /// Returns the conversations ordered by `lastUpdated`, most recent first.
    pub fn by_recency(&self) -> Vec<&Conversation> {
        let mut conversations: Vec<&Conversation> = self.conversations.iter().collect();
        conversations.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        conversations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn store_with(messages: &[(Role, &str)]) -> (ConversationStore, ConversationId) {
        let mut store = ConversationStore::new();
        let id = store.create("test");
        for (role, text) in messages {
            store.append(&id, Message::new(*role, *text)).unwrap();
        }
        (store, id)
    }

    fn contents(store: &ConversationStore, id: &ConversationId) -> Vec<String> {
        store
            .get(id)
            .unwrap()
            .messages
            .iter()
            .map(|m| m.content.clone())
            .collect()
    }

    #[test]
    fn create_inserts_at_front() {
        let mut store = ConversationStore::new();
        let first = store.create("first");
        let second = store.create("second");
        assert_eq!(store.conversations()[0].id, second);
        assert_eq!(store.conversations()[1].id, first);
    }

    #[test]
    fn append_bumps_last_updated_and_clears_streaming() {
        let (mut store, id) = store_with(&[]);
        let before = store.get(&id).unwrap().last_updated - Duration::seconds(5);
        store.conversations[0].last_updated = before;

        store.append(&id, Message::streaming_placeholder()).unwrap();
        let conversation = store.get(&id).unwrap();
        assert!(conversation.last_updated > before);
        assert!(!conversation.messages[0].streaming);
    }

    #[test]
    fn truncate_after_keeps_prefix() {
        let (mut store, id) = store_with(&[
            (Role::User, "A"),
            (Role::Assistant, "B"),
            (Role::User, "C"),
            (Role::Assistant, "D"),
        ]);
        let discarded = store.truncate_after(&id, 0).unwrap();
        assert_eq!(contents(&store, &id), vec!["A"]);
        assert_eq!(discarded.len(), 3);
        assert!(store.truncate_after(&id, 5).unwrap_err().is_validation());
    }

    #[test]
    fn remove_trailing_assistant_only_removes_assistant() {
        let (mut store, id) = store_with(&[(Role::User, "2+2?"), (Role::Assistant, "4")]);
        let removed = store.remove_trailing_assistant(&id).unwrap();
        assert_eq!(removed.map(|m| m.content), Some("4".to_string()));
        assert_eq!(store.remove_trailing_assistant(&id).unwrap(), None);
        assert_eq!(contents(&store, &id), vec!["2+2?"]);
    }

    #[test]
    fn rename_leaves_last_updated_alone() {
        let (mut store, id) = store_with(&[(Role::User, "hi")]);
        let before = store.get(&id).unwrap().last_updated;
        store.rename(&id, "Greeting").unwrap();
        let conversation = store.get(&id).unwrap();
        assert_eq!(conversation.name, "Greeting");
        assert_eq!(conversation.last_updated, before);
    }

    #[test]
    fn missing_ids_are_not_found() {
        let mut store = ConversationStore::new();
        let missing = ConversationId::from("missing");
        assert!(store.append(&missing, Message::user("x")).unwrap_err().is_not_found());
        assert!(store.delete(&missing).unwrap_err().is_not_found());
        assert!(store.rename(&missing, "x").unwrap_err().is_not_found());

        let id = store.create("c");
        let err = store
            .update_content(&id, &MessageId::from("nope"), "x")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn find_message_reports_conversation_and_index() {
        let (store, id) = store_with(&[(Role::User, "A"), (Role::Assistant, "B")]);
        let target = store.get(&id).unwrap().messages[1].id.clone();
        assert_eq!(store.find_message(&target), Some((id, 1)));
        assert_eq!(store.find_message(&MessageId::from("nope")), None);
    }

    #[test]
    fn by_recency_sorts_on_last_updated() {
        let mut store = ConversationStore::new();
        let old = store.create("old");
        let new = store.create("new");
        store.conversations[0].last_updated -= Duration::minutes(10);
        let order: Vec<_> = store.by_recency().into_iter().map(|c| c.id.clone()).collect();
        assert_eq!(order, vec![old, new]);
    }
}
