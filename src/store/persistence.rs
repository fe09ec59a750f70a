//! Durable key-value storage for chat state.
//!
//! The whole chat state is one JSON blob under [`STATE_KEY`].  Any store that
//! can get, set and remove strings by key satisfies the contract.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use utf8path::Path;

use crate::error::{Error, Result};
use crate::observability::LOAD_FAILURES;
use crate::types::{Conversation, ConversationId};

/// Key under which the chat state blob is stored.
pub const STATE_KEY: &str = "chat-state";

/// A durable string-to-string map.
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key`.  Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;
}

/// A [`KeyValueStore`] that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}

/// A [`KeyValueStore`] that keeps one file per key under a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: Path<'static>,
}

impl FileStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn open(root: Path<'static>) -> Result<Self> {
        fs::create_dir_all(&root)
            .map_err(|e| Error::io(format!("cannot create {}: {e}", root.as_str()), e))?;
        Ok(Self { root })
    }

    /// Returns the directory holding the store's files.
    pub fn root(&self) -> &Path<'static> {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<Path<'static>> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::validation(
                format!("invalid store key {key:?}"),
                Some("key".to_string()),
            ));
        }
        let file_name = format!("{key}.json");
        Ok(self.root.join(file_name.as_str()).into_owned())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Ok(None);
        }
        let value = fs::read_to_string(&path)
            .map_err(|e| Error::io(format!("cannot read {}: {e}", path.as_str()), e))?;
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp_name = format!(".{key}.json.tmp");
        let tmp = self.root.join(tmp_name.as_str()).into_owned();
        let mut file = fs::File::create(&tmp)
            .map_err(|e| Error::io(format!("cannot create {}: {e}", tmp.as_str()), e))?;
        file.write_all(value.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)
            .map_err(|e| Error::io(format!("cannot replace {}: {e}", path.as_str()), e))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(format!("cannot remove {}: {e}", path.as_str()), e)),
        }
    }
}

/// The persisted chat state blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    /// Every conversation, newest first.
    pub conversations: Vec<Conversation>,

    /// The selected conversation.
    pub current_conversation_id: Option<ConversationId>,

    /// Whether a generation was in flight when the state was written.
    pub is_streaming: bool,

    /// Whether the conversation list is shown.
    pub sidebar_open: bool,
}

impl PersistedState {
    /// Normalizes a freshly loaded state.
    ///
    /// No generation survives a restart, and a selection must name a stored
    /// conversation.
    fn revive(mut self) -> Self {
        self.is_streaming = false;
        for conversation in &mut self.conversations {
            for message in &mut conversation.messages {
                message.streaming = false;
            }
        }
        let dangling = self
            .current_conversation_id
            .as_ref()
            .is_some_and(|current| !self.conversations.iter().any(|c| &c.id == current));
        if dangling {
            self.current_conversation_id = None;
        }
        self
    }
}

/// Loads the chat state, reporting corrupt data as [`Error::Parse`].
pub fn try_load_state(store: &dyn KeyValueStore) -> Result<Option<PersistedState>> {
    let Some(blob) = store.get(STATE_KEY)? else {
        return Ok(None);
    };
    let state: PersistedState = serde_json::from_str(&blob).map_err(|e| {
        Error::parse(
            format!("corrupt chat state under {STATE_KEY:?}: {e}"),
            Some(Box::new(e)),
        )
    })?;
    Ok(Some(state.revive()))
}

/// Loads the chat state, falling back to an empty state on any failure.
pub fn load_state(store: &dyn KeyValueStore) -> PersistedState {
    match try_load_state(store) {
        Ok(Some(state)) => state,
        Ok(None) => PersistedState::default(),
        Err(err) => {
            LOAD_FAILURES.click();
            tracing::warn!(error = %err, "discarding unreadable chat state");
            PersistedState::default()
        }
    }
}

/// Writes the chat state.
pub fn save_state(store: &dyn KeyValueStore, state: &PersistedState) -> Result<()> {
    let blob = serde_json::to_string(state)?;
    store.set(STATE_KEY, &blob)
}
