//! Session state and the single-flight generation gate.
//!
//! [`SessionState`] holds the per-process selections the controller mutates.
//! [`GenerationGate`] owns the one cancellation token that may be outstanding
//! at a time along with the ephemeral streaming message, and is the only
//! source of truth for whether a generation is in flight.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::types::{ConversationId, Message, MessageId};

/// Selections that live for the lifetime of the process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// The selected conversation.
    pub current_conversation_id: Option<ConversationId>,

    /// The user message currently being edited.
    pub editing_message_id: Option<MessageId>,

    /// Whether the conversation list is shown.
    pub sidebar_open: bool,
}

/// The in-progress assistant message of the running generation.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingMessage {
    /// Conversation the message will be committed to.
    pub conversation_id: ConversationId,

    /// The message, flagged as streaming, with every token received so far.
    pub message: Message,
}

#[derive(Debug, Default)]
struct GateState {
    serial: u64,
    token: Option<CancellationToken>,
    streaming: Option<StreamingMessage>,
}

/// Global single-flight gate.
///
/// Clones share the same gate.
#[derive(Debug, Clone, Default)]
pub struct GenerationGate {
    inner: Arc<Mutex<GateState>>,
}

impl GenerationGate {
    /// Creates an idle gate.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens the gate for a new generation.
    ///
    /// Returns `None` while another generation holds the gate; requests are
    /// rejected, never queued.  A stopped generation keeps holding the gate
    /// until its handle is dropped.
    pub fn try_begin(&self) -> Option<Generation> {
        let mut state = self.lock();
        if state.token.is_some() {
            return None;
        }
        state.serial += 1;
        let token = CancellationToken::new();
        state.token = Some(token.clone());
        state.streaming = None;
        Some(Generation {
            gate: self.clone(),
            serial: state.serial,
            token,
        })
    }

    /// Returns true while a generation is in flight, stopped or not.
    pub fn is_streaming(&self) -> bool {
        self.lock().token.is_some()
    }

    /// Returns a snapshot of the ephemeral streaming message.
    pub fn streaming_message(&self) -> Option<StreamingMessage> {
        self.lock().streaming.clone()
    }

    /// Cancels the running generation and discards its ephemeral message.
    ///
    /// The gate stays closed until the generation has settled and dropped its
    /// handle.  Returns false, changing nothing, when no generation is in
    /// flight or it was already stopped.
    pub fn stop(&self) -> bool {
        let mut state = self.lock();
        match state.token.as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                state.streaming = None;
                true
            }
            _ => false,
        }
    }

    /// Returns a handle that can stop generations from another task or thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { gate: self.clone() }
    }
}

/// Owned handle of the running generation.
///
/// Dropping it opens the gate again.
#[derive(Debug)]
pub struct Generation {
    gate: GenerationGate,
    serial: u64,
    token: CancellationToken,
}

impl Generation {
    /// The cancellation token to thread through every suspending call.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns true once the generation has been stopped.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Starts a fresh ephemeral message bound for `conversation_id`.
    pub fn start_message(&self, conversation_id: ConversationId) {
        let mut state = self.gate.lock();
        if state.serial == self.serial && !self.token.is_cancelled() {
            state.streaming = Some(StreamingMessage {
                conversation_id,
                message: Message::streaming_placeholder(),
            });
        }
    }

    /// Appends a token to the ephemeral message.
    pub fn append(&self, token: &str) {
        let mut state = self.gate.lock();
        if state.serial != self.serial {
            return;
        }
        if let Some(streaming) = state.streaming.as_mut() {
            streaming.message.content.push_str(token);
        }
    }

    /// Empties the ephemeral message, keeping it alive.
    pub fn reset_message(&self) {
        let mut state = self.gate.lock();
        if state.serial != self.serial {
            return;
        }
        if let Some(streaming) = state.streaming.as_mut() {
            streaming.message.content.clear();
        }
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        let mut state = self.gate.lock();
        if state.serial == self.serial {
            state.token = None;
            state.streaming = None;
        }
    }
}

/// Stops the running generation from outside the controller.
#[derive(Debug, Clone)]
pub struct StopHandle {
    gate: GenerationGate,
}

impl StopHandle {
    /// Stops the running generation, if any.  Safe to call repeatedly.
    pub fn stop(&self) -> bool {
        self.gate.stop()
    }

    /// Returns true while a generation is in flight.
    pub fn is_streaming(&self) -> bool {
        self.gate.is_streaming()
    }
}
