//! The conversation controller.
//!
//! Every user-facing operation is a method here.  Each one either runs to
//! completion synchronously (selection, deletion, edit bookkeeping) or drives
//! one generation through `Idle -> Generating -> Idle`:
//!
//! - a clean end of stream commits the accumulated tokens;
//! - a stop commits the trimmed partial output when there is any;
//! - any other stream failure falls back once to a non-streaming request, and
//!   when that fails too nothing is committed and the error is returned.
//!
//! Only one generation runs at a time across all conversations.  A request
//! made while one is in flight is answered with [`GenerationOutcome::Busy`].

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;

use crate::chat::session::{Generation, GenerationGate, SessionState, StopHandle, StreamingMessage};
use crate::chat::title::generate_title;
use crate::client::CompletionBackend;
use crate::error::{Error, Result};
use crate::observability::{
    FALLBACK_FAILURES, FALLBACKS, GENERATIONS, GENERATIONS_REJECTED, PARTIAL_COMMITS,
    PERSIST_ERRORS, TITLE_FAILURES,
};
use crate::store::{ConversationStore, KeyValueStore, PersistedState, load_state, save_state};
use crate::types::{ChatMessage, Conversation, ConversationId, Message, MessageId, Role};

/// How a generation-driving operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Another generation was in flight; nothing changed.
    Busy,

    /// The target could not be found or there was nothing to do; nothing changed.
    Ignored,

    /// The trailing assistant message was removed but no user message remained
    /// to answer, so the endpoint was not called.
    NoPrompt {
        /// The regenerated conversation.
        conversation_id: ConversationId,
    },

    /// An assistant message was committed.
    Completed {
        /// Conversation the message was appended to.
        conversation_id: ConversationId,
        /// The committed message.
        message_id: MessageId,
        /// True when the text came from the non-streaming fallback.
        fallback: bool,
    },

    /// The generation was stopped.
    Interrupted {
        /// Conversation the generation was for.
        conversation_id: ConversationId,
        /// The partial message, if any non-blank output had arrived.
        message_id: Option<MessageId>,
    },
}

impl GenerationOutcome {
    /// Returns the assistant message this outcome committed, if any.
    pub fn committed_message(&self) -> Option<&MessageId> {
        match self {
            GenerationOutcome::Completed { message_id, .. } => Some(message_id),
            GenerationOutcome::Interrupted { message_id, .. } => message_id.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    store: ConversationStore,
    session: SessionState,
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

fn snapshot(shared: &Shared, is_streaming: bool) -> PersistedState {
    PersistedState {
        conversations: shared.store.conversations().to_vec(),
        current_conversation_id: shared.session.current_conversation_id.clone(),
        is_streaming,
        sidebar_open: shared.session.sidebar_open,
    }
}

/// Writes snapshots of the shared state to a key-value store.
///
/// The snapshot is taken under the state lock and written after releasing
/// it.  `writes` keeps snapshots landing in the order they were taken.
struct Persister {
    kv: Arc<dyn KeyValueStore>,
    writes: Mutex<()>,
}

impl Persister {
    fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            writes: Mutex::new(()),
        }
    }

    fn persist(&self, shared: &Mutex<Shared>, gate: &GenerationGate) {
        let _writing = self.writes.lock().unwrap_or_else(|e| e.into_inner());
        let is_streaming = gate.is_streaming();
        let state = snapshot(&lock_shared(shared), is_streaming);
        if let Err(err) = save_state(self.kv.as_ref(), &state) {
            PERSIST_ERRORS.click();
            tracing::error!(error = %err, "failed to persist chat state");
        }
    }
}

/// Drives conversations against a completion backend.
pub struct ChatController {
    backend: Arc<dyn CompletionBackend>,
    shared: Arc<Mutex<Shared>>,
    gate: GenerationGate,
    persistence: Option<Arc<Persister>>,
    title_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatController {
    /// Creates a controller with an empty, unpersisted store.
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            backend,
            shared: Arc::new(Mutex::new(Shared::default())),
            gate: GenerationGate::new(),
            persistence: None,
            title_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Creates a controller whose state is loaded from, and written back to, `kv`.
    ///
    /// Unreadable state is discarded and the controller starts empty.
    pub fn load(backend: Arc<dyn CompletionBackend>, kv: Arc<dyn KeyValueStore>) -> Self {
        let state = load_state(kv.as_ref());
        tracing::info!(
            conversations = state.conversations.len(),
            "loaded chat state"
        );
        let shared = Shared {
            store: ConversationStore::from_conversations(state.conversations),
            session: SessionState {
                current_conversation_id: state.current_conversation_id,
                editing_message_id: None,
                sidebar_open: state.sidebar_open,
            },
        };
        Self {
            backend,
            shared: Arc::new(Mutex::new(shared)),
            gate: GenerationGate::new(),
            persistence: Some(Arc::new(Persister::new(kv))),
            title_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the completion backend used by later operations.
    pub fn set_backend(&mut self, backend: Arc<dyn CompletionBackend>) {
        self.backend = backend;
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock_shared(&self.shared)
    }

    fn persist(&self) {
        if let Some(persister) = &self.persistence {
            persister.persist(&self.shared, &self.gate);
        }
    }

    /// Returns every conversation, newest first.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.lock().store.conversations().to_vec()
    }

    /// Returns every conversation, most recently updated first.
    pub fn conversations_by_recency(&self) -> Vec<Conversation> {
        self.lock().store.by_recency().into_iter().cloned().collect()
    }

    /// Returns a conversation by identifier.
    pub fn conversation(&self, id: &ConversationId) -> Option<Conversation> {
        self.lock().store.get(id).cloned()
    }

    /// Returns the selected conversation.
    pub fn current_conversation(&self) -> Option<Conversation> {
        let shared = self.lock();
        let id = shared.session.current_conversation_id.as_ref()?;
        shared.store.get(id).cloned()
    }

    /// Returns a snapshot of the session state.
    pub fn session(&self) -> SessionState {
        self.lock().session.clone()
    }

    /// Returns true while a generation is in flight.
    pub fn is_streaming(&self) -> bool {
        self.gate.is_streaming()
    }

    /// Returns the in-progress assistant message, if a generation is running.
    pub fn streaming_message(&self) -> Option<StreamingMessage> {
        self.gate.streaming_message()
    }

    /// Returns a handle that stops generations from another task or a signal handler.
    pub fn stop_handle(&self) -> StopHandle {
        self.gate.stop_handle()
    }

    fn begin(&self) -> Option<Generation> {
        let generation = self.gate.try_begin();
        if generation.is_none() {
            GENERATIONS_REJECTED.click();
            tracing::debug!("rejecting request while a generation is in flight");
        }
        generation
    }

    /// Sends a user message to the selected conversation, creating one if
    /// none is selected, and generates the reply.
    ///
    /// Blank text is ignored.  The first exchange of a conversation also
    /// requests a title in the background.
    pub async fn send(&self, text: &str) -> Result<GenerationOutcome> {
        if text.trim().is_empty() {
            return Ok(GenerationOutcome::Ignored);
        }
        let Some(generation) = self.begin() else {
            return Ok(GenerationOutcome::Busy);
        };

        let (conversation_id, history, first_exchange) = {
            let mut shared = self.lock();
            let Shared { store, session } = &mut *shared;
            let conversation_id = match session
                .current_conversation_id
                .clone()
                .filter(|id| store.contains(id))
            {
                Some(id) => id,
                None => store.create(Conversation::name_from_text(text)),
            };
            let prior = store
                .get(&conversation_id)
                .map(|c| c.messages.len())
                .unwrap_or_default();
            store.append(&conversation_id, Message::user(text))?;
            session.current_conversation_id = Some(conversation_id.clone());
            let history = store
                .get(&conversation_id)
                .map(Conversation::history)
                .unwrap_or_default();
            (conversation_id, history, prior == 0)
        };
        self.persist();

        let outcome = self.generate(generation, &conversation_id, history).await?;
        if first_exchange && matches!(outcome, GenerationOutcome::Completed { .. }) {
            self.spawn_title(conversation_id, text.to_string());
        }
        Ok(outcome)
    }

    /// Replaces the trailing assistant message of a conversation with a new reply.
    ///
    /// Does nothing unless the conversation ends in an assistant message.
    pub async fn regenerate(&self, conversation_id: &ConversationId) -> Result<GenerationOutcome> {
        let Some(generation) = self.begin() else {
            return Ok(GenerationOutcome::Busy);
        };

        let history = {
            let mut shared = self.lock();
            if !shared.store.contains(conversation_id) {
                return Ok(GenerationOutcome::Ignored);
            }
            if shared
                .store
                .remove_trailing_assistant(conversation_id)?
                .is_none()
            {
                return Ok(GenerationOutcome::Ignored);
            }
            shared
                .store
                .get(conversation_id)
                .filter(|c| c.messages.iter().any(|m| m.role == Role::User))
                .map(Conversation::history)
        };

        let Some(history) = history else {
            drop(generation);
            self.persist();
            return Ok(GenerationOutcome::NoPrompt {
                conversation_id: conversation_id.clone(),
            });
        };
        self.persist();
        self.generate(generation, conversation_id, history).await
    }

    /// Regenerates the conversation holding `message_id`.
    pub async fn regenerate_message(&self, message_id: &MessageId) -> Result<GenerationOutcome> {
        let located = self.lock().store.find_message(message_id);
        match located {
            Some((conversation_id, _)) => self.regenerate(&conversation_id).await,
            None => {
                tracing::debug!(message = %message_id, "regenerate target not found");
                Ok(GenerationOutcome::Ignored)
            }
        }
    }

    /// Rewrites a message, discards everything after it, and generates a new reply.
    pub async fn edit_and_regenerate(
        &self,
        message_id: &MessageId,
        new_text: &str,
    ) -> Result<GenerationOutcome> {
        let Some(generation) = self.begin() else {
            return Ok(GenerationOutcome::Busy);
        };

        let (conversation_id, history) = {
            let mut shared = self.lock();
            let Some((conversation_id, index)) = shared.store.find_message(message_id) else {
                tracing::debug!(message = %message_id, "edit target not found");
                return Ok(GenerationOutcome::Ignored);
            };
            shared
                .store
                .update_content(&conversation_id, message_id, new_text)?;
            let discarded = shared.store.truncate_after(&conversation_id, index)?;
            shared.session.editing_message_id = None;
            tracing::debug!(
                conversation = %conversation_id,
                discarded = discarded.len(),
                "rewrote history"
            );
            let history = shared
                .store
                .get(&conversation_id)
                .map(Conversation::history)
                .unwrap_or_default();
            (conversation_id, history)
        };
        self.persist();
        self.generate(generation, &conversation_id, history).await
    }

    async fn generate(
        &self,
        generation: Generation,
        conversation_id: &ConversationId,
        history: Vec<ChatMessage>,
    ) -> Result<GenerationOutcome> {
        GENERATIONS.click();
        generation.start_message(conversation_id.clone());
        let backend = Arc::clone(&self.backend);

        let mut accumulated = String::new();
        let streamed = {
            let generation = &generation;
            let accumulated = &mut accumulated;
            let mut on_token = move |token: &str| {
                accumulated.push_str(token);
                generation.append(token);
            };
            backend
                .complete_streaming(&history, generation.token(), &mut on_token)
                .await
        };

        let outcome = match streamed {
            Ok(_) => self.commit(conversation_id, accumulated, false),
            Err(err) if err.is_abort() => {
                let partial = accumulated.trim();
                let message_id = if partial.is_empty() {
                    None
                } else {
                    PARTIAL_COMMITS.click();
                    self.commit_message(conversation_id, partial.to_string())
                };
                tracing::info!(
                    conversation = %conversation_id,
                    kept_partial = message_id.is_some(),
                    "generation stopped"
                );
                GenerationOutcome::Interrupted {
                    conversation_id: conversation_id.clone(),
                    message_id,
                }
            }
            Err(err) => {
                FALLBACKS.click();
                tracing::warn!(
                    error = %err,
                    conversation = %conversation_id,
                    "streaming failed, falling back to a single request"
                );
                generation.reset_message();
                let fallback = tokio::select! {
                    biased;
                    _ = generation.token().cancelled() => {
                        Err(Error::abort("stopped during fallback request"))
                    }
                    result = backend.complete_once(&history) => result,
                };
                match fallback {
                    Ok(text) => self.commit(conversation_id, text, true),
                    Err(err) if err.is_abort() => GenerationOutcome::Interrupted {
                        conversation_id: conversation_id.clone(),
                        message_id: None,
                    },
                    Err(err) => {
                        FALLBACK_FAILURES.click();
                        tracing::error!(
                            error = %err,
                            conversation = %conversation_id,
                            "fallback request failed"
                        );
                        drop(generation);
                        self.persist();
                        return Err(err);
                    }
                }
            }
        };

        drop(generation);
        self.persist();
        Ok(outcome)
    }

    fn commit(
        &self,
        conversation_id: &ConversationId,
        content: String,
        fallback: bool,
    ) -> GenerationOutcome {
        match self.commit_message(conversation_id, content) {
            Some(message_id) => GenerationOutcome::Completed {
                conversation_id: conversation_id.clone(),
                message_id,
                fallback,
            },
            None => GenerationOutcome::Ignored,
        }
    }

    fn commit_message(&self, conversation_id: &ConversationId, content: String) -> Option<MessageId> {
        let message = Message::assistant(content);
        let message_id = message.id.clone();
        match self.lock().store.append(conversation_id, message) {
            Ok(()) => Some(message_id),
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    conversation = %conversation_id,
                    "dropping reply for a conversation that no longer exists"
                );
                None
            }
        }
    }

    fn spawn_title(&self, conversation_id: ConversationId, first_user_message: String) {
        let backend = Arc::clone(&self.backend);
        let shared = Arc::clone(&self.shared);
        let gate = self.gate.clone();
        let persistence = self.persistence.clone();
        let handle = tokio::spawn(async move {
            let title = match generate_title(backend.as_ref(), &first_user_message).await {
                Ok(title) => title,
                Err(err) => {
                    TITLE_FAILURES.click();
                    tracing::debug!(error = %err, conversation = %conversation_id, "no title");
                    return;
                }
            };
            if lock_shared(&shared)
                .store
                .rename(&conversation_id, title.as_str())
                .is_err()
            {
                return;
            }
            if let Some(persister) = &persistence {
                persister.persist(&shared, &gate);
            }
            tracing::info!(conversation = %conversation_id, title, "renamed conversation");
        });
        let mut tasks = self.title_tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Waits for every outstanding title request to finish.
    pub async fn wait_for_titles(&self) {
        let tasks = {
            let mut tasks = self.title_tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "title task failed");
            }
        }
    }

    /// Stops the running generation.  Returns false when nothing was running.
    pub fn stop(&self) -> bool {
        let stopped = self.gate.stop();
        if stopped {
            self.persist();
        }
        stopped
    }

    /// Puts a user message under edit and returns its current text.
    ///
    /// Selects the conversation holding the message.  Only user messages can
    /// be edited.
    pub fn begin_edit(&self, message_id: &MessageId) -> Option<String> {
        let text = {
            let mut shared = self.lock();
            let (conversation_id, index) = shared.store.find_message(message_id)?;
            let message = shared.store.get(&conversation_id)?.messages.get(index)?;
            if message.role != Role::User {
                return None;
            }
            let text = message.content.clone();
            shared.session.editing_message_id = Some(message_id.clone());
            shared.session.current_conversation_id = Some(conversation_id);
            text
        };
        self.persist();
        Some(text)
    }

    /// Abandons the pending edit.
    pub fn cancel_edit(&self) {
        self.lock().session.editing_message_id = None;
    }

    /// Selects a conversation and closes the conversation list.
    ///
    /// Unknown identifiers are ignored.
    pub fn select(&self, conversation_id: &ConversationId) -> bool {
        {
            let mut shared = self.lock();
            if !shared.store.contains(conversation_id) {
                return false;
            }
            shared.session.current_conversation_id = Some(conversation_id.clone());
            shared.session.sidebar_open = false;
        }
        self.persist();
        true
    }

    /// Clears the selection so the next send starts a new conversation.
    pub fn new_conversation(&self) {
        {
            let mut shared = self.lock();
            shared.session.current_conversation_id = None;
            shared.session.sidebar_open = false;
        }
        self.persist();
    }

    /// Deletes a conversation, clearing the selection if it was selected.
    pub fn delete(&self, conversation_id: &ConversationId) -> bool {
        {
            let mut shared = self.lock();
            let Ok(deleted) = shared.store.delete(conversation_id) else {
                return false;
            };
            let session = &mut shared.session;
            if session.current_conversation_id.as_ref() == Some(conversation_id) {
                session.current_conversation_id = None;
            }
            if session
                .editing_message_id
                .as_ref()
                .is_some_and(|id| deleted.position_of(id).is_some())
            {
                session.editing_message_id = None;
            }
        }
        self.persist();
        true
    }

    /// Shows or hides the conversation list and returns the new visibility.
    pub fn toggle_sidebar(&self) -> bool {
        let open = {
            let mut shared = self.lock();
            shared.session.sidebar_open = !shared.session.sidebar_open;
            shared.session.sidebar_open
        };
        self.persist();
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_util::sync::CancellationToken;

    use crate::store::{MemoryStore, STATE_KEY, try_load_state};

    enum End {
        Done,
        Fail(Error),
        WaitForCancel,
    }

    struct Script {
        tokens: Vec<&'static str>,
        end: End,
    }

    fn stream(tokens: &[&'static str], end: End) -> Script {
        Script {
            tokens: tokens.to_vec(),
            end,
        }
    }

    #[derive(Default)]
    struct ScriptedBackend {
        streams: Mutex<VecDeque<Script>>,
        once: Mutex<VecDeque<Result<String>>>,
        titles: Mutex<VecDeque<Result<String>>>,
        histories: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedBackend {
        fn with_stream(self, script: Script) -> Self {
            self.streams.lock().unwrap().push_back(script);
            self
        }

        fn with_once(self, reply: Result<String>) -> Self {
            self.once.lock().unwrap().push_back(reply);
            self
        }

        fn with_title(self, reply: Result<String>) -> Self {
            self.titles.lock().unwrap().push_back(reply);
            self
        }

        fn histories(&self) -> Vec<Vec<ChatMessage>> {
            self.histories.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete_streaming(
            &self,
            history: &[ChatMessage],
            cancel: &CancellationToken,
            on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
        ) -> Result<String> {
            self.histories.lock().unwrap().push(history.to_vec());
            let script = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| stream(&[], End::Done));
            let mut text = String::new();
            for token in &script.tokens {
                text.push_str(token);
                on_token(token);
            }
            match script.end {
                End::Done => Ok(text),
                End::Fail(err) => Err(err),
                End::WaitForCancel => {
                    cancel.cancelled().await;
                    Err(Error::abort("cancelled"))
                }
            }
        }

        async fn complete_once(&self, history: &[ChatMessage]) -> Result<String> {
            let is_title = history.len() == 1 && history[0].content.starts_with("Provide a short");
            if is_title {
                return self
                    .titles
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| Err(Error::transport("no title scripted", None)));
            }
            self.histories.lock().unwrap().push(history.to_vec());
            self.once
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::transport("no reply scripted", None)))
        }
    }

    fn controller(backend: ScriptedBackend) -> (ChatController, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        (ChatController::new(backend.clone()), backend)
    }

    fn transcript(conversation: &Conversation) -> Vec<(Role, String)> {
        conversation
            .messages
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect()
    }

    fn seed(controller: &ChatController, messages: &[(Role, &str)]) -> ConversationId {
        let mut shared = controller.lock();
        let id = shared.store.create("seeded");
        for (role, text) in messages {
            shared.store.append(&id, Message::new(*role, *text)).unwrap();
        }
        shared.session.current_conversation_id = Some(id.clone());
        id
    }

    #[tokio::test]
    async fn send_on_empty_store_creates_conversation_and_commits_reply() {
        let (controller, backend) =
            controller(ScriptedBackend::default().with_stream(stream(&["Hel", "lo!"], End::Done)));

        let outcome = controller.send("Hi").await.unwrap();
        assert!(matches!(
            outcome,
            GenerationOutcome::Completed { fallback: false, .. }
        ));

        let conversations = controller.conversations();
        assert_eq!(conversations.len(), 1);
        let conversation = &conversations[0];
        assert_eq!(conversation.name, "Hi");
        assert_eq!(
            transcript(conversation),
            vec![
                (Role::User, "Hi".to_string()),
                (Role::Assistant, "Hello!".to_string())
            ]
        );
        assert!(conversation.messages.iter().all(|m| !m.streaming));
        assert!(!controller.is_streaming());
        assert_eq!(controller.streaming_message(), None);
        assert_eq!(
            controller.session().current_conversation_id,
            Some(conversation.id.clone())
        );
        assert_eq!(backend.histories(), vec![vec![ChatMessage::user("Hi")]]);
    }

    #[tokio::test]
    async fn blank_text_is_ignored() {
        let (controller, backend) = controller(ScriptedBackend::default());
        assert_eq!(
            controller.send("   ").await.unwrap(),
            GenerationOutcome::Ignored
        );
        assert!(controller.conversations().is_empty());
        assert!(backend.histories().is_empty());
    }

    #[tokio::test]
    async fn send_appends_to_selected_conversation_with_full_history() {
        let (controller, backend) =
            controller(ScriptedBackend::default().with_stream(stream(&["6"], End::Done)));
        let id = seed(&controller, &[(Role::User, "2+2?"), (Role::Assistant, "4")]);

        controller.send("3+3?").await.unwrap();
        assert_eq!(
            backend.histories()[0],
            vec![
                ChatMessage::user("2+2?"),
                ChatMessage::assistant("4"),
                ChatMessage::user("3+3?")
            ]
        );
        assert_eq!(controller.conversation(&id).unwrap().messages.len(), 4);
        assert_eq!(controller.conversations().len(), 1);
    }

    #[tokio::test]
    async fn first_exchange_requests_a_title() {
        let (controller, _) = controller(
            ScriptedBackend::default()
                .with_stream(stream(&["Hello!"], End::Done))
                .with_title(Ok("  Friendly\nGreeting ".to_string())),
        );
        controller.send("Hi").await.unwrap();
        controller.wait_for_titles().await;
        assert_eq!(controller.conversations()[0].name, "Friendly Greeting");
    }

    #[tokio::test]
    async fn title_failure_keeps_the_prefix_name() {
        let long = "Tell me everything about the borrow checker please";
        let (controller, _) = controller(
            ScriptedBackend::default()
                .with_stream(stream(&["ok"], End::Done))
                .with_title(Err(Error::endpoint(500, "boom"))),
        );
        controller.send(long).await.unwrap();
        controller.wait_for_titles().await;
        assert_eq!(
            controller.conversations()[0].name,
            "Tell me everything about the b..."
        );
    }

    #[tokio::test]
    async fn later_sends_do_not_request_titles() {
        let (controller, _) = controller(
            ScriptedBackend::default()
                .with_stream(stream(&["again"], End::Done))
                .with_title(Ok("Unwanted".to_string())),
        );
        seed(&controller, &[(Role::User, "a"), (Role::Assistant, "b")]);
        controller.send("c").await.unwrap();
        controller.wait_for_titles().await;
        assert_eq!(controller.conversations()[0].name, "seeded");
    }

    #[tokio::test]
    async fn interrupted_first_exchange_requests_no_title() {
        let (controller, backend) = controller(
            ScriptedBackend::default()
                .with_stream(stream(&["Once upon"], End::WaitForCancel))
                .with_title(Ok("Unwanted".to_string())),
        );
        let generating = controller.send("Tell me a story");
        let stopping = async {
            tokio::task::yield_now().await;
            assert!(controller.stop());
        };
        let (outcome, ()) = tokio::join!(generating, stopping);
        assert!(outcome.unwrap().committed_message().is_some());

        controller.wait_for_titles().await;
        assert_eq!(controller.conversations()[0].name, "Tell me a story");
        assert_eq!(backend.titles.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stream_failure_falls_back_once() {
        let (controller, backend) = controller(
            ScriptedBackend::default()
                .with_stream(stream(
                    &["partial"],
                    End::Fail(Error::transport("connection reset", None)),
                ))
                .with_once(Ok("Recovered".to_string())),
        );
        let outcome = controller.send("Hi").await.unwrap();
        assert!(matches!(
            outcome,
            GenerationOutcome::Completed { fallback: true, .. }
        ));
        let conversation = controller.current_conversation().unwrap();
        assert_eq!(conversation.messages[1].content, "Recovered");
        let histories = backend.histories();
        assert_eq!(histories.len(), 2);
        assert_eq!(histories[0], histories[1]);
    }

    #[tokio::test]
    async fn fallback_failure_commits_nothing_and_reports_the_error() {
        let (controller, _) = controller(
            ScriptedBackend::default()
                .with_stream(stream(&["x"], End::Fail(Error::endpoint(502, "bad"))))
                .with_once(Err(Error::endpoint(503, "down"))),
        );
        let err = controller.send("Hi").await.unwrap_err();
        assert_eq!(err.status_code(), Some(503));
        let conversation = controller.current_conversation().unwrap();
        assert_eq!(
            transcript(&conversation),
            vec![(Role::User, "Hi".to_string())]
        );
        assert!(!controller.is_streaming());
    }

    #[tokio::test]
    async fn stop_keeps_trimmed_partial_output() {
        let (controller, _) = controller(
            ScriptedBackend::default().with_stream(stream(&["  Par", "tial "], End::WaitForCancel)),
        );
        let generating = controller.send("Hi");
        let stopping = async {
            tokio::task::yield_now().await;
            assert!(controller.is_streaming());
            let streaming = controller.streaming_message().unwrap();
            assert_eq!(streaming.message.content, "  Partial ");
            assert!(streaming.message.streaming);
            assert!(controller.stop());
            assert!(!controller.stop());
        };
        let (outcome, ()) = tokio::join!(generating, stopping);

        let outcome = outcome.unwrap();
        assert!(matches!(
            outcome,
            GenerationOutcome::Interrupted {
                message_id: Some(_),
                ..
            }
        ));
        let conversation = controller.current_conversation().unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[1].content, "Partial");
        assert!(!conversation.messages[1].streaming);
        assert!(!controller.is_streaming());
    }

    #[tokio::test]
    async fn stop_before_any_token_commits_nothing() {
        let (controller, _) =
            controller(ScriptedBackend::default().with_stream(stream(&[], End::WaitForCancel)));
        let handle = controller.stop_handle();
        let generating = controller.send("Hi");
        let stopping = async {
            tokio::task::yield_now().await;
            assert!(handle.stop());
        };
        let (outcome, ()) = tokio::join!(generating, stopping);
        assert!(matches!(
            outcome.unwrap(),
            GenerationOutcome::Interrupted {
                message_id: None,
                ..
            }
        ));
        let conversation = controller.current_conversation().unwrap();
        assert_eq!(conversation.messages.len(), 1);
    }

    #[tokio::test]
    async fn blank_partial_output_is_discarded() {
        let (controller, _) = controller(
            ScriptedBackend::default().with_stream(stream(&[" ", "\n"], End::WaitForCancel)),
        );
        let generating = controller.send("Hi");
        let stopping = async {
            tokio::task::yield_now().await;
            controller.stop();
        };
        let (outcome, ()) = tokio::join!(generating, stopping);
        assert_eq!(outcome.unwrap().committed_message(), None);
        assert_eq!(controller.current_conversation().unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn second_request_while_generating_is_rejected() {
        let (controller, backend) =
            controller(ScriptedBackend::default().with_stream(stream(&["a"], End::WaitForCancel)));
        let generating = controller.send("first");
        let competing = async {
            tokio::task::yield_now().await;
            let busy = controller.send("second").await.unwrap();
            let id = controller.session().current_conversation_id.unwrap();
            let busy_regenerate = controller.regenerate(&id).await.unwrap();
            controller.stop();
            (busy, busy_regenerate)
        };
        let (_, (busy, busy_regenerate)) = tokio::join!(generating, competing);
        assert_eq!(busy, GenerationOutcome::Busy);
        assert_eq!(busy_regenerate, GenerationOutcome::Busy);
        assert_eq!(backend.histories().len(), 1);
        let conversation = controller.current_conversation().unwrap();
        assert_eq!(
            transcript(&conversation),
            vec![
                (Role::User, "first".to_string()),
                (Role::Assistant, "a".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn send_right_after_stop_waits_for_the_stopped_reply() {
        let (controller, backend) = controller(
            ScriptedBackend::default()
                .with_stream(stream(&["partial"], End::WaitForCancel))
                .with_stream(stream(&["answer"], End::Done)),
        );
        let generating = controller.send("Q1");
        let competing = async {
            tokio::task::yield_now().await;
            assert!(controller.stop());
            assert!(controller.is_streaming());
            controller.send("Q2").await.unwrap()
        };
        let (first, second) = tokio::join!(generating, competing);
        assert!(matches!(
            first.unwrap(),
            GenerationOutcome::Interrupted {
                message_id: Some(_),
                ..
            }
        ));
        assert_eq!(second, GenerationOutcome::Busy);
        assert!(!controller.is_streaming());
        assert_eq!(backend.histories(), vec![vec![ChatMessage::user("Q1")]]);

        controller.send("Q3").await.unwrap();
        let conversation = controller.current_conversation().unwrap();
        assert_eq!(
            transcript(&conversation),
            vec![
                (Role::User, "Q1".to_string()),
                (Role::Assistant, "partial".to_string()),
                (Role::User, "Q3".to_string()),
                (Role::Assistant, "answer".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn regenerate_removes_trailing_assistant_before_requesting() {
        let (controller, backend) =
            controller(ScriptedBackend::default().with_stream(stream(&["four"], End::Done)));
        let id = seed(&controller, &[(Role::User, "2+2?"), (Role::Assistant, "4")]);

        let outcome = controller.regenerate(&id).await.unwrap();
        assert!(matches!(outcome, GenerationOutcome::Completed { .. }));
        assert_eq!(backend.histories(), vec![vec![ChatMessage::user("2+2?")]]);
        assert_eq!(
            transcript(&controller.conversation(&id).unwrap()),
            vec![
                (Role::User, "2+2?".to_string()),
                (Role::Assistant, "four".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn regenerate_without_trailing_assistant_is_a_no_op() {
        let (controller, backend) = controller(ScriptedBackend::default());
        let id = seed(&controller, &[(Role::User, "hello")]);
        assert_eq!(
            controller.regenerate(&id).await.unwrap(),
            GenerationOutcome::Ignored
        );
        assert_eq!(
            controller
                .regenerate(&ConversationId::from("missing"))
                .await
                .unwrap(),
            GenerationOutcome::Ignored
        );
        assert!(backend.histories().is_empty());
        assert!(!controller.is_streaming());
    }

    #[tokio::test]
    async fn regenerate_with_no_user_message_stops_without_a_request() {
        let (controller, backend) = controller(ScriptedBackend::default());
        let id = seed(&controller, &[(Role::System, "be terse"), (Role::Assistant, "ok")]);
        let outcome = controller.regenerate(&id).await.unwrap();
        assert_eq!(
            outcome,
            GenerationOutcome::NoPrompt {
                conversation_id: id.clone()
            }
        );
        assert!(backend.histories().is_empty());
        assert_eq!(controller.conversation(&id).unwrap().messages.len(), 1);
        assert!(!controller.is_streaming());
    }

    #[tokio::test]
    async fn regenerate_message_finds_the_conversation() {
        let (controller, backend) =
            controller(ScriptedBackend::default().with_stream(stream(&["B2"], End::Done)));
        let id = seed(&controller, &[(Role::User, "A"), (Role::Assistant, "B")]);
        let user_id = controller.conversation(&id).unwrap().messages[0].id.clone();

        controller.regenerate_message(&user_id).await.unwrap();
        assert_eq!(backend.histories(), vec![vec![ChatMessage::user("A")]]);
        assert_eq!(
            controller
                .regenerate_message(&MessageId::from("missing"))
                .await
                .unwrap(),
            GenerationOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn edit_rewrites_history_from_the_edited_message() {
        let (controller, backend) =
            controller(ScriptedBackend::default().with_stream(stream(&["B2"], End::Done)));
        let id = seed(
            &controller,
            &[
                (Role::User, "A"),
                (Role::Assistant, "B"),
                (Role::User, "C"),
                (Role::Assistant, "D"),
            ],
        );
        let first = controller.conversation(&id).unwrap().messages[0].clone();
        assert_eq!(controller.begin_edit(&first.id), Some("A".to_string()));
        assert_eq!(controller.session().editing_message_id, Some(first.id.clone()));

        controller.edit_and_regenerate(&first.id, "A2").await.unwrap();

        assert_eq!(backend.histories(), vec![vec![ChatMessage::user("A2")]]);
        let conversation = controller.conversation(&id).unwrap();
        assert_eq!(
            transcript(&conversation),
            vec![
                (Role::User, "A2".to_string()),
                (Role::Assistant, "B2".to_string())
            ]
        );
        assert_eq!(conversation.messages[0].id, first.id);
        assert_eq!(conversation.messages[0].created_at, first.created_at);
        assert_eq!(controller.session().editing_message_id, None);
    }

    #[tokio::test]
    async fn edit_in_the_middle_keeps_earlier_messages() {
        let (controller, backend) =
            controller(ScriptedBackend::default().with_stream(stream(&["D2"], End::Done)));
        let id = seed(
            &controller,
            &[
                (Role::User, "A"),
                (Role::Assistant, "B"),
                (Role::User, "C"),
                (Role::Assistant, "D"),
            ],
        );
        let before = controller.conversation(&id).unwrap();
        controller
            .edit_and_regenerate(&before.messages[2].id, "C2")
            .await
            .unwrap();
        let after = controller.conversation(&id).unwrap();
        assert_eq!(&after.messages[..2], &before.messages[..2]);
        assert_eq!(after.messages[2].content, "C2");
        assert_eq!(after.messages[3].content, "D2");
        assert_eq!(after.messages.len(), 4);
        assert_eq!(backend.histories()[0].len(), 3);
    }

    #[tokio::test]
    async fn edit_of_unknown_message_is_a_no_op() {
        let (controller, backend) = controller(ScriptedBackend::default());
        assert_eq!(
            controller
                .edit_and_regenerate(&MessageId::from("missing"), "x")
                .await
                .unwrap(),
            GenerationOutcome::Ignored
        );
        assert!(backend.histories().is_empty());
    }

    #[test]
    fn only_user_messages_can_be_edited() {
        let (controller, _) = controller(ScriptedBackend::default());
        let id = seed(&controller, &[(Role::User, "A"), (Role::Assistant, "B")]);
        let reply = controller.conversation(&id).unwrap().messages[1].id.clone();
        assert_eq!(controller.begin_edit(&reply), None);
        assert_eq!(controller.session().editing_message_id, None);

        let question = controller.conversation(&id).unwrap().messages[0].id.clone();
        controller.new_conversation();
        assert!(controller.begin_edit(&question).is_some());
        assert_eq!(controller.session().current_conversation_id, Some(id));
        controller.cancel_edit();
        assert_eq!(controller.session().editing_message_id, None);
    }

    #[test]
    fn selection_and_deletion() {
        let (controller, _) = controller(ScriptedBackend::default());
        let first = seed(&controller, &[]);
        let second = seed(&controller, &[]);
        assert!(controller.toggle_sidebar());

        assert!(controller.select(&first));
        assert!(!controller.session().sidebar_open);
        assert!(!controller.select(&ConversationId::from("missing")));
        assert_eq!(controller.session().current_conversation_id, Some(first.clone()));

        assert!(controller.delete(&first));
        assert_eq!(controller.session().current_conversation_id, None);
        assert!(!controller.delete(&first));
        assert_eq!(controller.conversations().len(), 1);
        assert_eq!(controller.conversations()[0].id, second);
    }

    #[tokio::test]
    async fn new_conversation_starts_fresh_on_next_send() {
        let (controller, _) = controller(
            ScriptedBackend::default()
                .with_stream(stream(&["one"], End::Done))
                .with_stream(stream(&["two"], End::Done)),
        );
        controller.send("first").await.unwrap();
        controller.new_conversation();
        controller.send("second").await.unwrap();
        let conversations = controller.conversations();
        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].name, "second");
        assert_eq!(conversations[1].name, "first");
    }

    /// Counts writes made while the controller state was locked.
    #[derive(Default)]
    struct LockCheckingStore {
        inner: MemoryStore,
        shared: OnceLock<Arc<Mutex<Shared>>>,
        writes: AtomicUsize,
        writes_under_lock: AtomicUsize,
    }

    impl KeyValueStore for LockCheckingStore {
        fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> Result<()> {
            if let Some(shared) = self.shared.get() {
                self.writes.fetch_add(1, Ordering::SeqCst);
                if shared.try_lock().is_err() {
                    self.writes_under_lock.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.inner.set(key, value)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key)
        }
    }

    #[tokio::test]
    async fn state_is_written_after_the_lock_is_released() {
        let kv = Arc::new(LockCheckingStore::default());
        let backend = Arc::new(
            ScriptedBackend::default()
                .with_stream(stream(&["Hello"], End::Done))
                .with_title(Ok("Greeting".to_string())),
        );
        let controller = ChatController::load(backend, kv.clone());
        assert!(kv.shared.set(Arc::clone(&controller.shared)).is_ok());

        controller.send("Hi").await.unwrap();
        controller.wait_for_titles().await;
        controller.new_conversation();

        assert!(kv.writes.load(Ordering::SeqCst) >= 3);
        assert_eq!(kv.writes_under_lock.load(Ordering::SeqCst), 0);
        let stored = try_load_state(&*kv).unwrap().unwrap();
        assert_eq!(stored.conversations[0].name, "Greeting");
    }

    #[tokio::test]
    async fn state_is_persisted_and_reloaded() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let backend = Arc::new(
            ScriptedBackend::default()
                .with_stream(stream(&["Hel", "lo!"], End::Done))
                .with_title(Ok("Greeting".to_string())),
        );
        let controller = ChatController::load(backend.clone(), kv.clone());
        controller.send("Hi").await.unwrap();
        controller.wait_for_titles().await;

        let stored = try_load_state(kv.as_ref()).unwrap().unwrap();
        assert!(!stored.is_streaming);
        assert_eq!(stored.conversations[0].name, "Greeting");
        assert_eq!(stored.conversations[0].messages.len(), 2);

        let reloaded = ChatController::load(backend, kv.clone());
        assert_eq!(reloaded.conversations(), controller.conversations());
        assert_eq!(
            reloaded.session().current_conversation_id,
            controller.session().current_conversation_id
        );
        assert!(kv.get(STATE_KEY).unwrap().is_some());
    }
}
