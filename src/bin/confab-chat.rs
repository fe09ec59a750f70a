//! Interactive terminal chat against an OpenAI-compatible completion endpoint.
//!
//! Conversations and endpoint settings are saved under the state directory
//! and restored on the next start.
//!
//! # Usage
//!
//! ```bash
//! # Talk to the default local endpoint
//! confab-chat
//!
//! # Point at another endpoint and model
//! confab-chat --base-url https://api.example.com --api-key sk-... --model gpt-4o
//!
//! # Read endpoint settings from a YAML file
//! confab-chat --settings ~/.config/confab.yaml
//!
//! # Disable colors (useful for piping output)
//! confab-chat --no-color
//! ```
//!
//! Type `/help` at the prompt for the list of commands.  Ctrl+C while a reply
//! is streaming stops it and keeps what arrived so far.

use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;
use utf8path::Path;

use confab::chat::{
    ChatArgs, ChatCommand, ChatConfig, ChatController, ConversationRef, GenerationOutcome,
    Settings, export_conversation, export_file_name, help_text, parse_command, save_settings,
};
use confab::markup::render_message;
use confab::store::{FileStore, KeyValueStore, MemoryStore};
use confab::{
    ClientConfig, CompletionBackend, CompletionClient, Conversation, ConversationId, MessageId,
    PlainTextRenderer, Renderer, Role, TracingClientLogger,
};

/// How often the streaming message is polled for new text.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How long to wait for pending title requests on exit.
const TITLE_GRACE: Duration = Duration::from_secs(5);

/// Main entry point for the confab-chat application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let (args, _) = ChatArgs::from_command_line_relaxed("confab-chat [OPTIONS]");
    let config = ChatConfig::from_args(&args);
    let kv = open_store(config.state_dir.as_ref())?;
    let config = config.resolve(&args, kv.as_ref())?;

    let mut renderer = PlainTextRenderer::with_color(config.use_color);
    let mut client_config = config.client.clone();
    let mut controller = ChatController::load(make_backend(&client_config)?, Arc::clone(&kv));
    let mut rl = DefaultEditor::new()?;

    let stop = controller.stop_handle();
    ctrlc::set_handler(move || {
        stop.stop();
    })?;

    println!(
        "confab chat (endpoint: {}, model: {})",
        client_config.base_url, client_config.model
    );
    println!("Type /help for commands, /quit to exit\n");
    if let Some(conversation) = controller.current_conversation() {
        renderer.print_info(&format!("Continuing \"{}\"", conversation.name));
    }
    if controller.session().sidebar_open {
        print_list(&controller);
    }

    let mut pending_edit: Option<MessageId> = None;
    loop {
        let prompt = if pending_edit.is_some() { "Edit: " } else { "You: " };
        let line = match rl.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C at prompt - soft interrupt
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                // Ctrl+D - exit
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                renderer.print_error(&format!("Input error: {err}"));
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(line);

        let Some(command) = parse_command(line) else {
            println!("Assistant:");
            match pending_edit.take() {
                Some(message_id) => {
                    let edit = controller.edit_and_regenerate(&message_id, line);
                    stream_reply(&controller, &mut renderer, edit).await;
                }
                None => {
                    let send = controller.send(line);
                    stream_reply(&controller, &mut renderer, send).await;
                }
            }
            continue;
        };

        match command {
            ChatCommand::Quit => {
                println!("Goodbye!");
                break;
            }
            ChatCommand::Help => {
                for line in help_text().lines() {
                    println!("    {line}");
                }
            }
            ChatCommand::New => {
                pending_edit = None;
                controller.cancel_edit();
                controller.new_conversation();
                renderer.print_info("Your next message starts a new conversation.");
            }
            ChatCommand::List => print_list(&controller),
            ChatCommand::Sidebar => {
                if controller.toggle_sidebar() {
                    print_list(&controller);
                } else {
                    renderer.print_info("Conversation list hidden.");
                }
            }
            ChatCommand::Select(reference) => {
                let Some(id) = resolve(&controller, &reference) else {
                    renderer.print_error("No such conversation.");
                    continue;
                };
                pending_edit = None;
                controller.cancel_edit();
                controller.select(&id);
                if let Some(conversation) = controller.conversation(&id) {
                    show_conversation(&mut renderer, &conversation);
                }
            }
            ChatCommand::Delete(reference) => {
                match resolve(&controller, &reference) {
                    Some(id) if controller.delete(&id) => {
                        if controller.session().editing_message_id.is_none() {
                            pending_edit = None;
                        }
                        renderer.print_info("Conversation deleted.");
                    }
                    _ => renderer.print_error("No such conversation."),
                }
            }
            ChatCommand::Regenerate => {
                let Some(conversation) = controller.current_conversation() else {
                    renderer.print_error("No conversation is selected.");
                    continue;
                };
                if conversation.last_message().map(|m| m.role) != Some(Role::Assistant) {
                    renderer.print_error("The last message is not a reply.");
                    continue;
                }
                println!("Assistant:");
                let regenerate = controller.regenerate(&conversation.id);
                stream_reply(&controller, &mut renderer, regenerate).await;
            }
            ChatCommand::Edit(n) => {
                let Some(conversation) = controller.current_conversation() else {
                    renderer.print_error("No conversation is selected.");
                    continue;
                };
                let Some(message) = conversation.messages.get(n - 1) else {
                    renderer.print_error(&format!("There is no message {n}."));
                    continue;
                };
                match controller.begin_edit(&message.id) {
                    Some(text) => {
                        renderer.print_info(&format!(
                            "Editing message {n}:\n{text}\nEnter the replacement text, or /cancel."
                        ));
                        pending_edit = Some(message.id.clone());
                    }
                    None => renderer.print_error("Only your own messages can be edited."),
                }
            }
            ChatCommand::Cancel => {
                controller.cancel_edit();
                if pending_edit.take().is_some() {
                    renderer.print_info("Edit cancelled.");
                }
            }
            ChatCommand::Export { format, path } => {
                let Some(conversation) = controller.current_conversation() else {
                    renderer.print_error("No conversation is selected.");
                    continue;
                };
                let now = confab::utils::time::now();
                let written = export_conversation(&conversation, format, now).and_then(|text| {
                    let path = match path {
                        Some(path) => path,
                        None => export_file_name(&conversation, format, now)?,
                    };
                    fs::write(&path, text)?;
                    Ok(path)
                });
                match written {
                    Ok(path) => renderer.print_info(&format!("Exported to {path}")),
                    Err(err) => renderer.print_error(&format!("Export failed: {err}")),
                }
            }
            ChatCommand::Code => {
                let reply = controller.current_conversation().and_then(|conversation| {
                    conversation
                        .messages
                        .iter()
                        .rev()
                        .find(|m| m.role == Role::Assistant)
                        .map(|m| m.content.clone())
                });
                let blocks = reply
                    .map(|content| render_message(Role::Assistant, &content).code_blocks)
                    .unwrap_or_default();
                if blocks.is_empty() {
                    renderer.print_info("The last reply has no code blocks.");
                } else {
                    renderer.print_code_blocks(&blocks);
                }
            }
            ChatCommand::Endpoint(url) => {
                let updated = client_config.clone().with_base_url(url);
                if apply_settings(&mut controller, kv.as_ref(), &mut renderer, &updated) {
                    renderer.print_info(&format!("Endpoint set to {}", updated.base_url));
                    client_config = updated;
                }
            }
            ChatCommand::Key(key) => {
                let updated = client_config.clone().with_api_key(key);
                if apply_settings(&mut controller, kv.as_ref(), &mut renderer, &updated) {
                    match updated.api_key {
                        Some(_) => renderer.print_info("API key set."),
                        None => renderer.print_info("API key cleared."),
                    }
                    client_config = updated;
                }
            }
            ChatCommand::Model(model) => {
                let updated = client_config.clone().with_model(model);
                if apply_settings(&mut controller, kv.as_ref(), &mut renderer, &updated) {
                    renderer.print_info(&format!("Model changed to: {}", updated.model));
                    client_config = updated;
                }
            }
            ChatCommand::Settings => {
                let mut shown = Settings::from(&client_config);
                shown.api_key = shown.api_key.map(|key| mask_key(&key));
                match serde_yaml::to_string(&shown) {
                    Ok(yaml) => {
                        println!("    Current Settings:");
                        for line in yaml.lines() {
                            println!("      {line}");
                        }
                    }
                    Err(err) => renderer.print_error(&err.to_string()),
                }
                match &config.state_dir {
                    Some(dir) => println!("      state directory: {}", dir.display()),
                    None => println!("      state directory: (in memory)"),
                }
            }
            ChatCommand::Invalid(message) => renderer.print_error(&message),
        }
    }

    if tokio::time::timeout(TITLE_GRACE, controller.wait_for_titles())
        .await
        .is_err()
    {
        tracing::debug!("abandoning pending title requests");
    }
    Ok(())
}

fn open_store(state_dir: Option<&PathBuf>) -> confab::Result<Arc<dyn KeyValueStore>> {
    match state_dir {
        Some(dir) => {
            let root = Path::try_from(dir.clone()).map_err(std::io::Error::other)?;
            Ok(Arc::new(FileStore::open(root)?))
        }
        None => {
            tracing::warn!("no state directory available; conversations will not be saved");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn make_backend(config: &ClientConfig) -> confab::Result<Arc<dyn CompletionBackend>> {
    let client = CompletionClient::new(config.clone())?.with_logger(Arc::new(TracingClientLogger));
    Ok(Arc::new(client))
}

/// Swaps in a backend for `config` and saves the settings.
///
/// Returns false, leaving everything unchanged, when the settings are invalid.
fn apply_settings<R: Renderer>(
    controller: &mut ChatController,
    kv: &dyn KeyValueStore,
    renderer: &mut R,
    config: &ClientConfig,
) -> bool {
    let backend = match make_backend(config) {
        Ok(backend) => backend,
        Err(err) => {
            renderer.print_error(&err.to_string());
            return false;
        }
    };
    controller.set_backend(backend);
    if let Err(err) = save_settings(kv, config) {
        tracing::error!(error = %err, "failed to save settings");
        renderer.print_error(&format!("Settings apply to this session only: {err}"));
    }
    true
}

fn mask_key(key: &str) -> String {
    let count = key.chars().count();
    let visible: String = key.chars().skip(count.saturating_sub(4)).collect();
    format!("****{visible}")
}

fn resolve(controller: &ChatController, reference: &ConversationRef) -> Option<ConversationId> {
    match reference {
        ConversationRef::Index(n) => controller
            .conversations_by_recency()
            .into_iter()
            .nth(n.checked_sub(1)?)
            .map(|c| c.id),
        ConversationRef::Id(id) => {
            let id = ConversationId::from(id.as_str());
            controller.conversation(&id).map(|c| c.id)
        }
    }
}

fn print_list(controller: &ChatController) {
    let conversations = controller.conversations_by_recency();
    if conversations.is_empty() {
        println!("    (no conversations)");
        return;
    }
    let current = controller.session().current_conversation_id;
    for (n, conversation) in conversations.iter().enumerate() {
        let marker = if current.as_ref() == Some(&conversation.id) {
            "*"
        } else {
            " "
        };
        println!(
            "  {marker} {}. {} ({} messages)",
            n + 1,
            conversation.name,
            conversation.messages.len()
        );
    }
}

fn show_conversation<R: Renderer>(renderer: &mut R, conversation: &Conversation) {
    renderer.print_info(&format!("== {} ==", conversation.name));
    for (n, message) in conversation.messages.iter().enumerate() {
        renderer.print_message(n + 1, message.role, &message.content);
    }
}

/// Runs a generation while echoing the streaming message as it grows.
async fn stream_reply<R, F>(controller: &ChatController, renderer: &mut R, generation: F)
where
    R: Renderer,
    F: Future<Output = confab::Result<GenerationOutcome>>,
{
    tokio::pin!(generation);
    let mut printed = String::new();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let outcome = loop {
        tokio::select! {
            outcome = &mut generation => break outcome,
            _ = ticker.tick() => {
                let Some(streaming) = controller.streaming_message() else {
                    continue;
                };
                let fresh = streaming
                    .message
                    .content
                    .strip_prefix(printed.as_str())
                    .unwrap_or_default()
                    .to_string();
                if !fresh.is_empty() {
                    renderer.print_text(&fresh);
                    printed.push_str(&fresh);
                }
            }
        }
    };

    match outcome {
        Ok(GenerationOutcome::Completed {
            conversation_id,
            message_id,
            fallback,
        }) => {
            let content = controller
                .conversation(&conversation_id)
                .and_then(|c| c.message(&message_id).map(|m| m.content.clone()))
                .unwrap_or_default();
            match content.strip_prefix(printed.as_str()) {
                Some(rest) => renderer.print_text(rest),
                None => {
                    if !printed.is_empty() {
                        renderer.finish_response();
                    }
                    renderer.print_text(&content);
                }
            }
            renderer.finish_response();
            if fallback {
                renderer.print_info("(streaming failed; the reply was fetched in one request)");
            }
        }
        Ok(GenerationOutcome::Interrupted { message_id, .. }) => {
            renderer.print_interrupted();
            if message_id.is_none() {
                renderer.print_info("Nothing was kept.");
            }
        }
        Ok(GenerationOutcome::NoPrompt { .. }) => {
            renderer.print_info("Nothing to regenerate: the conversation has no user message.");
        }
        Ok(GenerationOutcome::Busy) => {
            renderer.print_error("A reply is already being generated.");
        }
        Ok(GenerationOutcome::Ignored) => {}
        Err(err) => renderer.print_error(&err.to_string()),
    }
}
