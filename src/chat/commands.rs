//! Slash command parsing for the chat application.
//!
//! This module handles parsing of special commands that start with `/`,
//! allowing users to manage conversations and settings without sending
//! messages to the endpoint.

use crate::chat::export::ExportFormat;

/// A reference to a conversation: its position in the listing or its identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationRef {
    /// One-based position in the `/list` output.
    Index(usize),

    /// Conversation identifier.
    Id(String),
}

/// A parsed chat command.
///
/// These commands control the session and are not sent to the endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    /// Clear the selection so the next message starts a new conversation.
    New,

    /// List conversations, most recently updated first.
    List,

    /// Select a conversation.
    Select(ConversationRef),

    /// Delete a conversation.
    Delete(ConversationRef),

    /// Regenerate the last reply of the selected conversation.
    Regenerate,

    /// Put the n-th message (one-based) of the selected conversation under edit.
    Edit(usize),

    /// Abandon the pending edit.
    Cancel,

    /// Export the selected conversation, optionally to a file.
    Export {
        /// Output format.
        format: ExportFormat,
        /// Destination file; a generated name is used when absent.
        path: Option<String>,
    },

    /// Show the code blocks of the last reply.
    Code,

    /// Change the endpoint base URL.
    Endpoint(String),

    /// Set or clear the API key.
    /// `None` clears the key.
    Key(Option<String>),

    /// Change the model.
    Model(String),

    /// Show the current settings.
    Settings,

    /// Show or hide the conversation list.
    Sidebar,

    /// Display help information.
    Help,

    /// Exit the chat application.
    Quit,

    /// Report a parsing error back to the caller.
    Invalid(String),
}

/// Parses user input for slash commands.
///
/// Returns `Some(ChatCommand)` if the input is a command, or `None` if it
/// should be sent as a regular message.
///
/// # Examples
///
/// ```
/// # use confab::chat::parse_command;
/// assert!(parse_command("/quit").is_some());
/// assert!(parse_command("/model gpt-4o-mini").is_some());
/// assert!(parse_command("Hello there!").is_none());
/// ```
pub fn parse_command(input: &str) -> Option<ChatCommand> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let mut parts = rest.splitn(2, ' ');
    let command = parts.next()?.to_lowercase();
    let argument = parts.next().map(|s| s.trim()).filter(|s| !s.is_empty());

    let result = match command.as_str() {
        "new" => ChatCommand::New,
        "list" | "ls" => ChatCommand::List,
        "select" => match argument {
            Some(arg) => ChatCommand::Select(parse_conversation_ref(arg)),
            None => ChatCommand::Invalid("/select requires a number or id".to_string()),
        },
        "delete" | "rm" => match argument {
            Some(arg) => ChatCommand::Delete(parse_conversation_ref(arg)),
            None => ChatCommand::Invalid("/delete requires a number or id".to_string()),
        },
        "regenerate" | "retry" => ChatCommand::Regenerate,
        "edit" => match argument.map(str::parse::<usize>) {
            Some(Ok(n)) if n > 0 => ChatCommand::Edit(n),
            Some(_) => ChatCommand::Invalid("/edit expects a message number".to_string()),
            None => ChatCommand::Invalid("/edit requires a message number".to_string()),
        },
        "cancel" => ChatCommand::Cancel,
        "export" => parse_export_command(argument),
        "code" => ChatCommand::Code,
        "endpoint" => match argument {
            Some(url) => ChatCommand::Endpoint(url.to_string()),
            None => ChatCommand::Invalid("/endpoint requires a base URL".to_string()),
        },
        "key" => ChatCommand::Key(argument.map(|s| s.to_string())),
        "model" => match argument {
            Some(model) => ChatCommand::Model(model.to_string()),
            None => ChatCommand::Invalid("/model requires a model name".to_string()),
        },
        "settings" | "config" => ChatCommand::Settings,
        "sidebar" => ChatCommand::Sidebar,
        "help" | "?" => ChatCommand::Help,
        "quit" | "exit" | "q" => ChatCommand::Quit,
        _ => ChatCommand::Invalid(format!("Unknown command: /{command}")),
    };

    Some(result)
}

fn parse_conversation_ref(arg: &str) -> ConversationRef {
    match arg.parse::<usize>() {
        Ok(n) => ConversationRef::Index(n),
        Err(_) => ConversationRef::Id(arg.to_string()),
    }
}

fn parse_export_command(argument: Option<&str>) -> ChatCommand {
    let Some(arg) = argument else {
        return ChatCommand::Invalid(
            "/export requires a format (markdown, json, text or html)".to_string(),
        );
    };
    let mut parts = arg.splitn(2, ' ');
    let name = parts.next().unwrap_or_default();
    let path = parts
        .next()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    match ExportFormat::from_name(name) {
        Some(format) => ChatCommand::Export { format, path },
        None => ChatCommand::Invalid(format!("Unknown export format: {name}")),
    }
}

/// Returns help text describing available commands.
pub fn help_text() -> &'static str {
    r#"Available commands:
  /new                   Start a new conversation
  /list                  List conversations
  /select <n|id>         Switch to a conversation
  /delete <n|id>         Delete a conversation
  /regenerate            Regenerate the last reply
  /edit <n>              Edit message n and regenerate from there
  /cancel                Cancel a pending edit
  /export <fmt> [file]   Export as markdown, json, text or html
  /code                  Show code blocks from the last reply
  /endpoint <url>        Change the endpoint base URL
  /key [key]             Set the API key (no argument clears it)
  /model <name>          Change the model (e.g., /model gpt-4o-mini)
  /settings              Show current settings
  /sidebar               Toggle the conversation list
  /help                  Show this help message
  /quit                  Exit the chat

Press Ctrl+C while a reply is streaming to stop it."#
}
