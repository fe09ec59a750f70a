//! Chat application layer.
//!
//! This module turns user events into conversation changes and completion
//! requests.  It supports:
//!
//! - Streaming replies with stop, partial salvage, and a non-streaming fallback
//! - Regenerating replies and editing earlier user messages
//! - Automatic conversation titles
//! - Export to markdown, JSON, text, and HTML
//! - Slash commands for the terminal front end
//!
//! # Architecture
//!
//! - [`controller`]: the conversation state machine
//! - [`session`]: session state and the single-flight generation gate
//! - [`title`]: title requests
//! - [`export`]: conversation export
//! - [`commands`]: slash command parsing
//! - [`config`]: CLI arguments and endpoint settings

pub mod commands;
pub mod config;
pub mod controller;
pub mod export;
pub mod session;
pub mod title;

pub use commands::{ChatCommand, ConversationRef, help_text, parse_command};
pub use config::{
    ChatArgs, ChatConfig, Settings, default_state_dir, load_settings, save_settings,
};
pub use controller::{ChatController, GenerationOutcome};
pub use export::{ExportFormat, export_conversation, export_file_name};
pub use session::{GenerationGate, SessionState, StopHandle, StreamingMessage};
pub use title::{clean_title, generate_title, title_prompt};
