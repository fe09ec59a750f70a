//! Conversation export.

use std::fmt::Write;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

use crate::error::{Error, Result};
use crate::markup::{escape_html, render_message};
use crate::types::{Conversation, ConversationId, Message, MessageId, Role};

const DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const TEXT_SEPARATOR_WIDTH: usize = 50;

/// Output format of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Markdown with one section per message.
    Markdown,
    /// Pretty-printed JSON.
    Json,
    /// Plain text.
    Text,
    /// A standalone HTML page with rendered messages.
    Html,
}

impl ExportFormat {
    /// Looks a format up by name or file extension.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Some(ExportFormat::Markdown),
            "json" => Some(ExportFormat::Json),
            "text" | "txt" => Some(ExportFormat::Text),
            "html" | "htm" => Some(ExportFormat::Html),
            _ => None,
        }
    }

    /// File extension used for exported files.
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Markdown => "md",
            ExportFormat::Json => "json",
            ExportFormat::Text => "txt",
            ExportFormat::Html => "html",
        }
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "You",
        Role::Assistant => "Assistant",
        Role::System => "System",
    }
}

fn format_date(at: OffsetDateTime) -> Result<String> {
    at.format(DATE_FORMAT)
        .map_err(|e| Error::serialization(format!("cannot format date: {e}"), Some(Box::new(e))))
}

/// Builds a file name from the conversation name and the export date.
///
/// Every character that is not an ASCII letter or digit becomes `_`.
pub fn export_file_name(
    conversation: &Conversation,
    format: ExportFormat,
    at: OffsetDateTime,
) -> Result<String> {
    let safe: String = conversation
        .name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    Ok(format!("{safe}_{}.{}", format_date(at)?, format.extension()))
}

/// Renders a conversation in the given format.
pub fn export_conversation(
    conversation: &Conversation,
    format: ExportFormat,
    at: OffsetDateTime,
) -> Result<String> {
    match format {
        ExportFormat::Markdown => to_markdown(conversation, at),
        ExportFormat::Json => to_json(conversation, at),
        ExportFormat::Text => to_text(conversation, at),
        ExportFormat::Html => to_html(conversation, at),
    }
}

fn to_markdown(conversation: &Conversation, at: OffsetDateTime) -> Result<String> {
    let mut out = format!(
        "# {}\n\n*Exported on {}*\n\n",
        conversation.name,
        format_date(at)?
    );
    for (index, message) in conversation.messages.iter().enumerate() {
        let _ = write!(
            out,
            "## **{}**\n\n{}\n\n",
            role_label(message.role),
            message.content
        );
        if index + 1 < conversation.messages.len() {
            out.push_str("---\n\n");
        }
    }
    Ok(out)
}

fn to_text(conversation: &Conversation, at: OffsetDateTime) -> Result<String> {
    let underline = "=".repeat(conversation.name.chars().count());
    let mut out = format!(
        "{}\n{underline}\n\nExported on {}\n\n",
        conversation.name,
        format_date(at)?
    );
    for (index, message) in conversation.messages.iter().enumerate() {
        let _ = write!(
            out,
            "{}:\n{}\n\n",
            role_label(message.role),
            message.content
        );
        if index + 1 < conversation.messages.len() {
            out.push_str(&"-".repeat(TEXT_SEPARATOR_WIDTH));
            out.push_str("\n\n");
        }
    }
    Ok(out)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportedMessage<'a> {
    id: &'a MessageId,
    role: Role,
    content: &'a str,
    #[serde(with = "crate::utils::time")]
    timestamp: OffsetDateTime,
}

impl<'a> From<&'a Message> for ExportedMessage<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            id: &message.id,
            role: message.role,
            content: &message.content,
            timestamp: message.created_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportedConversation<'a> {
    id: &'a ConversationId,
    name: &'a str,
    #[serde(with = "crate::utils::time")]
    last_updated: OffsetDateTime,
    messages: Vec<ExportedMessage<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportDocument<'a> {
    conversation: ExportedConversation<'a>,
    #[serde(with = "crate::utils::time")]
    exported_at: OffsetDateTime,
}

fn to_json(conversation: &Conversation, at: OffsetDateTime) -> Result<String> {
    let document = ExportDocument {
        conversation: ExportedConversation {
            id: &conversation.id,
            name: &conversation.name,
            last_updated: conversation.last_updated,
            messages: conversation.messages.iter().map(ExportedMessage::from).collect(),
        },
        exported_at: at,
    };
    Ok(serde_json::to_string_pretty(&document)?)
}

fn to_html(conversation: &Conversation, at: OffsetDateTime) -> Result<String> {
    let name = escape_html(&conversation.name);
    let mut out = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{name}</title>\n\
         </head>\n<body>\n<h1>{name}</h1>\n<p><em>Exported on {}</em></p>\n",
        format_date(at)?
    );
    for message in &conversation.messages {
        let rendered = render_message(message.role, &message.content);
        let _ = write!(
            out,
            "<section class=\"message {}\">\n<h2>{}</h2>\n{}\n</section>\n",
            message.role,
            role_label(message.role),
            rendered.html
        );
    }
    out.push_str("</body>\n</html>\n");
    Ok(out)
}
