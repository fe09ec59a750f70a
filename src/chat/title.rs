//! Automatic conversation naming.

use crate::client::CompletionBackend;
use crate::error::{Error, Result};
use crate::types::ChatMessage;

/// Longest title kept after cleaning, in characters.
const MAX_TITLE_CHARS: usize = 60;

/// Builds the single-message prompt that asks for a title.
pub fn title_prompt(first_user_message: &str) -> String {
    format!(
        "Provide a short (max 30 characters) chat title for a conversation whose first user \
         message is:\n\n\"{first_user_message}\"\n\nReturn only the title."
    )
}

/// Normalizes a raw title reply; returns `None` when nothing usable remains.
pub fn clean_title(raw: &str) -> Option<String> {
    let flattened = raw.replace('\n', " ");
    let title: String = flattened.trim().chars().take(MAX_TITLE_CHARS).collect();
    if title.is_empty() { None } else { Some(title) }
}

/// Asks the backend for a title for a conversation that starts with `first_user_message`.
pub async fn generate_title(
    backend: &dyn CompletionBackend,
    first_user_message: &str,
) -> Result<String> {
    if first_user_message.is_empty() {
        return Err(Error::title_generation("conversation has no user message"));
    }
    let prompt = [ChatMessage::user(title_prompt(first_user_message))];
    let reply = backend
        .complete_once(&prompt)
        .await
        .map_err(|e| Error::title_generation(e.to_string()))?;
    clean_title(&reply).ok_or_else(|| Error::title_generation("endpoint returned an empty title"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_quotes_the_first_message() {
        assert_eq!(
            title_prompt("What is Rust?"),
            "Provide a short (max 30 characters) chat title for a conversation whose first user \
             message is:\n\n\"What is Rust?\"\n\nReturn only the title."
        );
    }

    #[test]
    fn newlines_become_spaces_and_edges_are_trimmed() {
        assert_eq!(
            clean_title("  Rust\nBasics \n"),
            Some("Rust Basics".to_string())
        );
    }

    #[test]
    fn long_titles_are_cut() {
        let raw = "x".repeat(100);
        assert_eq!(clean_title(&raw).unwrap().chars().count(), 60);
    }

    #[test]
    fn blank_titles_are_ignored() {
        assert_eq!(clean_title(""), None);
        assert_eq!(clean_title(" \n \n"), None);
    }
}
