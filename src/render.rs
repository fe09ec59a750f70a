//! Terminal output for the chat front end.
//!
//! The renderer receives streamed reply text, whole messages when a
//! conversation is shown, extracted code blocks, and user-visible notices.

use std::io::{self, Stdout, Write};

use crate::markup::CodeBlock;
use crate::types::Role;

/// ANSI escape code for dim text (used for timestamps and separators).
const ANSI_DIM: &str = "\x1b[2m";

/// ANSI escape code for bold text (used for role labels).
const ANSI_BOLD: &str = "\x1b[1m";

/// ANSI escape code to reset all styling.
const ANSI_RESET: &str = "\x1b[0m";

/// ANSI escape code for cyan text (used for the user label).
const ANSI_CYAN: &str = "\x1b[36m";

/// ANSI escape code for yellow text (used for code block headers).
const ANSI_YELLOW: &str = "\x1b[33m";

/// ANSI escape code for green text (used for the assistant label).
const ANSI_GREEN: &str = "\x1b[32m";

/// ANSI escape code for red text (used for errors).
const ANSI_RED: &str = "\x1b[31m";

/// ANSI escape code for magenta text (used for tool output).
const ANSI_MAGENTA: &str = "\x1b[35m";

/// Trait for rendering chat output.
///
/// This abstraction allows for different rendering strategies:
/// - Plain text with ANSI styling
/// - Plain text without styling (for piping/redirecting)
pub trait Renderer: Send {
    /// Print a chunk of reply text.
    ///
    /// This is called incrementally as tokens are streamed from the endpoint.
    fn print_text(&mut self, text: &str);

    /// Print a whole stored message.
    fn print_message(&mut self, index: usize, role: Role, content: &str);

    /// Print extracted code blocks.
    fn print_code_blocks(&mut self, blocks: &[CodeBlock]);

    /// Print an error message.
    fn print_error(&mut self, error: &str);

    /// Print an informational message.
    fn print_info(&mut self, info: &str);

    /// Called when a reply is complete.
    ///
    /// Used to ensure proper newlines after streaming.
    fn finish_response(&mut self);

    /// Called when the reply is stopped by the user.
    fn print_interrupted(&mut self) {}
}

/// Plain text renderer with optional ANSI styling.
pub struct PlainTextRenderer<W: Write = Stdout> {
    out: W,
    use_color: bool,
    line_start: bool,
}

impl PlainTextRenderer<Stdout> {
    /// Creates a new PlainTextRenderer with ANSI colors enabled.
    pub fn new() -> Self {
        Self::with_color(true)
    }

    /// Creates a new PlainTextRenderer with specified color setting.
    pub fn with_color(use_color: bool) -> Self {
        Self::with_writer(io::stdout(), use_color)
    }
}

impl<W: Write> PlainTextRenderer<W> {
    /// Creates a renderer that writes to `out`.
    pub fn with_writer(out: W, use_color: bool) -> Self {
        Self {
            out,
            use_color,
            line_start: true,
        }
    }

    /// Consumes the renderer and returns its writer.
    pub fn into_inner(self) -> W {
        self.out
    }

    fn write(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let _ = self.out.write_all(text.as_bytes());
        let _ = self.out.flush();
        self.line_start = text.ends_with('\n');
    }

    fn styled(&self, style: &str, text: &str) -> String {
        if self.use_color {
            format!("{style}{text}{ANSI_RESET}")
        } else {
            text.to_string()
        }
    }

    fn end_line(&mut self) {
        if !self.line_start {
            self.write("\n");
        }
    }
}

impl Default for PlainTextRenderer<Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

fn role_label(role: Role) -> (&'static str, &'static str) {
    match role {
        Role::User => ("You", ANSI_CYAN),
        Role::Assistant => ("Assistant", ANSI_GREEN),
        Role::System => ("System", ANSI_DIM),
    }
}

impl<W: Write + Send> Renderer for PlainTextRenderer<W> {
    fn print_text(&mut self, text: &str) {
        self.write(text);
    }

    fn print_message(&mut self, index: usize, role: Role, content: &str) {
        self.end_line();
        let (label, color) = role_label(role);
        let header = format!(
            "{} {}\n",
            self.styled(ANSI_DIM, &format!("[{index}]")),
            self.styled(&format!("{ANSI_BOLD}{color}"), label)
        );
        self.write(&header);
        self.write(content);
        self.end_line();
        self.write("\n");
    }

    fn print_code_blocks(&mut self, blocks: &[CodeBlock]) {
        self.end_line();
        for (n, block) in blocks.iter().enumerate() {
            let kind = if block.is_tool {
                "tool output".to_string()
            } else {
                block.language.clone().unwrap_or_else(|| "text".to_string())
            };
            let header = self.styled(ANSI_YELLOW, &format!("--- [{}] {kind} ---", n + 1));
            self.write(&format!("{header}\n"));
            let body = if block.is_tool {
                self.styled(ANSI_MAGENTA, &block.code)
            } else {
                block.code.clone()
            };
            self.write(&body);
            self.end_line();
        }
    }

    fn print_error(&mut self, error: &str) {
        self.end_line();
        let line = self.styled(ANSI_RED, &format!("Error: {error}"));
        self.write(&format!("{line}\n"));
    }

    fn print_info(&mut self, info: &str) {
        self.end_line();
        self.write(&format!("{info}\n"));
    }

    fn finish_response(&mut self) {
        self.write("\n");
    }

    fn print_interrupted(&mut self) {
        self.end_line();
        let line = self.styled(ANSI_DIM, "[stopped]");
        self.write(&format!("{line}\n"));
    }
}
