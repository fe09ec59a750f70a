//! Turns raw message text into displayable HTML.
//!
//! Assistant text goes through math substitution and then markdown; user text
//! is escaped verbatim.  Fenced code blocks are also returned separately so a
//! front end can offer them for copying.  Blocks fenced as `tool` carry tool
//! output and are flagged as such.

use std::sync::LazyLock;

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd, html};
use regex::{Captures, Regex};

use crate::types::Role;

static CODE_SPAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```.*?```|`[^`]+`").expect("CODE_SPAN pattern is valid")
});
static DISPLAY_DOLLARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\$\$(.+?)\$\$").expect("DISPLAY_DOLLARS pattern is valid")
});
static INLINE_DOLLAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([^$\n]+?)\$").expect("INLINE_DOLLAR pattern is valid"));
static DISPLAY_BRACKETS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)\\\[(.*?)\\\]").expect("DISPLAY_BRACKETS pattern is valid")
});
static INLINE_PARENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\\((.*?)\\\)").expect("INLINE_PARENS pattern is valid"));

const TOOL_LANGUAGE: &str = "tool";

/// A fenced or indented code block found in a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// First word of the fence's info string, if any.
    pub language: Option<String>,

    /// Block contents, without the fences.
    pub code: String,

    /// True for blocks fenced as `tool`.
    pub is_tool: bool,
}

/// The displayable form of one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendered {
    /// HTML fragment.
    pub html: String,

    /// Code blocks in document order.
    pub code_blocks: Vec<CodeBlock>,
}

/// Escapes text for inclusion in HTML content or attribute values.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Renders a message for display.
pub fn render_message(role: Role, content: &str) -> Rendered {
    match role {
        Role::User => Rendered {
            html: escape_html(content).replace('\n', "<br>"),
            code_blocks: Vec::new(),
        },
        Role::Assistant | Role::System => render_markdown(content),
    }
}

struct MathSubstitution {
    text: String,
    rendered: Vec<String>,
}

fn math_element(tex: &str, display: bool) -> String {
    let class = if display { "math-display" } else { "math-inline" };
    format!("<span class=\"math {class}\">{}</span>", escape_html(tex))
}

fn math_placeholder(n: usize) -> String {
    format!("@@MATH{n}@@")
}

/// Swaps math outside code for placeholders and renders each expression.
fn substitute_math(text: &str) -> MathSubstitution {
    let mut code = Vec::new();
    let protected = CODE_SPAN.replace_all(text, |caps: &Captures| {
        code.push(caps[0].to_string());
        format!("%%CODE_BLOCK_{}%%", code.len() - 1)
    });

    let mut rendered = Vec::new();
    let mut text = protected.into_owned();
    let passes: [(&Regex, bool, bool); 4] = [
        (&*DISPLAY_DOLLARS, true, true),
        (&*INLINE_DOLLAR, false, true),
        (&*DISPLAY_BRACKETS, true, false),
        (&*INLINE_PARENS, false, false),
    ];
    for (pattern, display, trim) in passes {
        text = pattern
            .replace_all(&text, |caps: &Captures| {
                let tex = if trim { caps[1].trim() } else { &caps[1] };
                rendered.push(math_element(tex, display));
                math_placeholder(rendered.len() - 1)
            })
            .into_owned();
    }

    for (n, original) in code.iter().enumerate() {
        text = text.replacen(&format!("%%CODE_BLOCK_{n}%%"), original, 1);
    }
    MathSubstitution { text, rendered }
}

fn render_markdown(content: &str) -> Rendered {
    let MathSubstitution { text, rendered } = substitute_math(content);

    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);

    let mut code_blocks = Vec::new();
    let mut current: Option<CodeBlock> = None;
    let events = Parser::new_ext(&text, options).map(|event| {
        match &event {
            Event::Start(Tag::CodeBlock(kind)) => {
                let language = match kind {
                    CodeBlockKind::Fenced(info) => info
                        .split_whitespace()
                        .next()
                        .map(|lang| lang.to_string()),
                    CodeBlockKind::Indented => None,
                };
                current = Some(CodeBlock {
                    is_tool: language.as_deref() == Some(TOOL_LANGUAGE),
                    language,
                    code: String::new(),
                });
            }
            Event::Text(text) => {
                if let Some(block) = current.as_mut() {
                    block.code.push_str(text);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some(block) = current.take() {
                    code_blocks.push(block);
                }
            }
            Event::SoftBreak if current.is_none() => return Event::HardBreak,
            _ => {}
        }
        event
    });

    let mut out = String::new();
    html::push_html(&mut out, events);
    for (n, element) in rendered.iter().enumerate() {
        out = out.replacen(&math_placeholder(n), element, 1);
    }
    Rendered {
        html: out,
        code_blocks,
    }
}
