//! Decoding of streamed chat completion responses.
//!
//! The response body is a newline-delimited event stream.  Each line may carry
//! a `data:` marker, the literal `[DONE]` ends the stream, and every other line
//! is a JSON chunk whose token text lives at `choices[0].delta.content` (or
//! `choices[0].text`).  Lines that are not JSON are forwarded verbatim as token
//! text.  Bytes are buffered until a full line boundary is seen so that lines
//! and multi-byte characters split across network chunks decode intact.
//! Invalid UTF-8 within a line is replaced with U+FFFD.

use std::collections::VecDeque;
use std::error;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;

use crate::observability::{STREAM_BYTES, STREAM_TOKENS};
use crate::types::extract_token_text;
use crate::{Error, Result};

/// Marker that prefixes event lines.
const DATA_MARKER: &str = "data:";

/// Sentinel line that terminates the stream.
const DONE_SENTINEL: &str = "[DONE]";

/// One decoded item of a completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// An increment of assistant text.
    Token(String),

    /// The endpoint signalled the end of the stream.
    Done,
}

/// Decode a single, complete line.
///
/// Returns `None` for lines that carry nothing (blank lines, keep-alives and
/// chunks without token text).
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.is_empty() {
        return None;
    }
    let line = match line.strip_prefix(DATA_MARKER) {
        Some(rest) => rest.trim_start(),
        None => line,
    };
    if line == DONE_SENTINEL {
        return Some(StreamEvent::Done);
    }
    match serde_json::from_str::<Value>(line) {
        Ok(chunk) => extract_token_text(&chunk)
            .filter(|token| !token.is_empty())
            .map(|token| StreamEvent::Token(token.to_string())),
        Err(_) => Some(StreamEvent::Token(line.to_string())),
    }
}

/// Splits a byte stream into complete lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let rest = self.buffer.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buffer, rest);
            line.pop();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Returns the unterminated tail once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&tail).into_owned())
    }
}

struct DecodeState<S> {
    stream: S,
    decoder: LineDecoder,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

/// Process a stream of bytes into a stream of token events.
///
/// The returned stream ends after the first [`StreamEvent::Done`] or when the
/// body ends, whichever comes first.  Transport failures surface as
/// [`Error::Transport`].
pub fn process_stream<S, E>(byte_stream: S) -> impl Stream<Item = Result<StreamEvent>>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: error::Error + Send + Sync + 'static,
{
    let state = DecodeState {
        stream: byte_stream,
        decoder: LineDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                if event == StreamEvent::Done {
                    state.finished = true;
                    state.pending.clear();
                }
                return Some((Ok(event), state));
            }
            if state.finished {
                return None;
            }

            match state.stream.next().await {
                Some(Ok(bytes)) => {
                    STREAM_BYTES.count(bytes.len() as u64);
                    let lines = state.decoder.push(&bytes);
                    state.pending.extend(lines.iter().filter_map(|l| parse_line(l)));
                }
                Some(Err(e)) => {
                    state.finished = true;
                    let err = Error::transport(
                        format!("Error in HTTP stream: {e}"),
                        Some(Box::new(e)),
                    );
                    return Some((Err(err), state));
                }
                None => {
                    state.finished = true;
                    let event = state.decoder.finish().and_then(|tail| parse_line(&tail));
                    return match event {
                        Some(StreamEvent::Done) | None => None,
                        Some(event) => Some((Ok(event), state)),
                    };
                }
            }
        }
    })
    .inspect(|event| {
        if matches!(event, Ok(StreamEvent::Token(_))) {
            STREAM_TOKENS.click();
        }
    })
}
