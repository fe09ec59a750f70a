//! Logging trait for completion client operations.
//!
//! This module provides the [`ClientLogger`] trait that allows users to capture
//! and log all traffic passing through the [`CompletionClient`](crate::CompletionClient).

use crate::types::ChatCompletionRequest;

/// A trait for logging completion client operations.
///
/// # Example
///
/// ```rust,ignore
/// use confab::{ChatCompletionRequest, ClientLogger};
/// use std::io::Write;
/// use std::sync::Mutex;
///
/// struct FileLogger {
///     file: Mutex<std::fs::File>,
/// }
///
/// impl ClientLogger for FileLogger {
///     fn log_request(&self, request: &ChatCompletionRequest<'_>) {
///         let mut file = self.file.lock().unwrap();
///         writeln!(file, "Request: {}", serde_json::to_string(request).unwrap()).unwrap();
///     }
///
///     fn log_token(&self, token: &str) {
///         let mut file = self.file.lock().unwrap();
///         writeln!(file, "Token: {token:?}").unwrap();
///     }
///
///     fn log_response(&self, text: &str) {
///         let mut file = self.file.lock().unwrap();
///         writeln!(file, "Response: {text:?}").unwrap();
///     }
/// }
/// ```
pub trait ClientLogger: Send + Sync {
    /// Log a request body just before it is sent.
    fn log_request(&self, request: &ChatCompletionRequest<'_>);

    /// Log one decoded token of a streaming response.
    fn log_token(&self, token: &str);

    /// Log the final assistant text of a completed request.
    ///
    /// Called once per successful streaming or non-streaming call.  Streams
    /// that end in an error or cancellation are not logged here.
    fn log_response(&self, text: &str);
}

/// A [`ClientLogger`] that forwards traffic to `tracing` at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingClientLogger;

impl ClientLogger for TracingClientLogger {
    fn log_request(&self, request: &ChatCompletionRequest<'_>) {
        tracing::trace!(
            model = request.model,
            messages = request.messages.len(),
            stream = request.stream,
            "completion request"
        );
    }

    fn log_token(&self, token: &str) {
        tracing::trace!(token, "completion token");
    }

    fn log_response(&self, text: &str) {
        tracing::trace!(chars = text.chars().count(), "completion response");
    }
}
