use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::client_logger::ClientLogger;
use crate::error::{Error, Result};
use crate::observability::{
    CLIENT_REQUEST_DURATION, CLIENT_REQUEST_ERRORS, CLIENT_REQUESTS, STREAM_ABORTS, STREAM_TTFB,
};
use crate::sse::{StreamEvent, process_stream};
use crate::types::{ChatCompletionRequest, ChatMessage, extract_message_text};

/// Default endpoint base URL, a local placeholder.
pub const DEFAULT_BASE_URL: &str = "http://localhost:4321";
/// Default model name.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Endpoint settings for a [`CompletionClient`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL; the completions path is appended to it.
    pub base_url: String,

    /// Bearer token sent in the `Authorization` header, if any.
    pub api_key: Option<String>,

    /// Model name sent with every request.
    pub model: String,

    /// Connect timeout, and total timeout for non-streaming requests.
    pub timeout_secs: u64,
}

impl ClientConfig {
    /// Creates a configuration with the default endpoint, no key and the default model.
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Sets the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Sets or clears the API key.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.is_empty());
        self
    }

    /// Sets the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sets the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs();
        self
    }

    /// Returns the timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns the full completions URL.
    pub fn completions_url(&self) -> String {
        format!("{}{COMPLETIONS_PATH}", self.base_url.trim_end_matches('/'))
    }

    /// Checks that the base URL parses and uses http(s), and that a model is set.
    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.base_url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::validation(
                format!("unsupported URL scheme {:?}", url.scheme()),
                Some("base_url".to_string()),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(Error::validation(
                "model must not be empty",
                Some("model".to_string()),
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A chat completion endpoint.
///
/// Every call carries the full history; implementations keep no
/// conversation state between calls and never retry.
#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Streams a completion, calling `on_token` once per decoded token in arrival order.
    ///
    /// Returns the assembled text.  When `cancel` fires the transport is dropped
    /// and the call fails with [`Error::Abort`]; tokens already handed to
    /// `on_token` are not retracted.
    async fn complete_streaming(
        &self,
        history: &[ChatMessage],
        cancel: &CancellationToken,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<String>;

    /// Requests a completion without streaming.
    async fn complete_once(&self, history: &[ChatMessage]) -> Result<String>;
}

/// HTTP client for an OpenAI-compatible chat completion endpoint.
#[derive(Clone)]
pub struct CompletionClient {
    client: ReqwestClient,
    config: ClientConfig,
    logger: Option<Arc<dyn ClientLogger>>,
}

impl CompletionClient {
    /// Create a new client for the given endpoint configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let client = ReqwestClient::builder()
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| {
                Error::transport(
                    format!("Failed to build HTTP client: {e}"),
                    Some(Box::new(e)),
                )
            })?;

        Ok(Self {
            client,
            config,
            logger: None,
        })
    }

    /// Attaches a logger that observes every request, token and response.
    pub fn with_logger(mut self, logger: Arc<dyn ClientLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Returns the endpoint configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Create and return default headers for API requests.
    fn default_headers(&self, stream: bool) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(
            header::ACCEPT,
            if stream {
                HeaderValue::from_static("text/event-stream")
            } else {
                HeaderValue::from_static("application/json")
            },
        );
        if let Some(key) = &self.config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| {
                Error::validation(
                    "API key contains characters not allowed in a header",
                    Some("api_key".to_string()),
                )
            })?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn post(&self, history: &[ChatMessage], stream: bool) -> Result<Response> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: history,
            stream,
        };
        if let Some(logger) = &self.logger {
            logger.log_request(&request);
        }
        CLIENT_REQUESTS.click();

        let mut builder = self
            .client
            .post(self.config.completions_url())
            .headers(self.default_headers(stream)?)
            .json(&request);
        if !stream {
            builder = builder.timeout(self.config.timeout());
        }

        let response = builder.send().await.map_err(|e| {
            CLIENT_REQUEST_ERRORS.click();
            if e.is_timeout() {
                Error::transport(format!("Request timed out: {e}"), Some(Box::new(e)))
            } else if e.is_connect() {
                Error::transport(format!("Connection error: {e}"), Some(Box::new(e)))
            } else {
                Error::transport(format!("Request failed: {e}"), Some(Box::new(e)))
            }
        })?;

        if !response.status().is_success() {
            CLIENT_REQUEST_ERRORS.click();
            return Err(Self::process_error_response(response).await);
        }
        Ok(response)
    }

    /// Process API response errors and convert to our Error type
    async fn process_error_response(response: Response) -> Error {
        let status_code = response.status().as_u16();
        match response.text().await {
            Ok(body) => Error::endpoint(status_code, body),
            Err(e) => Error::transport(
                format!("Failed to read error response ({status_code}): {e}"),
                Some(Box::new(e)),
            ),
        }
    }
}

impl fmt::Debug for CompletionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionClient")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .field("has_api_key", &self.config.api_key.is_some())
            .finish()
    }
}

#[async_trait::async_trait]
impl CompletionBackend for CompletionClient {
    async fn complete_streaming(
        &self,
        history: &[ChatMessage],
        cancel: &CancellationToken,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<String> {
        if cancel.is_cancelled() {
            STREAM_ABORTS.click();
            return Err(Error::abort("cancelled before the request was sent"));
        }
        let start = Instant::now();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                STREAM_ABORTS.click();
                return Err(Error::abort("cancelled while waiting for the endpoint"));
            }
            response = self.post(history, true) => response?,
        };

        let events = process_stream(response.bytes_stream());
        futures::pin_mut!(events);

        let mut text = String::new();
        let mut first_token = true;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    STREAM_ABORTS.click();
                    return Err(Error::abort("cancelled while streaming"));
                }
                next = events.next() => next,
            };
            match next {
                Some(Ok(StreamEvent::Token(token))) => {
                    if first_token {
                        STREAM_TTFB.add(start.elapsed().as_secs_f64());
                        first_token = false;
                    }
                    if let Some(logger) = &self.logger {
                        logger.log_token(&token);
                    }
                    text.push_str(&token);
                    on_token(&token);
                }
                Some(Ok(StreamEvent::Done)) | None => break,
                Some(Err(e)) => {
                    CLIENT_REQUEST_ERRORS.click();
                    return Err(e);
                }
            }
        }

        CLIENT_REQUEST_DURATION.add(start.elapsed().as_secs_f64());
        if let Some(logger) = &self.logger {
            logger.log_response(&text);
        }
        Ok(text)
    }

    async fn complete_once(&self, history: &[ChatMessage]) -> Result<String> {
        let start = Instant::now();
        let response = self.post(history, false).await?;
        let body = response.text().await.map_err(|e| {
            CLIENT_REQUEST_ERRORS.click();
            Error::transport(format!("Failed to read response: {e}"), Some(Box::new(e)))
        })?;
        let value: Value = serde_json::from_str(&body).map_err(|e| {
            Error::serialization(format!("Failed to parse response: {e}"), Some(Box::new(e)))
        })?;
        let text = extract_message_text(&value).unwrap_or_default().to_string();

        CLIENT_REQUEST_DURATION.add(start.elapsed().as_secs_f64());
        if let Some(logger) = &self.logger {
            logger.log_response(&text);
        }
        Ok(text)
    }
}
