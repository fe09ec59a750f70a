//! Error types for confab.
//!
//! Every fallible operation in the crate reports one of these variants.  The
//! conversation controller recovers from most of them locally; see
//! [`crate::chat::ChatController`] for the propagation rules.

use std::error;
use std::fmt;
use std::io;
use std::sync::Arc;

/// The main error type for confab.
#[derive(Clone, Debug)]
pub enum Error {
    /// The completion endpoint answered with a non-2xx status.
    Endpoint {
        /// HTTP status code.
        status_code: u16,
        /// Response body text, verbatim.
        body: String,
    },

    /// The request never produced a response, or the response body broke off.
    Transport {
        /// Human-readable error message.
        message: String,
        /// Underlying cause.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// The request was cancelled by the caller.
    Abort {
        /// Human-readable error message.
        message: String,
    },

    /// Persisted state could not be decoded.
    Parse {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// Automatic conversation naming failed.
    TitleGeneration {
        /// Human-readable error message.
        message: String,
    },

    /// Error during JSON or YAML serialization or deserialization.
    Serialization {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// I/O error.
    Io {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Arc<io::Error>,
    },

    /// A URL parsing error.
    Url {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<url::ParseError>,
    },

    /// A conversation or message could not be found.
    NotFound {
        /// Resource type.
        resource_type: String,
        /// Resource ID.
        resource_id: String,
    },

    /// Invalid configuration or argument.
    Validation {
        /// Human-readable error message.
        message: String,
        /// Parameter that failed validation.
        param: Option<String>,
    },
}

impl Error {
    /// Creates a new endpoint error.
    pub fn endpoint(status_code: u16, body: impl Into<String>) -> Self {
        Error::Endpoint {
            status_code,
            body: body.into(),
        }
    }

    /// Creates a new transport error.
    pub fn transport(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Transport {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new abort error.
    pub fn abort(message: impl Into<String>) -> Self {
        Error::Abort {
            message: message.into(),
        }
    }

    /// Creates a new parse error.
    pub fn parse(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Parse {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new title generation error.
    pub fn title_generation(message: impl Into<String>) -> Self {
        Error::TitleGeneration {
            message: message.into(),
        }
    }

    /// Creates a new serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Serialization {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new I/O error.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            message: message.into(),
            source: Arc::new(source),
        }
    }

    /// Creates a new URL error.
    pub fn url(message: impl Into<String>, source: Option<url::ParseError>) -> Self {
        Error::Url {
            message: message.into(),
            source,
        }
    }

    /// Creates a new not found error.
    pub fn not_found(resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Error::NotFound {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        }
    }

    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>, param: Option<String>) -> Self {
        Error::Validation {
            message: message.into(),
            param,
        }
    }

    /// Returns true if this error is an endpoint (non-2xx) error.
    pub fn is_endpoint(&self) -> bool {
        matches!(self, Error::Endpoint { .. })
    }

    /// Returns true if this error is a transport error.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// Returns true if this error is an abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, Error::Abort { .. })
    }

    /// Returns true if this error came from decoding persisted state.
    pub fn is_parse(&self) -> bool {
        matches!(self, Error::Parse { .. })
    }

    /// Returns true if this error is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Returns true if this error is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Returns the status code associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Endpoint { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Endpoint { status_code, body } => {
                write!(f, "API error {status_code}: {body}")
            }
            Error::Transport { message, .. } => {
                write!(f, "Transport error: {message}")
            }
            Error::Abort { message } => {
                write!(f, "Request aborted: {message}")
            }
            Error::Parse { message, .. } => {
                write!(f, "Parse error: {message}")
            }
            Error::TitleGeneration { message } => {
                write!(f, "Title generation failed: {message}")
            }
            Error::Serialization { message, .. } => {
                write!(f, "Serialization error: {message}")
            }
            Error::Io { message, .. } => {
                write!(f, "I/O error: {message}")
            }
            Error::Url { message, .. } => {
                write!(f, "URL error: {message}")
            }
            Error::NotFound {
                resource_type,
                resource_id,
            } => {
                write!(f, "Resource not found ({resource_type}) [ID: {resource_id}]")
            }
            Error::Validation { message, param } => {
                if let Some(param) = param {
                    write!(f, "Validation error: {message} (parameter: {param})")
                } else {
                    write!(f, "Validation error: {message}")
                }
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Transport { source, .. }
            | Error::Parse { source, .. }
            | Error::Serialization { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Io { source, .. } => Some(source),
            Error::Url { source, .. } => {
                source.as_ref().map(|e| e as &(dyn error::Error + 'static))
            }
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err.to_string(), err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(format!("JSON error: {err}"), Some(Box::new(err)))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::serialization(format!("YAML error: {err}"), Some(Box::new(err)))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::url(format!("URL parse error: {err}"), Some(err))
    }
}

/// A specialized Result type for confab operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_error_carries_status_and_body() {
        let err = Error::endpoint(503, "overloaded");
        assert!(err.is_endpoint());
        assert_eq!(err.status_code(), Some(503));
        assert_eq!(err.to_string(), "API error 503: overloaded");
    }

    #[test]
    fn abort_is_distinguishable() {
        let err = Error::abort("stopped by user");
        assert!(err.is_abort());
        assert!(!err.is_transport());
        assert_eq!(err.status_code(), None);
    }

    #[test]
    fn transport_exposes_source() {
        let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let err = Error::transport("connection dropped", Some(Box::new(io)));
        assert!(err.is_transport());
        assert!(error::Error::source(&err).is_some());
    }

    #[test]
    fn json_errors_convert_to_serialization() {
        let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization { .. }));
    }
}
