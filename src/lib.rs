// Public modules
pub mod chat;
pub mod client;
pub mod client_logger;
pub mod error;
pub mod markup;
pub mod observability;
pub mod render;
pub mod sse;
pub mod store;
pub mod types;
pub mod utils;

// Re-exports
pub use client::{ClientConfig, CompletionBackend, CompletionClient};
pub use client_logger::{ClientLogger, TracingClientLogger};
pub use error::{Error, Result};
pub use observability::register_biometrics;
pub use render::{PlainTextRenderer, Renderer};
pub use types::*;
