// Public modules
pub mod completion;
pub mod conversation;
pub mod message;

// Re-exports
pub use completion::{ChatCompletionRequest, ChatMessage, extract_message_text, extract_token_text};
pub use conversation::{Conversation, ConversationId};
pub use message::{Message, MessageId, Role};
