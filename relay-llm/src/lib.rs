//! BYO-key chat-completion client for chatrelay.
//!
//! Pure HTTP client against an OpenAI-compatible `/v1/chat/completions` endpoint.

mod client;
mod error;
mod openai;
mod types;

pub use client::{DEFAULT_COMPLETIONS_URL, LlmClient};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, ChatResponse, Role, Usage};
