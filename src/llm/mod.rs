//! Chat-completion provider used for translation, subtitle repair and
//! metadata generation.

pub mod client;
pub mod error;
pub mod types;

use async_trait::async_trait;

pub use client::{OpenAiClient, RetryPolicy};
pub use error::LlmError;

/// Anything that turns a system prompt plus a user prompt into a reply.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, system: &str, user: &str) -> Result<String, LlmError>;
}
