//! Language model boundary.
//!
//! The backbone needs exactly one capability from a model: turn a prompt
//! (plus an optional system message) into text. Callers treat any output
//! they cannot parse as a low-confidence result, never as a crash.

pub mod openai;

use async_trait::async_trait;

pub use openai::{LlmConfig, OpenAiCompatibleClient};

/// Error type for model calls
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Model API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed model response: {0}")]
    Malformed(String),

    #[error("Model returned no choices")]
    EmptyResponse,

    #[error("Model unavailable: {0}")]
    Unavailable(String),
}

pub type LlmResult<T> = Result<T, LlmError>;

/// Text generation capability.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str, system: &str) -> LlmResult<String>;

    /// Identifier used in logs and health output.
    fn model_name(&self) -> &str {
        "unknown"
    }
}
