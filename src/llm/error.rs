//! Error type for chat-completion calls.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP 429. `retry_after_ms` comes from the `retry-after` header when present.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-success status.
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("response contained no choices")]
    EmptyResponse,
}

impl LlmError {
    /// Rate limits, network failures and 5xx responses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } | LlmError::NetworkError(_) => true,
            LlmError::ApiError { status, .. } => *status >= 500,
            LlmError::EmptyResponse => false,
        }
    }
}
