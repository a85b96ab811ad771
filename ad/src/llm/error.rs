//! LLM error taxonomy
//!
//! The loop and the dispatcher branch on these variants structurally:
//! transient failures retry, permanent ones fail the call immediately.

use std::time::Duration;
use thiserror::Error;

/// Errors from LLM providers
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Provider error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl LlmError {
    /// Transient failures worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::Api { status, .. } => *status >= 500 || *status == 429,
            LlmError::Timeout(_) => true,
            LlmError::Unavailable(_) => true,
            LlmError::Auth(_) => false,
            LlmError::InvalidInput(_) => false,
        }
    }

    /// Provider-suggested retry delay, when it gave one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
