//! LLM backend error types

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while talking to the LLM backend
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend reported a failure inside an otherwise successful response
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Invalid host '{host}': {reason}")]
    InvalidHost { host: String, reason: String },
}

impl LlmError {
    /// Check if this error is retryable
    ///
    /// Rate limits are not: the caller gets the server's retry-after instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::ApiError { status, .. } => matches!(status, 408 | 500 | 502 | 503 | 504),
            LlmError::Network(e) => !e.is_builder(),
            LlmError::RateLimited { .. }
            | LlmError::InvalidResponse(_)
            | LlmError::Json(_)
            | LlmError::Backend(_)
            | LlmError::InvalidHost { .. } => false,
        }
    }

    /// Check if the server could not be reached at all
    pub fn is_connect(&self) -> bool {
        matches!(self, LlmError::Network(e) if e.is_connect())
    }

    /// Get the retry duration if this is a rate limit error
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Stable machine-readable code for error payloads
    pub fn code(&self) -> &'static str {
        match self {
            LlmError::RateLimited { .. } => "rate_limited",
            LlmError::ApiError { .. } => "api_error",
            LlmError::Network(e) if e.is_connect() => "connection_failed",
            LlmError::Network(e) if e.is_timeout() => "timeout",
            LlmError::Network(_) => "network",
            LlmError::InvalidResponse(_) => "invalid_response",
            LlmError::Json(_) => "invalid_json",
            LlmError::Backend(_) => "backend",
            LlmError::InvalidHost { .. } => "invalid_host",
        }
    }

    /// Structured details for error payloads, where there are any
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            LlmError::RateLimited { retry_after } => {
                Some(serde_json::json!({ "retry_after_ms": retry_after.as_millis() as u64 }))
            }
            LlmError::ApiError { status, .. } => Some(serde_json::json!({ "status": status })),
            LlmError::Network(e) => Some(serde_json::json!({
                "url": e.url().map(|u| u.to_string()),
                "connect": e.is_connect(),
                "timeout": e.is_timeout(),
            })),
            LlmError::InvalidHost { host, .. } => Some(serde_json::json!({ "host": host })),
            LlmError::InvalidResponse(_) | LlmError::Json(_) | LlmError::Backend(_) => None,
        }
    }
}
