//! Upstream API error types

use thiserror::Error;

/// Errors that can occur when communicating with the Actions service
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Failed to parse JSON response
    #[error("Failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Server returned an error response
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Credential resolution or token exchange failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Rate limited
    #[error("Rate limited, retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Request timed out
    #[error("Request timed out")]
    Timeout,

    /// All retry attempts exhausted
    #[error("All retry attempts exhausted: {0}")]
    RetryExhausted(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,
}

impl ApiError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Request(e) => e.is_connect() || e.is_timeout(),
            ApiError::Server { status, .. } => *status >= 500,
            ApiError::RateLimited { .. } => true,
            ApiError::Timeout => true,
            _ => false,
        }
    }
}

/// Result type for upstream API operations
pub type ApiResult<T> = Result<T, ApiError>;
