//! Error types for the Corral client

use corral_core::{BlobError, StoreError};
use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur when using the Corral client
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// Error message from the API
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl ClientError {
    /// Create an API error from status code and response body.
    ///
    /// The store answers with `{"error": "..."}`; the message is unwrapped
    /// from that envelope when present.
    pub fn api_error(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);
        Self::ApiError { status, message }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }

    /// Check if this error is a client error (4xx status)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if *status >= 400 && *status < 500)
    }

    /// Check if this error is a server error (5xx status)
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if *status >= 500)
    }

    /// Transport failures and 5xx answers; repeating an idempotent call may help
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(err) => err.is_connect() || err.is_timeout() || err.is_request(),
            _ => self.is_server_error(),
        }
    }
}

impl From<ClientError> for StoreError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::ApiError { status: 404, message } => StoreError::NotFound(message),
            ClientError::ApiError { status: 409, message } => StoreError::Conflict(message),
            ClientError::ApiError { status: 422, message } => StoreError::InvalidState(message),
            ClientError::ApiError { status: 400, message } => StoreError::Validation(message),
            ClientError::ApiError { status, message } if status >= 500 => {
                StoreError::Unavailable(message)
            }
            ClientError::ApiError { status, message } => {
                StoreError::Internal(format!("unexpected status {}: {}", status, message))
            }
            ClientError::RequestFailed(err) => StoreError::Unavailable(err.to_string()),
            ClientError::ParseError(msg) => StoreError::Internal(msg),
        }
    }
}

impl From<ClientError> for BlobError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::ApiError { status: 404, message } => BlobError::NotFound(message),
            ClientError::ApiError { status: 400, message } => BlobError::InvalidLocator(message),
            other => BlobError::Unavailable(other.to_string()),
        }
    }
}
