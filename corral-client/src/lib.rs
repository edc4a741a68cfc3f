//! Corral HTTP Client
//!
//! Type-safe HTTP clients for the Corral services:
//! - [`StoreClient`] talks to the Work-Item Store and implements
//!   [`WorkItemApi`](corral_core::WorkItemApi)
//! - [`HttpBlobStore`] talks to the content-addressed blob service and
//!   implements [`BlobStore`](corral_core::BlobStore)
//!
//! # Example
//!
//! ```no_run
//! use corral_client::StoreClient;
//! use corral_core::WorkItemApi;
//! use corral_core::domain::WorkItemState;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = StoreClient::new("http://localhost:8080");
//!
//!     let queued = client.list_work_items(&[WorkItemState::Queued]).await?;
//!     println!("{} work items waiting", queued.len());
//!     Ok(())
//! }
//! ```

pub mod blob;
pub mod error;
mod requests;
mod retry;
mod work_items;

// Re-export commonly used types
pub use blob::HttpBlobStore;
pub use error::{ClientError, Result};
pub use retry::RetryPolicy;

use reqwest::Client;
use serde::de::DeserializeOwned;

/// HTTP client for the Work-Item Store API
///
/// Methods are organized into two groups:
/// - Request lifecycle (create, commit, priority, cancel)
/// - Work Item operations used by the dispatcher and runners
///
/// Idempotent reads are retried according to the [`RetryPolicy`]; lock,
/// unlock and state reports are sent exactly once.
#[derive(Debug, Clone)]
pub struct StoreClient {
    /// Base URL of the store (e.g., "http://localhost:8080")
    base_url: String,
    /// HTTP client instance
    client: Client,
    retry: RetryPolicy,
}

impl StoreClient {
    /// Create a new store client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the store API (e.g., "http://localhost:8080")
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new store client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy for idempotent calls
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Get the base URL of the store
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Check the status code of a response whose body is not needed
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}
