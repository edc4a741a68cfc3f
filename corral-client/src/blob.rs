//! HTTP blob service client
//!
//! The blob service stores blocks addressed by their MD5 hash:
//! `PUT /{hash}` uploads a block and answers with its signed locator,
//! `GET /{locator}` downloads it.

use async_trait::async_trait;
use corral_core::manifest::Locator;
use corral_core::{BlobError, BlobStore};
use reqwest::Client;

use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    base_url: String,
    client: Client,
    retry: RetryPolicy,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn put_once(&self, locator: &Locator, data: &[u8]) -> Result<Locator> {
        let url = format!("{}/{}", self.base_url, locator.hash());
        let response = self.client.put(&url).body(data.to_vec()).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::api_error(status.as_u16(), text));
        }

        let stored = text.trim();
        if stored.is_empty() {
            return Ok(locator.clone());
        }
        stored
            .parse::<Locator>()
            .map_err(|e| ClientError::ParseError(format!("bad locator {:?}: {}", stored, e)))
    }

    async fn get_once(&self, locator: &Locator) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.base_url, locator);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::api_error(status.as_u16(), text));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn put(&self, data: &[u8]) -> std::result::Result<Locator, BlobError> {
        let locator = Locator::for_bytes(data);
        let stored = self
            .retry
            .run("blob put", || self.put_once(&locator, data))
            .await?;
        if stored.hash() != locator.hash() {
            return Err(BlobError::Corrupt(format!(
                "service stored {} for block {}",
                stored, locator
            )));
        }
        Ok(stored)
    }

    async fn get(&self, locator: &Locator) -> std::result::Result<Vec<u8>, BlobError> {
        let data = self
            .retry
            .run("blob get", || self.get_once(locator))
            .await?;
        if !locator.matches(&data) {
            return Err(BlobError::Corrupt(locator.to_string()));
        }
        Ok(data)
    }
}
