//! Content-addressed blob service interface

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::BlobError;
use crate::manifest::Locator;

/// Key-value blob service addressed by content hash
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `data` and returns its locator (possibly with service hints)
    async fn put(&self, data: &[u8]) -> Result<Locator, BlobError>;

    /// Fetches the bytes named by `locator`
    async fn get(&self, locator: &Locator) -> Result<Vec<u8>, BlobError>;
}

/// In-process blob store, used by tests and single-node setups
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blocks: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blocks stored
    pub fn len(&self) -> usize {
        self.blocks.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, locator: &Locator) -> bool {
        self.blocks
            .lock()
            .map(|b| b.contains_key(locator.hash()))
            .unwrap_or(false)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: &[u8]) -> Result<Locator, BlobError> {
        let locator = Locator::for_bytes(data);
        let mut blocks = self
            .blocks
            .lock()
            .map_err(|_| BlobError::Unavailable("block map poisoned".to_string()))?;
        blocks
            .entry(locator.hash().to_string())
            .or_insert_with(|| data.to_vec());
        Ok(locator)
    }

    async fn get(&self, locator: &Locator) -> Result<Vec<u8>, BlobError> {
        let blocks = self
            .blocks
            .lock()
            .map_err(|_| BlobError::Unavailable("block map poisoned".to_string()))?;
        let data = blocks
            .get(locator.hash())
            .cloned()
            .ok_or_else(|| BlobError::NotFound(locator.to_string()))?;
        if !locator.matches(&data) {
            return Err(BlobError::Corrupt(locator.to_string()));
        }
        Ok(data)
    }
}
