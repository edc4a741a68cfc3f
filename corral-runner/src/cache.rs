//! Manifest cache
//!
//! Collections are immutable, so a parsed manifest never goes stale; the
//! cache is bounded only to cap memory. Least recently used entries are
//! evicted first.

use anyhow::{Context, Result};
use corral_core::BlobStore;
use corral_core::manifest::{Locator, Manifest};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

struct Entry {
    manifest: Arc<Manifest>,
    last_used: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    tick: u64,
}

/// Bounded LRU cache of parsed manifests keyed by portable data hash
pub struct ManifestCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ManifestCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                tick: 0,
            }),
        }
    }

    pub fn get(&self, pdh: &str) -> Option<Arc<Manifest>> {
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.get_mut(pdh).map(|entry| {
            entry.last_used = tick;
            entry.manifest.clone()
        })
    }

    pub fn insert(&self, pdh: &str, manifest: Arc<Manifest>) {
        let mut inner = self.lock();
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.entries.contains_key(pdh) && inner.entries.len() >= self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                inner.entries.remove(&key);
            }
        }

        inner.entries.insert(
            pdh.to_string(),
            Entry {
                manifest,
                last_used: tick,
            },
        );
    }

    pub fn invalidate(&self, pdh: &str) {
        self.lock().entries.remove(pdh);
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the manifest for `pdh`, fetching its text from the blob
    /// service on a miss
    pub async fn load(&self, blobs: &dyn BlobStore, pdh: &str) -> Result<Arc<Manifest>> {
        if let Some(manifest) = self.get(pdh) {
            return Ok(manifest);
        }

        let locator: Locator = pdh
            .parse()
            .with_context(|| format!("Invalid portable data hash {:?}", pdh))?;
        let bytes = blobs
            .get(&locator)
            .await
            .with_context(|| format!("While getting collection {}", pdh))?;
        let text = String::from_utf8(bytes)
            .with_context(|| format!("Manifest of {} is not valid UTF-8", pdh))?;
        let manifest = Arc::new(
            Manifest::parse(&text).with_context(|| format!("Error parsing manifest for {}", pdh))?,
        );

        self.insert(pdh, manifest.clone());
        Ok(manifest)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManifestCache {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_core::MemoryBlobStore;

    fn manifest(name: &str) -> Arc<Manifest> {
        Arc::new(
            Manifest::parse(&format!(
                ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:{}\n",
                name
            ))
            .unwrap(),
        )
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = ManifestCache::new(2);
        cache.insert("a", manifest("a"));
        cache.insert("b", manifest("b"));
        assert!(cache.get("a").is_some());

        cache.insert("c", manifest("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = ManifestCache::new(4);
        cache.insert("a", manifest("a"));
        cache.insert("b", manifest("b"));

        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_load_fetches_once() {
        let blobs = MemoryBlobStore::new();
        blobs.put(b"foo").await.unwrap();
        let text = ". acbd18db4cc2f85cedef654fccc4a4d8+3 0:3:foo.txt\n";
        let pdh = blobs.put(text.as_bytes()).await.unwrap().to_string();

        let cache = ManifestCache::default();
        let first = cache.load(&blobs, &pdh).await.unwrap();
        assert_eq!(first.text(), text);
        assert_eq!(cache.len(), 1);

        let again = cache.load(&blobs, &pdh).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn test_load_missing_collection() {
        let cache = ManifestCache::default();
        let blobs = MemoryBlobStore::new();
        let err = cache
            .load(&blobs, "d41d8cd98f00b204e9800998ecf8427f+5")
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("While getting collection"));
        assert!(cache.is_empty());
    }
}
