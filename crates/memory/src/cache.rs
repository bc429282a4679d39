//! Content-hash keyed embedding cache with least-recently-used eviction.

use std::{collections::HashMap, sync::Arc};

use tracing::info;

use crate::{config::CacheSettings, embeddings::Fingerprint, error::Result, store::MemoryStore};

pub struct EmbeddingCache {
    store: Arc<dyn MemoryStore>,
    settings: CacheSettings,
}

impl EmbeddingCache {
    pub fn new(store: Arc<dyn MemoryStore>, settings: CacheSettings) -> Self {
        Self { store, settings }
    }

    pub fn enabled(&self) -> bool {
        self.settings.enabled
    }

    /// A hit requires the same hash under the same fingerprint, dims included.
    #[cfg(test)]
    pub async fn get(&self, hash: &str, fingerprint: &Fingerprint) -> Result<Option<Vec<f32>>> {
        let mut found = self.get_many(fingerprint, &[hash.to_string()]).await?;
        Ok(found.remove(hash))
    }

    pub async fn get_many(
        &self,
        fingerprint: &Fingerprint,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        if !self.settings.enabled || hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let mut unique: Vec<String> = hashes.to_vec();
        unique.sort();
        unique.dedup();
        self.store.cache_get(fingerprint, &unique).await
    }

    #[cfg(test)]
    pub async fn put(&self, hash: &str, fingerprint: &Fingerprint, vector: Vec<f32>) -> Result<()> {
        self.put_many(fingerprint, &[(hash.to_string(), vector)]).await
    }

    pub async fn put_many(&self, fingerprint: &Fingerprint, entries: &[(String, Vec<f32>)]) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }
        self.store.cache_put(fingerprint, entries).await
    }

    pub async fn entry_count(&self) -> Result<usize> {
        self.store.cache_count().await
    }

    /// Trim to `max_entries`. Returns the number of evicted rows.
    pub async fn prune(&self) -> Result<usize> {
        if !self.settings.enabled {
            return Ok(0);
        }
        let evicted = self.store.cache_prune(self.settings.max_entries).await?;
        if evicted > 0 {
            info!(evicted, "embedding cache: evicted old entries");
        }
        Ok(evicted)
    }
}
