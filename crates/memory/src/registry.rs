//! Process-wide map from cache key to the one manager owning that index.

use std::{collections::HashMap, future::Future, sync::Arc};

use {
    tokio::sync::Mutex,
    tracing::{debug, warn},
};

use crate::{config::MemoryConfig, error::Result, manager::MemoryIndexManager};

/// Construction happens under the map lock so two callers never open the
/// same index concurrently.
#[derive(Default)]
pub struct ManagerRegistry {
    managers: Mutex<HashMap<String, Arc<MemoryIndexManager>>>,
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The manager for `config`, opening it with configured providers on first use.
    pub async fn get_or_open(&self, config: MemoryConfig) -> Result<Arc<MemoryIndexManager>> {
        self.get_or_open_with(config, MemoryIndexManager::open).await
    }

    /// Like [`Self::get_or_open`] with a custom constructor.
    pub async fn get_or_open_with<F, Fut>(
        &self,
        config: MemoryConfig,
        open: F,
    ) -> Result<Arc<MemoryIndexManager>>
    where
        F: FnOnce(MemoryConfig) -> Fut,
        Fut: Future<Output = Result<MemoryIndexManager>>,
    {
        let key = config.cache_key();
        let mut managers = self.managers.lock().await;
        if let Some(existing) = managers.get(&key)
            && !existing.is_closed()
        {
            return Ok(Arc::clone(existing));
        }
        debug!(key, "opening memory index manager");
        let manager = Arc::new(open(config).await?);
        managers.insert(key, Arc::clone(&manager));
        Ok(manager)
    }

    pub async fn get(&self, key: &str) -> Option<Arc<MemoryIndexManager>> {
        self.managers
            .lock()
            .await
            .get(key)
            .filter(|m| !m.is_closed())
            .cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.managers.lock().await.keys().cloned().collect()
    }

    /// Close and forget one manager. Returns whether it was registered.
    pub async fn close(&self, key: &str) -> Result<bool> {
        let removed = self.managers.lock().await.remove(key);
        match removed {
            Some(manager) => {
                manager.close().await?;
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Close every manager, even after one fails. Returns the first error.
    pub async fn close_all(&self) -> Result<()> {
        let managers: Vec<(String, Arc<MemoryIndexManager>)> =
            self.managers.lock().await.drain().collect();
        let mut first = None;
        for (key, manager) in managers {
            if let Err(e) = manager.close().await {
                warn!(key = %key, error = %e, "failed to close memory index manager");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            embeddings::{EmbeddingProvider, ProviderKind},
            error::EmbeddingError,
        },
        async_trait::async_trait,
        std::{
            path::Path,
            sync::atomic::{AtomicUsize, Ordering},
        },
    };

    struct Fixed;

    #[async_trait]
    impl EmbeddingProvider for Fixed {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Local
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn model_name(&self) -> &str {
            "fixed"
        }

        fn dimensions(&self) -> usize {
            2
        }

        fn provider_key(&self) -> &str {
            "fixed"
        }
    }

    fn config(ws: &Path) -> MemoryConfig {
        let mut config = MemoryConfig::for_workspace("agent", ws);
        config.db_path = ws.join("index.sqlite").to_string_lossy().into_owned();
        config.sync.watch = false;
        config
    }

    async fn open_fixed(config: MemoryConfig) -> Result<MemoryIndexManager> {
        MemoryIndexManager::open_with_providers(config, vec![Arc::new(Fixed) as Arc<dyn EmbeddingProvider>]).await
    }

    #[tokio::test]
    async fn one_manager_per_key_under_concurrency() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ManagerRegistry::new();
        let opened = AtomicUsize::new(0);
        let open = |config| {
            opened.fetch_add(1, Ordering::SeqCst);
            open_fixed(config)
        };

        let (a, b) = tokio::join!(
            registry.get_or_open_with(config(tmp.path()), open),
            registry.get_or_open_with(config(tmp.path()), open)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(registry.keys().await, vec![config(tmp.path()).cache_key()]);
        registry.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn closed_manager_is_forgotten() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ManagerRegistry::new();
        let key = config(tmp.path()).cache_key();
        let first = registry
            .get_or_open_with(config(tmp.path()), open_fixed)
            .await
            .unwrap();

        assert!(registry.close(&key).await.unwrap());
        assert!(first.is_closed());
        assert!(registry.get(&key).await.is_none());
        assert!(!registry.close(&key).await.unwrap());

        let reopened = registry
            .get_or_open_with(config(tmp.path()), open_fixed)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &reopened));
        registry.close_all().await.unwrap();
    }

    #[tokio::test]
    async fn close_all_closes_every_manager() {
        let first_ws = tempfile::tempdir().unwrap();
        let second_ws = tempfile::tempdir().unwrap();
        let registry = ManagerRegistry::new();
        let first = registry
            .get_or_open_with(config(first_ws.path()), open_fixed)
            .await
            .unwrap();
        let second = registry
            .get_or_open_with(config(second_ws.path()), open_fixed)
            .await
            .unwrap();
        // Already closed behind the registry's back.
        first.close().await.unwrap();

        registry.close_all().await.unwrap();
        assert!(first.is_closed());
        assert!(second.is_closed());
        assert!(registry.keys().await.is_empty());
    }

    #[test]
    fn settings_change_the_key() {
        let tmp = tempfile::tempdir().unwrap();
        let mut other = config(tmp.path());
        other.chunk_tokens = 200;
        assert_ne!(config(tmp.path()).cache_key(), other.cache_key());
    }
}
