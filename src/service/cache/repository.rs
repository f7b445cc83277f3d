use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::{types::CacheEntry, CacheBackend, CacheError};
use crate::database::DbResult;

/// Read-through cache over a backend. Keys are chosen by the caller.
pub struct CacheRepository<T, B>
where
    T: Send + Sync + 'static,
    B: CacheBackend<T>,
{
    backend: B,
    ttl: Option<Duration>,
    negative_ttl: Duration,
    _phantom: PhantomData<T>,
}

impl<T, B> CacheRepository<T, B>
where
    T: Send + Sync + 'static,
    B: CacheBackend<T>,
{
    pub fn new(backend: B, ttl: Option<Duration>, negative_ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            negative_ttl,
            _phantom: PhantomData,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn get_entry(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, CacheError> {
        self.backend.get(key).await.map_err(|e| CacheError::Backend(e.to_string()))
    }

    pub async fn set_positive(&self, key: &str, value: T) -> Result<Arc<T>, CacheError> {
        let value = Arc::new(value);
        self.backend
            .set(key, Arc::new(CacheEntry::Positive(value.clone())), self.ttl)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(value)
    }

    pub async fn set_negative(&self, key: &str) -> Result<(), CacheError> {
        self.backend
            .set(key, Arc::new(CacheEntry::Negative), Some(self.negative_ttl))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.backend.delete(key).await.map_err(|e| CacheError::Backend(e.to_string()))
    }

    pub async fn clear(&self) -> Result<(), CacheError> {
        self.backend.clear().await.map_err(|e| CacheError::Backend(e.to_string()))
    }

    /// Returns the cached value, or runs `load` and remembers its answer,
    /// including a miss.
    pub async fn get_or_load<F>(&self, key: &str, load: F) -> Result<Option<Arc<T>>, CacheError>
    where
        F: FnOnce() -> DbResult<Option<T>>,
    {
        if let Some(entry) = self.get_entry(key).await? {
            return Ok(entry.value());
        }
        match load()? {
            Some(value) => Ok(Some(self.set_positive(key, value).await?)),
            None => {
                self.set_negative(key).await?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::cache::memory::MemoryCacheBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn loader_runs_once_for_hits_and_misses() {
        let repo: CacheRepository<String, _> =
            CacheRepository::new(MemoryCacheBackend::new(), None, Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let value = repo
                .get_or_load("k:1", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some("one".to_string()))
                })
                .await
                .unwrap();
            assert_eq!(value.as_deref().map(String::as_str), Some("one"));
        }
        for _ in 0..3 {
            let value = repo
                .get_or_load("k:2", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert!(value.is_none());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        repo.delete("k:1").await.unwrap();
        assert!(repo.get_entry("k:1").await.unwrap().is_none());
    }
}
