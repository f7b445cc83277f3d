use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cyder_tools::log::debug;
use dashmap::DashMap;
use thiserror::Error;

use super::{metrics::CacheMetrics, types::CacheEntry, CacheBackend};

#[derive(Debug, Error)]
#[error("memory cache error: {0}")]
pub struct MemoryCacheError(String);

type Slot<T> = (Arc<CacheEntry<T>>, Option<Instant>);

pub struct MemoryCacheBackend<T> {
    data: Arc<DashMap<String, Slot<T>>>,
    metrics: Arc<CacheMetrics>,
}

// Entries sit behind `Arc`, so cloning never needs `T: Clone`.
impl<T> Clone for MemoryCacheBackend<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> MemoryCacheBackend<T> {
    pub fn new() -> Self {
        let backend = Self {
            data: Arc::new(DashMap::new()),
            metrics: Arc::new(CacheMetrics::default()),
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            backend.clone().spawn_sweeper(Duration::from_secs(60));
        }
        backend
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    fn spawn_sweeper(self, every: Duration) {
        let data = Arc::downgrade(&self.data);
        let metrics = self.metrics.clone();
        drop(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let Some(data) = data.upgrade() else { break };
                let now = Instant::now();
                let before = data.len();
                data.retain(|_, (_, expires)| expires.is_none_or(|at| now < at));
                let removed = before.saturating_sub(data.len());
                if removed > 0 {
                    metrics.record_evictions(removed as u64);
                    debug!("evicted {} expired cache entries", removed);
                }
            }
        });
    }
}

impl<T: Send + Sync + 'static> Default for MemoryCacheBackend<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> CacheBackend<T> for MemoryCacheBackend<T> {
    type Error = MemoryCacheError;

    async fn get(&self, key: &str) -> Result<Option<Arc<CacheEntry<T>>>, Self::Error> {
        let hit = self.data.get(key).and_then(|slot| {
            let (value, expires) = slot.value();
            match expires {
                Some(at) if Instant::now() >= *at => None,
                _ => Some(value.clone()),
            }
        });
        match hit {
            Some(value) => {
                self.metrics.record_hit();
                Ok(Some(value))
            }
            None => {
                self.data.remove_if(key, |_, (_, expires)| expires.is_some_and(|at| Instant::now() >= at));
                self.metrics.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Arc<CacheEntry<T>>, ttl: Option<Duration>) -> Result<(), Self::Error> {
        self.data.insert(key.to_string(), (value, ttl.map(|d| Instant::now() + d)));
        self.metrics.record_set();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Self::Error> {
        self.data.remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        self.data.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn positive_and_negative_entries() {
        let cache = MemoryCacheBackend::<String>::new();
        cache
            .set("a", Arc::new(CacheEntry::Positive(Arc::new("v".to_string()))), None)
            .await
            .unwrap();
        cache.set("b", Arc::new(CacheEntry::Negative), None).await.unwrap();
        assert!(matches!(*cache.get("a").await.unwrap().unwrap(), CacheEntry::Positive(_)));
        assert!(matches!(*cache.get("b").await.unwrap().unwrap(), CacheEntry::Negative));
        assert!(cache.get("c").await.unwrap().is_none());
        assert_eq!(cache.metrics().snapshot().misses, 1);
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryCacheBackend::<String>::new();
        cache
            .set("a", Arc::new(CacheEntry::Negative), Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(cache.get("a").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get("a").await.unwrap().is_none());
    }
}
