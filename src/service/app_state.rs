use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use cyder_tools::log::{debug, error, info, warn};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::aggregator::Aggregator;
use super::cache::channel::ChannelCache;
use super::cache::error_rule::ErrorRuleCache;
use super::cache::memory::MemoryCacheBackend;
use super::cache::repository::CacheRepository;
use super::cache::CacheError;
use super::http_client::HttpClientPool;
use super::log_table::LogTableRouter;
use super::log_writer::LogWriter;
use crate::config::FinalConfig;
use crate::database::log::ConsumptionLog;
use crate::database::token::Token;
use crate::database::{DbError, SharedStore};
use crate::relay::adaptor::AdaptorRegistry;
use crate::task::adaptor::TaskAdaptorRegistry;
use crate::task::poller::PollingService;
use crate::utils::auth::JwtKeys;

#[derive(Debug, Error)]
pub enum AppStoreError {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("database error: {0}")]
    Db(#[from] DbError),
}

enum CacheKey<'a> {
    TokenKey(&'a str),
}

impl std::fmt::Display for CacheKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::TokenKey(key) => write!(f, "token:key:{}", key),
        }
    }
}

pub struct AppState {
    pub config: Arc<FinalConfig>,
    pub store: SharedStore,
    pub channels: ChannelCache,
    pub error_rules: ErrorRuleCache,
    token_cache: CacheRepository<Token, MemoryCacheBackend<Token>>,
    pub http: HttpClientPool,
    pub log_writer: Arc<LogWriter>,
    pub log_tables: LogTableRouter,
    pub aggregator: Arc<Aggregator>,
    pub jwt: JwtKeys,
    pub adaptors: AdaptorRegistry,
    pub task_adaptors: TaskAdaptorRegistry,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Builds the state and loads the channel and error-rule snapshots.
    /// Background workers are started separately by [`AppState::start_background`].
    pub fn new(config: FinalConfig, store: SharedStore) -> Result<Arc<Self>, AppStoreError> {
        let channels = ChannelCache::new(Duration::from_secs(config.relay.cooldown_secs));
        let error_rules = ErrorRuleCache::new();
        let channel_count = channels.reload(store.as_ref())?;
        let rule_count = error_rules.reload(store.as_ref())?;
        info!("loaded {} channels and {} error rules", channel_count, rule_count);

        let token_cache = CacheRepository::new(
            MemoryCacheBackend::new(),
            Some(config.cache.ttl()),
            config.cache.negative_ttl(),
        );
        let state = AppState {
            http: HttpClientPool::new(config.proxy.clone()),
            log_writer: LogWriter::new(store.clone(), &config.log_writer),
            log_tables: LogTableRouter::new(store.clone(), config.tz()),
            aggregator: Aggregator::new(store.clone(), &config.aggregator),
            jwt: JwtKeys::new(config.jwt_secret.as_bytes()),
            adaptors: AdaptorRegistry::with_builtin(),
            task_adaptors: TaskAdaptorRegistry::with_builtin(),
            config: Arc::new(config),
            store,
            channels,
            error_rules,
            token_cache,
            shutdown: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        };
        Ok(Arc::new(state))
    }

    pub fn start_background(self: &Arc<Self>) {
        self.log_writer.start();
        self.aggregator.start(self.config.aggregator.workers);

        let mut handles = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        handles.push(self.spawn_cache_sync());
        if self.config.task.enabled {
            let poller = PollingService::new(self.clone());
            let cancel = self.shutdown.clone();
            handles.push(tokio::spawn(async move { poller.run(cancel).await }));
        }
    }

    fn spawn_cache_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let state = self.clone();
        let cancel = self.shutdown.clone();
        let every = Duration::from_secs(self.config.relay.sync_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let reload = state.clone();
                        match tokio::task::spawn_blocking(move || reload.reload_snapshots()).await {
                            Ok(Err(err)) => warn!("cache sync failed: {}", err),
                            Err(err) => error!("cache sync task failed: {}", err),
                            Ok(Ok(())) => {}
                        }
                        state.refresh_token_cache().await;
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    pub fn reload_snapshots(&self) -> Result<(), DbError> {
        let channels = self.channels.reload(self.store.as_ref())?;
        let rules = self.error_rules.reload(self.store.as_ref())?;
        debug!("cache sync: {} channels, {} error rules", channels, rules);
        Ok(())
    }

    /// Looks a token up by key through the cache. Misses are remembered briefly.
    pub async fn get_token(&self, key: &str) -> Result<Option<Arc<Token>>, AppStoreError> {
        let cache_key = CacheKey::TokenKey(key).to_string();
        let store = self.store.clone();
        let token = self
            .token_cache
            .get_or_load(&cache_key, || store.get_token_by_key(key))
            .await?;
        Ok(token)
    }

    /// Drops every cached token so status and quota edits made elsewhere
    /// are seen on the next request.
    pub async fn refresh_token_cache(&self) {
        let metrics = self.token_cache.backend().metrics().snapshot();
        debug!(
            "token cache: {} hits, {} misses, hit rate {:.2}",
            metrics.hits, metrics.misses, metrics.hit_rate
        );
        if let Err(err) = self.token_cache.clear().await {
            warn!("failed to clear token cache: {}", err);
        }
    }

    pub async fn invalidate_token(&self, key: &str) {
        let cache_key = CacheKey::TokenKey(key).to_string();
        if let Err(err) = self.token_cache.delete(&cache_key).await {
            warn!("failed to invalidate token cache for {}: {}", cache_key, err);
        }
    }

    /// Routes a log row to its daily table and queues it.
    pub fn record_log(&self, log: ConsumptionLog) {
        match self.log_tables.get_log_table_name(log.created_at) {
            Ok(table) => self.log_writer.add_log_async(table, log),
            Err(err) => error!(
                "no log table for {}: {} row={}",
                log.created_at,
                err,
                serde_json::to_string(&log).unwrap_or_default()
            ),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops the poller and cache sync, then drains the aggregators and the log buffer.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.background.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            let _ = handle.await;
        }
        self.aggregator.shutdown().await;
        self.log_writer.shutdown().await;
        info!("background workers stopped");
    }
}

pub type StateRouter = Router<Arc<AppState>>;

pub fn create_state_router() -> StateRouter {
    Router::<Arc<AppState>>::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryStore;
    use crate::database::SeedStore;

    fn state() -> (Arc<MemoryStore>, Arc<AppState>) {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(FinalConfig::default(), store.clone()).unwrap();
        (store, state)
    }

    #[tokio::test]
    async fn token_lookup_goes_through_cache() {
        let (store, state) = state();
        assert!(state.get_token("sk-late").await.unwrap().is_none());

        let token = Token { id: 1, user_id: 1, key: "sk-late".to_string(), ..Default::default() };
        store.upsert_token(&token).unwrap();
        // The miss is still cached.
        assert!(state.get_token("sk-late").await.unwrap().is_none());

        state.invalidate_token("sk-late").await;
        assert_eq!(state.get_token("sk-late").await.unwrap().unwrap().id, 1);
    }

    #[tokio::test]
    async fn cache_refresh_picks_up_token_edits() {
        let (store, state) = state();
        let token = Token { id: 2, user_id: 1, key: "sk-edit".to_string(), remain_quota: 5, ..Default::default() };
        store.upsert_token(&token).unwrap();
        assert_eq!(state.get_token("sk-edit").await.unwrap().unwrap().remain_quota, 5);

        store.upsert_token(&Token { remain_quota: 9, ..token }).unwrap();
        assert_eq!(state.get_token("sk-edit").await.unwrap().unwrap().remain_quota, 5);
        state.refresh_token_cache().await;
        assert_eq!(state.get_token("sk-edit").await.unwrap().unwrap().remain_quota, 9);
    }

    #[tokio::test]
    async fn logs_are_routed_and_drained_on_shutdown() {
        let (store, state) = state();
        state.start_background();
        let log = ConsumptionLog { id: 7, user_id: 1, created_at: 1_735_689_600, ..Default::default() };
        state.record_log(log);
        state.shutdown().await;
        use crate::database::log::LogStore;
        let rows = store.list_logs("logs_2025_01_01", None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 7);
    }
}
