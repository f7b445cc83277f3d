use std::sync::Arc;

use cyder_tools::log::{error, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AggregatorConfig;
use crate::database::stat::HourFilter;
use crate::database::SharedStore;

pub const HOUR: i64 = 3600;
pub const HEALTH_SLICE: i64 = 300;
pub const MAX_RANGE_SECS: i64 = 31 * 24 * HOUR;
pub const MAX_LIMIT: usize = 500;

pub fn hour_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(HOUR)
}

pub fn slice_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(HEALTH_SLICE)
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatEvent {
    UserCall { ts: i64, user_id: i64, success: bool },
    ModelHealth { ts: i64, model_name: String, success: bool, latency_ms: i64 },
}

fn write_event(store: &SharedStore, event: &StatEvent) {
    let result = match event {
        StatEvent::UserCall { ts, user_id, success } => store.record_user_call(hour_start(*ts), *user_id, *success),
        StatEvent::ModelHealth { ts, model_name, success, latency_ms } => {
            store.record_model_health(slice_start(*ts), model_name, *success, *latency_ms)
        }
    };
    if let Err(err) = result {
        error!("failed to write stat event {:?}: {}", event, err);
    }
}

/// Worker pool writing hourly user-call and 5-minute model-health counters.
pub struct Aggregator {
    store: SharedStore,
    tx: mpsc::Sender<StatEvent>,
    rx: Arc<TokioMutex<mpsc::Receiver<StatEvent>>>,
    cancel: CancellationToken,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Aggregator {
    pub fn new(store: SharedStore, config: &AggregatorConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Arc::new(Self {
            store,
            tx,
            rx: Arc::new(TokioMutex::new(rx)),
            cancel: CancellationToken::new(),
            workers: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn start(self: &Arc<Self>, workers: usize) {
        let mut handles = self.workers.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for _ in 0..workers.max(1) {
            let rx = self.rx.clone();
            let store = self.store.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        event = async { rx.lock().await.recv().await } => event,
                        _ = cancel.cancelled() => None,
                    };
                    let Some(event) = event else { break };
                    let store = store.clone();
                    let _ = tokio::task::spawn_blocking(move || write_event(&store, &event)).await;
                }
            }));
        }
    }

    pub fn record_user_call(&self, ts: i64, user_id: i64, success: bool) {
        self.enqueue(StatEvent::UserCall { ts, user_id, success });
    }

    pub fn record_model_health(&self, ts: i64, model_name: &str, success: bool, latency_ms: i64) {
        self.enqueue(StatEvent::ModelHealth {
            ts,
            model_name: model_name.to_string(),
            success,
            latency_ms,
        });
    }

    fn enqueue(&self, event: StatEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("stat queue full, writing event out of band");
                let store = self.store.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn_blocking(move || write_event(&store, &event));
                    }
                    Err(_) => write_event(&store, &event),
                }
            }
            Err(TrySendError::Closed(event)) => write_event(&self.store, &event),
        }
    }

    /// Writes everything still queued on the calling task.
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut drained = 0;
        while let Ok(event) = rx.try_recv() {
            write_event(&self.store, &event);
            drained += 1;
        }
        drained
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
        for handle in handles {
            let _ = handle.await;
        }
        self.drain().await;
    }
}

/// Checks a leaderboard filter and clamps its limit.
pub fn validate_query(filter: &HourFilter, limit: Option<usize>) -> Result<usize, String> {
    match filter {
        HourFilter::Range { start, end } => {
            if end <= start {
                return Err("end must be after start".to_string());
            }
            if end - start > MAX_RANGE_SECS {
                return Err("range must not exceed 31 days".to_string());
            }
        }
        HourFilter::List(hours) => {
            if hours.len() > (MAX_RANGE_SECS / HOUR) as usize {
                return Err("too many hours".to_string());
            }
        }
    }
    Ok(limit.unwrap_or(100).clamp(1, MAX_LIMIT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryStore;
    use crate::database::stat::StatStore;

    #[test]
    fn bucket_alignment() {
        assert_eq!(hour_start(7_199), 3_600);
        assert_eq!(hour_start(7_200), 7_200);
        assert_eq!(slice_start(7_499), 7_200);
        assert_eq!(slice_start(7_500), 7_500);
    }

    #[test]
    fn query_validation() {
        assert_eq!(validate_query(&HourFilter::Range { start: 0, end: 3600 }, Some(10_000)), Ok(500));
        assert!(validate_query(&HourFilter::Range { start: 0, end: MAX_RANGE_SECS + HOUR }, None).is_err());
        assert!(validate_query(&HourFilter::Range { start: 10, end: 10 }, None).is_err());
    }

    #[tokio::test]
    async fn overflow_is_not_dropped() {
        let store = Arc::new(MemoryStore::new());
        let config = AggregatorConfig { queue_capacity: 2, workers: 1 };
        let aggregator = Aggregator::new(store.clone(), &config);
        for _ in 0..10 {
            aggregator.record_user_call(3_700, 9, true);
        }
        aggregator.drain().await;
        // Out-of-band writers run on the blocking pool.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let ranks = store.query_user_calls(&HourFilter::List(vec![3_600]), 10).unwrap();
        assert_eq!(ranks[0].total_calls, 10);
    }

    #[tokio::test]
    async fn workers_write_and_stop() {
        let store = Arc::new(MemoryStore::new());
        let aggregator = Aggregator::new(store.clone(), &AggregatorConfig::default());
        aggregator.start(4);
        aggregator.record_model_health(610, "gpt-4o", true, 120);
        aggregator.record_model_health(650, "gpt-4o", false, 80);
        aggregator.shutdown().await;
        let health = store.query_model_health(&HourFilter::List(vec![0]), 10).unwrap();
        assert_eq!(health[0].total_calls, 2);
        assert_eq!(health[0].avg_latency_ms, 100);
    }
}
