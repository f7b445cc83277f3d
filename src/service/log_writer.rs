use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cyder_tools::log::{debug, error, info};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::LogWriterConfig;
use crate::database::log::ConsumptionLog;
use crate::database::SharedStore;

type PendingRow = (String, ConsumptionLog);

/// Buffers consumption logs in memory and writes them in batches.
pub struct LogWriter {
    store: SharedStore,
    buffer: Mutex<Vec<PendingRow>>,
    flush_interval: Duration,
    shutdown_grace: Duration,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LogWriter {
    pub fn new(store: SharedStore, config: &LogWriterConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            buffer: Mutex::new(Vec::new()),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(10)),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let writer = this.clone();
                        if let Err(err) = tokio::task::spawn_blocking(move || writer.flush_now()).await {
                            error!("log writer flush task failed: {}", err);
                        }
                    }
                    _ = this.cancel.cancelled() => break,
                }
            }
            let writer = this.clone();
            let _ = tokio::task::spawn_blocking(move || writer.flush_now()).await;
        });
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Queues one row. Never blocks on I/O and never drops.
    pub fn add_log_async(&self, table: String, log: ConsumptionLog) {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).push((table, log));
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Swaps the buffer out and writes it. Returns how many rows were written.
    pub fn flush_now(&self) -> usize {
        let batch = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner));
        if batch.is_empty() {
            return 0;
        }
        let mut by_table: BTreeMap<String, Vec<ConsumptionLog>> = BTreeMap::new();
        for (table, log) in batch {
            by_table.entry(table).or_default().push(log);
        }

        let mut written = 0;
        for (table, rows) in by_table {
            match self.store.insert_logs(&table, &rows) {
                Ok(()) => written += rows.len(),
                Err(err) => {
                    error!("batch insert of {} logs into {} failed, retrying row by row: {}", rows.len(), table, err);
                    for row in &rows {
                        match self.store.insert_log(&table, row) {
                            Ok(()) => written += 1,
                            Err(err) => error!(
                                "failed to write log {} into {}: {} row={}",
                                row.id,
                                table,
                                err,
                                serde_json::to_string(row).unwrap_or_default()
                            ),
                        }
                    }
                }
            }
        }
        debug!("flushed {} consumption logs", written);
        written
    }

    /// Stops the worker and drains what is left, waiting at most the grace period
    /// for the worker before draining inline.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if tokio::time::timeout(self.shutdown_grace, handle).await.is_err() {
                error!("log writer did not stop within {:?}", self.shutdown_grace);
            }
        }
        let rest = self.flush_now();
        info!("log writer stopped ({} rows drained at exit)", rest);
    }
}
