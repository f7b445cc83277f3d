use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, TimeZone};
use chrono_tz::Tz;
use cyder_tools::log::info;

use crate::database::{DbError, DbResult, SharedStore};

/// Maps timestamps to `logs_YYYY_MM_DD` tables, creating each day's table once.
pub struct LogTableRouter {
    store: SharedStore,
    tz: Tz,
    day_start: AtomicI64,
    next_day: AtomicI64,
    current: RwLock<String>,
    create_lock: Mutex<()>,
}

pub fn table_name(date: NaiveDate) -> String {
    format!("logs_{:04}_{:02}_{:02}", date.year(), date.month(), date.day())
}

/// Local-midnight bounds `[start, end)` of the day containing `ts`.
fn day_bounds(tz: Tz, ts: i64) -> Option<(NaiveDate, i64, i64)> {
    let local = tz.timestamp_opt(ts, 0).single()?;
    let date = local.date_naive();
    let midnight = |d: NaiveDate| {
        tz.from_local_datetime(&d.and_hms_opt(0, 0, 0)?)
            .earliest()
            .map(|t| t.timestamp())
    };
    let start = midnight(date)?;
    let end = midnight(date + ChronoDuration::days(1))?;
    Some((date, start, end))
}

impl LogTableRouter {
    pub fn new(store: SharedStore, tz: Tz) -> Self {
        Self {
            store,
            tz,
            day_start: AtomicI64::new(i64::MAX),
            next_day: AtomicI64::new(i64::MIN),
            current: RwLock::new(String::new()),
            create_lock: Mutex::new(()),
        }
    }

    fn current_if_covers(&self, ts: i64) -> Option<String> {
        let next = self.next_day.load(Ordering::Acquire);
        let start = self.day_start.load(Ordering::Acquire);
        if ts >= start && ts < next {
            return Some(self.current.read().unwrap_or_else(PoisonError::into_inner).clone());
        }
        None
    }

    pub fn get_log_table_name(&self, ts: i64) -> DbResult<String> {
        if let Some(name) = self.current_if_covers(ts) {
            return Ok(name);
        }
        let _guard = self.create_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(name) = self.current_if_covers(ts) {
            return Ok(name);
        }
        let (date, start, end) = day_bounds(self.tz, ts)
            .ok_or_else(|| DbError::Invalid(format!("timestamp {} has no local date", ts)))?;
        let name = table_name(date);
        self.store.ensure_log_table(&name)?;
        // Only move forward; late rows for an older day keep today's table current.
        if end > self.next_day.load(Ordering::Acquire) {
            *self.current.write().unwrap_or_else(PoisonError::into_inner) = name.clone();
            self.day_start.store(start, Ordering::Release);
            self.next_day.store(end, Ordering::Release);
            info!("log table rolled over to {}", name);
        }
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn tables_follow_local_midnight() {
        let store = Arc::new(MemoryStore::new());
        let router = LogTableRouter::new(store.clone(), chrono_tz::Asia::Shanghai);
        // 2025-01-01T15:59:59Z is 23:59:59 in Shanghai.
        assert_eq!(router.get_log_table_name(1_735_747_199).unwrap(), "logs_2025_01_01");
        assert_eq!(router.get_log_table_name(1_735_747_200).unwrap(), "logs_2025_01_02");
        assert_eq!(router.get_log_table_name(1_735_747_300).unwrap(), "logs_2025_01_02");
        assert_eq!(store.log_table_creations(), 2);
    }

    #[test]
    fn concurrent_first_writers_create_once() {
        let store = Arc::new(MemoryStore::new());
        let router = Arc::new(LogTableRouter::new(store.clone(), Tz::UTC));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let router = router.clone();
                std::thread::spawn(move || router.get_log_table_name(1_735_689_600 + i).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "logs_2025_01_01");
        }
        assert_eq!(store.log_table_creations(), 1);
    }
}
