use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::channel::{Channel, ChannelStore};
use super::error_rule::{CustomErrorRule, ErrorRuleStore};
use super::log::{is_valid_log_table, ConsumptionLog, LogStore};
use super::redemption::{RedeemError, RedeemOutcome, Redemption, RedemptionStore};
use super::stat::{HourFilter, ModelHealthHourly, ModelHealthRank, StatStore, UserCallRank};
use super::subscription::{Subscription, SubscriptionItem, SubscriptionPlan, SubscriptionStore};
use super::task::{Task, TaskStore};
use super::token::{Token, TokenStore};
use super::user::{User, UserStore};
use super::{DbError, DbResult, SeedStore};
use crate::schema::enum_def::{ChannelStatus, QuotaType, RedemptionStatus, SubscriptionStatus, TaskStatus};

#[derive(Default)]
struct MemoryData {
    users: HashMap<i64, User>,
    tokens: HashMap<i64, Token>,
    channels: BTreeMap<i64, Channel>,
    log_tables: HashMap<String, Vec<ConsumptionLog>>,
    tasks: BTreeMap<i64, Task>,
    // (hour_start_ts, user_id) -> (total, success)
    user_calls: BTreeMap<(i64, i64), (i64, i64)>,
    // (model_name, slice_start_ts) -> (total, success, latency sum)
    model_health: BTreeMap<(String, i64), (i64, i64, i64)>,
    subscriptions: BTreeMap<i64, Subscription>,
    items: BTreeMap<i64, SubscriptionItem>,
    redemptions: HashMap<String, Redemption>,
    error_rules: BTreeMap<i64, CustomErrorRule>,
    next_id: i64,
}

impl MemoryData {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store. Every trait call is atomic under one mutex.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<MemoryData>,
    table_creations: AtomicUsize,
    fail_next_batch: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, MemoryData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of `CREATE TABLE IF NOT EXISTS` statements issued for daily tables.
    pub fn log_table_creations(&self) -> usize {
        self.table_creations.load(Ordering::SeqCst)
    }

    /// Makes the next batch insert fail so callers exercise their per-row path.
    pub fn fail_next_batch(&self) {
        self.fail_next_batch.store(true, Ordering::SeqCst);
    }

    pub fn all_tasks(&self) -> Vec<Task> {
        self.data().tasks.values().cloned().collect()
    }
}

impl UserStore for MemoryStore {
    fn get_user(&self, user_id: i64) -> DbResult<Option<User>> {
        Ok(self.data().users.get(&user_id).cloned())
    }

    fn decrease_user_quota_bounded(&self, user_id: i64, amount: i64) -> DbResult<bool> {
        let mut data = self.data();
        match data.users.get_mut(&user_id) {
            Some(user) if user.quota >= amount => {
                user.quota -= amount;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn change_user_quota(&self, user_id: i64, delta: i64) -> DbResult<()> {
        if let Some(user) = self.data().users.get_mut(&user_id) {
            user.quota += delta;
        }
        Ok(())
    }

    fn add_user_usage(&self, user_id: i64, used_quota: i64, request_count: i64) -> DbResult<()> {
        if let Some(user) = self.data().users.get_mut(&user_id) {
            user.used_quota += used_quota;
            user.request_count += request_count;
        }
        Ok(())
    }
}

impl TokenStore for MemoryStore {
    fn get_token_by_key(&self, key: &str) -> DbResult<Option<Token>> {
        Ok(self.data().tokens.values().find(|t| t.key == key).cloned())
    }

    fn get_token(&self, token_id: i64) -> DbResult<Option<Token>> {
        Ok(self.data().tokens.get(&token_id).cloned())
    }

    fn consume_token_quota_bounded(&self, token_id: i64, amount: i64) -> DbResult<bool> {
        let mut data = self.data();
        match data.tokens.get_mut(&token_id) {
            Some(token) if token.remain_quota >= amount => {
                token.remain_quota -= amount;
                token.used_quota += amount;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn consume_token_quota(&self, token_id: i64, amount: i64) -> DbResult<()> {
        if let Some(token) = self.data().tokens.get_mut(&token_id) {
            token.remain_quota -= amount;
            token.used_quota += amount;
        }
        Ok(())
    }
}

impl ChannelStore for MemoryStore {
    fn list_channels(&self) -> DbResult<Vec<Channel>> {
        Ok(self.data().channels.values().cloned().collect())
    }

    fn update_channel_status(&self, channel_id: i64, status: ChannelStatus) -> DbResult<()> {
        if let Some(channel) = self.data().channels.get_mut(&channel_id) {
            channel.status = status;
        }
        Ok(())
    }

    fn add_channel_used_quota(&self, channel_id: i64, quota: i64) -> DbResult<()> {
        if let Some(channel) = self.data().channels.get_mut(&channel_id) {
            channel.used_quota += quota;
        }
        Ok(())
    }
}

impl LogStore for MemoryStore {
    fn ensure_log_table(&self, table: &str) -> DbResult<()> {
        if !is_valid_log_table(table) {
            return Err(DbError::Invalid(format!("invalid log table name: {}", table)));
        }
        self.table_creations.fetch_add(1, Ordering::SeqCst);
        self.data().log_tables.entry(table.to_string()).or_default();
        Ok(())
    }

    fn insert_logs(&self, table: &str, logs: &[ConsumptionLog]) -> DbResult<()> {
        if self.fail_next_batch.swap(false, Ordering::SeqCst) {
            return Err(DbError::Invalid("injected batch failure".to_string()));
        }
        let mut data = self.data();
        let rows = data
            .log_tables
            .get_mut(table)
            .ok_or_else(|| DbError::Invalid(format!("no such table: {}", table)))?;
        rows.extend_from_slice(logs);
        Ok(())
    }

    fn insert_log(&self, table: &str, log: &ConsumptionLog) -> DbResult<()> {
        let mut data = self.data();
        let rows = data
            .log_tables
            .get_mut(table)
            .ok_or_else(|| DbError::Invalid(format!("no such table: {}", table)))?;
        rows.push(log.clone());
        Ok(())
    }

    fn list_logs(&self, table: &str, user_id: Option<i64>) -> DbResult<Vec<ConsumptionLog>> {
        let data = self.data();
        let rows = data.log_tables.get(table).cloned().unwrap_or_default();
        Ok(rows
            .into_iter()
            .filter(|log| user_id.is_none_or(|id| log.user_id == id))
            .collect())
    }
}

impl TaskStore for MemoryStore {
    fn insert_task(&self, task: &Task) -> DbResult<()> {
        let mut data = self.data();
        if data.tasks.values().any(|t| t.task_id == task.task_id) {
            return Err(DbError::Invalid(format!("duplicate task id {}", task.task_id)));
        }
        data.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn get_task(&self, user_id: i64, task_id: &str) -> DbResult<Option<Task>> {
        Ok(self
            .data()
            .tasks
            .values()
            .find(|t| t.user_id == user_id && t.task_id == task_id)
            .cloned())
    }

    fn list_tasks(&self, user_id: i64, task_ids: &[String]) -> DbResult<Vec<Task>> {
        Ok(self
            .data()
            .tasks
            .values()
            .filter(|t| t.user_id == user_id && task_ids.contains(&t.task_id))
            .cloned()
            .collect())
    }

    fn list_unfinished_tasks(&self) -> DbResult<Vec<Task>> {
        Ok(self
            .data()
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect())
    }

    fn compare_and_update_task(&self, task: &Task, expected: TaskStatus) -> DbResult<bool> {
        let mut data = self.data();
        match data.tasks.get_mut(&task.id) {
            Some(current) if current.status == expected => {
                *current = task.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn hour_matches(filter: &HourFilter, hour: i64) -> bool {
    match filter {
        HourFilter::Range { start, end } => hour >= *start && hour < *end,
        HourFilter::List(hours) => hours.contains(&hour),
    }
}

impl StatStore for MemoryStore {
    fn record_user_call(&self, hour_start_ts: i64, user_id: i64, success: bool) -> DbResult<()> {
        let mut data = self.data();
        let entry = data.user_calls.entry((hour_start_ts, user_id)).or_default();
        entry.0 += 1;
        if success {
            entry.1 += 1;
        }
        Ok(())
    }

    fn record_model_health(
        &self,
        slice_start_ts: i64,
        model_name: &str,
        success: bool,
        latency_ms: i64,
    ) -> DbResult<()> {
        let mut data = self.data();
        let entry = data
            .model_health
            .entry((model_name.to_string(), slice_start_ts))
            .or_default();
        entry.0 += 1;
        if success {
            entry.1 += 1;
        }
        entry.2 += latency_ms;
        Ok(())
    }

    fn query_user_calls(&self, filter: &HourFilter, limit: usize) -> DbResult<Vec<UserCallRank>> {
        let data = self.data();
        let mut by_user: BTreeMap<i64, UserCallRank> = BTreeMap::new();
        for ((hour, user_id), (total, success)) in data.user_calls.iter() {
            if !hour_matches(filter, *hour) {
                continue;
            }
            let rank = by_user.entry(*user_id).or_insert_with(|| UserCallRank {
                user_id: *user_id,
                ..Default::default()
            });
            rank.total_calls += total;
            rank.success_calls += success;
        }
        let mut ranks: Vec<UserCallRank> = by_user.into_values().collect();
        ranks.sort_by(|a, b| b.total_calls.cmp(&a.total_calls).then(a.user_id.cmp(&b.user_id)));
        ranks.truncate(limit);
        Ok(ranks)
    }

    fn query_model_health(&self, filter: &HourFilter, limit: usize) -> DbResult<Vec<ModelHealthRank>> {
        let data = self.data();
        let mut by_model: BTreeMap<String, (i64, i64, i64)> = BTreeMap::new();
        for ((model, slice), (total, success, latency)) in data.model_health.iter() {
            if !hour_matches(filter, slice - slice % 3600) {
                continue;
            }
            let acc = by_model.entry(model.clone()).or_default();
            acc.0 += total;
            acc.1 += success;
            acc.2 += latency;
        }
        let mut ranks: Vec<ModelHealthRank> = by_model
            .into_iter()
            .map(|(model_name, (total, success, latency))| ModelHealthRank {
                model_name,
                total_calls: total,
                success_calls: success,
                avg_latency_ms: if total > 0 { latency / total } else { 0 },
            })
            .collect();
        ranks.sort_by(|a, b| b.total_calls.cmp(&a.total_calls).then(a.model_name.cmp(&b.model_name)));
        ranks.truncate(limit);
        Ok(ranks)
    }

    fn query_model_health_hourly(
        &self,
        filter: &HourFilter,
        model_name: Option<&str>,
    ) -> DbResult<Vec<ModelHealthHourly>> {
        let data = self.data();
        let mut by_hour: BTreeMap<(i64, String), (i64, i64)> = BTreeMap::new();
        for ((model, slice), (total, success, _)) in data.model_health.iter() {
            let hour = slice / 3600 * 3600;
            if !hour_matches(filter, hour) || model_name.is_some_and(|m| m != model) {
                continue;
            }
            let acc = by_hour.entry((hour, model.clone())).or_default();
            acc.0 += total;
            acc.1 += success;
        }
        Ok(by_hour
            .into_iter()
            .map(|((hour_start_ts, model_name), (total_calls, success_calls))| ModelHealthHourly {
                hour_start_ts,
                model_name,
                total_calls,
                success_calls,
            })
            .collect())
    }
}

impl SubscriptionStore for MemoryStore {
    fn try_consume_subscription(
        &self,
        user_id: i64,
        model_name: &str,
        quota_type: QuotaType,
        amount: i64,
        now: i64,
    ) -> DbResult<Option<i64>> {
        let mut data = self.data();
        let active: Vec<i64> = data
            .subscriptions
            .values()
            .filter(|s| {
                s.user_id == user_id
                    && s.status == SubscriptionStatus::Active
                    && s.start_time <= now
                    && now < s.end_time
            })
            .map(|s| s.id)
            .collect();
        let item = data.items.values_mut().find(|item| {
            active.contains(&item.subscription_id)
                && item.model_name == model_name
                && item.quota_type == quota_type
                && item.amount_used + amount <= item.amount_total
        });
        Ok(item.map(|item| {
            item.amount_used += amount;
            item.id
        }))
    }

    fn adjust_subscription_item(&self, item_id: i64, delta: i64) -> DbResult<()> {
        if let Some(item) = self.data().items.get_mut(&item_id) {
            item.amount_used += delta;
        }
        Ok(())
    }

    fn create_subscription(&self, user_id: i64, plan: &SubscriptionPlan, now: i64) -> DbResult<i64> {
        let mut data = self.data();
        let subscription_id = data.next_id();
        data.subscriptions.insert(
            subscription_id,
            Subscription {
                id: subscription_id,
                user_id,
                plan_id: plan.plan_id.clone(),
                start_time: now,
                end_time: now + plan.duration_secs,
                status: SubscriptionStatus::Active,
            },
        );
        for plan_item in &plan.items {
            let item_id = data.next_id();
            data.items.insert(
                item_id,
                SubscriptionItem {
                    id: item_id,
                    subscription_id,
                    user_id,
                    model_name: plan_item.model_name.clone(),
                    quota_type: plan_item.quota_type,
                    amount_total: plan_item.amount,
                    amount_used: 0,
                },
            );
        }
        Ok(subscription_id)
    }

    fn list_subscription_items(&self, user_id: i64) -> DbResult<Vec<SubscriptionItem>> {
        Ok(self
            .data()
            .items
            .values()
            .filter(|item| item.user_id == user_id)
            .cloned()
            .collect())
    }
}

impl RedemptionStore for MemoryStore {
    fn redeem(&self, key: &str, user_id: i64, now: i64) -> Result<RedeemOutcome, RedeemError> {
        let plan = {
            let mut data = self.data();
            let redemption = data.redemptions.get_mut(key).ok_or(RedeemError::NotFound)?;
            match redemption.status {
                RedemptionStatus::Used => return Err(RedeemError::Used),
                RedemptionStatus::Disabled => return Err(RedeemError::Disabled),
                RedemptionStatus::Enabled => {}
            }
            if redemption.expired_at != 0 && redemption.expired_at < now {
                return Err(RedeemError::Expired);
            }
            redemption.status = RedemptionStatus::Used;
            redemption.redeemed_at = now;
            redemption.used_user_id = user_id;
            let quota = redemption.quota;
            let plan = redemption.plan.clone();
            if quota > 0 {
                if let Some(user) = data.users.get_mut(&user_id) {
                    user.quota += quota;
                }
            }
            (quota, plan)
        };
        let subscription_id = match &plan.1 {
            Some(plan) => Some(self.create_subscription(user_id, plan, now)?),
            None => None,
        };
        Ok(RedeemOutcome {
            quota: plan.0,
            subscription_id,
        })
    }

    fn get_redemption(&self, key: &str) -> Result<Option<Redemption>, DbError> {
        Ok(self.data().redemptions.get(key).cloned())
    }
}

impl ErrorRuleStore for MemoryStore {
    fn list_error_rules(&self) -> DbResult<Vec<CustomErrorRule>> {
        Ok(self.data().error_rules.values().cloned().collect())
    }
}

impl SeedStore for MemoryStore {
    fn upsert_channel(&self, channel: &Channel) -> DbResult<()> {
        self.data().channels.insert(channel.id, channel.clone());
        Ok(())
    }

    fn upsert_user(&self, user: &User) -> DbResult<()> {
        self.data().users.insert(user.id, user.clone());
        Ok(())
    }

    fn upsert_token(&self, token: &Token) -> DbResult<()> {
        self.data().tokens.insert(token.id, token.clone());
        Ok(())
    }

    fn upsert_error_rule(&self, rule: &CustomErrorRule) -> DbResult<()> {
        self.data().error_rules.insert(rule.id, rule.clone());
        Ok(())
    }

    fn upsert_redemption(&self, redemption: &Redemption) -> DbResult<()> {
        self.data().redemptions.insert(redemption.key.clone(), redemption.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .upsert_user(&User { id: 1, username: "alice".into(), group: "default".into(), quota: 100, ..Default::default() })
            .unwrap();
        store
    }

    #[test]
    fn bounded_decrement_never_goes_negative() {
        let store = seeded();
        assert!(store.decrease_user_quota_bounded(1, 60).unwrap());
        assert!(!store.decrease_user_quota_bounded(1, 60).unwrap());
        assert_eq!(store.get_user(1).unwrap().unwrap().quota, 40);
    }

    #[test]
    fn redemption_is_single_use() {
        let store = seeded();
        store
            .upsert_redemption(&Redemption { id: 1, key: "K".into(), quota: 500, ..Default::default() })
            .unwrap();
        let outcome = store.redeem("K", 1, 10).unwrap();
        assert_eq!(outcome.quota, 500);
        assert_eq!(store.get_user(1).unwrap().unwrap().quota, 600);
        assert!(matches!(store.redeem("K", 1, 11), Err(RedeemError::Used)));
        assert!(matches!(store.redeem("missing", 1, 11), Err(RedeemError::NotFound)));
    }

    #[test]
    fn subscription_consumption_respects_total() {
        let store = seeded();
        let plan = SubscriptionPlan {
            plan_id: "pro".into(),
            duration_secs: 100,
            items: vec![super::super::subscription::PlanItem {
                model_name: "gpt-4o".into(),
                quota_type: QuotaType::ByCount,
                amount: 2,
            }],
        };
        store.create_subscription(1, &plan, 0).unwrap();
        assert!(store.try_consume_subscription(1, "gpt-4o", QuotaType::ByCount, 1, 5).unwrap().is_some());
        assert!(store.try_consume_subscription(1, "gpt-4o", QuotaType::ByCount, 1, 5).unwrap().is_some());
        assert!(store.try_consume_subscription(1, "gpt-4o", QuotaType::ByCount, 1, 5).unwrap().is_none());
        // expired
        assert!(store.try_consume_subscription(1, "gpt-4o", QuotaType::ByCount, 0, 500).unwrap().is_none());
    }
}
