//! Task state transitions. Every transition is a compare-and-set on the task
//! row; only the writer that wins settles or refunds.

use cyder_tools::log::{error, info, warn};
use serde_json::json;

use crate::config::QuotaConfig;
use crate::database::log::ConsumptionLog;
use crate::database::task::{Task, TaskProperties};
use crate::database::DbResult;
use crate::dto::task::{TaskInfo, TaskView};
use crate::relay::quota::{Charge, PriceData, QuotaSource};
use crate::schema::enum_def::{LogType, QuotaType, TaskStatus};
use crate::service::app_state::AppState;
use crate::utils::ID_GENERATOR;

/// Unit pricing captured at submit time.
pub fn task_price(props: &TaskProperties, quota: &QuotaConfig) -> PriceData {
    PriceData {
        model_ratio: 0.0,
        completion_ratio: 1.0,
        cache_ratio: 1.0,
        group_ratio: props.group_ratio,
        group_special_ratio: 1.0,
        model_price: Some(props.model_price),
        quota_per_unit: quota.quota_per_unit,
    }
}

/// The precharge of `task` as a settleable charge.
pub fn task_charge(task: &Task, token_unlimited: bool) -> Charge {
    let source = match task.properties.subscription_item_id {
        Some(item_id) => QuotaSource::Subscription { item_id, quota_type: QuotaType::ByQuota },
        None => QuotaSource::Wallet,
    };
    Charge {
        user_id: task.user_id,
        token_id: task.token_id,
        token_unlimited,
        source,
        amount: task.quota,
    }
}

pub fn task_view(task: &Task) -> TaskView {
    TaskView {
        task_id: task.task_id.clone(),
        model: task.model.clone(),
        status: task.status,
        progress: task.progress.clone(),
        submit_time: task.submit_time,
        finish_time: (task.finish_time > 0).then_some(task.finish_time),
        fail_reason: (!task.fail_reason.is_empty()).then(|| task.fail_reason.clone()),
        result_url: (!task.result_url.is_empty()).then(|| task.result_url.clone()),
        quota: task.quota,
        units: task.properties.billed_units,
    }
}

pub(crate) fn task_log(task: &Task, log_type: LogType, quota: i64, content: String, now: i64) -> ConsumptionLog {
    ConsumptionLog {
        id: ID_GENERATOR.generate_id(),
        user_id: task.user_id,
        created_at: now,
        log_type,
        content,
        username: task.properties.username.clone(),
        token_id: task.token_id,
        token_name: task.properties.token_name.clone(),
        channel_id: task.channel_id,
        model_name: task.model.clone(),
        upstream_model: task.upstream_model.clone(),
        quota,
        group: task.group.clone(),
        request_id: task.task_id.clone(),
        other: json!({
            "task_id": task.task_id,
            "upstream_task_id": task.upstream_task_id,
            "model_price": task.properties.model_price,
            "group_ratio": task.properties.group_ratio,
            "estimated_units": task.properties.estimated_units,
            "billed_units": task.properties.billed_units,
        }),
        ..Default::default()
    }
}

fn token_unlimited(state: &AppState, token_id: i64) -> bool {
    match state.store.get_token(token_id) {
        Ok(token) => token.is_some_and(|t| t.unlimited_quota),
        Err(err) => {
            warn!("token {} lookup failed during task settlement: {}", token_id, err);
            false
        }
    }
}

/// Applies an upstream observation. Returns whether the row changed.
pub fn apply_update(state: &AppState, task: &Task, update: &TaskInfo, now: i64) -> DbResult<bool> {
    if task.status.is_terminal() {
        return Ok(false);
    }
    let mut next = task.clone();
    next.data = update.raw.clone();
    if !update.progress.is_empty() {
        next.progress = update.progress.clone();
    }
    if update.status == task.status {
        if next.progress == task.progress {
            return Ok(false);
        }
        return state.store.compare_and_update_task(&next, task.status);
    }

    next.status = update.status;
    match update.status {
        TaskStatus::InProgress if next.start_time == 0 => next.start_time = now,
        TaskStatus::Success => {
            next.finish_time = now;
            next.progress = "100%".to_string();
            next.result_url = update.result.clone().unwrap_or_default();
            if !task.properties.free {
                let units = update.usage.as_ref().map_or(task.properties.estimated_units, |u| u.units);
                next.properties.billed_units = Some(units);
                next.quota = task_price(&task.properties, &state.config.quota).task_charge(units);
            }
        }
        TaskStatus::Failure => {
            next.finish_time = now;
            next.fail_reason = update.error.clone().unwrap_or_else(|| "task failed upstream".to_string());
            next.quota = 0;
        }
        _ => {}
    }
    if !state.store.compare_and_update_task(&next, task.status)? {
        return Ok(false);
    }
    match next.status {
        TaskStatus::Success => settle(state, task, &next, now),
        TaskStatus::Failure => refund(state, task, &next.fail_reason, now),
        _ => {}
    }
    Ok(true)
}

/// Fails a task the poller gave up on.
pub fn force_fail(state: &AppState, task: &Task, reason: &str, now: i64) -> DbResult<bool> {
    let update = TaskInfo {
        task_id: task.upstream_task_id.clone(),
        status: TaskStatus::Failure,
        error: Some(reason.to_string()),
        raw: task.data.clone(),
        ..Default::default()
    };
    apply_update(state, task, &update, now)
}

fn settle(state: &AppState, before: &Task, after: &Task, now: i64) {
    if before.properties.free {
        return;
    }
    let charge = task_charge(before, token_unlimited(state, before.token_id));
    let delta = charge.settle(&state.store, after.quota, after.channel_id);
    let content = format!(
        "task {} settled: precharged {}, actual {}",
        after.task_id, before.quota, after.quota
    );
    state.record_log(task_log(after, LogType::Consume, delta, content, now));
    info!("task {} settled with delta {} (actual {})", after.task_id, delta, after.quota);
}

fn refund(state: &AppState, before: &Task, reason: &str, now: i64) {
    if before.quota == 0 {
        return;
    }
    let charge = task_charge(before, token_unlimited(state, before.token_id));
    charge.refund(&state.store);
    let content = format!("task {} failed, refunded {}: {}", before.task_id, before.quota, reason);
    let mut log = task_log(before, LogType::Refund, before.quota, content, now);
    log.other["fail_reason"] = json!(reason);
    state.record_log(log);
    if before.properties.subscription_item_id.is_some() {
        info!("task {} refunded to subscription item", before.task_id);
    } else {
        info!("task {} refunded {}", before.task_id, before.quota);
    }
}

/// Persists a fresh task. The caller still owns the precharge until this succeeds.
pub fn persist(state: &AppState, task: &Task) -> DbResult<()> {
    state.store.insert_task(task).inspect_err(|err| {
        error!("failed to persist task {}: {}", task.task_id, err);
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::FinalConfig;
    use crate::database::memory::MemoryStore;
    use crate::database::token::Token;
    use crate::database::user::User;
    use crate::database::task::TaskStore;
    use crate::database::token::TokenStore;
    use crate::database::user::UserStore;
    use crate::database::SeedStore;
    use crate::dto::task::TaskUsage;
    use crate::service::app_state::AppState;

    fn setup() -> (Arc<MemoryStore>, Arc<AppState>) {
        let store = Arc::new(MemoryStore::new());
        store.upsert_user(&User { id: 1, username: "u".into(), quota: 1000, ..Default::default() }).unwrap();
        store.upsert_token(&Token { id: 9, user_id: 1, key: "sk-t".into(), remain_quota: 1000, ..Default::default() }).unwrap();
        let state = AppState::new(FinalConfig::default(), store.clone()).unwrap();
        (store, state)
    }

    fn running_task(quota: i64) -> Task {
        Task {
            id: 1,
            task_id: "task_1".into(),
            user_id: 1,
            token_id: 9,
            upstream_task_id: "up-1".into(),
            status: TaskStatus::Submitted,
            quota,
            submit_time: 100,
            properties: TaskProperties { model_price: 0.0001, group_ratio: 1.0, estimated_units: 1.0, ..Default::default() },
            ..Default::default()
        }
    }

    #[test]
    fn success_settles_the_difference_once() {
        let (store, state) = setup();
        // Precharge of 50 was taken at submit.
        store.change_user_quota(1, -50).unwrap();
        store.consume_token_quota(9, 50).unwrap();
        let task = running_task(50);
        store.insert_task(&task).unwrap();

        let per_unit = task_price(&task.properties, &state.config.quota).task_charge(1.0);
        assert_eq!(per_unit, 50);
        let done = TaskInfo {
            task_id: "up-1".into(),
            status: TaskStatus::Success,
            usage: Some(TaskUsage { units: 2.0 }),
            ..Default::default()
        };
        assert!(apply_update(&state, &task, &done, 200).unwrap());
        let user = store.get_user(1).unwrap().unwrap();
        assert_eq!(user.quota, 1000 - 2 * per_unit);

        // A second observation of the same transition loses the compare-and-set.
        assert!(!apply_update(&state, &task, &done, 201).unwrap());
        assert_eq!(store.get_user(1).unwrap().unwrap().quota, 1000 - 2 * per_unit);
        let saved = store.get_task(1, "task_1").unwrap().unwrap();
        assert_eq!(saved.quota, 2 * per_unit);
        assert_eq!(task_view(&saved).units, Some(2.0));
    }

    #[test]
    fn failure_refunds_the_precharge() {
        let (store, state) = setup();
        store.change_user_quota(1, -50).unwrap();
        let task = running_task(50);
        store.insert_task(&task).unwrap();
        assert!(force_fail(&state, &task, "timed out", 500).unwrap());
        assert_eq!(store.get_user(1).unwrap().unwrap().quota, 1000);
        let saved = store.get_task(1, "task_1").unwrap().unwrap();
        assert_eq!(saved.status, TaskStatus::Failure);
        assert_eq!(saved.quota, 0);
        assert_eq!(saved.fail_reason, "timed out");
    }

    #[test]
    fn progress_only_updates_keep_status() {
        let (store, state) = setup();
        let task = running_task(0);
        store.insert_task(&task).unwrap();
        let update = TaskInfo { status: TaskStatus::Submitted, progress: "10%".into(), ..Default::default() };
        assert!(apply_update(&state, &task, &update, 150).unwrap());
        assert!(!apply_update(&state, &store.get_task(1, "task_1").unwrap().unwrap(), &update, 160).unwrap());
    }
}
