//! Asynchronous generation tasks: submit with a precharge, answer status
//! queries from the local row, and let the poller settle terminal states.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use cyder_tools::log::{info, warn};
use serde_json::{json, Value};

use self::adaptor::{TaskAdaptor, TaskContext};
use self::service::{persist, task_log, task_view};
use crate::controller::error::{ErrorKind, RelayError};
use crate::database::channel::Channel;
use crate::database::task::{Task, TaskProperties};
use crate::dto::task::TaskView;
use crate::relay::info::AuthContext;
use crate::relay::model_mapping::apply_model_mapping;
use crate::relay::note_channel_failure;
use crate::relay::quota::{pre_consume, price_data, PreConsumeRequest, PriceData, QuotaGuard, QuotaSource};
use crate::relay::router::select_channel;
use crate::relay::validate::authorize_model;
use crate::schema::enum_def::{LogType, TaskStatus};
use crate::service::app_state::AppState;
use crate::utils::i18n::{tr, Msg};
use crate::utils::{now_secs, ID_GENERATOR};

pub mod adaptor;
pub mod ali;
pub mod poller;
pub mod relay_task;
pub mod service;

/// Answer of a `?precharge=true` submit: what the real submit would cost.
fn precharge_answer(units: f64, quota: i64) -> Value {
    json!({ "estimated_units": units, "quota": quota })
}

pub fn task_not_found() -> RelayError {
    RelayError::new(ErrorKind::Client, StatusCode::NOT_FOUND, "task_not_found", tr(Msg::TaskNotFound))
}

/// Submits `body` for `model`. With `precharge_only` nothing is charged or
/// sent for real; the estimate is returned instead.
pub async fn submit(
    state: Arc<AppState>,
    auth: AuthContext,
    model: &str,
    body: Value,
    precharge_only: bool,
) -> Result<Value, RelayError> {
    if model.is_empty() {
        return Err(RelayError::invalid_request_msg(Msg::ModelRequired));
    }
    authorize_model(&auth.token, model)?;
    let free = state.config.task.free_models.iter().any(|m| m == model);
    let price = price_data(&state.config.ratio, &state.config.quota, model, &auth.user.group, &auth.using_group);
    if !free && price.model_price.is_none() {
        warn!("task model {} has no unit price, submissions are charged nothing", model);
    }

    let mut tried = HashSet::new();
    let mut guard: Option<QuotaGuard> = None;
    let mut last_err: Option<RelayError> = None;
    for attempt in 0..=state.config.relay.retry_times {
        let selected = select_channel(&state.channels, model, &auth.using_group, &tried, |c| {
            state.task_adaptors.get(c.channel_type.api_type()).is_some()
        });
        let channel = match selected {
            Ok(channel) => channel,
            Err(err) => {
                last_err.get_or_insert(err);
                break;
            }
        };
        tried.insert(channel.id);
        let outcome = submit_once(&state, &auth, &channel, model, &body, free, precharge_only, &price, &mut guard).await;
        match outcome {
            Ok(answer) => return Ok(answer),
            Err(err) => {
                warn!("task submit attempt {} for {} on channel {} failed: {}", attempt, model, channel.id, err);
                note_channel_failure(&state, channel.id, &err);
                let retry = err.is_retriable();
                last_err = Some(err);
                if !retry {
                    break;
                }
            }
        }
    }
    if let Some(guard) = guard {
        guard.refund();
    }
    Err(last_err.unwrap_or_else(|| RelayError::no_channel(model, &auth.using_group)))
}

#[allow(clippy::too_many_arguments)]
async fn submit_once(
    state: &Arc<AppState>,
    auth: &AuthContext,
    channel: &Channel,
    model: &str,
    body: &Value,
    free: bool,
    precharge_only: bool,
    price: &PriceData,
    guard: &mut Option<QuotaGuard>,
) -> Result<Value, RelayError> {
    let adaptor: Arc<dyn TaskAdaptor> = state
        .task_adaptors
        .get(channel.channel_type.api_type())
        .ok_or_else(|| RelayError::not_supported(&channel.channel_type.to_string()))?;
    let upstream_model = apply_model_mapping(&channel.model_mapping, model)?;
    let ctx = TaskContext {
        http: &state.http,
        channel,
        upstream_model: &upstream_model,
        timeout: Duration::from_secs(state.config.relay.non_stream_timeout_secs),
    };

    let units = if free {
        0.0
    } else {
        adaptor.estimate(&ctx, body).await?.unwrap_or(state.config.task.default_units)
    };
    let amount = if free { 0 } else { price.task_charge(units) };
    if precharge_only {
        return Ok(precharge_answer(units, amount));
    }

    if guard.is_none() && !free {
        let charge = pre_consume(
            &state.store,
            &state.config.quota,
            PreConsumeRequest {
                user_id: auth.user.id,
                token_id: auth.token.id,
                token_unlimited: auth.token.unlimited_quota,
                model,
                amount,
                per_call: false,
            },
        )?;
        *guard = Some(QuotaGuard::new(state.store.clone(), charge));
    }

    let submitted = adaptor.submit(&ctx, body).await?;
    let now = now_secs();
    let id = ID_GENERATOR.generate_id();
    let (precharged, subscription_item_id) = match guard.as_ref().and_then(QuotaGuard::charge) {
        Some(charge) => {
            let item = match charge.source {
                QuotaSource::Subscription { item_id, .. } => Some(item_id),
                QuotaSource::Wallet => None,
            };
            (charge.amount, item)
        }
        None => (0, None),
    };
    let task = Task {
        id,
        task_id: format!("task_{id}"),
        platform: channel.channel_type,
        user_id: auth.user.id,
        token_id: auth.token.id,
        group: auth.using_group.clone(),
        channel_id: channel.id,
        model: model.to_string(),
        upstream_model: upstream_model.clone(),
        upstream_task_id: submitted.upstream_task_id,
        status: TaskStatus::Submitted,
        progress: "0%".to_string(),
        quota: precharged,
        submit_time: now,
        data: submitted.raw,
        properties: TaskProperties {
            model_price: price.model_price.unwrap_or(0.0),
            group_ratio: price.group_ratio * price.group_special_ratio,
            estimated_units: units,
            billed_units: None,
            free,
            token_name: auth.token.name.clone(),
            username: auth.user.username.clone(),
            subscription_item_id,
        },
        ..Default::default()
    };
    persist(state, &task).map_err(|err| RelayError::internal(err.to_string()).with_skip_retry())?;
    // The persisted row owns the precharge from here on.
    if let Some(guard) = guard.take() {
        guard.disarm();
    }
    if precharged > 0 {
        let content = format!("task {} submitted, precharged {} for {} units", task.task_id, precharged, units);
        state.record_log(task_log(&task, LogType::Consume, precharged, content, now));
    }
    info!(
        "task {} submitted to channel {} as {} (model {}, precharge {})",
        task.task_id, channel.id, task.upstream_task_id, upstream_model, precharged
    );
    Ok(json!(task_view(&task)))
}

pub fn get_task(state: &AppState, auth: &AuthContext, task_id: &str) -> Result<TaskView, RelayError> {
    state
        .store
        .get_task(auth.user.id, task_id)?
        .map(|task| task_view(&task))
        .ok_or_else(task_not_found)
}

/// Views of the caller's own tasks among `task_ids`. Unknown ids are skipped.
/// At most `task.batch_size` ids are accepted per call.
pub fn list_tasks(state: &AppState, auth: &AuthContext, task_ids: &[String]) -> Result<Vec<TaskView>, RelayError> {
    let limit = state.config.task.batch_size.max(1);
    if task_ids.len() > limit {
        return Err(RelayError::rate_limit_batch(limit));
    }
    let tasks = state
        .store
        .list_tasks(auth.user.id, task_ids)
        .map_err(|err| RelayError::batch_internal(err.to_string()))?;
    Ok(tasks.iter().map(task_view).collect())
}
