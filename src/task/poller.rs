use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use cyder_tools::log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::adaptor::TaskContext;
use super::service::{apply_update, force_fail};
use crate::controller::error::RelayError;
use crate::database::task::Task;
use crate::service::app_state::AppState;
use crate::utils::now_secs;

/// Counts of one polling round.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub updated: usize,
    pub force_failed: usize,
}

/// The single background worker that advances non-terminal tasks.
pub struct PollingService {
    state: Arc<AppState>,
    semaphore: Arc<Semaphore>,
}

impl PollingService {
    pub fn new(state: Arc<AppState>) -> Self {
        let permits = state.config.task.max_concurrent.max(1);
        Self {
            state,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let every = Duration::from_secs(self.state.config.task.poll_interval_secs.max(1));
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        info!("task poller started, every {:?}", every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.poll_once().await;
                    if summary != PollSummary::default() {
                        debug!("task poll: {} updated, {} force-failed", summary.updated, summary.force_failed);
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        info!("task poller stopped");
    }

    pub async fn poll_once(&self) -> PollSummary {
        let store = self.state.store.clone();
        let tasks = match tokio::task::spawn_blocking(move || store.list_unfinished_tasks()).await {
            Ok(Ok(tasks)) => tasks,
            Ok(Err(err)) => {
                error!("failed to list unfinished tasks: {}", err);
                return PollSummary::default();
            }
            Err(err) => {
                error!("task listing panicked: {}", err);
                return PollSummary::default();
            }
        };

        let now = now_secs();
        let deadline = now - self.state.config.task.max_lifetime_secs;
        let mut summary = PollSummary::default();
        let mut groups: BTreeMap<(i64, String), Vec<Task>> = BTreeMap::new();
        for task in tasks {
            if task.submit_time <= deadline {
                summary.force_failed += self.fail(&task, "task exceeded its maximum lifetime", now);
                continue;
            }
            groups.entry((task.channel_id, task.upstream_model.clone())).or_default().push(task);
        }

        let batch_size = self.state.config.task.batch_size.max(1);
        let mut jobs = JoinSet::new();
        for ((channel_id, upstream_model), tasks) in groups {
            let channel = self.state.channels.get(channel_id).filter(|c| c.is_enabled());
            let Some(channel) = channel else {
                for task in &tasks {
                    summary.force_failed += self.fail(task, "channel is disabled or removed", now);
                }
                continue;
            };
            for batch in tasks.chunks(batch_size) {
                let permit = match self.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return summary,
                };
                let state = self.state.clone();
                let channel = channel.clone();
                let upstream_model = upstream_model.clone();
                let batch = batch.to_vec();
                jobs.spawn(async move {
                    let _permit = permit;
                    poll_batch(&state, &channel, &upstream_model, batch).await
                });
            }
        }
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok(updated) => summary.updated += updated,
                Err(err) => error!("task poll: {}", RelayError::batch_internal(err.to_string())),
            }
        }
        summary
    }

    fn fail(&self, task: &Task, reason: &str, now: i64) -> usize {
        match force_fail(&self.state, task, reason, now) {
            Ok(true) => {
                warn!("task {} force-failed: {}", task.task_id, reason);
                1
            }
            Ok(false) => 0,
            Err(err) => {
                error!("failed to force-fail task {}: {}", task.task_id, err);
                0
            }
        }
    }
}

async fn poll_batch(
    state: &AppState,
    channel: &crate::database::channel::Channel,
    upstream_model: &str,
    batch: Vec<Task>,
) -> usize {
    let Some(adaptor) = state.task_adaptors.get(channel.channel_type.api_type()) else {
        warn!("channel {} has no task adaptor for {}", channel.id, channel.channel_type);
        return 0;
    };
    let ctx = TaskContext {
        http: &state.http,
        channel,
        upstream_model,
        timeout: Duration::from_secs(state.config.task.query_timeout_secs),
    };
    let ids: Vec<String> = batch.iter().map(|t| t.upstream_task_id.clone()).collect();
    let budget = ctx.timeout.saturating_mul(ids.len().max(1) as u32);
    let fetched = tokio::time::timeout(budget, adaptor.fetch(&ctx, &ids))
        .await
        .unwrap_or_else(|_| Err(RelayError::batch_timeout()));
    let infos = match fetched {
        Ok(infos) => infos,
        Err(err) => {
            warn!("task query on channel {} for {} tasks failed: {}", channel.id, ids.len(), err);
            return 0;
        }
    };
    let by_id: HashMap<&str, &Task> = batch.iter().map(|t| (t.upstream_task_id.as_str(), t)).collect();
    let now = now_secs();
    let mut updated = 0;
    for info in &infos {
        let Some(task) = by_id.get(info.task_id.as_str()) else {
            continue;
        };
        match apply_update(state, task, info, now) {
            Ok(true) => updated += 1,
            Ok(false) => {}
            Err(err) => error!("failed to update task {}: {}", task.task_id, err),
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    use super::*;
    use crate::config::FinalConfig;
    use crate::database::channel::Channel;
    use crate::database::memory::MemoryStore;
    use crate::database::task::{TaskProperties, TaskStore};
    use crate::database::user::{User, UserStore};
    use crate::database::SeedStore;
    use crate::schema::enum_def::{ChannelStatus, ChannelType, TaskStatus};

    async fn mock_upstream() -> String {
        let app = Router::new().route(
            "/{model}/task/list-by-condition",
            post(|Json(body): Json<Value>| async move {
                let ids = body["task_ids"].as_array().cloned().unwrap_or_default();
                let data: Vec<Value> = ids
                    .iter()
                    .map(|id| json!({
                        "task_id": id,
                        "model": "m",
                        "status": "SUCCESS",
                        "progress": "100%",
                        "submit_time": 1,
                        "quota": 0,
                        "units": 3.0,
                        "result_url": "https://cdn/x.png"
                    }))
                    .collect();
                Json(json!({"code": 0, "message": "success", "data": data}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn task(id: i64, channel_id: i64, submit_time: i64, quota: i64) -> Task {
        Task {
            id,
            task_id: format!("task_{id}"),
            user_id: 1,
            channel_id,
            upstream_model: "m".into(),
            upstream_task_id: format!("up-{id}"),
            status: TaskStatus::Submitted,
            quota,
            submit_time,
            properties: TaskProperties { model_price: 0.0001, group_ratio: 1.0, estimated_units: 1.0, ..Default::default() },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn settles_finished_and_fails_stale_tasks() {
        let base_url = mock_upstream().await;
        let store = Arc::new(MemoryStore::new());
        store.upsert_user(&User { id: 1, quota: 850, ..Default::default() }).unwrap();
        let live = Channel {
            id: 1,
            channel_type: ChannelType::TaskRelay,
            base_url,
            models: vec!["m".into()],
            ..Default::default()
        };
        let off = Channel { id: 2, status: ChannelStatus::ManuallyDisabled, ..live.clone() };
        store.upsert_channel(&live).unwrap();
        store.upsert_channel(&off).unwrap();

        let now = now_secs();
        // 50 each was precharged for three tasks.
        store.insert_task(&task(1, 1, now, 50)).unwrap();
        store.insert_task(&task(2, 2, now, 50)).unwrap();
        store.insert_task(&task(3, 1, now - 2 * 24 * 3600, 50)).unwrap();

        let state = AppState::new(FinalConfig::default(), store.clone()).unwrap();
        let summary = PollingService::new(state).poll_once().await;
        assert_eq!(summary, PollSummary { updated: 1, force_failed: 2 });

        let done = store.get_task(1, "task_1").unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert_eq!(done.quota, 150);
        assert_eq!(done.result_url, "https://cdn/x.png");
        assert_eq!(store.get_task(1, "task_2").unwrap().unwrap().status, TaskStatus::Failure);
        assert_eq!(store.get_task(1, "task_3").unwrap().unwrap().status, TaskStatus::Failure);
        // 850 + 50 + 50 refunded, then 100 more for the three units of task 1.
        assert_eq!(store.get_user(1).unwrap().unwrap().quota, 850);
    }

    #[tokio::test]
    async fn one_failing_dashscope_id_does_not_hold_back_the_batch() {
        use axum::extract::Path;
        use axum::http::StatusCode;
        use axum::response::IntoResponse;
        use axum::routing::get;

        let app = Router::new().route(
            "/api/v1/tasks/{id}",
            get(|Path(id): Path<String>| async move {
                if id == "up-2" {
                    return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"code": "InternalError", "message": "boom"})))
                        .into_response();
                }
                Json(json!({
                    "output": {"task_id": id, "task_status": "SUCCEEDED", "results": [{"url": "https://cdn/a.png"}]},
                    "usage": {"image_count": 1}
                }))
                .into_response()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let store = Arc::new(MemoryStore::new());
        store.upsert_user(&User { id: 1, quota: 1000, ..Default::default() }).unwrap();
        let channel = Channel {
            id: 1,
            channel_type: ChannelType::Ali,
            base_url: format!("http://{addr}"),
            models: vec!["m".into()],
            ..Default::default()
        };
        store.upsert_channel(&channel).unwrap();
        let now = now_secs();
        store.insert_task(&task(1, 1, now, 50)).unwrap();
        store.insert_task(&task(2, 1, now, 50)).unwrap();

        let state = AppState::new(FinalConfig::default(), store.clone()).unwrap();
        let summary = PollingService::new(state).poll_once().await;
        assert_eq!(summary, PollSummary { updated: 1, force_failed: 0 });
        assert_eq!(store.get_task(1, "task_1").unwrap().unwrap().status, TaskStatus::Success);
        assert_eq!(store.get_task(1, "task_2").unwrap().unwrap().status, TaskStatus::Submitted);
    }
}
