use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use super::error::{RelayError, TaskApiError};
use crate::dto::task::{TaskEnvelope, TaskListQuery, TaskView};
use crate::relay::info::AuthContext;
use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::task;

#[derive(Debug, Default, Deserialize)]
struct SubmitParams {
    #[serde(default)]
    precharge: bool,
}

async fn submit(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(model): Path<String>,
    Query(params): Query<SubmitParams>,
    body: Bytes,
) -> Result<Json<TaskEnvelope<Value>>, TaskApiError> {
    let body: Value = serde_json::from_slice(&body).map_err(RelayError::from)?;
    let data = task::submit(state, auth, &model, body, params.precharge).await?;
    Ok(Json(TaskEnvelope::ok(data)))
}

async fn list_by_condition(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(_model): Path<String>,
    Json(query): Json<TaskListQuery>,
) -> Result<Json<TaskEnvelope<Vec<TaskView>>>, TaskApiError> {
    let views = task::list_tasks(&state, &auth, &query.task_ids)?;
    Ok(Json(TaskEnvelope::ok(views)))
}

async fn fetch_one(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((_model, task_id)): Path<(String, String)>,
) -> Result<Json<TaskEnvelope<TaskView>>, TaskApiError> {
    let view = task::get_task(&state, &auth, &task_id)?;
    Ok(Json(TaskEnvelope::ok(view)))
}

pub fn routes() -> StateRouter {
    create_state_router()
        .route("/{model}/submit", post(submit))
        .route("/{model}/task/list-by-condition", post(list_by_condition))
        .route("/{model}/task/{task_id}", get(fetch_one))
}
