use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Extension, Json};
use cyder_tools::log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::error::RelayError;
use crate::database::log::ConsumptionLog;
use crate::relay::info::AuthContext;
use crate::schema::enum_def::LogType;
use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::utils::{now_secs, HttpResult, ID_GENERATOR};

#[derive(Debug, Deserialize)]
struct RedeemRequest {
    key: String,
}

#[derive(Debug, Serialize)]
struct RedeemResult {
    quota: i64,
    subscription_id: Option<i64>,
}

async fn redeem(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(req): Json<RedeemRequest>,
) -> Result<HttpResult<RedeemResult>, RelayError> {
    let key = req.key.trim();
    if key.is_empty() {
        return Err(RelayError::invalid_request("key is required").with_param("key"));
    }
    let now = now_secs();
    let outcome = state.store.redeem(key, auth.user.id, now)?;

    let content = match outcome.subscription_id {
        Some(id) => format!("redeemed code for subscription {id}"),
        None => format!("redeemed code for {} quota", outcome.quota),
    };
    state.record_log(ConsumptionLog {
        id: ID_GENERATOR.generate_id(),
        user_id: auth.user.id,
        created_at: now,
        log_type: LogType::Topup,
        content,
        username: auth.user.username.clone(),
        token_id: auth.token.id,
        token_name: auth.token.name.clone(),
        quota: outcome.quota,
        group: auth.using_group.clone(),
        other: json!({ "subscription_id": outcome.subscription_id }),
        ..Default::default()
    });
    info!("user {} redeemed a code: quota {}, subscription {:?}", auth.user.id, outcome.quota, outcome.subscription_id);
    Ok(HttpResult::new(RedeemResult {
        quota: outcome.quota,
        subscription_id: outcome.subscription_id,
    }))
}

pub fn routes() -> StateRouter {
    create_state_router().route("/redeem", post(redeem))
}
