use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::Json;
use serde::Deserialize;

use super::error::RelayError;
use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::utils::i18n::Msg;
use crate::utils::HttpResult;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    key: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(login_request): Json<LoginRequest>,
) -> Result<HttpResult<String>, RelayError> {
    if !login_request.key.is_empty() && login_request.key == state.config.admin_key {
        Ok(HttpResult::new(state.jwt.issue_admin_token(0)))
    } else {
        Err(RelayError::invalid_credential(Msg::TokenInvalid))
    }
}

pub fn routes() -> StateRouter {
    create_state_router().nest("/auth", create_state_router().route("/login", post(login)))
}
