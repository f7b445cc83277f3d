use std::collections::BTreeSet;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{get, post, MethodRouter};
use axum::{Extension, Json};
use bytes::Bytes;
use serde::Serialize;

use super::error::RelayError;
use crate::relay::info::AuthContext;
use crate::relay::{relay, RelayRequest};
use crate::schema::enum_def::{RelayFormat, RelayMode};
use crate::service::app_state::{create_state_router, AppState, StateRouter};

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// A POST route whose body goes straight to the orchestrator.
fn relay_route(mode: RelayMode, format: RelayFormat) -> MethodRouter<Arc<AppState>> {
    post(
        move |State(state): State<Arc<AppState>>,
              Extension(auth): Extension<AuthContext>,
              headers: HeaderMap,
              body: Bytes| async move {
            let req = RelayRequest {
                mode,
                format,
                body,
                content_type: content_type(&headers),
                path_model: None,
                path_stream: None,
                action: String::new(),
            };
            relay(state, auth, req).await
        },
    )
}

/// Splits `gemini-2.5-pro:streamGenerateContent` into model and streaming flag.
fn parse_gemini_target(target: &str) -> Result<(String, bool), RelayError> {
    let (model, action) = target
        .split_once(':')
        .ok_or_else(|| RelayError::invalid_request(format!("missing action in {target}")))?;
    match action {
        "generateContent" => Ok((model.to_string(), false)),
        "streamGenerateContent" => Ok((model.to_string(), true)),
        other => Err(RelayError::not_supported(other)),
    }
}

async fn gemini_generate(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(target): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let (model, stream) = parse_gemini_target(&target)?;
    let req = RelayRequest {
        mode: RelayMode::ChatCompletions,
        format: RelayFormat::Gemini,
        body,
        content_type: content_type(&headers),
        path_model: Some(model),
        path_stream: Some(stream),
        action: String::new(),
    };
    relay(state, auth, req).await
}

async fn passthrough(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path((model, action)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let req = RelayRequest {
        mode: RelayMode::Passthrough,
        format: RelayFormat::OpenAi,
        body,
        content_type: content_type(&headers),
        path_model: Some(model),
        path_stream: None,
        action,
    };
    relay(state, auth, req).await
}

#[derive(Serialize, Debug)]
struct ModelListResponse {
    object: &'static str,
    data: Vec<ModelInfo>,
}

#[derive(Serialize, Debug)]
struct ModelInfo {
    id: String,
    object: &'static str,
    owned_by: &'static str,
}

/// Models reachable through the caller's group and allowed by the token.
fn visible_models(state: &AppState, auth: &AuthContext) -> BTreeSet<String> {
    state
        .channels
        .models_for_group(&auth.using_group)
        .into_iter()
        .filter(|m| auth.token.allows_model(m))
        .collect()
}

async fn list_models(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Json<ModelListResponse> {
    let data = visible_models(&state, &auth)
        .into_iter()
        .map(|id| ModelInfo { id, object: "model", owned_by: "cyder-relay" })
        .collect();
    Json(ModelListResponse { object: "list", data })
}

pub fn routes() -> StateRouter {
    use RelayFormat::{Claude, OpenAi, Responses};
    create_state_router()
        .route("/v1/chat/completions", relay_route(RelayMode::ChatCompletions, OpenAi))
        .route("/v1/completions", relay_route(RelayMode::Completions, OpenAi))
        .route("/v1/embeddings", relay_route(RelayMode::Embeddings, OpenAi))
        .route("/v1/moderations", relay_route(RelayMode::Moderations, OpenAi))
        .route("/v1/responses", relay_route(RelayMode::Responses, Responses))
        .route("/v1/responses/compact", relay_route(RelayMode::ResponsesCompact, Responses))
        .route("/v1/audio/speech", relay_route(RelayMode::AudioSpeech, OpenAi))
        .route("/v1/audio/transcriptions", relay_route(RelayMode::AudioTranscription, OpenAi))
        .route("/v1/images/generations", relay_route(RelayMode::ImagesGenerations, OpenAi))
        .route("/v1/images/edits", relay_route(RelayMode::ImagesEdits, OpenAi))
        .route("/v1/rerank", relay_route(RelayMode::Rerank, OpenAi))
        .route("/v1/messages", relay_route(RelayMode::ChatCompletions, Claude))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{target}", post(gemini_generate))
        .route("/v1beta/models/{target}", post(gemini_generate))
        .route("/pass/{model}/{*action}", post(passthrough))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemini_targets() {
        assert_eq!(parse_gemini_target("gemini-2.5-pro:generateContent").unwrap(), ("gemini-2.5-pro".to_string(), false));
        assert_eq!(
            parse_gemini_target("gemini-2.5-pro:streamGenerateContent").unwrap(),
            ("gemini-2.5-pro".to_string(), true)
        );
        assert_eq!(parse_gemini_target("gemini-2.5-pro:countTokens").unwrap_err().code, "not_supported");
        assert!(parse_gemini_target("gemini-2.5-pro").is_err());
    }
}
