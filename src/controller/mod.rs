use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http;
use axum::middleware;
use axum::response::IntoResponse;
use tower_http::cors::CorsLayer;

use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::utils::auth::{admin_auth_middleware, token_auth_middleware};

mod auth;
pub mod error;
mod redeem;
mod relay;
mod stat;
mod task;

/// Uploads for audio transcription and image edits can be large.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub fn create_router(state: &Arc<AppState>) -> StateRouter {
    let api_router = create_state_router()
        .merge(relay::routes())
        .merge(task::routes())
        .merge(redeem::routes())
        .layer(middleware::from_fn_with_state(state.clone(), token_auth_middleware))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES));

    let manager_router = create_state_router().nest(
        "/api",
        create_state_router()
            .merge(stat::routes())
            .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
            .merge(auth::routes()),
    );

    create_state_router()
        .merge(api_router)
        .merge(manager_router)
        .fallback(handle_404)
        .layer(CorsLayer::permissive())
}

pub async fn handle_404() -> impl IntoResponse {
    (http::StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::config::FinalConfig;
    use crate::database::channel::{Channel, ChannelSettings};
    use crate::database::log::{ConsumptionLog, LogStore};
    use crate::database::memory::MemoryStore;
    use crate::database::redemption::{Redemption, RedemptionStore};
    use crate::database::task::TaskStore;
    use crate::database::token::{Token, TokenStore};
    use crate::database::user::{User, UserStore};
    use crate::database::SeedStore;
    use crate::schema::enum_def::{ChannelType, LogType, RedemptionStatus, TaskStatus};
    use crate::task::poller::PollingService;
    use crate::utils::now_secs;

    const KEY: &str = "sk-scenario";

    type Seen = Arc<Mutex<Vec<String>>>;

    fn chat_body(model: &str) -> Value {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": model,
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello there"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        })
    }

    fn chunk(model: &str, delta: Value, finish: Option<&str>) -> String {
        let chunk = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1,
            "model": model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]
        });
        format!("data: {chunk}\n\n")
    }

    /// OpenAI, Anthropic and DashScope lookalikes on one listener.
    async fn mock_upstream(seen: Seen) -> String {
        let claude_seen = seen.clone();
        let messages = post(move |Json(body): Json<Value>| {
            let seen = claude_seen.clone();
            async move {
                seen.lock().unwrap().push(body["system"].as_str().unwrap_or_default().to_string());
                Json(json!({
                    "id": "msg_1",
                    "type": "message",
                    "role": "assistant",
                    "model": body["model"],
                    "content": [{"type": "thinking", "thinking": "hm", "signature": "s"}, {"type": "text", "text": "hi"}],
                    "stop_reason": "end_turn",
                    "usage": {"input_tokens": 5, "output_tokens": 2}
                }))
            }
        });
        let chat = post(move |Json(body): Json<Value>| {
            let seen = seen.clone();
            async move {
                let model = body["model"].as_str().unwrap_or_default().to_string();
                seen.lock().unwrap().push(model.clone());
                if body["stream"].as_bool() == Some(true) {
                    let usage = json!({
                        "id": "chatcmpl-1", "object": "chat.completion.chunk", "created": 1, "model": model,
                        "choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
                    });
                    let text = [
                        chunk(&model, json!({"role": "assistant", "content": "hello"}), None),
                        chunk(&model, json!({"content": " there"}), Some("stop")),
                        format!("data: {usage}\n\n"),
                        "data: [DONE]\n\n".to_string(),
                    ]
                    .concat();
                    return Response::builder()
                        .header("content-type", "text/event-stream")
                        .body(Body::from(text))
                        .unwrap();
                }
                Json(chat_body(&model)).into_response()
            }
        });
        let app = Router::new()
            .route("/v1/chat/completions", chat)
            .route("/v1/messages", messages)
            .route(
                "/api/v1/services/aigc/video-generation/video-synthesis",
                post(|| async { Json(json!({"output": {"task_id": "up-1", "task_status": "PENDING"}, "request_id": "r1"})) }),
            )
            .route(
                "/api/v1/tasks/{id}",
                get(|| async {
                    Json(json!({
                        "output": {"task_id": "up-1", "task_status": "SUCCEEDED", "video_url": "https://cdn/v.mp4"},
                        "usage": {"video_count": 2}
                    }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    struct Harness {
        store: Arc<MemoryStore>,
        state: Arc<AppState>,
        app: Router,
        seen: Seen,
    }

    async fn harness(channel: impl FnOnce(String) -> Channel) -> Harness {
        let seen: Seen = Arc::default();
        let base_url = mock_upstream(seen.clone()).await;
        let store = Arc::new(MemoryStore::new());
        store.upsert_user(&User { id: 1, username: "alice".into(), quota: 1_000_000, ..Default::default() }).unwrap();
        store
            .upsert_token(&Token { id: 1, user_id: 1, key: KEY.into(), remain_quota: 1_000_000, expired_time: -1, ..Default::default() })
            .unwrap();
        store.upsert_channel(&channel(base_url)).unwrap();

        let mut config = FinalConfig::default();
        config.task.enabled = false;
        config.quota.trust_multiplier = 0;
        config.ratio.model_price.insert("wanx2.1-t2v-plus".into(), 0.0002);
        let state = AppState::new(config, store.clone()).unwrap();
        let app = create_router(&state).with_state(state.clone());
        Harness { store, state, app, seen }
    }

    fn openai_channel(base_url: String) -> Channel {
        Channel {
            id: 1,
            name: "mock".into(),
            channel_type: ChannelType::OpenAi,
            base_url,
            key: "sk-upstream".into(),
            models: vec!["gpt-4o".into(), "Pro/deepseek-ai/DeepSeek-R1".into()],
            ..Default::default()
        }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", format!("Bearer {KEY}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    /// Settlement of streams finishes after the body ends, so poll for the rows.
    async fn logs(h: &Harness, expected: usize) -> Vec<ConsumptionLog> {
        let table = h.state.log_tables.get_log_table_name(now_secs()).unwrap();
        for _ in 0..100 {
            h.state.log_writer.flush_now();
            let rows = h.store.list_logs(&table, Some(1)).unwrap();
            if rows.len() >= expected {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        h.store.list_logs(&table, Some(1)).unwrap()
    }

    fn balance(h: &Harness) -> i64 {
        h.store.get_user(1).unwrap().unwrap().quota
    }

    #[tokio::test]
    async fn chat_without_stream_is_billed() {
        let h = harness(openai_channel).await;
        let request = post_json("/v1/chat/completions", json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "hi"}]}));
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["choices"][0]["message"]["content"], "hello there");

        let rows = logs(&h, 1).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].log_type, LogType::Consume);
        assert!(rows[0].quota > 0);
        assert_eq!(balance(&h), 1_000_000 - rows[0].quota);
    }

    #[tokio::test]
    async fn chat_stream_reports_usage_before_done() {
        let h = harness(openai_channel).await;
        let request = post_json(
            "/v1/chat/completions",
            json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
                "stream_options": {"include_usage": true}
            }),
        );
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        let frames: Vec<&str> = text
            .split("\n\n")
            .filter_map(|frame| frame.strip_prefix("data: "))
            .collect();
        assert_eq!(frames.last(), Some(&"[DONE]"));
        let last: Value = serde_json::from_str(frames[frames.len() - 2]).unwrap();
        let total = last["usage"]["total_tokens"].as_i64().unwrap();
        assert_eq!(total, 7);

        let rows = logs(&h, 1).await;
        assert_eq!(rows[0].prompt_tokens + rows[0].completion_tokens, total);
        assert!(rows[0].is_stream);
    }

    #[tokio::test]
    async fn redemption_code_is_single_use() {
        let h = harness(openai_channel).await;
        h.store
            .upsert_redemption(&Redemption { id: 1, key: "K".into(), quota: 500, ..Default::default() })
            .unwrap();
        let response = h.app.clone().oneshot(post_json("/redeem", json!({"key": "K"}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(balance(&h), 1_000_500);
        assert_eq!(h.store.get_redemption("K").unwrap().unwrap().status, RedemptionStatus::Used);
        let rows = logs(&h, 1).await;
        assert_eq!(rows[0].log_type, LogType::Topup);
        assert_eq!(rows[0].quota, 500);

        let again = h.app.clone().oneshot(post_json("/redeem", json!({"key": "K"}))).await.unwrap();
        assert_eq!(again.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(again).await["error"]["code"], "redemption.used");
    }

    #[tokio::test]
    async fn task_is_precharged_then_settled_by_the_poller() {
        let h = harness(|base_url| Channel {
            id: 1,
            channel_type: ChannelType::Ali,
            base_url,
            key: "sk-dash".into(),
            models: vec!["wanx2.1-t2v-plus".into()],
            ..Default::default()
        })
        .await;
        let response = h
            .app
            .clone()
            .oneshot(post_json("/wanx2.1-t2v-plus/submit", json!({"input": {"prompt": "a cat surfing"}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["code"], 0);
        let task_id = body["data"]["task_id"].as_str().unwrap().to_string();
        // One video at 0.0002 USD.
        let precharge = 100;
        assert_eq!(balance(&h), 1_000_000 - precharge);
        assert_eq!(h.store.get_token(1).unwrap().unwrap().remain_quota, 1_000_000 - precharge);

        let summary = PollingService::new(h.state.clone()).poll_once().await;
        assert_eq!(summary.updated, 1);
        let task = h.store.get_task(1, &task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.quota, 2 * precharge);
        assert_eq!(balance(&h), 1_000_000 - 2 * precharge);

        let rows = logs(&h, 2).await;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.log_type == LogType::Consume));

        let fetched = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/wanx2.1-t2v-plus/task/{task_id}"))
                    .header("authorization", format!("Bearer {KEY}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let view = body_json(fetched).await;
        assert_eq!(view["data"]["status"], "SUCCESS");
        assert_eq!(view["data"]["result_url"], "https://cdn/v.mp4");
    }

    #[tokio::test]
    async fn wildcard_mapping_strips_the_prefix() {
        let h = harness(|base_url| Channel {
            model_mapping: [("Pro/*".to_string(), "*".to_string())].into_iter().collect(),
            ..openai_channel(base_url)
        })
        .await;
        let request = post_json(
            "/v1/chat/completions",
            json!({"model": "Pro/deepseek-ai/DeepSeek-R1", "messages": [{"role": "user", "content": "hi"}]}),
        );
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.seen.lock().unwrap().as_slice(), ["deepseek-ai/DeepSeek-R1"]);
        assert_eq!(body_json(response).await["model"], "deepseek-ai/DeepSeek-R1");

        let rows = logs(&h, 1).await;
        assert_eq!(rows[0].model_name, "Pro/deepseek-ai/DeepSeek-R1");
        assert_eq!(rows[0].upstream_model, "deepseek-ai/DeepSeek-R1");
    }

    #[tokio::test]
    async fn native_claude_request_carries_channel_settings() {
        let h = harness(|base_url| Channel {
            channel_type: ChannelType::Anthropic,
            models: vec!["claude-sonnet-4-5".into()],
            settings: ChannelSettings {
                system_prompt: Some("be brief".into()),
                thinking_to_content: true,
                ..Default::default()
            },
            ..openai_channel(base_url)
        })
        .await;
        let request = post_json(
            "/v1/messages",
            json!({"model": "claude-sonnet-4-5", "max_tokens": 64, "messages": [{"role": "user", "content": "hi"}]}),
        );
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.seen.lock().unwrap().as_slice(), ["be brief"]);

        let body = body_json(response).await;
        assert_eq!(body["type"], "message");
        let text = body["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("<think>"), "{text}");
        assert!(text.ends_with("hi"), "{text}");
        assert_eq!(logs(&h, 1).await.len(), 1);
    }

    #[tokio::test]
    async fn blocked_request_costs_nothing() {
        let h = harness(|base_url| Channel {
            param_override: serde_json::from_value(json!([{
                "mode": "block",
                "conditions": [{"path": "messages.0.content", "mode": "contains", "value": "forbidden"}],
                "logic": "AND"
            }]))
            .unwrap(),
            ..openai_channel(base_url)
        })
        .await;
        let request = post_json(
            "/v1/chat/completions",
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "this is forbidden"}]}),
        );
        let response = h.app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "blocked_by_policy");
        assert_eq!(balance(&h), 1_000_000);
        assert!(h.seen.lock().unwrap().is_empty());
        assert!(logs(&h, 0).await.is_empty());
    }

    #[tokio::test]
    async fn missing_key_is_rejected_and_models_are_listed() {
        let h = harness(openai_channel).await;
        let anonymous = Request::builder().uri("/v1/models").body(Body::empty()).unwrap();
        let response = h.app.clone().oneshot(anonymous).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let listed = Request::builder()
            .uri("/v1/models")
            .header("x-api-key", KEY)
            .body(Body::empty())
            .unwrap();
        let body = body_json(h.app.clone().oneshot(listed).await.unwrap()).await;
        let ids: Vec<&str> = body["data"].as_array().unwrap().iter().filter_map(|m| m["id"].as_str()).collect();
        assert_eq!(ids, ["Pro/deepseek-ai/DeepSeek-R1", "gpt-4o"]);
    }

    #[tokio::test]
    async fn stat_routes_need_an_admin_token() {
        let h = harness(openai_channel).await;
        let uri = "/api/stat/user_calls?start=0&end=3600";
        let response = h.app.clone().oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let login = Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header("content-type", "application/json")
            .body(Body::from(json!({"key": h.state.config.admin_key}).to_string()))
            .unwrap();
        let token = body_json(h.app.clone().oneshot(login).await.unwrap()).await["data"].as_str().unwrap().to_string();
        let authorized = Request::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let response = h.app.clone().oneshot(authorized).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"], json!([]));
    }
}
