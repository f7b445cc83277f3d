//! The relay orchestrator. One client request becomes up to `retry_times + 1`
//! upstream attempts; the quota is pre-consumed once and settled or refunded
//! exactly once, whichever attempt ends the request.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use cyder_tools::log::{debug, error, info, warn};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use self::adaptor::{do_request, json_headers, parse_response, stream_decoder, Adaptor, Dialect, UpstreamRequest};
use self::info::{AuthContext, RelayInfo};
use self::model_mapping::apply_model_mapping;
use self::param_override::apply_param_override;
use self::quota::{pre_consume, price_data, PreConsumeRequest, PriceData, QuotaGuard};
use self::router::select_channel;
use self::stream::{billable_usage, collect, pump, receiver_body, Pipeline, StreamOutcome, StreamTiming};
use crate::bridge::thinking::{inline_thinking, ThinkingToContent};
use crate::bridge::{claude, encoder_for, gemini, responses};
use crate::controller::error::{ErrorKind, RelayError};
use crate::database::channel::{Channel, ChannelSettings};
use crate::database::log::ConsumptionLog;
use crate::dto::claude::ClaudeRequest;
use crate::dto::gemini::GeminiRequest;
use crate::dto::openai::{ChatRequest, ChatResponse, Message, MessageContent, Usage};
use crate::dto::responses::ResponsesRequest;
use crate::schema::enum_def::{LogType, RelayFormat, RelayMode};
use crate::service::app_state::AppState;
use crate::service::http_client::read_body;
use crate::utils::{force_stream_usage, now_secs, ID_GENERATOR};

pub mod adaptor;
pub mod info;
pub mod model_mapping;
pub mod param_override;
pub mod quota;
pub mod router;
pub mod stream;
pub mod tokenizer;
pub mod validate;

/// A client request as the controllers hand it over.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub mode: RelayMode,
    pub format: RelayFormat,
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Model named by the path (Gemini, passthrough) instead of the body.
    pub path_model: Option<String>,
    /// Gemini picks streaming by path, not by a body flag.
    pub path_stream: Option<bool>,
    /// Trailing path forwarded on passthrough.
    pub action: String,
}

impl RelayRequest {
    pub fn json(mode: RelayMode, format: RelayFormat, body: Bytes) -> Self {
        Self {
            mode,
            format,
            body,
            content_type: Some("application/json".to_string()),
            path_model: None,
            path_stream: None,
            action: String::new(),
        }
    }

    fn is_json(&self) -> bool {
        self.content_type.as_deref().map_or(true, |ct| ct.contains("json"))
    }
}

enum Payload {
    /// Chat-bearing request: the hub form and the original document for native forwarding.
    Chat { chat: Box<ChatRequest>, original: Value },
    /// JSON forwarded as is apart from model and overrides.
    Json(Value),
    /// Multipart or binary, forwarded untouched.
    Raw,
}

struct Prepared {
    payload: Payload,
    raw: Bytes,
    content_type: Option<String>,
    model: String,
    is_stream: bool,
    include_usage: bool,
    max_tokens: Option<u64>,
    prompt_tokens: i64,
    prompt_text: String,
}

fn parse<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, RelayError> {
    Ok(serde_json::from_value(value.clone())?)
}

fn chat_prepared(req: &RelayRequest, chat: ChatRequest, original: Value) -> Result<Prepared, RelayError> {
    validate::validate_chat(&chat)?;
    let include_usage = match req.format {
        RelayFormat::OpenAi => chat.include_usage(),
        _ => true,
    };
    Ok(Prepared {
        model: chat.model.clone(),
        is_stream: chat.is_stream(),
        include_usage,
        max_tokens: chat.max_output_tokens(),
        prompt_tokens: tokenizer::estimate_chat_prompt(&chat),
        prompt_text: chat.prompt_text(),
        payload: Payload::Chat { chat: Box::new(chat), original },
        raw: req.body.clone(),
        content_type: req.content_type.clone(),
    })
}

/// Plain text of `input` or `prompt`, used for estimates and the word filter.
fn body_text(value: &Value) -> String {
    fn flatten(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| flatten(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    for key in ["input", "prompt", "query", "documents"] {
        if let Some(v) = value.get(key) {
            flatten(v, &mut out);
        }
    }
    out.join("\n")
}

/// Value of a plain text form field in a `multipart/form-data` body.
fn multipart_field(content_type: &str, body: &[u8], field: &str) -> Option<String> {
    let boundary = content_type.split(';').find_map(|p| p.trim().strip_prefix("boundary="))?;
    let boundary = format!("--{}", boundary.trim_matches('"'));
    let text = String::from_utf8_lossy(body);
    let marker = format!("name=\"{field}\"");
    text.split(boundary.as_str()).find_map(|part| {
        let (head, value) = part.split_once("\r\n\r\n")?;
        head.contains(&marker).then(|| value.trim_end_matches("\r\n").trim().to_string())
    })
}

fn prepare(req: &RelayRequest) -> Result<Prepared, RelayError> {
    if !req.is_json() {
        let content_type = req.content_type.clone().unwrap_or_default();
        let model = req
            .path_model
            .clone()
            .or_else(|| multipart_field(&content_type, &req.body, "model"))
            .unwrap_or_default();
        if model.is_empty() {
            return Err(RelayError::invalid_request_msg(crate::utils::i18n::Msg::ModelRequired).with_param("model"));
        }
        return Ok(Prepared {
            payload: Payload::Raw,
            raw: req.body.clone(),
            content_type: req.content_type.clone(),
            model,
            is_stream: false,
            include_usage: false,
            max_tokens: None,
            prompt_tokens: 0,
            prompt_text: String::new(),
        });
    }

    let value: Value = serde_json::from_slice(&req.body)?;
    match (req.mode, req.format) {
        (RelayMode::ChatCompletions, RelayFormat::OpenAi) => {
            let chat: ChatRequest = parse(&value)?;
            chat_prepared(req, chat, value)
        }
        (_, RelayFormat::Claude) => {
            let claude: ClaudeRequest = parse(&value)?;
            chat_prepared(req, claude::claude_to_chat(claude), value)
        }
        (_, RelayFormat::Gemini) => {
            let gemini_req: GeminiRequest = parse(&value)?;
            let model = req.path_model.clone().unwrap_or_default();
            let stream = req.path_stream.unwrap_or(false);
            chat_prepared(req, gemini::gemini_to_chat(gemini_req, &model, stream), value)
        }
        (RelayMode::Responses, _) => {
            let responses_req: ResponsesRequest = parse(&value)?;
            chat_prepared(req, responses::responses_to_chat(responses_req), value)
        }
        _ => {
            validate::validate_body(req.mode, &value)?;
            let model = req
                .path_model
                .clone()
                .or_else(|| value.get("model").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            if model.is_empty() {
                return Err(RelayError::invalid_request_msg(crate::utils::i18n::Msg::ModelRequired).with_param("model"));
            }
            let is_stream = value.get("stream").and_then(Value::as_bool).unwrap_or(false);
            let include_usage = value
                .pointer("/stream_options/include_usage")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let prompt_text = body_text(&value);
            Ok(Prepared {
                model,
                is_stream,
                include_usage,
                max_tokens: value.get("max_tokens").and_then(Value::as_u64),
                prompt_tokens: tokenizer::estimate_tokens(&prompt_text),
                prompt_text,
                payload: Payload::Json(value),
                raw: req.body.clone(),
                content_type: req.content_type.clone(),
            })
        }
    }
}

/// System text to send given the request's own, or `None` to leave it alone.
fn merged_prompt(settings: &ChannelSettings, existing: Option<&str>) -> Option<String> {
    let prompt = settings.system_prompt.as_deref().filter(|p| !p.is_empty())?;
    match existing {
        None => Some(prompt.to_string()),
        Some("") if settings.system_prompt_override => Some(prompt.to_string()),
        Some(text) if settings.system_prompt_override => Some(format!("{prompt}\n{text}")),
        Some(_) => None,
    }
}

/// Channel-level rewrites of the hub request: system prompt and role renames.
pub fn apply_channel_settings(chat: &mut ChatRequest, settings: &ChannelSettings) {
    let position = chat.messages.iter().position(|m| m.role == "system");
    let existing = position.map(|i| chat.messages[i].content_text());
    if let Some(merged) = merged_prompt(settings, existing.as_deref()) {
        match position {
            Some(i) => chat.messages[i].content = Some(MessageContent::Text(merged)),
            None => chat.messages.insert(0, Message::text("system", merged)),
        }
    }
    if !settings.role_mappings.is_empty() {
        for message in &mut chat.messages {
            if let Some(role) = settings.role_mappings.get(&message.role) {
                message.role = role.clone();
            }
        }
    }
}

/// Puts the channel prompt in a system slot holding a string or a list of
/// text blocks. Lists get the prompt as a new leading block.
fn merge_system_slot(map: &mut Map<String, Value>, key: &str, settings: &ChannelSettings, block: fn(&str) -> Value) {
    let existing = match map.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => Some(String::new()),
    };
    let Some(merged) = merged_prompt(settings, existing.as_deref()) else {
        return;
    };
    match map.get_mut(key) {
        Some(Value::Array(blocks)) => {
            if let Some(prompt) = settings.system_prompt.as_deref() {
                blocks.insert(0, block(prompt));
            }
        }
        _ => {
            map.insert(key.to_string(), Value::String(merged));
        }
    }
}

/// The same rewrites as [`apply_channel_settings`] on a body forwarded in
/// the client's own dialect.
fn apply_native_settings(body: &mut Value, format: RelayFormat, settings: &ChannelSettings) {
    let Value::Object(map) = body else {
        return;
    };
    match format {
        RelayFormat::Claude => merge_system_slot(map, "system", settings, |text| json!({"type": "text", "text": text})),
        RelayFormat::Responses => merge_system_slot(map, "instructions", settings, |text| json!({"type": "input_text", "text": text})),
        RelayFormat::Gemini => {
            let key = if map.contains_key("system_instruction") { "system_instruction" } else { "systemInstruction" };
            let existing = map.get(key).and_then(|v| v.get("parts")).and_then(Value::as_array).map(|parts| {
                parts.iter().filter_map(|p| p.get("text").and_then(Value::as_str)).collect::<Vec<_>>().join("\n")
            });
            if let Some(merged) = merged_prompt(settings, existing.as_deref()) {
                map.insert(key.to_string(), json!({"parts": [{"text": merged}]}));
            }
        }
        RelayFormat::OpenAi => {
            if let Some(messages) = map.get_mut("messages").and_then(Value::as_array_mut) {
                let position = messages.iter().position(|m| m.get("role").and_then(Value::as_str) == Some("system"));
                let existing = position.map(|i| match &messages[i]["content"] {
                    Value::String(s) => s.clone(),
                    _ => String::new(),
                });
                if let Some(merged) = merged_prompt(settings, existing.as_deref()) {
                    match position {
                        Some(i) => messages[i]["content"] = Value::String(merged),
                        None => messages.insert(0, json!({"role": "system", "content": merged})),
                    }
                }
            }
        }
    }
    if settings.role_mappings.is_empty() {
        return;
    }
    let list = match format {
        RelayFormat::Gemini => "contents",
        RelayFormat::Responses => "input",
        RelayFormat::OpenAi | RelayFormat::Claude => "messages",
    };
    if let Some(items) = map.get_mut(list).and_then(Value::as_array_mut) {
        for item in items.iter_mut().filter_map(Value::as_object_mut) {
            let renamed = item.get("role").and_then(Value::as_str).and_then(|r| settings.role_mappings.get(r));
            if let Some(role) = renamed.cloned() {
                item.insert("role".to_string(), Value::String(role));
            }
        }
    }
}

enum Outbound {
    Json(Value),
    Raw(Bytes),
}

fn build_body(adaptor: &dyn Adaptor, info: &RelayInfo, prepared: &Prepared, channel: &Channel) -> Result<Outbound, RelayError> {
    let pass_body = info.settings.pass_through_body_enabled && info.native;
    let mut body = match &prepared.payload {
        Payload::Raw => return Ok(Outbound::Raw(prepared.raw.clone())),
        _ if pass_body => return Ok(Outbound::Raw(prepared.raw.clone())),
        Payload::Chat { chat, original } => {
            if info.native {
                let mut body = original.clone();
                apply_native_settings(&mut body, info.format, &info.settings);
                adaptor.finalize_native(&mut body, info)?;
                body
            } else {
                let mut chat = ChatRequest::clone(chat);
                apply_channel_settings(&mut chat, &info.settings);
                adaptor.convert_chat(chat, info)?
            }
        }
        Payload::Json(value) => {
            let mut body = value.clone();
            adaptor.finalize_native(&mut body, info)?;
            if info.mode == RelayMode::Completions {
                force_stream_usage(&mut body);
            }
            body
        }
    };
    if !channel.param_override.is_empty() {
        apply_param_override(&mut body, &channel.param_override, info.prompt_tokens)?;
    }
    Ok(Outbound::Json(body))
}

fn sse_response(body: Body) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    (StatusCode::OK, headers, body).into_response()
}

fn json_response(body: Bytes) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    (StatusCode::OK, headers, body).into_response()
}

/// Best-effort usage of a directive or passthrough response.
fn sniff_usage(body: &[u8]) -> Option<Usage> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    if let Some(input) = usage.get("input_tokens").and_then(Value::as_i64) {
        let output = usage.get("output_tokens").and_then(Value::as_i64).unwrap_or(0);
        return Some(Usage::new(input, output));
    }
    let mut usage: Usage = serde_json::from_value(usage.clone()).ok()?;
    usage.normalize();
    Some(usage)
}

/// Orchestrates one request: validation, routing with retries, quota and logging.
pub async fn relay(state: Arc<AppState>, auth: AuthContext, req: RelayRequest) -> Result<Response, RelayError> {
    let prepared = prepare(&req)?;
    validate::authorize_model(&auth.token, &prepared.model)?;
    validate::check_sensitive(&state.config.relay.sensitive_words, &prepared.prompt_text)?;

    let mut info = RelayInfo::new(&auth, req.mode, req.format, &prepared.model);
    info.is_stream = prepared.is_stream;
    info.include_usage = prepared.include_usage;
    info.prompt_tokens = prepared.prompt_tokens;
    info.action = req.action.clone();
    let price = price_data(
        &state.config.ratio,
        &state.config.quota,
        &info.origin_model,
        &info.user_group,
        &info.using_group,
    );
    debug!(
        "[{}] relay {} {} model={} stream={} user={}",
        info.request_id, info.mode, info.format, info.origin_model, info.is_stream, info.user_id
    );

    let mut tried = HashSet::new();
    let mut guard: Option<QuotaGuard> = None;
    let mut last_err: Option<RelayError> = None;
    for attempt in 0..=state.config.relay.retry_times {
        let selected = select_channel(&state.channels, &info.origin_model, &info.using_group, &tried, |c| {
            state.adaptors.serves(c.channel_type, info.mode)
        });
        let channel = match selected {
            Ok(channel) => channel,
            Err(err) => {
                last_err.get_or_insert(err);
                break;
            }
        };
        tried.insert(channel.id);
        info.bind_channel(&channel);

        match attempt_once(&state, &channel, &mut info, &prepared, &price, &mut guard).await {
            Ok(response) => return Ok(response),
            Err(err) => {
                warn!(
                    "[{}] attempt {} on channel {} ({}) failed: {}",
                    info.request_id, attempt, channel.id, channel.name, err
                );
                note_channel_failure(&state, channel.id, &err);
                let retry = err.is_retriable();
                last_err = Some(err);
                if !retry {
                    break;
                }
            }
        }
    }
    let err = last_err.unwrap_or_else(|| RelayError::no_channel(&info.origin_model, &info.using_group));
    Err(fail(&state, &info, guard, err))
}

async fn attempt_once(
    state: &Arc<AppState>,
    channel: &Channel,
    info: &mut RelayInfo,
    prepared: &Prepared,
    price: &PriceData,
    guard: &mut Option<QuotaGuard>,
) -> Result<Response, RelayError> {
    let adaptor = state
        .adaptors
        .get(channel.channel_type.api_type())
        .ok_or_else(|| RelayError::not_supported(&channel.channel_type.to_string()))?;
    info.upstream_model = apply_model_mapping(&channel.model_mapping, &info.origin_model)?;
    let dialect = adaptor.dialect(info.format, info.mode);
    info.native = !matches!(prepared.payload, Payload::Chat { .. })
        || info.mode == RelayMode::ResponsesCompact
        || dialect.matches(info.format);

    // Native chat bodies still go through the hub when thinking must be inlined.
    let transcode = !info.native
        || (info.settings.thinking_to_content
            && matches!(prepared.payload, Payload::Chat { .. })
            && info.mode != RelayMode::ResponsesCompact);

    let body = build_body(adaptor.as_ref(), info, prepared, channel)?;

    if guard.is_none() {
        let amount = price.estimate(info.prompt_tokens, prepared.max_tokens);
        let charge = pre_consume(
            &state.store,
            &state.config.quota,
            PreConsumeRequest {
                user_id: info.user_id,
                token_id: info.token_id,
                token_unlimited: info.token_unlimited,
                model: &info.origin_model,
                amount,
                per_call: price.is_per_call(),
            },
        )?;
        debug!("[{}] pre-consumed {} (estimate {})", info.request_id, charge.amount, amount);
        *guard = Some(QuotaGuard::new(state.store.clone(), charge));
    }
    if let Some(charge) = guard.as_ref().and_then(QuotaGuard::charge) {
        info.pre_consumed = charge.amount;
        info.quota_source = charge.source;
    }

    let mut headers = json_headers();
    let body = match body {
        Outbound::Json(value) => Bytes::from(serde_json::to_vec(&value)?),
        Outbound::Raw(raw) => {
            if let Some(ct) = prepared.content_type.as_deref().and_then(|ct| HeaderValue::from_str(ct).ok()) {
                headers.insert(CONTENT_TYPE, ct);
            }
            raw
        }
    };
    adaptor.setup_headers(&mut headers, info)?;
    let url = adaptor.request_url(info, dialect)?;
    let forced = adaptor.forces_stream(dialect)
        && !matches!(info.mode, RelayMode::ResponsesCompact | RelayMode::Passthrough);
    let upstream_stream = info.is_stream || forced;
    let timeout = (!upstream_stream).then(|| Duration::from_secs(state.config.relay.non_stream_timeout_secs));
    debug!("[{}] -> {} model={} native={}", info.request_id, url, info.upstream_model, info.native);

    let response = do_request(&state.http, info, UpstreamRequest { url, headers, body, timeout }).await?;

    if info.is_stream {
        return Ok(stream_response(state, info.clone(), dialect, transcode, response, guard.take(), price.clone()));
    }
    if forced {
        let chat = collect(response, stream_decoder(dialect, &info.upstream_model), stream_timing(state, info)).await?;
        return finish_chat(state, info, chat, None, dialect, guard.take(), price);
    }

    let (_, upstream_headers, bytes) = read_body(response).await?;
    match &prepared.payload {
        Payload::Chat { .. } if transcode => {
            let chat = parse_response(dialect, &bytes, &info.upstream_model)?;
            finish_chat(state, info, chat, Some(bytes), dialect, guard.take(), price)
        }
        Payload::Chat { .. } => {
            let parsed = parse_response(dialect, &bytes, &info.upstream_model).ok();
            let usage = match &parsed {
                Some(chat) => billable_usage(
                    chat.usage.as_ref(),
                    info.prompt_tokens,
                    &chat.completion_text(),
                    chat.tool_call_count(),
                ),
                None => billable_usage(None, info.prompt_tokens, "", 0),
            };
            settle(state, info, guard.take(), price, &usage, json!({}));
            Ok(json_response(bytes))
        }
        Payload::Json(_) | Payload::Raw => {
            let usage = billable_usage(sniff_usage(&bytes).as_ref(), info.prompt_tokens, "", 0);
            settle(state, info, guard.take(), price, &usage, json!({}));
            let mut headers = HeaderMap::new();
            if let Some(ct) = upstream_headers.get(CONTENT_TYPE) {
                headers.insert(CONTENT_TYPE, ct.clone());
            }
            Ok((StatusCode::OK, headers, Body::from(bytes)).into_response())
        }
    }
}

fn stream_timing(state: &AppState, info: &RelayInfo) -> StreamTiming {
    StreamTiming {
        idle: state.config.relay.stream_idle_timeout(&info.upstream_model),
        hard_cap: Duration::from_secs(state.config.relay.stream_hard_cap_secs),
    }
}

/// Hub response back in the client's dialect, then settled.
fn finish_chat(
    state: &Arc<AppState>,
    info: &RelayInfo,
    mut chat: ChatResponse,
    upstream: Option<Bytes>,
    dialect: Dialect,
    guard: Option<QuotaGuard>,
    price: &PriceData,
) -> Result<Response, RelayError> {
    let usage = billable_usage(chat.usage.as_ref(), info.prompt_tokens, &chat.completion_text(), chat.tool_call_count());
    let thinking = info.settings.thinking_to_content;
    if thinking {
        inline_thinking(&mut chat);
    }
    if chat.usage.is_none() {
        chat.usage = Some(usage.clone());
    }
    let body = match info.format {
        RelayFormat::OpenAi => match upstream {
            Some(raw) if dialect == Dialect::Chat && !info.settings.force_format && !thinking => raw,
            _ => Bytes::from(serde_json::to_vec(&chat)?),
        },
        RelayFormat::Claude => Bytes::from(serde_json::to_vec(&claude::chat_response_to_claude(chat))?),
        RelayFormat::Gemini => Bytes::from(serde_json::to_vec(&gemini::chat_response_to_gemini(&chat))?),
        RelayFormat::Responses => Bytes::from(serde_json::to_vec(&responses::chat_response_to_responses(&chat))?),
    };
    settle(state, info, guard, price, &usage, json!({}));
    Ok(json_response(body))
}

fn stream_response(
    state: &Arc<AppState>,
    info: RelayInfo,
    dialect: Dialect,
    transcode: bool,
    response: reqwest::Response,
    guard: Option<QuotaGuard>,
    price: PriceData,
) -> Response {
    let timing = stream_timing(state, &info);
    let decoder = stream_decoder(dialect, &info.upstream_model);
    let pipeline = if !transcode {
        Pipeline::Passthrough {
            decoder,
            strip_usage_frames: info.mode == RelayMode::Completions && !info.include_usage,
        }
    } else {
        Pipeline::Transcode {
            decoder,
            encoder: encoder_for(info.format, info.include_usage, &info.origin_model),
            thinking: info.settings.thinking_to_content.then(ThinkingToContent::new),
        }
    };
    let (tx, rx) = mpsc::channel::<Bytes>(64);
    let state = state.clone();
    tokio::spawn(async move {
        let outcome = pump(response, pipeline, timing, tx, info.prompt_tokens, info.start).await;
        finish_stream(&state, &info, guard, &price, outcome);
    });
    sse_response(receiver_body(rx))
}

fn finish_stream(state: &AppState, info: &RelayInfo, guard: Option<QuotaGuard>, price: &PriceData, mut outcome: StreamOutcome) {
    if outcome.client_gone {
        info!("[{}] client disconnected after {} frames", info.request_id, outcome.frames);
    }
    match outcome.error.take() {
        Some(err) if outcome.frames == 0 => {
            fail(state, info, guard, err);
        }
        error => {
            let usage = outcome.final_usage(info.prompt_tokens);
            let extra = json!({
                "estimated": outcome.is_estimated(),
                "first_frame_ms": outcome.first_frame_ms,
                "stream_error": error.map(|e| e.code),
                "client_gone": outcome.client_gone,
            });
            settle(state, info, guard, price, &usage, extra);
        }
    }
}

fn base_log(info: &RelayInfo, log_type: LogType) -> ConsumptionLog {
    ConsumptionLog {
        id: ID_GENERATOR.generate_id(),
        user_id: info.user_id,
        created_at: now_secs(),
        log_type,
        username: info.username.clone(),
        token_id: info.token_id,
        token_name: info.token_name.clone(),
        channel_id: info.channel_id,
        model_name: info.origin_model.clone(),
        upstream_model: info.upstream_model.clone(),
        use_time_ms: info.elapsed_ms(),
        is_stream: info.is_stream,
        group: info.using_group.clone(),
        request_id: info.request_id.clone(),
        ..Default::default()
    }
}

/// Final charge for a completed request: quota delta, log row and counters.
fn settle(state: &AppState, info: &RelayInfo, guard: Option<QuotaGuard>, price: &PriceData, usage: &Usage, extra: Value) -> i64 {
    let quota = price.actual(usage);
    let pre_consumed = guard.as_ref().map_or(0, QuotaGuard::amount);
    if let Some(guard) = guard {
        guard.settle(quota, info.channel_id);
    }

    let mut other = price.describe(pre_consumed);
    if let (Value::Object(map), Value::Object(extra)) = (&mut other, extra) {
        map.extend(extra);
    }
    if info.upstream_model != info.origin_model {
        other["upstream_model"] = json!(info.upstream_model);
    }
    let mut log = base_log(info, LogType::Consume);
    log.content = format!("channel #{} {}", info.channel_id, info.channel_name);
    log.quota = quota;
    log.prompt_tokens = usage.prompt_tokens;
    log.completion_tokens = usage.completion_tokens;
    log.thinking_tokens = usage.reasoning_tokens();
    log.other = other;
    let (created_at, elapsed) = (log.created_at, log.use_time_ms);
    state.record_log(log);
    state.aggregator.record_user_call(created_at, info.user_id, true);
    state.aggregator.record_model_health(created_at, &info.origin_model, true, elapsed);
    info!(
        "[{}] done channel={} model={} prompt={} completion={} quota={} pre={} {}ms",
        info.request_id,
        info.channel_id,
        info.upstream_model,
        usage.prompt_tokens,
        usage.completion_tokens,
        quota,
        pre_consumed,
        elapsed
    );
    quota
}

/// Ends a failed request: refund, error log, then the client-facing rewrite.
fn fail(state: &AppState, info: &RelayInfo, guard: Option<QuotaGuard>, mut err: RelayError) -> RelayError {
    if let Some(guard) = guard {
        guard.refund();
    }
    if err.kind == ErrorKind::Upstream {
        let now = now_secs();
        if state.config.relay.record_error_log && info.channel_id > 0 {
            let mut log = base_log(info, LogType::Error);
            log.content = err.message.clone();
            log.other = json!({
                "status": err.upstream_status,
                "code": err.upstream_code.as_deref().unwrap_or(&err.code),
            });
            state.record_log(log);
        }
        state.aggregator.record_user_call(now, info.user_id, false);
        state.aggregator.record_model_health(now, &info.origin_model, false, info.elapsed_ms());
        let status = err.upstream_status.unwrap_or(err.status.as_u16());
        if let Some(replacement) = state.error_rules.rewrite(status, &err.message) {
            err.message = replacement.to_string();
        }
        if state.config.relay.pass_through_upstream_status {
            err = err.pass_through_status();
        }
    }
    if err.kind == ErrorKind::Internal {
        error!("[{}] {}", info.request_id, err);
    } else {
        warn!("[{}] request failed: {}", info.request_id, err);
    }
    err
}

pub(crate) fn note_channel_failure(state: &AppState, channel_id: i64, err: &RelayError) {
    if err.should_disable_channel() && state.config.relay.auto_disable_channel {
        if let Err(db) = state.channels.auto_disable(state.store.as_ref(), channel_id) {
            error!("failed to auto-disable channel {}: {}", channel_id, db);
        }
    } else if err.should_cooldown() {
        state.channels.cool_down(channel_id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn system_prompt_is_added_or_merged() {
        let mut settings = ChannelSettings { system_prompt: Some("be brief".into()), ..Default::default() };
        let mut chat = ChatRequest { messages: vec![Message::text("user", "hi")], ..Default::default() };
        apply_channel_settings(&mut chat, &settings);
        assert_eq!(chat.messages[0].role, "system");
        assert_eq!(chat.messages[0].content_text(), "be brief");

        let mut chat = ChatRequest {
            messages: vec![Message::text("system", "you are kind"), Message::text("user", "hi")],
            ..Default::default()
        };
        apply_channel_settings(&mut chat, &settings);
        assert_eq!(chat.messages[0].content_text(), "you are kind");
        settings.system_prompt_override = true;
        apply_channel_settings(&mut chat, &settings);
        assert_eq!(chat.messages[0].content_text(), "be brief\nyou are kind");
    }

    #[test]
    fn roles_are_renamed() {
        let settings = ChannelSettings {
            role_mappings: BTreeMap::from([("developer".to_string(), "system".to_string())]),
            ..Default::default()
        };
        let mut chat = ChatRequest { messages: vec![Message::text("developer", "rules")], ..Default::default() };
        apply_channel_settings(&mut chat, &settings);
        assert_eq!(chat.messages[0].role, "system");
    }

    #[test]
    fn native_bodies_get_the_channel_prompt() {
        let mut settings = ChannelSettings { system_prompt: Some("be brief".into()), ..Default::default() };

        let mut claude = json!({"messages": [{"role": "user", "content": "hi"}]});
        apply_native_settings(&mut claude, RelayFormat::Claude, &settings);
        assert_eq!(claude["system"], "be brief");

        let mut responses = json!({"input": "hi", "instructions": "be kind"});
        apply_native_settings(&mut responses, RelayFormat::Responses, &settings);
        assert_eq!(responses["instructions"], "be kind");

        let mut gemini = json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]});
        apply_native_settings(&mut gemini, RelayFormat::Gemini, &settings);
        assert_eq!(gemini["systemInstruction"]["parts"][0]["text"], "be brief");

        settings.system_prompt_override = true;
        apply_native_settings(&mut responses, RelayFormat::Responses, &settings);
        assert_eq!(responses["instructions"], "be brief\nbe kind");

        let mut blocks = json!({"system": [{"type": "text", "text": "cached", "cache_control": {"type": "ephemeral"}}]});
        apply_native_settings(&mut blocks, RelayFormat::Claude, &settings);
        assert_eq!(blocks["system"][0]["text"], "be brief");
        assert_eq!(blocks["system"][1]["cache_control"]["type"], "ephemeral");

        let mut gemini = json!({"system_instruction": {"parts": [{"text": "rules"}]}, "contents": []});
        apply_native_settings(&mut gemini, RelayFormat::Gemini, &settings);
        assert_eq!(gemini["system_instruction"]["parts"][0]["text"], "be brief\nrules");
        assert!(gemini.get("systemInstruction").is_none());
    }

    #[test]
    fn native_roles_are_renamed() {
        let settings = ChannelSettings {
            role_mappings: BTreeMap::from([("model".to_string(), "assistant".to_string())]),
            ..Default::default()
        };
        let mut gemini = json!({"contents": [{"role": "user", "parts": []}, {"role": "model", "parts": []}]});
        apply_native_settings(&mut gemini, RelayFormat::Gemini, &settings);
        assert_eq!(gemini["contents"][0]["role"], "user");
        assert_eq!(gemini["contents"][1]["role"], "assistant");
    }

    #[test]
    fn multipart_model_is_found() {
        let body = b"--XyZ\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.wav\"\r\n\r\nRIFF\r\n\
--XyZ\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-1\r\n--XyZ--\r\n";
        let ct = "multipart/form-data; boundary=XyZ";
        assert_eq!(multipart_field(ct, body, "model").as_deref(), Some("whisper-1"));
        assert_eq!(multipart_field(ct, body, "language"), None);
    }

    #[test]
    fn usage_is_sniffed_from_either_shape() {
        assert_eq!(sniff_usage(br#"{"usage":{"prompt_tokens":8,"total_tokens":8}}"#), Some(Usage::new(8, 0)));
        assert_eq!(sniff_usage(br#"{"usage":{"input_tokens":3,"output_tokens":4}}"#), Some(Usage::new(3, 4)));
        assert_eq!(sniff_usage(b"not json"), None);
    }

    #[test]
    fn requests_are_classified() {
        let chat = RelayRequest::json(
            RelayMode::ChatCompletions,
            RelayFormat::OpenAi,
            Bytes::from_static(br#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}],"max_tokens":10}"#),
        );
        let prepared = prepare(&chat).unwrap();
        assert!(matches!(prepared.payload, Payload::Chat { .. }));
        assert_eq!(prepared.max_tokens, Some(10));
        assert!(prepared.prompt_tokens > 0);

        let empty = RelayRequest::json(
            RelayMode::ChatCompletions,
            RelayFormat::OpenAi,
            Bytes::from_static(br#"{"model":"gpt-4o","messages":[]}"#),
        );
        assert_eq!(prepare(&empty).err().map(|e| e.code), Some("invalid_request".to_string()));

        let embed = RelayRequest::json(
            RelayMode::Embeddings,
            RelayFormat::OpenAi,
            Bytes::from_static(br#"{"model":"text-embedding-3-small","input":["abcd","efgh"]}"#),
        );
        let prepared = prepare(&embed).unwrap();
        assert!(matches!(prepared.payload, Payload::Json(_)));
        assert_eq!(prepared.prompt_text, "abcd\nefgh");

        let mut gemini = RelayRequest::json(
            RelayMode::ChatCompletions,
            RelayFormat::Gemini,
            Bytes::from_static(br#"{"contents":[{"role":"user","parts":[{"text":"hi"}]}]}"#),
        );
        gemini.path_model = Some("gemini-2.5-pro".into());
        gemini.path_stream = Some(true);
        let prepared = prepare(&gemini).unwrap();
        assert_eq!(prepared.model, "gemini-2.5-pro");
        assert!(prepared.is_stream);
    }
}
