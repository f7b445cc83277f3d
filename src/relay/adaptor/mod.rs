//! Upstream adaptors. One per [`ApiType`], registered at startup and shared
//! by every request; all request-specific state lives in [`RelayInfo`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::Value;

use super::info::RelayInfo;
use crate::bridge::{self, OpenAiStreamDecoder, StreamDecoder};
use crate::controller::error::RelayError;
use crate::dto::claude::ClaudeResponse;
use crate::dto::gemini::GeminiResponse;
use crate::dto::openai::{ChatRequest, ChatResponse};
use crate::dto::responses::ResponsesResponse;
use crate::schema::enum_def::{ApiType, ChannelType, RelayFormat, RelayMode};
use crate::service::http_client::HttpClientPool;

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod openai;

/// Wire dialect spoken with the upstream for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Chat,
    Claude,
    Gemini,
    Responses,
}

impl Dialect {
    /// Client formats that can be forwarded to this dialect untranslated.
    pub fn matches(&self, format: RelayFormat) -> bool {
        matches!(
            (self, format),
            (Dialect::Claude, RelayFormat::Claude)
                | (Dialect::Gemini, RelayFormat::Gemini)
                | (Dialect::Responses, RelayFormat::Responses)
        )
    }
}

pub trait Adaptor: Send + Sync {
    fn api_type(&self) -> ApiType;

    fn channel_name(&self) -> &'static str;

    /// Models a fresh channel of this family is expected to serve.
    fn model_list(&self) -> &'static [&'static str];

    fn supports(&self, mode: RelayMode) -> bool;

    fn default_base_url(&self, channel_type: ChannelType) -> &'static str;

    /// Dialect used upstream for a request that arrived as `format` on `mode`.
    fn dialect(&self, format: RelayFormat, mode: RelayMode) -> Dialect;

    fn request_url(&self, info: &RelayInfo, dialect: Dialect) -> Result<String, RelayError>;

    fn setup_headers(&self, headers: &mut HeaderMap, info: &RelayInfo) -> Result<(), RelayError>;

    /// Hub request into the upstream body. `info.upstream_model` is already resolved.
    fn convert_chat(&self, req: ChatRequest, info: &RelayInfo) -> Result<Value, RelayError>;

    /// Last touch on a body forwarded in the client's own dialect.
    fn finalize_native(&self, body: &mut Value, info: &RelayInfo) -> Result<(), RelayError> {
        if let Value::Object(map) = body {
            map.insert("model".into(), Value::String(info.upstream_model.clone()));
        }
        Ok(())
    }

    /// Whether the upstream must be read as a stream whatever the client asked.
    fn forces_stream(&self, _dialect: Dialect) -> bool {
        false
    }
}

/// Adaptors keyed by [`ApiType`].
pub struct AdaptorRegistry {
    adaptors: HashMap<ApiType, Arc<dyn Adaptor>>,
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self { adaptors: HashMap::new() }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(openai::OpenAiAdaptor));
        registry.register(Arc::new(claude::ClaudeAdaptor));
        registry.register(Arc::new(gemini::GeminiAdaptor));
        registry.register(Arc::new(codex::CodexAdaptor));
        registry
    }

    pub fn register(&mut self, adaptor: Arc<dyn Adaptor>) {
        self.adaptors.insert(adaptor.api_type(), adaptor);
    }

    pub fn get(&self, api_type: ApiType) -> Option<Arc<dyn Adaptor>> {
        self.adaptors.get(&api_type).cloned()
    }

    /// Whether a channel of `channel_type` can serve `mode` at all.
    pub fn serves(&self, channel_type: ChannelType, mode: RelayMode) -> bool {
        self.get(channel_type.api_type()).is_some_and(|a| a.supports(mode))
    }
}

impl Default for AdaptorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Base URL of the bound channel, or the family default.
pub fn base_url(adaptor: &dyn Adaptor, info: &RelayInfo) -> String {
    if info.base_url.is_empty() {
        adaptor.default_base_url(info.channel_type).to_string()
    } else {
        info.base_url.clone()
    }
}

pub(crate) fn header(name: &'static str, value: &str) -> Result<(HeaderName, HeaderValue), RelayError> {
    let value = HeaderValue::from_str(value)
        .map_err(|_| RelayError::internal(format!("invalid value for header {name}")))?;
    Ok((HeaderName::from_static(name), value))
}

pub(crate) fn bearer(headers: &mut HeaderMap, token: &str) -> Result<(), RelayError> {
    let (name, value) = header("authorization", &format!("Bearer {token}"))?;
    headers.insert(name, value);
    Ok(())
}

/// Upstream body decoder for `dialect`.
pub fn stream_decoder(dialect: Dialect, model: &str) -> Box<dyn StreamDecoder> {
    match dialect {
        Dialect::Chat => Box::new(OpenAiStreamDecoder),
        Dialect::Claude => Box::new(bridge::claude::ClaudeStreamDecoder::new()),
        Dialect::Gemini => Box::new(bridge::gemini::GeminiStreamDecoder::new(model)),
        Dialect::Responses => Box::new(bridge::responses::ResponsesStreamDecoder::new(model)),
    }
}

/// Parses a non-stream upstream body into the hub response, usage normalized.
pub fn parse_response(dialect: Dialect, body: &[u8], model: &str) -> Result<ChatResponse, RelayError> {
    let bad_body = |e: serde_json::Error| RelayError::upstream_transport(format!("bad response body: {e}"));
    let mut resp = match dialect {
        Dialect::Chat => serde_json::from_slice::<ChatResponse>(body).map_err(bad_body)?,
        Dialect::Claude => bridge::claude::claude_response_to_chat(
            serde_json::from_slice::<ClaudeResponse>(body).map_err(bad_body)?,
        ),
        Dialect::Gemini => bridge::gemini::gemini_response_to_chat(
            serde_json::from_slice::<GeminiResponse>(body).map_err(bad_body)?,
            model,
        ),
        Dialect::Responses => bridge::responses::responses_response_to_chat(
            serde_json::from_slice::<ResponsesResponse>(body).map_err(bad_body)?,
        ),
    };
    if let Some(usage) = resp.usage.as_mut() {
        usage.normalize();
    }
    Ok(resp)
}

/// Pulls `(message, code)` out of the error bodies the known dialects return.
pub fn upstream_error_detail(body: &[u8]) -> (String, Option<String>) {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        let text = String::from_utf8_lossy(body).trim().to_string();
        return (if text.is_empty() { "empty upstream error body".to_string() } else { text }, None);
    };
    let error = value.get("error").unwrap_or(&value);
    let message = match error {
        Value::String(s) => s.clone(),
        _ => error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
    };
    let code = error
        .get("code")
        .and_then(|c| c.as_str().map(str::to_string).or_else(|| c.as_i64().map(|n| n.to_string())))
        .or_else(|| error.get("type").and_then(Value::as_str).map(str::to_string))
        .or_else(|| error.get("status").and_then(Value::as_str).map(str::to_string));
    (message, code)
}

/// A prepared upstream call.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Option<Duration>,
}

/// Sends through the shared client pool. Non-success statuses become upstream errors.
pub async fn do_request(
    http: &HttpClientPool,
    info: &RelayInfo,
    request: UpstreamRequest,
) -> Result<reqwest::Response, RelayError> {
    let client = http.client_for(info.channel_type, info.settings.proxy.as_deref())?;
    let mut builder = client.post(&request.url).headers(request.headers).body(request.body);
    if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
    }
    let response = builder.send().await.map_err(|e| {
        if e.is_timeout() {
            RelayError::upstream_timeout()
        } else {
            RelayError::upstream_transport(e.to_string())
        }
    })?;
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let (_, _, body) = crate::service::http_client::read_body(response).await?;
    let (message, code) = upstream_error_detail(&body);
    Err(RelayError::upstream(status, message, code))
}

pub fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}
