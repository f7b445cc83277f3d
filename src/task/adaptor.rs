//! Task adaptors talk to asynchronous generation APIs: estimate, submit, and
//! batched status queries normalized into [`TaskInfo`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;

use crate::controller::error::RelayError;
use crate::database::channel::{Channel, TaskStatusMapping};
use crate::dto::task::TaskInfo;
use crate::relay::adaptor::upstream_error_detail;
use crate::schema::enum_def::{ApiType, TaskStatus};
use crate::service::http_client::{read_body, HttpClientPool};

use super::{ali::AliTaskAdaptor, relay_task::RelayTaskAdaptor};

/// One upstream call of a task adaptor.
pub struct TaskContext<'a> {
    pub http: &'a HttpClientPool,
    pub channel: &'a Channel,
    /// Model after the channel mapping.
    pub upstream_model: &'a str,
    pub timeout: Duration,
}

impl TaskContext<'_> {
    pub fn base_url(&self, fallback: &str) -> String {
        self.channel.base_url_or(fallback)
    }

    /// Sends a request and parses a JSON answer. Non-success statuses become upstream errors.
    pub async fn send(&self, method: Method, url: &str, headers: HeaderMap, body: Option<&Value>) -> Result<Value, RelayError> {
        let client = self
            .http
            .client_for(self.channel.channel_type, self.channel.settings.proxy.as_deref())?;
        let mut builder = client.request(method, url).headers(headers).timeout(self.timeout);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::upstream_timeout()
            } else {
                RelayError::upstream_transport(e.to_string())
            }
        })?;
        let (status, _, bytes) = read_body(response).await?;
        if !status.is_success() {
            let (message, code) = upstream_error_detail(&bytes);
            return Err(RelayError::upstream(status.as_u16(), message, code));
        }
        serde_json::from_slice(&bytes).map_err(|e| RelayError::upstream_transport(format!("bad task response: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Submitted {
    pub upstream_task_id: String,
    pub raw: Value,
}

#[async_trait]
pub trait TaskAdaptor: Send + Sync {
    fn api_type(&self) -> ApiType;

    /// Billable units the submission is expected to cost. `None` when unknown.
    async fn estimate(&self, ctx: &TaskContext<'_>, body: &Value) -> Result<Option<f64>, RelayError>;

    async fn submit(&self, ctx: &TaskContext<'_>, body: &Value) -> Result<Submitted, RelayError>;

    /// Current state of each upstream id. Ids the upstream does not know are left out.
    async fn fetch(&self, ctx: &TaskContext<'_>, upstream_ids: &[String]) -> Result<Vec<TaskInfo>, RelayError>;
}

pub struct TaskAdaptorRegistry {
    adaptors: HashMap<ApiType, Arc<dyn TaskAdaptor>>,
}

impl TaskAdaptorRegistry {
    pub fn new() -> Self {
        Self { adaptors: HashMap::new() }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AliTaskAdaptor));
        registry.register(Arc::new(RelayTaskAdaptor));
        registry
    }

    pub fn register(&mut self, adaptor: Arc<dyn TaskAdaptor>) {
        self.adaptors.insert(adaptor.api_type(), adaptor);
    }

    pub fn get(&self, api_type: ApiType) -> Option<Arc<dyn TaskAdaptor>> {
        self.adaptors.get(&api_type).cloned()
    }
}

impl Default for TaskAdaptorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

/// Normalizes an upstream status string. A channel mapping, matched
/// case-insensitively, wins over the adaptor's built-in table.
pub fn map_status(raw: &str, mapping: Option<&TaskStatusMapping>, builtin: fn(&str) -> TaskStatus) -> TaskStatus {
    if let Some(mapping) = mapping {
        let hit = |list: &[String]| list.iter().any(|s| s.eq_ignore_ascii_case(raw));
        if hit(&mapping.success) {
            return TaskStatus::Success;
        }
        if hit(&mapping.failure) {
            return TaskStatus::Failure;
        }
        if hit(&mapping.in_progress) {
            return TaskStatus::InProgress;
        }
    }
    builtin(raw)
}
