//! Another relay speaking this same task protocol, including precharge estimates.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::{json, Value};

use super::adaptor::{map_status, Submitted, TaskAdaptor, TaskContext};
use crate::controller::error::RelayError;
use crate::dto::task::{TaskInfo, TaskUsage, TaskView};
use crate::relay::adaptor::{bearer, json_headers};
use crate::schema::enum_def::{ApiType, TaskStatus};

pub struct RelayTaskAdaptor;

fn headers(ctx: &TaskContext<'_>) -> Result<HeaderMap, RelayError> {
    let mut headers = json_headers();
    bearer(&mut headers, &ctx.channel.key)?;
    Ok(headers)
}

/// Unwraps `{code, message, data}`; a non-zero code is an upstream failure.
fn envelope_data(value: Value) -> Result<Value, RelayError> {
    match value.get("code").and_then(Value::as_i64) {
        Some(0) | None => Ok(value.get("data").cloned().unwrap_or(Value::Null)),
        Some(code) => {
            let message = value.get("message").and_then(Value::as_str).unwrap_or("task upstream error");
            Err(RelayError::upstream(500, message, Some(code.to_string())))
        }
    }
}

fn builtin_status(raw: &str) -> TaskStatus {
    raw.to_ascii_uppercase().parse().unwrap_or(TaskStatus::Submitted)
}

fn view_to_info(view: TaskView, raw: Value, ctx: &TaskContext<'_>) -> TaskInfo {
    let status = map_status(&view.status.to_string(), ctx.channel.settings.task_status_mapping.as_ref(), builtin_status);
    TaskInfo {
        task_id: view.task_id,
        status,
        progress: view.progress,
        error: view.fail_reason,
        result: view.result_url,
        usage: view.units.map(|units| TaskUsage { units }),
        raw,
    }
}

#[async_trait]
impl TaskAdaptor for RelayTaskAdaptor {
    fn api_type(&self) -> ApiType {
        ApiType::RelayTask
    }

    async fn estimate(&self, ctx: &TaskContext<'_>, body: &Value) -> Result<Option<f64>, RelayError> {
        let url = format!("{}/{}/submit?precharge=true", ctx.base_url(""), ctx.upstream_model);
        let data = envelope_data(ctx.send(Method::POST, &url, headers(ctx)?, Some(body)).await?)?;
        Ok(data.get("estimated_units").and_then(Value::as_f64))
    }

    async fn submit(&self, ctx: &TaskContext<'_>, body: &Value) -> Result<Submitted, RelayError> {
        let url = format!("{}/{}/submit", ctx.base_url(""), ctx.upstream_model);
        let raw = ctx.send(Method::POST, &url, headers(ctx)?, Some(body)).await?;
        let data = envelope_data(raw.clone())?;
        let upstream_task_id = data
            .get("task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::upstream_transport("submit response carries no task id"))?
            .to_string();
        Ok(Submitted { upstream_task_id, raw })
    }

    async fn fetch(&self, ctx: &TaskContext<'_>, upstream_ids: &[String]) -> Result<Vec<TaskInfo>, RelayError> {
        let url = format!("{}/{}/task/list-by-condition", ctx.base_url(""), ctx.upstream_model);
        let body = json!({ "task_ids": upstream_ids });
        let data = envelope_data(ctx.send(Method::POST, &url, headers(ctx)?, Some(&body)).await?)?;
        let Value::Array(items) = data else {
            return Err(RelayError::upstream_transport("task list is not an array"));
        };
        Ok(items
            .into_iter()
            .filter_map(|item| {
                let view: TaskView = serde_json::from_value(item.clone()).ok()?;
                Some(view_to_info(view, item, ctx))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::database::channel::Channel;
    use crate::service::http_client::HttpClientPool;

    #[test]
    fn envelopes_and_views() {
        assert_eq!(envelope_data(json!({"code": 0, "data": {"a": 1}})).unwrap(), json!({"a": 1}));
        let err = envelope_data(json!({"code": 7, "message": "nope"})).unwrap_err();
        assert_eq!(err.upstream_code.as_deref(), Some("7"));

        let http = HttpClientPool::default();
        let channel = Channel::default();
        let ctx = TaskContext { http: &http, channel: &channel, upstream_model: "m", timeout: Duration::from_secs(1) };
        let view = TaskView {
            task_id: "t".into(),
            status: TaskStatus::Success,
            units: Some(2.0),
            ..Default::default()
        };
        let info = view_to_info(view, Value::Null, &ctx);
        assert_eq!(info.status, TaskStatus::Success);
        assert_eq!(info.usage, Some(TaskUsage { units: 2.0 }));
    }
}
