//! DashScope asynchronous image and video synthesis.

use async_trait::async_trait;
use cyder_tools::log::warn;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::Value;

use super::adaptor::{map_status, Submitted, TaskAdaptor, TaskContext};
use crate::controller::error::RelayError;
use crate::dto::task::{TaskInfo, TaskUsage};
use crate::relay::adaptor::{bearer, header, json_headers};
use crate::schema::enum_def::{ApiType, TaskStatus};

const DEFAULT_BASE: &str = "https://dashscope.aliyuncs.com";

pub struct AliTaskAdaptor;

fn is_video(model: &str) -> bool {
    let model = model.to_ascii_lowercase();
    model.contains("2v") || model.contains("video")
}

fn submit_path(model: &str) -> &'static str {
    if is_video(model) {
        "/api/v1/services/aigc/video-generation/video-synthesis"
    } else {
        "/api/v1/services/aigc/text2image/image-synthesis"
    }
}

fn builtin_status(raw: &str) -> TaskStatus {
    match raw.to_ascii_uppercase().as_str() {
        "PENDING" => TaskStatus::Submitted,
        "RUNNING" => TaskStatus::InProgress,
        "SUCCEEDED" => TaskStatus::Success,
        "FAILED" | "CANCELED" | "UNKNOWN" => TaskStatus::Failure,
        _ => TaskStatus::Submitted,
    }
}

fn headers(ctx: &TaskContext<'_>) -> Result<HeaderMap, RelayError> {
    let mut headers = json_headers();
    bearer(&mut headers, &ctx.channel.key)?;
    Ok(headers)
}

/// Images requested, or one video.
fn requested_units(model: &str, body: &Value) -> f64 {
    if is_video(model) {
        return 1.0;
    }
    body.pointer("/parameters/n").and_then(Value::as_f64).unwrap_or(1.0).max(1.0)
}

fn usage_units(usage: &Value) -> Option<f64> {
    ["video_count", "image_count"]
        .iter()
        .find_map(|key| usage.get(*key).and_then(Value::as_f64))
}

fn result_url(output: &Value) -> Option<String> {
    output
        .get("video_url")
        .and_then(Value::as_str)
        .or_else(|| output.pointer("/results/0/url").and_then(Value::as_str))
        .map(str::to_string)
}

pub(crate) fn parse_task(value: Value, ctx: &TaskContext<'_>) -> Option<TaskInfo> {
    let output = value.get("output")?;
    let task_id = output.get("task_id").and_then(Value::as_str)?.to_string();
    let raw_status = output.get("task_status").and_then(Value::as_str).unwrap_or_default();
    let status = map_status(raw_status, ctx.channel.settings.task_status_mapping.as_ref(), builtin_status);
    let error = output
        .get("message")
        .and_then(Value::as_str)
        .filter(|_| status == TaskStatus::Failure)
        .map(str::to_string);
    let progress = match status {
        TaskStatus::Success => "100%",
        TaskStatus::InProgress => "50%",
        _ => "",
    };
    Some(TaskInfo {
        task_id,
        status,
        progress: progress.to_string(),
        error,
        result: result_url(output),
        usage: value.get("usage").and_then(usage_units).map(|units| TaskUsage { units }),
        raw: value,
    })
}

#[async_trait]
impl TaskAdaptor for AliTaskAdaptor {
    fn api_type(&self) -> ApiType {
        ApiType::AliTask
    }

    async fn estimate(&self, ctx: &TaskContext<'_>, body: &Value) -> Result<Option<f64>, RelayError> {
        Ok(Some(requested_units(ctx.upstream_model, body)))
    }

    async fn submit(&self, ctx: &TaskContext<'_>, body: &Value) -> Result<Submitted, RelayError> {
        let mut body = body.clone();
        if let Value::Object(map) = &mut body {
            map.insert("model".into(), Value::String(ctx.upstream_model.to_string()));
        }
        let mut headers = headers(ctx)?;
        let (name, value) = header("x-dashscope-async", "enable")?;
        headers.insert(name, value);
        let url = format!("{}{}", ctx.base_url(DEFAULT_BASE), submit_path(ctx.upstream_model));
        let raw = ctx.send(Method::POST, &url, headers, Some(&body)).await?;
        let upstream_task_id = raw
            .pointer("/output/task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::upstream_transport("submit response carries no task id"))?
            .to_string();
        Ok(Submitted { upstream_task_id, raw })
    }

    async fn fetch(&self, ctx: &TaskContext<'_>, upstream_ids: &[String]) -> Result<Vec<TaskInfo>, RelayError> {
        let base = ctx.base_url(DEFAULT_BASE);
        let mut infos = Vec::with_capacity(upstream_ids.len());
        let mut last_err = None;
        for id in upstream_ids {
            let url = format!("{base}/api/v1/tasks/{id}");
            match ctx.send(Method::GET, &url, headers(ctx)?, None).await {
                Ok(value) => infos.extend(parse_task(value, ctx)),
                Err(err) => {
                    warn!("dashscope task {} query failed: {}", id, err);
                    last_err = Some(err);
                }
            }
        }
        // One bad id must not hold back the rest of the batch.
        match last_err {
            Some(err) if infos.is_empty() => Err(err),
            _ => Ok(infos),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::database::channel::{Channel, TaskStatusMapping};
    use crate::service::http_client::HttpClientPool;

    fn ctx<'a>(http: &'a HttpClientPool, channel: &'a Channel) -> TaskContext<'a> {
        TaskContext { http, channel, upstream_model: "wanx2.1-t2v-plus", timeout: Duration::from_secs(1) }
    }

    #[test]
    fn succeeded_video_reports_units_and_url() {
        let http = HttpClientPool::default();
        let channel = Channel::default();
        let value = json!({
            "output": {"task_id": "t-1", "task_status": "SUCCEEDED", "video_url": "https://cdn/v.mp4"},
            "usage": {"video_count": 1, "video_duration": 5}
        });
        let info = parse_task(value, &ctx(&http, &channel)).unwrap();
        assert_eq!(info.status, TaskStatus::Success);
        assert_eq!(info.result.as_deref(), Some("https://cdn/v.mp4"));
        assert_eq!(info.usage, Some(TaskUsage { units: 1.0 }));
        assert_eq!(info.progress, "100%");
    }

    #[test]
    fn failures_keep_the_message_and_custom_statuses_apply() {
        let http = HttpClientPool::default();
        let mut channel = Channel::default();
        let value = json!({"output": {"task_id": "t-2", "task_status": "FAILED", "message": "nsfw"}});
        let info = parse_task(value, &ctx(&http, &channel)).unwrap();
        assert_eq!(info.status, TaskStatus::Failure);
        assert_eq!(info.error.as_deref(), Some("nsfw"));

        channel.settings.task_status_mapping =
            Some(TaskStatusMapping { success: vec!["archived".into()], ..Default::default() });
        let value = json!({"output": {"task_id": "t-3", "task_status": "ARCHIVED"}});
        assert_eq!(parse_task(value, &ctx(&http, &channel)).unwrap().status, TaskStatus::Success);
    }

    #[test]
    fn units_follow_the_request() {
        assert_eq!(requested_units("wanx2.1-t2i-turbo", &json!({"parameters": {"n": 4}})), 4.0);
        assert_eq!(requested_units("wanx2.1-t2v-plus", &json!({"parameters": {"n": 4}})), 1.0);
        assert!(submit_path("wanx2.1-t2v-plus").ends_with("video-synthesis"));
    }
}
