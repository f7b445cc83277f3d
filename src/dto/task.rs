use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

use crate::schema::enum_def::TaskStatus;

/// Upstream state of one task, normalized by the task adaptor.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskInfo {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub progress: String,
    pub error: Option<String>,
    pub result: Option<String>,
    pub usage: Option<TaskUsage>,
    /// Raw upstream payload for this task.
    #[serde(default)]
    pub raw: Value,
}

/// Billable units reported by the upstream (images, seconds, videos).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskUsage {
    #[serde(default)]
    pub units: f64,
}

/// Client view of a task row.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskView {
    pub task_id: String,
    pub model: String,
    pub status: TaskStatus,
    pub progress: String,
    pub submit_time: i64,
    pub finish_time: Option<i64>,
    pub fail_reason: Option<String>,
    pub result_url: Option<String>,
    pub quota: i64,
    /// Units billed, once known.
    pub units: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskEnvelope<T: Serialize> {
    pub code: i64,
    pub message: String,
    pub data: T,
}

impl<T: Serialize> TaskEnvelope<T> {
    pub fn ok(data: T) -> Self {
        Self { code: 0, message: "success".to_string(), data }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskListQuery {
    #[serde(default)]
    pub task_ids: Vec<String>,
}
