use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DbResult;
use crate::schema::enum_def::{ChannelType, TaskStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    /// Public id returned to the client.
    pub task_id: String,
    pub platform: ChannelType,
    pub user_id: i64,
    pub token_id: i64,
    pub group: String,
    pub channel_id: i64,
    /// Model (action) name as requested by the client.
    pub model: String,
    pub upstream_model: String,
    pub upstream_task_id: String,
    pub status: TaskStatus,
    pub progress: String,
    /// Precharged amount while running; the settled amount once terminal.
    pub quota: i64,
    pub submit_time: i64,
    pub start_time: i64,
    pub finish_time: i64,
    pub fail_reason: String,
    pub result_url: String,
    /// Latest upstream snapshot.
    pub data: Value,
    /// Pricing inputs captured at submit time.
    pub properties: TaskProperties,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskProperties {
    pub model_price: f64,
    pub group_ratio: f64,
    pub estimated_units: f64,
    /// Units actually billed once the task succeeded.
    pub billed_units: Option<f64>,
    pub free: bool,
    pub token_name: String,
    pub username: String,
    pub subscription_item_id: Option<i64>,
}

pub trait TaskStore {
    fn insert_task(&self, task: &Task) -> DbResult<()>;
    fn get_task(&self, user_id: i64, task_id: &str) -> DbResult<Option<Task>>;
    fn list_tasks(&self, user_id: i64, task_ids: &[String]) -> DbResult<Vec<Task>>;
    fn list_unfinished_tasks(&self) -> DbResult<Vec<Task>>;

    /// Writes every mutable column only when the row is still in `expected`.
    /// The winner of this compare-and-set owns settlement for the transition.
    fn compare_and_update_task(&self, task: &Task, expected: TaskStatus) -> DbResult<bool>;
}
