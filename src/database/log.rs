use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DbResult;
use crate::schema::enum_def::LogType;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConsumptionLog {
    pub id: i64,
    pub user_id: i64,
    pub created_at: i64,
    pub log_type: LogType,
    pub content: String,
    pub username: String,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: i64,
    pub model_name: String,
    pub upstream_model: String,
    pub quota: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub thinking_tokens: i64,
    pub use_time_ms: i64,
    pub is_stream: bool,
    pub group: String,
    pub request_id: String,
    /// Price decomposition and other free-form details.
    pub other: Value,
}

/// Validates the `logs_YYYY_MM_DD` shape before it is spliced into SQL.
pub fn is_valid_log_table(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("logs_") else {
        return false;
    };
    let parts: Vec<&str> = rest.split('_').collect();
    parts.len() == 3
        && parts[0].len() == 4
        && parts[1].len() == 2
        && parts[2].len() == 2
        && parts.iter().all(|p| p.bytes().all(|b| b.is_ascii_digit()))
}

pub trait LogStore {
    /// Idempotent `CREATE TABLE IF NOT EXISTS` for one daily shard.
    fn ensure_log_table(&self, table: &str) -> DbResult<()>;
    /// All-or-nothing batch insert.
    fn insert_logs(&self, table: &str, logs: &[ConsumptionLog]) -> DbResult<()>;
    fn insert_log(&self, table: &str, log: &ConsumptionLog) -> DbResult<()>;
    fn list_logs(&self, table: &str, user_id: Option<i64>) -> DbResult<Vec<ConsumptionLog>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_table_names_are_validated() {
        assert!(is_valid_log_table("logs_2025_01_31"));
        assert!(!is_valid_log_table("logs"));
        assert!(!is_valid_log_table("logs_2025_1_31"));
        assert!(!is_valid_log_table("logs_2025_01_31; DROP TABLE users"));
        assert!(!is_valid_log_table("users_2025_01_31"));
    }
}
