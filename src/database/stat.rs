use serde::{Deserialize, Serialize};

use super::DbResult;

/// Which hours a leaderboard query covers.
#[derive(Debug, Clone, PartialEq)]
pub enum HourFilter {
    /// `[start, end)` in unix seconds, both hour aligned.
    Range { start: i64, end: i64 },
    List(Vec<i64>),
}

impl HourFilter {
    pub(crate) fn hour_list_sql(hours: &[i64]) -> String {
        hours.iter().map(|h| h.to_string()).collect::<Vec<_>>().join(",")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserCallRank {
    pub user_id: i64,
    pub total_calls: i64,
    pub success_calls: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelHealthRank {
    pub model_name: String,
    pub total_calls: i64,
    pub success_calls: i64,
    pub avg_latency_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelHealthHourly {
    pub hour_start_ts: i64,
    pub model_name: String,
    pub total_calls: i64,
    pub success_calls: i64,
}

pub trait StatStore {
    fn record_user_call(&self, hour_start_ts: i64, user_id: i64, success: bool) -> DbResult<()>;
    fn record_model_health(
        &self,
        slice_start_ts: i64,
        model_name: &str,
        success: bool,
        latency_ms: i64,
    ) -> DbResult<()>;
    fn query_user_calls(&self, filter: &HourFilter, limit: usize) -> DbResult<Vec<UserCallRank>>;
    fn query_model_health(&self, filter: &HourFilter, limit: usize) -> DbResult<Vec<ModelHealthRank>>;
    fn query_model_health_hourly(
        &self,
        filter: &HourFilter,
        model_name: Option<&str>,
    ) -> DbResult<Vec<ModelHealthHourly>>;
}
