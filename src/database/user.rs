use serde::{Deserialize, Serialize};

use super::DbResult;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(default = "default_group")]
    pub group: String,
    /// Signed balance. Bounded decrements keep it non-negative; settlement may not.
    #[serde(default)]
    pub quota: i64,
    #[serde(default)]
    pub used_quota: i64,
    #[serde(default)]
    pub request_count: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

pub(crate) fn default_group() -> String {
    "default".to_string()
}

fn default_enabled() -> bool {
    true
}

/// The quota ledger. Every mutation is a single atomic statement.
pub trait UserStore {
    fn get_user(&self, user_id: i64) -> DbResult<Option<User>>;

    /// `quota -= amount` only when `quota >= amount`. Returns whether it applied.
    fn decrease_user_quota_bounded(&self, user_id: i64, amount: i64) -> DbResult<bool>;

    /// Unconditional `quota += delta`.
    fn change_user_quota(&self, user_id: i64, delta: i64) -> DbResult<()>;

    fn add_user_usage(&self, user_id: i64, used_quota: i64, request_count: i64) -> DbResult<()>;
}
