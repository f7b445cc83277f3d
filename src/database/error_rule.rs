use serde::{Deserialize, Serialize};

use super::DbResult;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CustomErrorRule {
    pub id: i64,
    /// Lower wins.
    #[serde(default)]
    pub priority: i64,
    pub contains: String,
    /// `0` matches any upstream status.
    #[serde(default)]
    pub status_code: u16,
    pub new_message: String,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn enabled() -> bool {
    true
}

pub trait ErrorRuleStore {
    fn list_error_rules(&self) -> DbResult<Vec<CustomErrorRule>>;
}
