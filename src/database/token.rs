use serde::{Deserialize, Serialize};

use super::DbResult;
use crate::schema::enum_def::TokenStatus;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: TokenStatus,
    #[serde(default)]
    pub remain_quota: i64,
    #[serde(default)]
    pub unlimited_quota: bool,
    #[serde(default)]
    pub used_quota: i64,
    /// Unix seconds, `-1` never expires.
    #[serde(default = "never")]
    pub expired_time: i64,
    /// Empty means every model is allowed.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Overrides the owner's group when set.
    #[serde(default)]
    pub group: Option<String>,
}

fn never() -> i64 {
    -1
}

impl Token {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expired_time != -1 && self.expired_time < now
    }

    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}

pub trait TokenStore {
    fn get_token_by_key(&self, key: &str) -> DbResult<Option<Token>>;
    fn get_token(&self, token_id: i64) -> DbResult<Option<Token>>;

    /// Moves `amount` from remain to used only when `remain_quota >= amount`.
    fn consume_token_quota_bounded(&self, token_id: i64, amount: i64) -> DbResult<bool>;

    /// Unconditional move of `amount` (negative refunds) from remain to used.
    fn consume_token_quota(&self, token_id: i64, amount: i64) -> DbResult<()>;
}
