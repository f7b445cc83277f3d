use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{subscription::SubscriptionPlan, DbError};
use crate::schema::enum_def::RedemptionStatus;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Redemption {
    pub id: i64,
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub quota: i64,
    #[serde(default)]
    pub plan: Option<SubscriptionPlan>,
    #[serde(default)]
    pub status: RedemptionStatus,
    #[serde(default)]
    pub created_at: i64,
    /// `0` never expires.
    #[serde(default)]
    pub expired_at: i64,
    #[serde(default)]
    pub redeemed_at: i64,
    #[serde(default)]
    pub used_user_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedeemOutcome {
    pub quota: i64,
    pub subscription_id: Option<i64>,
}

#[derive(Debug, Error)]
pub enum RedeemError {
    #[error("redemption.not_found")]
    NotFound,
    #[error("redemption.used")]
    Used,
    #[error("redemption.disabled")]
    Disabled,
    #[error("redemption.expired")]
    Expired,
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<diesel::result::Error> for RedeemError {
    fn from(err: diesel::result::Error) -> Self {
        RedeemError::Db(DbError::Query(err))
    }
}

pub trait RedemptionStore {
    /// Flips the code to `Used` and applies its grant in one transaction.
    fn redeem(&self, key: &str, user_id: i64, now: i64) -> Result<RedeemOutcome, RedeemError>;
    fn get_redemption(&self, key: &str) -> Result<Option<Redemption>, DbError>;
}
