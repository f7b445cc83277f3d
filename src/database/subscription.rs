use serde::{Deserialize, Serialize};

use super::DbResult;
use crate::schema::enum_def::{QuotaType, SubscriptionStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub plan_id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub status: SubscriptionStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionItem {
    pub id: i64,
    pub subscription_id: i64,
    pub user_id: i64,
    pub model_name: String,
    pub quota_type: QuotaType,
    pub amount_total: i64,
    pub amount_used: i64,
}

/// Template granted by a redemption code.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionPlan {
    pub plan_id: String,
    pub duration_secs: i64,
    pub items: Vec<PlanItem>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PlanItem {
    pub model_name: String,
    #[serde(default)]
    pub quota_type: QuotaType,
    pub amount: i64,
}

pub trait SubscriptionStore {
    /// Locks the first active item for `(user, model, quota_type)` with room for
    /// `amount` and charges it. Returns the charged item id.
    fn try_consume_subscription(
        &self,
        user_id: i64,
        model_name: &str,
        quota_type: QuotaType,
        amount: i64,
        now: i64,
    ) -> DbResult<Option<i64>>;

    /// Unbounded `amount_used += delta` on one item (settlement or refund).
    fn adjust_subscription_item(&self, item_id: i64, delta: i64) -> DbResult<()>;

    fn create_subscription(&self, user_id: i64, plan: &SubscriptionPlan, now: i64) -> DbResult<i64>;

    fn list_subscription_items(&self, user_id: i64) -> DbResult<Vec<SubscriptionItem>>;
}
