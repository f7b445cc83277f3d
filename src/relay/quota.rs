use serde_json::{json, Value};

use crate::config::{QuotaConfig, RatioConfig};
use crate::controller::error::RelayError;
use crate::database::SharedStore;
use crate::dto::openai::Usage;
use crate::schema::enum_def::QuotaType;
use crate::utils::i18n::Msg;
use crate::utils::now_secs;
use cyder_tools::log::{error, warn};

/// Ratios resolved for one `(model, user group, using group)` at request start.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceData {
    pub model_ratio: f64,
    /// Multiplier on top of `model_ratio` for completion tokens.
    pub completion_ratio: f64,
    pub cache_ratio: f64,
    pub group_ratio: f64,
    pub group_special_ratio: f64,
    /// Per-call price in USD; when set, tokens do not matter.
    pub model_price: Option<f64>,
    pub quota_per_unit: f64,
}

pub fn price_data(ratio: &RatioConfig, quota: &QuotaConfig, model: &str, user_group: &str, using_group: &str) -> PriceData {
    let group_special_ratio = ratio
        .group_special_ratio
        .get(user_group)
        .and_then(|targets| targets.get(using_group))
        .copied()
        .unwrap_or(1.0);
    PriceData {
        model_ratio: ratio.model_ratio.get(model).copied().unwrap_or(ratio.default_model_ratio),
        completion_ratio: ratio.completion_ratio.get(model).copied().unwrap_or(ratio.default_completion_ratio),
        cache_ratio: ratio.cache_ratio.get(model).copied().unwrap_or(ratio.default_cache_ratio),
        group_ratio: ratio.group_ratio.get(using_group).copied().unwrap_or(1.0),
        group_special_ratio,
        model_price: ratio.model_price.get(model).copied(),
        quota_per_unit: quota.quota_per_unit,
    }
}

impl PriceData {
    pub fn is_per_call(&self) -> bool {
        self.model_price.is_some()
    }

    /// Upfront charge from the prompt estimate and the requested output budget.
    pub fn estimate(&self, prompt_tokens: i64, max_tokens: Option<u64>) -> i64 {
        if let Some(price) = self.model_price {
            return (price * self.quota_per_unit * self.group_ratio).round() as i64;
        }
        let completion = max_tokens.unwrap_or(0) as f64;
        let quota = prompt_tokens as f64 * self.model_ratio * self.group_ratio
            + completion * (self.model_ratio * self.completion_ratio) * self.group_ratio;
        quota.round() as i64
    }

    /// Final charge for observed usage.
    pub fn actual(&self, usage: &Usage) -> i64 {
        let total_ratio = self.group_ratio * self.group_special_ratio;
        if let Some(price) = self.model_price {
            return (price * self.quota_per_unit * total_ratio).round() as i64;
        }
        let cached = usage.cached_tokens().clamp(0, usage.prompt_tokens.max(0));
        let tokens = (usage.prompt_tokens - cached) as f64
            + cached as f64 * self.cache_ratio
            + usage.completion_tokens as f64 * self.completion_ratio;
        let ratio = self.model_ratio * total_ratio;
        let quota = (tokens * ratio).round() as i64;
        if ratio > 0.0 && quota < 1 { 1 } else { quota }
    }

    /// Price per unit of a task model.
    pub fn task_charge(&self, units: f64) -> i64 {
        let price = self.model_price.unwrap_or(0.0);
        (price * units * self.quota_per_unit * self.group_ratio * self.group_special_ratio).round() as i64
    }

    /// Decomposition stored in the log's `other` column.
    pub fn describe(&self, pre_consumed: i64) -> Value {
        json!({
            "model_ratio": self.model_ratio,
            "completion_ratio": self.completion_ratio,
            "cache_ratio": self.cache_ratio,
            "group_ratio": self.group_ratio,
            "group_special_ratio": self.group_special_ratio,
            "model_price": self.model_price,
            "pre_consumed": pre_consumed,
        })
    }
}

/// Where the pre-consumed amount was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuotaSource {
    #[default]
    Wallet,
    Subscription { item_id: i64, quota_type: QuotaType },
}

/// Identity of a charge, enough to settle or refund it later.
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    pub user_id: i64,
    pub token_id: i64,
    pub token_unlimited: bool,
    pub source: QuotaSource,
    /// Amount taken upfront. Zero on the trusted path.
    pub amount: i64,
}

impl Charge {
    /// Applies `actual - amount` and bumps the used counters. Returns the delta.
    pub fn settle(&self, store: &SharedStore, actual: i64, channel_id: i64) -> i64 {
        let delta = match self.source {
            QuotaSource::Wallet => actual - self.amount,
            QuotaSource::Subscription { quota_type: QuotaType::ByCount, .. } => 0,
            QuotaSource::Subscription { .. } => actual - self.amount,
        };
        if delta != 0 {
            if let Err(err) = self.apply(store, delta) {
                error!("quota settlement for user {} failed (delta {}): {}", self.user_id, delta, err);
            }
        }
        if let Err(err) = store.add_user_usage(self.user_id, actual, 1) {
            error!("failed to record usage for user {}: {}", self.user_id, err);
        }
        if channel_id > 0 && actual != 0 {
            if let Err(err) = store.add_channel_used_quota(channel_id, actual) {
                error!("failed to record used quota for channel {}: {}", channel_id, err);
            }
        }
        delta
    }

    /// Credits the upfront amount back.
    pub fn refund(&self, store: &SharedStore) {
        if self.amount == 0 {
            return;
        }
        if let Err(err) = self.apply(store, -self.amount) {
            error!("refund of {} to user {} failed: {}", self.amount, self.user_id, err);
        }
    }

    /// Moves `delta` more quota out of the source (negative gives back).
    fn apply(&self, store: &SharedStore, delta: i64) -> Result<(), crate::database::DbError> {
        match self.source {
            QuotaSource::Wallet => {
                store.change_user_quota(self.user_id, -delta)?;
                if !self.token_unlimited {
                    store.consume_token_quota(self.token_id, delta)?;
                }
                Ok(())
            }
            QuotaSource::Subscription { item_id, .. } => store.adjust_subscription_item(item_id, delta),
        }
    }
}

pub struct PreConsumeRequest<'a> {
    pub user_id: i64,
    pub token_id: i64,
    pub token_unlimited: bool,
    pub model: &'a str,
    pub amount: i64,
    pub per_call: bool,
}

/// Takes the upfront charge: an active subscription item first, then the wallet.
pub fn pre_consume(store: &SharedStore, quota: &QuotaConfig, req: PreConsumeRequest<'_>) -> Result<Charge, RelayError> {
    let mut charge = Charge {
        user_id: req.user_id,
        token_id: req.token_id,
        token_unlimited: req.token_unlimited,
        source: QuotaSource::Wallet,
        amount: 0,
    };

    let (quota_type, sub_amount) = if req.per_call {
        (QuotaType::ByCount, 1)
    } else {
        (QuotaType::ByQuota, req.amount.max(0))
    };
    if let Some(item_id) = store.try_consume_subscription(req.user_id, req.model, quota_type, sub_amount, now_secs())? {
        charge.source = QuotaSource::Subscription { item_id, quota_type };
        charge.amount = sub_amount;
        return Ok(charge);
    }

    let user = store
        .get_user(req.user_id)?
        .ok_or_else(|| RelayError::insufficient_quota(Msg::UserQuotaInsufficient))?;
    if user.quota <= 0 || user.quota < req.amount {
        return Err(RelayError::insufficient_quota(Msg::UserQuotaInsufficient));
    }
    if req.amount <= 0 {
        return Ok(charge);
    }

    let threshold = req.amount.saturating_mul(quota.trust_multiplier.max(0));
    let token_trusted = req.token_unlimited
        || store
            .get_token(req.token_id)?
            .is_some_and(|token| token.remain_quota >= threshold);
    if quota.trust_multiplier > 0 && user.quota >= threshold && token_trusted {
        return Ok(charge);
    }

    if !store.decrease_user_quota_bounded(req.user_id, req.amount)? {
        return Err(RelayError::insufficient_quota(Msg::UserQuotaInsufficient));
    }
    if !req.token_unlimited && !store.consume_token_quota_bounded(req.token_id, req.amount)? {
        if let Err(err) = store.change_user_quota(req.user_id, req.amount) {
            error!("failed to return {} to user {} after token check: {}", req.amount, req.user_id, err);
        }
        return Err(RelayError::insufficient_quota(Msg::TokenQuotaInsufficient));
    }
    charge.amount = req.amount;
    Ok(charge)
}

/// Holds a charge until it is settled or refunded. Dropping an unfinished
/// guard refunds, so early returns and cancelled streams cannot leak quota.
pub struct QuotaGuard {
    store: SharedStore,
    charge: Option<Charge>,
}

impl QuotaGuard {
    pub fn new(store: SharedStore, charge: Charge) -> Self {
        Self { store, charge: Some(charge) }
    }

    pub fn charge(&self) -> Option<&Charge> {
        self.charge.as_ref()
    }

    pub fn amount(&self) -> i64 {
        self.charge.as_ref().map_or(0, |c| c.amount)
    }

    pub fn settle(mut self, actual: i64, channel_id: i64) -> i64 {
        match self.charge.take() {
            Some(charge) => charge.settle(&self.store, actual, channel_id),
            None => 0,
        }
    }

    pub fn refund(mut self) {
        if let Some(charge) = self.charge.take() {
            charge.refund(&self.store);
        }
    }

    /// Hands ownership of the charge to someone else, e.g. a persisted task.
    pub fn disarm(mut self) -> Option<Charge> {
        self.charge.take()
    }
}

impl Drop for QuotaGuard {
    fn drop(&mut self) {
        if let Some(charge) = self.charge.take() {
            warn!("quota guard for user {} dropped unsettled, refunding {}", charge.user_id, charge.amount);
            charge.refund(&self.store);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::database::memory::MemoryStore;
    use crate::database::subscription::{PlanItem, SubscriptionPlan};
    use crate::database::token::Token;
    use crate::database::user::User;
    use crate::database::SeedStore;

    fn store_with(user_quota: i64, token_remain: i64, unlimited: bool) -> SharedStore {
        let store = MemoryStore::new();
        store
            .upsert_user(&User { id: 1, username: "u".into(), group: "default".into(), quota: user_quota, enabled: true, ..Default::default() })
            .unwrap();
        store
            .upsert_token(&Token { id: 7, user_id: 1, key: "sk-t".into(), remain_quota: token_remain, unlimited_quota: unlimited, expired_time: -1, ..Default::default() })
            .unwrap();
        Arc::new(store)
    }

    fn request(amount: i64, unlimited: bool) -> PreConsumeRequest<'static> {
        PreConsumeRequest { user_id: 1, token_id: 7, token_unlimited: unlimited, model: "gpt-4o", amount, per_call: false }
    }

    fn quota_of(store: &SharedStore) -> i64 {
        store.get_user(1).unwrap().unwrap().quota
    }

    #[test]
    fn price_formulas() {
        let mut ratio = RatioConfig::default();
        ratio.group_ratio = HashMap::from([("vip".to_string(), 0.5)]);
        ratio.group_special_ratio = HashMap::from([("default".to_string(), HashMap::from([("vip".to_string(), 2.0)]))]);
        ratio.cache_ratio = HashMap::from([("gpt-4o".to_string(), 0.5)]);
        let price = price_data(&ratio, &QuotaConfig::default(), "gpt-4o", "default", "vip");
        // 100 * 1.25 * 0.5 + 10 * (1.25 * 4) * 0.5
        assert_eq!(price.estimate(100, Some(10)), 88);
        let mut usage = Usage::new(100, 10);
        usage.set_cached_tokens(40);
        // (60 + 20 + 40) * 1.25 * 0.5 * 2
        assert_eq!(price.actual(&usage), 150);

        let per_call = price_data(&ratio, &QuotaConfig::default(), "dall-e-3", "default", "default");
        assert_eq!(per_call.estimate(1000, Some(1000)), 20_000);
        assert!(per_call.is_per_call());
    }

    #[test]
    fn actual_has_floor_of_one() {
        let mut ratio = RatioConfig::default();
        ratio.model_ratio.insert("tiny".into(), 0.0001);
        let price = price_data(&ratio, &QuotaConfig::default(), "tiny", "default", "default");
        assert_eq!(price.actual(&Usage::new(1, 0)), 1);
        ratio.model_ratio.insert("free".into(), 0.0);
        let free = price_data(&ratio, &QuotaConfig::default(), "free", "default", "default");
        assert_eq!(free.actual(&Usage::new(100, 100)), 0);
    }

    #[test]
    fn settle_balances_the_ledger() {
        let store = store_with(1_000, 1_000, false);
        let charge = pre_consume(&store, &QuotaConfig::default(), request(100, false)).unwrap();
        assert_eq!(charge.amount, 100);
        assert_eq!(quota_of(&store), 900);
        let guard = QuotaGuard::new(store.clone(), charge);
        assert_eq!(guard.settle(130, 0), 30);
        assert_eq!(quota_of(&store), 870);
        let token = store.get_token(7).unwrap().unwrap();
        assert_eq!(token.remain_quota, 870);
        assert_eq!(store.get_user(1).unwrap().unwrap().used_quota, 130);
    }

    #[test]
    fn insufficient_quota_does_not_deduct() {
        let store = store_with(50, 1_000, false);
        let err = pre_consume(&store, &QuotaConfig::default(), request(100, false)).unwrap_err();
        assert_eq!(err.code, "insufficient_quota");
        assert_eq!(quota_of(&store), 50);

        let store = store_with(1_000, 10, false);
        let err = pre_consume(&store, &QuotaConfig::default(), request(100, false)).unwrap_err();
        assert_eq!(err.code, "insufficient_quota");
        assert_eq!(quota_of(&store), 1_000);
    }

    #[test]
    fn trusted_users_skip_the_upfront_charge() {
        let store = store_with(1_000_000, 0, true);
        let charge = pre_consume(&store, &QuotaConfig::default(), request(100, true)).unwrap();
        assert_eq!(charge.amount, 0);
        assert_eq!(quota_of(&store), 1_000_000);
        QuotaGuard::new(store.clone(), charge).settle(120, 0);
        assert_eq!(quota_of(&store), 1_000_000 - 120);
    }

    #[test]
    fn dropped_guard_refunds() {
        let store = store_with(1_000, 1_000, false);
        {
            let charge = pre_consume(&store, &QuotaConfig::default(), request(300, false)).unwrap();
            let _guard = QuotaGuard::new(store.clone(), charge);
            assert_eq!(quota_of(&store), 700);
        }
        assert_eq!(quota_of(&store), 1_000);
        assert_eq!(store.get_token(7).unwrap().unwrap().remain_quota, 1_000);
    }

    #[test]
    fn subscription_is_charged_before_wallet() {
        let store = store_with(1_000, 1_000, true);
        let plan = SubscriptionPlan {
            plan_id: "p".into(),
            duration_secs: 3600,
            items: vec![PlanItem { model_name: "gpt-4o".into(), quota_type: QuotaType::ByQuota, amount: 500 }],
        };
        store.create_subscription(1, &plan, now_secs()).unwrap();
        let charge = pre_consume(&store, &QuotaConfig::default(), request(200, true)).unwrap();
        assert!(matches!(charge.source, QuotaSource::Subscription { .. }));
        assert_eq!(quota_of(&store), 1_000);
        QuotaGuard::new(store.clone(), charge).settle(150, 0);
        let items = store.list_subscription_items(1).unwrap();
        assert_eq!(items[0].amount_used, 150);
    }
}
