use std::sync::{Arc, PoisonError, RwLock};

use crate::database::error_rule::{CustomErrorRule, ErrorRuleStore};
use crate::database::DbResult;

#[derive(Debug, Default)]
struct RuleSet {
    /// Enabled rules in ascending priority.
    rules: Vec<CustomErrorRule>,
    /// `replacements[i]` belongs to `rules[i]`.
    replacements: Vec<Arc<str>>,
}

/// Rewrites upstream error messages. Rules and replacements are published together.
#[derive(Default)]
pub struct ErrorRuleCache {
    inner: RwLock<Arc<RuleSet>>,
}

impl ErrorRuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, mut rules: Vec<CustomErrorRule>) {
        rules.retain(|r| r.enabled && !r.contains.is_empty());
        rules.sort_by_key(|r| (r.priority, r.id));
        let replacements = rules.iter().map(|r| Arc::from(r.new_message.as_str())).collect();
        let next = Arc::new(RuleSet { rules, replacements });
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub fn reload(&self, store: &dyn ErrorRuleStore) -> DbResult<usize> {
        let rules = store.list_error_rules()?;
        let count = rules.len();
        self.publish(rules);
        Ok(count)
    }

    /// Replacement text of the first rule matching `body` and `status`.
    pub fn rewrite(&self, status: u16, body: &str) -> Option<Arc<str>> {
        let set = self.inner.read().unwrap_or_else(PoisonError::into_inner).clone();
        set.rules
            .iter()
            .position(|r| (r.status_code == 0 || r.status_code == status) && body.contains(&r.contains))
            .map(|i| set.replacements[i].clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, priority: i64, contains: &str, status_code: u16, message: &str) -> CustomErrorRule {
        CustomErrorRule {
            id,
            priority,
            contains: contains.to_string(),
            status_code,
            new_message: message.to_string(),
            enabled: true,
        }
    }

    #[test]
    fn lowest_priority_match_wins() {
        let cache = ErrorRuleCache::new();
        cache.publish(vec![
            rule(1, 20, "quota", 0, "generic"),
            rule(2, 10, "quota", 429, "specific"),
            rule(3, 5, "nothing-matches", 0, "never"),
        ]);
        assert_eq!(cache.rewrite(429, "insufficient quota").as_deref(), Some("specific"));
        assert_eq!(cache.rewrite(500, "insufficient quota").as_deref(), Some("generic"));
        assert!(cache.rewrite(500, "fine").is_none());
    }

    #[test]
    fn swapping_priorities_prefers_the_lower_one() {
        let cache = ErrorRuleCache::new();
        cache.publish(vec![rule(1, 1, "err", 0, "a"), rule(2, 2, "err", 0, "b")]);
        assert_eq!(cache.rewrite(400, "err").as_deref(), Some("a"));
        cache.publish(vec![rule(1, 2, "err", 0, "a"), rule(2, 1, "err", 0, "b")]);
        assert_eq!(cache.rewrite(400, "err").as_deref(), Some("b"));
    }

    #[test]
    fn disabled_rules_are_ignored() {
        let cache = ErrorRuleCache::new();
        let mut disabled = rule(1, 1, "x", 0, "hidden");
        disabled.enabled = false;
        cache.publish(vec![disabled]);
        assert_eq!(cache.len(), 0);
    }
}
