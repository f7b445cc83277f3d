use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;

use crate::controller::error::RelayError;
use crate::database::channel::Channel;
use crate::service::cache::channel::ChannelCache;

/// Picks a channel for `model` in `group`: highest priority tier first,
/// weighted random inside the tier. Cooling and excluded channels are skipped.
pub fn select_channel(
    cache: &ChannelCache,
    model: &str,
    group: &str,
    exclude: &HashSet<i64>,
    serves: impl Fn(&Channel) -> bool,
) -> Result<Arc<Channel>, RelayError> {
    let snapshot = cache.snapshot();
    let candidates: Vec<&Arc<Channel>> = snapshot
        .channels()
        .iter()
        .filter(|c| {
            c.is_enabled()
                && c.supports_model(model)
                && c.groups.iter().any(|g| g == group)
                && !exclude.contains(&c.id)
                && !cache.in_cooldown(c.id)
                && serves(c)
        })
        .collect();

    let Some(top) = candidates.iter().map(|c| c.priority).max() else {
        return Err(RelayError::no_channel(model, group));
    };
    let tier: Vec<&Arc<Channel>> = candidates.into_iter().filter(|c| c.priority == top).collect();
    Ok(pick_weighted(&tier, &mut rand::rng()).clone())
}

fn pick_weighted<'a, R: Rng>(tier: &[&'a Arc<Channel>], rng: &mut R) -> &'a Arc<Channel> {
    // Zero weights count as one so such channels still get traffic.
    let total: u64 = tier.iter().map(|c| u64::from(c.weight.max(1))).sum();
    let mut point = rng.random_range(0..total);
    for channel in tier {
        let weight = u64::from(channel.weight.max(1));
        if point < weight {
            return channel;
        }
        point -= weight;
    }
    tier[tier.len() - 1]
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::schema::enum_def::ChannelStatus;

    fn channel(id: i64, priority: i64, weight: u32) -> Channel {
        Channel {
            id,
            priority,
            weight,
            models: vec!["gpt-4o".to_string()],
            groups: vec!["default".to_string()],
            ..Default::default()
        }
    }

    fn cache(channels: Vec<Channel>) -> ChannelCache {
        let cache = ChannelCache::new(Duration::from_secs(60));
        cache.publish(channels);
        cache
    }

    #[test]
    fn highest_priority_tier_wins() {
        let cache = cache(vec![channel(1, 0, 100), channel(2, 10, 1), channel(3, 5, 100)]);
        for _ in 0..20 {
            let picked = select_channel(&cache, "gpt-4o", "default", &HashSet::new(), |_| true).unwrap();
            assert_eq!(picked.id, 2);
        }
    }

    #[test]
    fn exclusion_and_cooldown_fall_through_to_lower_tiers() {
        let cache = cache(vec![channel(1, 10, 1), channel(2, 5, 1), channel(3, 0, 1)]);
        cache.cool_down(2);
        let picked = select_channel(&cache, "gpt-4o", "default", &HashSet::from([1]), |_| true).unwrap();
        assert_eq!(picked.id, 3);
        let err = select_channel(&cache, "gpt-4o", "default", &HashSet::from([1, 3]), |_| true).unwrap_err();
        assert_eq!(err.code, "no_channel");
    }

    #[test]
    fn filters_on_status_group_model_and_mode() {
        let mut disabled = channel(1, 10, 1);
        disabled.status = ChannelStatus::AutoDisabled;
        let mut vip = channel(2, 10, 1);
        vip.groups = vec!["vip".to_string()];
        let cache = cache(vec![disabled, vip, channel(3, 0, 1)]);
        assert_eq!(select_channel(&cache, "gpt-4o", "default", &HashSet::new(), |_| true).unwrap().id, 3);
        assert_eq!(select_channel(&cache, "gpt-4o", "vip", &HashSet::new(), |_| true).unwrap().id, 2);
        assert!(select_channel(&cache, "claude", "default", &HashSet::new(), |_| true).is_err());
        assert!(select_channel(&cache, "gpt-4o", "default", &HashSet::new(), |c| c.id != 3).is_err());
    }

    #[test]
    fn weights_shape_the_distribution() {
        let heavy = Arc::new(channel(1, 0, 99));
        let light = Arc::new(channel(2, 0, 1));
        let tier = vec![&heavy, &light];
        let mut rng = rand::rng();
        let heavy_hits = (0..1000).filter(|_| pick_weighted(&tier, &mut rng).id == 1).count();
        assert!(heavy_hits > 900, "heavy channel picked {heavy_hits} times");
    }
}
