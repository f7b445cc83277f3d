use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use cyder_tools::log::{info, warn};
use dashmap::DashMap;

use crate::database::channel::{Channel, ChannelStore};
use crate::database::DbResult;
use crate::schema::enum_def::ChannelStatus;

/// Immutable view of all channels, replaced as a whole on reload.
#[derive(Debug, Default)]
pub struct ChannelSnapshot {
    channels: Vec<Arc<Channel>>,
    by_id: HashMap<i64, Arc<Channel>>,
}

impl ChannelSnapshot {
    pub fn new(channels: Vec<Channel>) -> Self {
        let channels: Vec<Arc<Channel>> = channels.into_iter().map(Arc::new).collect();
        let by_id = channels.iter().map(|c| (c.id, c.clone())).collect();
        Self { channels, by_id }
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn get(&self, id: i64) -> Option<Arc<Channel>> {
        self.by_id.get(&id).cloned()
    }
}

pub struct ChannelCache {
    snapshot: RwLock<Arc<ChannelSnapshot>>,
    /// Held by reload and auto-disable for their whole store round trip.
    writer: Mutex<()>,
    cooldown_until: DashMap<i64, Instant>,
    cooldown: Duration,
}

impl ChannelCache {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(ChannelSnapshot::default())),
            writer: Mutex::new(()),
            cooldown_until: DashMap::new(),
            cooldown,
        }
    }

    pub fn snapshot(&self) -> Arc<ChannelSnapshot> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn publish(&self, channels: Vec<Channel>) {
        let next = Arc::new(ChannelSnapshot::new(channels));
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    pub fn reload(&self, store: &dyn ChannelStore) -> DbResult<usize> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let channels = store.list_channels()?;
        let count = channels.len();
        self.publish(channels);
        Ok(count)
    }

    pub fn get(&self, id: i64) -> Option<Arc<Channel>> {
        self.snapshot().get(id)
    }

    pub fn cool_down(&self, channel_id: i64) {
        if self.cooldown.is_zero() {
            return;
        }
        self.cooldown_until.insert(channel_id, Instant::now() + self.cooldown);
        info!("channel {} cooling down for {:?}", channel_id, self.cooldown);
    }

    pub fn in_cooldown(&self, channel_id: i64) -> bool {
        match self.cooldown_until.get(&channel_id).map(|until| *until) {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                self.cooldown_until.remove(&channel_id);
                false
            }
            None => false,
        }
    }

    /// Persists the auto-disabled status and republishes the snapshot without
    /// waiting for the next sync.
    pub fn auto_disable(&self, store: &dyn ChannelStore, channel_id: i64) -> DbResult<()> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        store.update_channel_status(channel_id, ChannelStatus::AutoDisabled)?;
        let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        let channels = snapshot
            .channels()
            .iter()
            .map(|c| {
                let mut channel = Channel::clone(c);
                if channel.id == channel_id {
                    channel.status = ChannelStatus::AutoDisabled;
                }
                channel
            })
            .collect();
        *snapshot = Arc::new(ChannelSnapshot::new(channels));
        drop(snapshot);
        warn!("channel {} auto-disabled", channel_id);
        Ok(())
    }

    /// Every model an enabled channel serves to `group`.
    pub fn models_for_group(&self, group: &str) -> BTreeSet<String> {
        self.snapshot()
            .channels()
            .iter()
            .filter(|c| c.is_enabled() && c.groups.iter().any(|g| g == group))
            .flat_map(|c| c.models.iter().cloned())
            .collect()
    }
}
