use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use crate::models::{ChannelId, Reading};

/// Last reading seen per channel, whether or not the channel is recording.
pub struct LiveValueCache {
    channels: Vec<ChannelId>,
    values: RwLock<HashMap<ChannelId, Reading>>,
}

impl LiveValueCache {
    pub fn new(channels: impl IntoIterator<Item = ChannelId>) -> Self {
        Self {
            channels: channels.into_iter().collect(),
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Readings for channels that were not configured are ignored.
    pub fn update(&self, reading: &Reading) {
        if !self.channels.contains(&reading.channel_id) {
            return;
        }
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(reading.channel_id.clone(), reading.clone());
    }

    pub fn get(&self, channel_id: &ChannelId) -> Option<Reading> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.get(channel_id).cloned()
    }

    /// Every configured channel, `None` for those never heard from.
    pub fn snapshot(&self) -> BTreeMap<ChannelId, Option<Reading>> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        self.channels
            .iter()
            .map(|channel_id| (channel_id.clone(), values.get(channel_id).cloned()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn snapshot_lists_silent_channels_as_none() {
        let oven1 = ChannelId::new("oven1").unwrap();
        let oven2 = ChannelId::new("oven2").unwrap();
        let cache = LiveValueCache::new([oven1.clone(), oven2.clone()]);
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

        cache.update(&Reading {
            channel_id: oven1.clone(),
            value: 180.2,
            captured_at: at,
        });
        cache.update(&Reading {
            channel_id: oven1.clone(),
            value: 181.0,
            captured_at: at,
        });

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&oven1].as_ref().map(|r| r.value), Some(181.0));
        assert_eq!(snapshot[&oven2], None);
    }

    #[test]
    fn ignores_unknown_channels() {
        let cache = LiveValueCache::new([ChannelId::new("oven1").unwrap()]);
        let stray = ChannelId::new("oven3").unwrap();
        cache.update(&Reading {
            channel_id: stray.clone(),
            value: 20.0,
            captured_at: Utc::now(),
        });
        assert_eq!(cache.get(&stray), None);
        assert_eq!(cache.snapshot().len(), 1);
    }
}
