use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::error::TrackerError;
use crate::models::{ChannelId, ProductId, Session, StartSession};

use super::{SessionSlot, SlotState, Throttle};

/// Owns one [`SessionSlot`] per configured channel.
///
/// Each slot sits behind its own lock so the two ovens never contend. A stop
/// is linearized at the moment its slot guard is released: any reading whose
/// admission takes the lock afterwards sees an idle slot.
pub struct SessionRegistry {
    order: Vec<ChannelId>,
    slots: HashMap<ChannelId, Mutex<SessionSlot>>,
    throttle: Throttle,
}

impl SessionRegistry {
    pub fn new(channels: impl IntoIterator<Item = ChannelId>, throttle: Throttle) -> Self {
        let mut order = Vec::new();
        let mut slots = HashMap::new();
        for channel in channels {
            if slots
                .insert(channel.clone(), Mutex::new(SessionSlot::default()))
                .is_none()
            {
                order.push(channel);
            }
        }
        Self {
            order,
            slots,
            throttle,
        }
    }

    pub fn channels(&self) -> &[ChannelId] {
        &self.order
    }

    pub fn throttle(&self) -> Throttle {
        self.throttle
    }

    fn slot(&self, channel_id: &ChannelId) -> Result<MutexGuard<'_, SessionSlot>, TrackerError> {
        let slot = self
            .slots
            .get(channel_id)
            .ok_or_else(|| TrackerError::invalid(format!("unknown channel '{channel_id}'")))?;
        Ok(slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn start(
        &self,
        request: StartSession,
        now: DateTime<Utc>,
    ) -> Result<Session, TrackerError> {
        let channel_id = request.channel_id.clone();
        let session = request.into_session(now)?;

        let mut slot = self.slot(&channel_id)?;
        if slot.state() == SlotState::Recording {
            return Err(TrackerError::AlreadyRunning(channel_id));
        }
        slot.begin(session.clone());
        Ok(session)
    }

    pub fn stop(&self, channel_id: &ChannelId, now: DateTime<Utc>) -> Result<Session, TrackerError> {
        let mut slot = self.slot(channel_id)?;
        slot.finish(now)
            .ok_or_else(|| TrackerError::NotRunning(channel_id.clone()))
    }

    /// Unknown channels have no active session.
    pub fn get_active(&self, channel_id: &ChannelId) -> Option<Session> {
        self.slot(channel_id).ok()?.active().cloned()
    }

    pub fn state(&self, channel_id: &ChannelId) -> Option<SlotState> {
        self.slot(channel_id).ok().map(|slot| slot.state())
    }

    /// Returns the series a reading captured at `at` on `channel_id` should
    /// be written to, or `None` when the channel is idle or throttled.
    pub fn admit(&self, channel_id: &ChannelId, at: DateTime<Utc>) -> Option<ProductId> {
        let mut slot = self.slot(channel_id).ok()?;
        slot.admit(at, &self.throttle)
    }

    /// Channel currently recording `product_id`, if any.
    pub fn channel_recording(&self, product_id: &ProductId) -> Option<ChannelId> {
        self.order.iter().find_map(|channel_id| {
            let active = self.get_active(channel_id)?;
            (active.product_id == *product_id).then(|| channel_id.clone())
        })
    }
}
