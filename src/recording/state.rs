use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ProductId, Session, SessionStatus};

use super::Throttle;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SlotState {
    #[default]
    Idle,
    Recording,
}

/// Per-channel recording state. The slot is `Recording` exactly when it
/// holds an active session.
#[derive(Debug, Clone)]
pub struct SessionSlot {
    active: Option<Session>,
    last_insert_at: DateTime<Utc>,
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self {
            active: None,
            last_insert_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl SessionSlot {
    pub fn state(&self) -> SlotState {
        if self.active.is_some() {
            SlotState::Recording
        } else {
            SlotState::Idle
        }
    }

    pub fn active(&self) -> Option<&Session> {
        self.active.as_ref()
    }

    pub fn last_insert_at(&self) -> DateTime<Utc> {
        self.last_insert_at
    }

    /// Resets the throttle to the epoch so the first reading is due at once.
    pub fn begin(&mut self, session: Session) {
        self.active = Some(session);
        self.last_insert_at = DateTime::<Utc>::UNIX_EPOCH;
    }

    pub fn finish(&mut self, ended_at: DateTime<Utc>) -> Option<Session> {
        let mut session = self.active.take()?;
        session.ended_at = Some(ended_at);
        session.status = SessionStatus::Completed;
        Some(session)
    }

    /// Throttle check-and-set. Returns the product whose series should
    /// receive the reading captured at `at`.
    pub fn admit(&mut self, at: DateTime<Utc>, throttle: &Throttle) -> Option<ProductId> {
        let session = self.active.as_ref()?;
        if !throttle.is_due(self.last_insert_at, at) {
            return None;
        }
        self.last_insert_at = at;
        Some(session.product_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChannelId, StartSession};
    use chrono::{Duration, TimeZone};

    fn session(at: DateTime<Utc>) -> Session {
        StartSession {
            channel_id: ChannelId::new("oven1").unwrap(),
            product_id: ProductId::new("5466").unwrap(),
            operation: "Colle Blanche".into(),
            piece_count: 20,
        }
        .into_session(at)
        .unwrap()
    }

    #[test]
    fn idle_slot_admits_nothing() {
        let mut slot = SessionSlot::default();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        assert_eq!(slot.state(), SlotState::Idle);
        assert_eq!(slot.admit(now, &Throttle::default()), None);
        assert_eq!(slot.last_insert_at(), DateTime::<Utc>::UNIX_EPOCH);
    }

    #[test]
    fn begin_resets_throttle_and_finish_completes() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let throttle = Throttle::default();
        let mut slot = SessionSlot::default();

        slot.begin(session(t0));
        assert!(slot.admit(t0, &throttle).is_some());
        assert_eq!(slot.last_insert_at(), t0);
        assert!(slot.admit(t0 + Duration::seconds(30), &throttle).is_none());

        let done = slot.finish(t0 + Duration::minutes(5)).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.ended_at, Some(t0 + Duration::minutes(5)));
        assert_eq!(slot.state(), SlotState::Idle);

        slot.begin(session(t0 + Duration::minutes(6)));
        assert_eq!(slot.last_insert_at(), DateTime::<Utc>::UNIX_EPOCH);
        assert!(slot.admit(t0 + Duration::minutes(6), &throttle).is_some());
    }
}
