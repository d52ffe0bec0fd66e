use chrono::{DateTime, Duration, Utc};

/// Minimum spacing between two persisted points of the same channel.
///
/// The boundary is closed: a reading exactly one interval after the last
/// insert is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    interval: Duration,
}

impl Throttle {
    pub const DEFAULT_INTERVAL_SECS: i64 = 60;

    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn from_secs(secs: u64) -> Self {
        let secs = i64::try_from(secs)
            .unwrap_or(i64::MAX)
            .min(i64::MAX / 1_000);
        Self::new(Duration::seconds(secs))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// A clock that moved backwards yields a negative elapsed time and is
    /// never due.
    pub fn is_due(&self, last_insert_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(last_insert_at) >= self.interval
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(Duration::seconds(Self::DEFAULT_INTERVAL_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn boundary_is_inclusive() {
        let throttle = Throttle::default();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();

        assert!(!throttle.is_due(t, t + Duration::seconds(59)));
        assert!(!throttle.is_due(t, t + Duration::milliseconds(59_999)));
        assert!(throttle.is_due(t, t + Duration::seconds(60)));
        assert!(throttle.is_due(t, t + Duration::seconds(61)));
    }

    #[test]
    fn epoch_is_always_due() {
        let throttle = Throttle::from_secs(3_600);
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        assert!(throttle.is_due(DateTime::<Utc>::UNIX_EPOCH, now));
    }

    #[test]
    fn clock_going_backwards_is_not_due() {
        let throttle = Throttle::default();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        assert!(!throttle.is_due(t, t - Duration::seconds(120)));
    }
}
