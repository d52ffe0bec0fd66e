use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Decides whether, and after how long, the reader reopens the device after
/// a connection error. `attempt` starts at 1 for the first retry.
pub trait ReconnectPolicy: Send + Sync {
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Stay degraded after the first error.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverReconnect;

impl ReconnectPolicy for NeverReconnect {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}

/// Doubling delays from `initial` up to `max`, optionally bounded in count.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        if self.max_attempts.is_some_and(|max| attempt > max) {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ReconnectSettings {
    #[default]
    Never,
    Backoff {
        initial_ms: u64,
        max_ms: u64,
        #[serde(default)]
        max_attempts: Option<u32>,
    },
}

impl ReconnectSettings {
    pub fn policy(&self) -> Arc<dyn ReconnectPolicy> {
        match *self {
            ReconnectSettings::Never => Arc::new(NeverReconnect),
            ReconnectSettings::Backoff {
                initial_ms,
                max_ms,
                max_attempts,
            } => Arc::new(ExponentialBackoff {
                initial: Duration::from_millis(initial_ms),
                max: Duration::from_millis(max_ms.max(initial_ms)),
                max_attempts,
            }),
        }
    }
}
