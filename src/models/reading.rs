use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ChannelId;

/// One decoded sensor value. Never mutated after the reader creates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub channel_id: ChannelId,
    pub value: f64,
    pub captured_at: DateTime<Utc>,
}

/// A persisted point of a product's temperature series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeriesPoint {
    pub value: f64,
    pub captured_at: DateTime<Utc>,
}

impl From<&Reading> for SeriesPoint {
    fn from(reading: &Reading) -> Self {
        Self {
            value: reading.value,
            captured_at: reading.captured_at,
        }
    }
}
