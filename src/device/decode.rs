use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::TrackerError;
use crate::models::{Channel, ChannelId, Reading};

/// Maps the fields of a device line onto channels.
///
/// A line is one JSON object such as `{"temp1": 180.2, "temp2": 175}`.
/// Absent, non-numeric and unknown fields are ignored.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    keys: Vec<(String, ChannelId)>,
}

impl LineDecoder {
    pub fn new(channels: &[Channel]) -> Self {
        Self {
            keys: channels
                .iter()
                .map(|channel| (channel.device_key.clone(), channel.id.clone()))
                .collect(),
        }
    }

    /// Yields zero or more readings, in channel configuration order.
    pub fn decode(
        &self,
        line: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<Vec<Reading>, TrackerError> {
        let record: Map<String, Value> = serde_json::from_str(line.trim())
            .map_err(|err| TrackerError::Decode(err.to_string()))?;

        Ok(self
            .keys
            .iter()
            .filter_map(|(key, channel_id)| {
                let value = record.get(key)?.as_f64()?;
                Some(Reading {
                    channel_id: channel_id.clone(),
                    value,
                    captured_at,
                })
            })
            .collect())
    }
}
