use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TrackerError;

use super::validate_identifier;

/// Stable name of a recording endpoint, e.g. `oven1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(value: impl Into<String>) -> Result<Self, TrackerError> {
        let value = value.into();
        validate_identifier("channel id", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ChannelId {
    type Error = TrackerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A configured channel: its id and the field name carrying its value in
/// device lines (`oven1` reads `temp1`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub device_key: String,
}

impl Channel {
    pub fn new(id: &str, device_key: &str) -> Result<Self, TrackerError> {
        Ok(Self {
            id: ChannelId::new(id)?,
            device_key: device_key.to_string(),
        })
    }
}
