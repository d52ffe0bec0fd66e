use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TrackerError;

use super::{ChannelId, ProductId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Running,
    Completed,
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "Running",
            SessionStatus::Completed => "Completed",
            SessionStatus::Interrupted => "Interrupted",
        }
    }
}

fn completed() -> SessionStatus {
    SessionStatus::Completed
}

fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// One recorded interval of work on a channel.
///
/// The aliases accept records written by the kiosk front end
/// (`ovenId`, `pieceNumber`, `startTime`, `endTime`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default = "new_session_id")]
    pub id: String,
    #[serde(alias = "ovenId")]
    pub channel_id: ChannelId,
    pub product_id: ProductId,
    pub operation: String,
    #[serde(alias = "pieceNumber")]
    pub piece_count: u32,
    #[serde(alias = "startTime")]
    pub started_at: DateTime<Utc>,
    #[serde(default, alias = "endTime")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default = "completed")]
    pub status: SessionStatus,
}

impl Session {
    /// Checks a caller-supplied record before it is appended to history.
    pub fn validate_completed(&self) -> Result<(), TrackerError> {
        validate_operation(&self.operation)?;
        if self.piece_count == 0 {
            return Err(TrackerError::invalid("piece count must be greater than zero"));
        }
        match self.ended_at {
            None => Err(TrackerError::invalid("a saved session needs an end time")),
            Some(ended_at) if ended_at < self.started_at => Err(TrackerError::invalid(
                "session end time precedes its start time",
            )),
            Some(_) if self.status == SessionStatus::Running => Err(TrackerError::invalid(
                "a saved session cannot be in the Running state",
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Arguments of `start-session`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSession {
    #[serde(alias = "ovenId")]
    pub channel_id: ChannelId,
    pub product_id: ProductId,
    pub operation: String,
    #[serde(alias = "pieceNumber")]
    pub piece_count: i64,
}

impl StartSession {
    /// Validates the request and builds the session that becomes active.
    pub fn into_session(self, started_at: DateTime<Utc>) -> Result<Session, TrackerError> {
        validate_operation(&self.operation)?;
        if self.piece_count <= 0 {
            return Err(TrackerError::invalid("piece count must be greater than zero"));
        }
        let piece_count = u32::try_from(self.piece_count).map_err(|_| {
            TrackerError::invalid(format!("piece count {} is too large", self.piece_count))
        })?;

        Ok(Session {
            id: new_session_id(),
            channel_id: self.channel_id,
            product_id: self.product_id,
            operation: self.operation.trim().to_string(),
            piece_count,
            started_at,
            ended_at: None,
            status: SessionStatus::Running,
        })
    }
}

fn validate_operation(operation: &str) -> Result<(), TrackerError> {
    if operation.trim().is_empty() {
        return Err(TrackerError::invalid("operation must not be empty"));
    }
    Ok(())
}
