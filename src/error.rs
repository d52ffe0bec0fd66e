use thiserror::Error;

use crate::models::ChannelId;

/// Failures surfaced by the recording core.
///
/// State-machine violations never mutate state. `Decode` and `Connection`
/// are contained inside the device reader and only reach the error sink.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("a session is already running on {0}")]
    AlreadyRunning(ChannelId),
    #[error("no session is running on {0}")]
    NotRunning(ChannelId),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("could not decode device line: {0}")]
    Decode(String),
    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),
    #[error("device connection error: {0}")]
    Connection(String),
}

impl TrackerError {
    /// Stable identifier sent to the operator-facing layer.
    pub fn kind(&self) -> &'static str {
        match self {
            TrackerError::AlreadyRunning(_) => "already-running",
            TrackerError::NotRunning(_) => "not-running",
            TrackerError::InvalidArguments(_) => "invalid-arguments",
            TrackerError::Decode(_) => "decode-error",
            TrackerError::Persistence(_) => "persistence-error",
            TrackerError::Connection(_) => "connection-error",
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        TrackerError::InvalidArguments(message.into())
    }
}

impl From<anyhow::Error> for TrackerError {
    fn from(err: anyhow::Error) -> Self {
        TrackerError::Persistence(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_kebab_case() {
        let channel = ChannelId::new("oven1").unwrap();
        assert_eq!(
            TrackerError::AlreadyRunning(channel.clone()).kind(),
            "already-running"
        );
        assert_eq!(TrackerError::NotRunning(channel).kind(), "not-running");
        assert_eq!(TrackerError::invalid("x").kind(), "invalid-arguments");
    }

    #[test]
    fn persistence_message_includes_context_chain() {
        let err = anyhow::anyhow!("disk full").context("failed to append point");
        let message = TrackerError::from(err).to_string();
        assert!(message.contains("failed to append point"));
        assert!(message.contains("disk full"));
    }
}
