pub mod channel;
pub mod product;
pub mod reading;
pub mod session;

pub use channel::{Channel, ChannelId};
pub use product::ProductId;
pub use reading::{Reading, SeriesPoint};
pub use session::{Session, SessionStatus, StartSession};

use crate::error::TrackerError;

const MAX_IDENTIFIER_LEN: usize = 64;

/// Identifiers end up inside SQLite table names, so they are restricted to
/// ASCII alphanumerics, `-` and `_`.
pub(crate) fn validate_identifier(kind: &str, value: &str) -> Result<(), TrackerError> {
    if value.is_empty() {
        return Err(TrackerError::invalid(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(TrackerError::invalid(format!(
            "{kind} '{value}' is longer than {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(TrackerError::invalid(format!(
            "{kind} '{value}' may only contain letters, digits, '-' and '_'"
        )));
    }
    Ok(())
}
