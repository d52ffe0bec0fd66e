use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::{ChannelId, ProductId, SessionStatus};

/// Fixed-width RFC 3339 (`2024-03-01T08:00:00.000000Z`) so that text
/// comparison in SQL orders timestamps chronologically.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_status(value: &str) -> Result<SessionStatus> {
    match value {
        "Running" => Ok(SessionStatus::Running),
        "Completed" => Ok(SessionStatus::Completed),
        "Interrupted" => Ok(SessionStatus::Interrupted),
        other => Err(anyhow!("unknown session status {other}")),
    }
}

pub fn to_piece_count(value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("piece_count contains out-of-range value {value}"))
}

/// SQLite folds identifier case, so ids are hex-encoded into table names to
/// keep `A7` and `a7` apart.
pub fn series_table_name(product_id: &ProductId) -> String {
    format!("series_{}", hex::encode(product_id.as_str()))
}

/// Unquoted name of the session history table of `channel_id`.
pub fn history_table_name(channel_id: &ChannelId) -> String {
    format!("sessions_{}", hex::encode(channel_id.as_str()))
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{name}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formatted_timestamps_sort_lexicographically() {
        let whole = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let fractional = whole + chrono::Duration::milliseconds(500);
        let a = format_datetime(&whole);
        let b = format_datetime(&fractional);
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&b, "captured_at").unwrap(), fractional);
    }

    #[test]
    fn table_names_are_deterministic() {
        let product = ProductId::new("5466").unwrap();
        let channel = ChannelId::new("oven-1").unwrap();
        assert_eq!(series_table_name(&product), "series_35343636");
        assert_eq!(history_table_name(&channel), "sessions_6f76656e2d31");
        assert_eq!(quote_identifier("series_35343636"), "\"series_35343636\"");
    }

    #[test]
    fn case_variants_get_distinct_tables() {
        let upper = ProductId::new("A7").unwrap();
        let lower = ProductId::new("a7").unwrap();
        assert_ne!(
            series_table_name(&upper).to_ascii_lowercase(),
            series_table_name(&lower).to_ascii_lowercase()
        );

        let upper = ChannelId::new("Oven1").unwrap();
        let lower = ChannelId::new("oven1").unwrap();
        assert_ne!(
            history_table_name(&upper).to_ascii_lowercase(),
            history_table_name(&lower).to_ascii_lowercase()
        );
    }
}
