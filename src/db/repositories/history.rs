use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{
        format_datetime, history_table_name, parse_datetime, parse_optional_datetime, parse_status,
        quote_identifier, to_piece_count,
    },
};
use crate::models::{ChannelId, ProductId, Session};

fn row_to_session(row: &Row, channel_id: &ChannelId) -> Result<Session> {
    let product_id: String = row.get("product_id")?;
    let started_at: String = row.get("started_at")?;
    let ended_at: Option<String> = row.get("ended_at")?;
    let status: String = row.get("status")?;
    let piece_count: i64 = row.get("piece_count")?;

    Ok(Session {
        id: row.get("id")?,
        channel_id: channel_id.clone(),
        product_id: ProductId::new(product_id)?,
        operation: row.get("operation")?,
        piece_count: to_piece_count(piece_count)?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: parse_optional_datetime(ended_at, "ended_at")?,
        status: parse_status(&status)?,
    })
}

fn ensure_history_table(conn: &Connection, channel_id: &ChannelId) -> Result<String> {
    let table = quote_identifier(&history_table_name(channel_id));
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            product_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            piece_count INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            ended_at TEXT,
            status TEXT NOT NULL
        );"
    ))
    .with_context(|| format!("failed to create history table for channel {channel_id}"))?;
    Ok(table)
}

pub(super) fn insert_history(conn: &Connection, session: &Session) -> Result<()> {
    let table = ensure_history_table(conn, &session.channel_id)?;
    conn.execute(
        &format!(
            "INSERT INTO {table} (id, product_id, operation, piece_count, started_at, ended_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
        ),
        params![
            session.id,
            session.product_id.as_str(),
            session.operation,
            i64::from(session.piece_count),
            format_datetime(&session.started_at),
            session.ended_at.as_ref().map(format_datetime),
            session.status.as_str(),
        ],
    )
    .with_context(|| {
        format!(
            "failed to append session {} to {} history",
            session.id, session.channel_id
        )
    })?;
    Ok(())
}

impl Database {
    /// Creates the history tables of every configured channel up front.
    pub async fn prepare_history(&self, channels: &[ChannelId]) -> Result<()> {
        let channels = channels.to_vec();
        self.execute(move |conn| {
            for channel_id in &channels {
                ensure_history_table(conn, channel_id)?;
            }
            Ok(())
        })
        .await
    }

    pub async fn append_history(&self, session: &Session) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| insert_history(conn, &record))
            .await
    }

    /// Most recently started first; equal start times keep insertion order.
    pub async fn list_history(&self, channel_id: &ChannelId) -> Result<Vec<Session>> {
        let channel_id = channel_id.clone();
        self.execute(move |conn| {
            let table_name = history_table_name(&channel_id);
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params![table_name],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(Vec::new());
            }

            let mut stmt = conn.prepare(&format!(
                "SELECT id, product_id, operation, piece_count, started_at, ended_at, status
                 FROM {}
                 ORDER BY started_at DESC, seq ASC",
                quote_identifier(&table_name)
            ))?;

            let mut rows = stmt.query([])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row, &channel_id)?);
            }

            Ok(sessions)
        })
        .await
    }
}
