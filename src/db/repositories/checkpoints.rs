use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, to_piece_count},
};
use crate::models::{ChannelId, ProductId, Session, SessionStatus};

use super::history::insert_history;

fn row_to_checkpoint(row: &Row) -> Result<Session> {
    let channel_id: String = row.get("channel_id")?;
    let product_id: String = row.get("product_id")?;
    let piece_count: i64 = row.get("piece_count")?;
    let started_at: String = row.get("started_at")?;

    Ok(Session {
        id: row.get("session_id")?,
        channel_id: ChannelId::new(channel_id)?,
        product_id: ProductId::new(product_id)?,
        operation: row.get("operation")?,
        piece_count: to_piece_count(piece_count)?,
        started_at: parse_datetime(&started_at, "started_at")?,
        ended_at: None,
        status: SessionStatus::Running,
    })
}

impl Database {
    /// Records the session currently active on its channel.
    pub async fn save_checkpoint(&self, session: &Session) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO active_sessions
                    (channel_id, session_id, product_id, operation, piece_count, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.channel_id.as_str(),
                    record.id,
                    record.product_id.as_str(),
                    record.operation,
                    i64::from(record.piece_count),
                    format_datetime(&record.started_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Removes the checkpoint of `session`, leaving a newer one on the same
    /// channel in place.
    pub async fn clear_checkpoint(&self, session: &Session) -> Result<()> {
        let channel_id = session.channel_id.clone();
        let session_id = session.id.clone();
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM active_sessions WHERE channel_id = ?1 AND session_id = ?2",
                params![channel_id.as_str(), session_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Moves sessions left active by a previous process into their channel
    /// history as `Interrupted`, in one transaction.
    pub async fn recover_interrupted_sessions(
        &self,
        stopped_at: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let mut recovered = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT channel_id, session_id, product_id, operation, piece_count, started_at
                     FROM active_sessions
                     ORDER BY started_at ASC",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    let mut session = row_to_checkpoint(row)?;
                    session.ended_at = Some(stopped_at.max(session.started_at));
                    session.status = SessionStatus::Interrupted;
                    recovered.push(session);
                }
            }

            for session in &recovered {
                insert_history(&tx, session)?;
            }
            tx.execute("DELETE FROM active_sessions", [])?;
            tx.commit()?;

            Ok(recovered)
        })
        .await
    }
}
