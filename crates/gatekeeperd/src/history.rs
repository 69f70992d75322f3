//! Access history sink: one SQLite row per status change.

use chrono::{DateTime, Utc};
use gatekeeper_core::{StatusKind, Transition};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

const UNKNOWN_USER: &str = "unknown";

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("history database: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("history directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Audit record for one access decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    /// Granted identity, or `"unknown"` for every other outcome.
    pub user_id: String,
    /// True only when access was granted to an enrolled identity.
    pub registered: bool,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl HistoryRecord {
    pub fn from_transition(transition: &Transition) -> Self {
        let (user_id, registered) = match &transition.status.kind {
            StatusKind::Granted(name) => (name.clone(), true),
            _ => (UNKNOWN_USER.to_string(), false),
        };
        Self {
            user_id,
            registered,
            timestamp: transition.status.timestamp,
            sequence: transition.status.sequence,
        }
    }
}

#[derive(Clone)]
pub struct HistoryLog {
    conn: tokio_rusqlite::Connection,
}

impl HistoryLog {
    pub async fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, HistoryError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, HistoryError> {
        conn.call(|c| {
            c.execute_batch(
                "CREATE TABLE IF NOT EXISTS access_history (
                    id          INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id     TEXT    NOT NULL,
                    registered  INTEGER NOT NULL,
                    timestamp   TEXT    NOT NULL,
                    sequence    INTEGER NOT NULL
                );",
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn record(&self, record: HistoryRecord) -> Result<(), HistoryError> {
        self.conn
            .call(move |c| {
                c.execute(
                    "INSERT INTO access_history (user_id, registered, timestamp, sequence)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        record.user_id,
                        record.registered,
                        record.timestamp.to_rfc3339(),
                        record.sequence as i64,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Most recent records, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>, HistoryError> {
        let rows = self
            .conn
            .call(move |c| {
                let mut stmt = c.prepare(
                    "SELECT user_id, registered, timestamp, sequence
                     FROM access_history ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map([limit as i64], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, bool>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(user_id, registered, ts, sequence)| {
                let timestamp = DateTime::parse_from_rfc3339(&ts).ok()?.with_timezone(&Utc);
                Some(HistoryRecord {
                    user_id,
                    registered,
                    timestamp,
                    sequence: sequence as u64,
                })
            })
            .collect())
    }
}
