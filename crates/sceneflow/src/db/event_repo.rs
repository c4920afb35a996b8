//! Append-only per-project progress event log.
//!
//! Sequence numbers are allocated as `MAX(seq) + 1` inside the
//! connection lock, so they are gapless and strictly increasing per
//! project even under concurrent publishers.

use chrono::Utc;
use rusqlite::params;

use super::{format_timestamp, Database, DatabaseError};

/// A stored event: its sequence number and serialized body.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub seq: u64,
    pub body: String,
}

/// Appends one event. The `build` closure receives the allocated
/// sequence number and returns the serialized body, so the body can
/// embed its own `seq`. Returns the sequence number.
pub fn append<F>(db: &Database, project_id: &str, build: F) -> Result<u64, DatabaseError>
where
    F: FnOnce(u64) -> Result<String, serde_json::Error>,
{
    db.with_conn(|conn| {
        let seq: u64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM progress_events WHERE project_id = ?1",
            params![project_id],
            |r| r.get(0),
        )?;
        let body = build(seq)?;
        conn.execute(
            "INSERT INTO progress_events (project_id, seq, body, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![project_id, seq, body, format_timestamp(Utc::now())],
        )?;
        Ok(seq)
    })
}

/// Events with `seq > after`, in sequence order. `after = 0` replays
/// the full history.
pub fn list_after(
    db: &Database,
    project_id: &str,
    after: u64,
) -> Result<Vec<EventRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT seq, body FROM progress_events
             WHERE project_id = ?1 AND seq > ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![project_id, after], |row| {
                Ok(EventRow {
                    seq: row.get(0)?,
                    body: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// The highest sequence number recorded for a project (0 if none).
pub fn last_seq(db: &Database, project_id: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let seq: u64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM progress_events WHERE project_id = ?1",
            params![project_id],
            |r| r.get(0),
        )?;
        Ok(seq)
    })
}
