//! Job repository: durable job records with compare-and-set transitions.
//!
//! Every status change is an `UPDATE ... WHERE id = ? AND status = ?`.
//! Zero affected rows means another writer moved the job first; that is
//! surfaced as `DatabaseError::Conflict` and callers decide whether the
//! lost race matters.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::model::{JobFailure, JobRecord, JobStatus, StageKind};

use super::{format_timestamp, parse_timestamp, Database, DatabaseError};

/// A raw job row as stored; converted to `JobRecord` after the query.
#[derive(Debug, Clone)]
struct JobRow {
    id: String,
    project_id: String,
    stage: String,
    status: String,
    progress: u8,
    payload: String,
    result: Option<String>,
    error: Option<String>,
    attempts: u32,
    max_attempts: u32,
    parent_id: Option<String>,
    fan_out: bool,
    run_at: String,
    heartbeat_at: Option<String>,
    timeout_secs: u64,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            stage: row.get("stage")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            payload: row.get("payload")?,
            result: row.get("result")?,
            error: row.get("error")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            parent_id: row.get("parent_id")?,
            fan_out: row.get("fan_out")?,
            run_at: row.get("run_at")?,
            heartbeat_at: row.get("heartbeat_at")?,
            timeout_secs: row.get("timeout_secs")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<JobRecord, DatabaseError> {
        let stage = StageKind::parse(&self.stage)
            .ok_or_else(|| DatabaseError::Corrupt(format!("unknown stage '{}'", self.stage)))?;
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| DatabaseError::Corrupt(format!("unknown status '{}'", self.status)))?;
        Ok(JobRecord {
            stage,
            status,
            progress: self.progress,
            payload: serde_json::from_str(&self.payload)?,
            result: self.result.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error.as_deref().map(serde_json::from_str).transpose()?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            parent_id: self.parent_id,
            fan_out: self.fan_out,
            run_at: parse_timestamp(&self.run_at)?,
            heartbeat_at: self.heartbeat_at.as_deref().map(parse_timestamp).transpose()?,
            timeout_secs: self.timeout_secs,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            project_id: self.project_id,
        })
    }
}

fn insert_in(conn: &Connection, job: &JobRecord) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, project_id, stage, status, progress, payload, result, error,
         attempts, max_attempts, parent_id, fan_out, run_at, heartbeat_at, timeout_secs,
         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            job.id,
            job.project_id,
            job.stage.as_str(),
            job.status.as_str(),
            job.progress,
            serde_json::to_string(&job.payload)?,
            job.result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            job.error.as_ref().map(serde_json::to_string).transpose()?,
            job.attempts,
            job.max_attempts,
            job.parent_id,
            job.fan_out,
            format_timestamp(job.run_at),
            job.heartbeat_at.map(format_timestamp),
            job.timeout_secs,
            format_timestamp(job.created_at),
            format_timestamp(job.updated_at),
        ],
    )?;
    Ok(())
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRecord) -> Result<(), DatabaseError> {
    db.with_conn(|conn| insert_in(conn, job))
}

/// Inserts a batch of jobs under one connection lock, so a fan-out
/// parent and all its children become visible atomically.
pub fn insert_many(db: &Database, jobs: &[JobRecord]) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        for job in jobs {
            insert_in(conn, job)?;
        }
        Ok(())
    })
}

/// Inserts additional children under a fan-out parent. The parent is
/// re-read under the same connection lock and must still be `running`;
/// a settled parent surfaces as `Conflict` so no orphan child can be
/// appended after fan-in already finished.
pub fn insert_children(
    db: &Database,
    parent_id: &str,
    jobs: &[JobRecord],
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let parent = find_in(conn, parent_id)?
            .ok_or_else(|| DatabaseError::NotFound(format!("job '{}'", parent_id)))?;
        if parent.status != JobStatus::Running {
            return Err(DatabaseError::Conflict {
                id: parent_id.to_string(),
                expected: JobStatus::Running.as_str().to_string(),
                actual: parent.status.as_str().to_string(),
            });
        }
        for job in jobs {
            insert_in(conn, job)?;
        }
        Ok(())
    })
}

fn find_in(conn: &Connection, id: &str) -> Result<Option<JobRecord>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
    let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
    match rows.next() {
        Some(Ok(row)) => Ok(Some(row.into_record()?)),
        Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
        None => Ok(None),
    }
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRecord>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, id))
}

/// Builds the error for a compare-and-set miss by re-reading the row.
fn cas_miss(conn: &Connection, id: &str, expected: JobStatus) -> DatabaseError {
    match find_in(conn, id) {
        Ok(Some(job)) => DatabaseError::Conflict {
            id: id.to_string(),
            expected: expected.as_str().to_string(),
            actual: job.status.as_str().to_string(),
        },
        Ok(None) => DatabaseError::NotFound(format!("job '{}'", id)),
        Err(e) => e,
    }
}

/// Claims a pending, due job for execution: `pending -> running`,
/// increments `attempts` and stamps the first heartbeat. Returns the
/// refreshed record.
pub fn claim(db: &Database, id: &str, now: DateTime<Utc>) -> Result<JobRecord, DatabaseError> {
    db.with_conn(|conn| {
        let ts = format_timestamp(now);
        let changed = conn.execute(
            "UPDATE jobs SET status='running', attempts=attempts+1, heartbeat_at=?2,
             updated_at=?2 WHERE id=?1 AND status='pending' AND run_at<=?2",
            params![id, ts],
        )?;
        if changed == 0 {
            return Err(cas_miss(conn, id, JobStatus::Pending));
        }
        find_in(conn, id)?.ok_or_else(|| DatabaseError::NotFound(format!("job '{}'", id)))
    })
}

/// Records success: `running -> succeeded`, stores the result, pins
/// progress at 100.
pub fn complete(
    db: &Database,
    id: &str,
    result: &serde_json::Value,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status='succeeded', result=?2, progress=100, updated_at=?3
             WHERE id=?1 AND status='running'",
            params![
                id,
                serde_json::to_string(result)?,
                format_timestamp(Utc::now())
            ],
        )?;
        if changed == 0 {
            return Err(cas_miss(conn, id, JobStatus::Running));
        }
        Ok(())
    })
}

/// Records a terminal failure: `running -> failed`.
pub fn fail(db: &Database, id: &str, failure: &JobFailure) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status='failed', error=?2, updated_at=?3
             WHERE id=?1 AND status='running'",
            params![
                id,
                serde_json::to_string(failure)?,
                format_timestamp(Utc::now())
            ],
        )?;
        if changed == 0 {
            return Err(cas_miss(conn, id, JobStatus::Running));
        }
        Ok(())
    })
}

/// Returns a running job to the queue with a new earliest-run time.
/// Used for retry backoff and for the stale-job sweep.
pub fn requeue(db: &Database, id: &str, run_at: DateTime<Utc>) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status='pending', run_at=?2, heartbeat_at=NULL, updated_at=?3
             WHERE id=?1 AND status='running'",
            params![id, format_timestamp(run_at), format_timestamp(Utc::now())],
        )?;
        if changed == 0 {
            return Err(cas_miss(conn, id, JobStatus::Running));
        }
        Ok(())
    })
}

/// Manual retry of a failed or cancelled job: back to `pending` with a
/// fresh attempt budget and the error cleared.
pub fn retry(db: &Database, id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let now = format_timestamp(Utc::now());
        let changed = conn.execute(
            "UPDATE jobs SET status='pending', attempts=0, error=NULL, heartbeat_at=NULL,
             run_at=?2, updated_at=?2 WHERE id=?1 AND status IN ('failed', 'cancelled')",
            params![id, now],
        )?;
        if changed == 0 {
            return Err(cas_miss(conn, id, JobStatus::Failed));
        }
        Ok(())
    })
}

/// Reopens a failed fan-out parent so fan-in can settle it again once
/// its retried children finish: `failed -> running`.
pub fn reopen(db: &Database, id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status='running', error=NULL, updated_at=?2
             WHERE id=?1 AND status='failed'",
            params![id, format_timestamp(Utc::now())],
        )?;
        if changed == 0 {
            return Err(cas_miss(conn, id, JobStatus::Failed));
        }
        Ok(())
    })
}

/// Cancels every non-terminal job of a project. Returns the jobs that
/// were actually moved to `cancelled`.
pub fn cancel_active_for_project(
    db: &Database,
    project_id: &str,
) -> Result<Vec<JobRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE project_id = ?1 AND status IN ('pending', 'running')",
        )?;
        let active: Vec<JobRecord> = stmt
            .query_map(params![project_id], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(JobRow::into_record)
            .collect::<Result<Vec<_>, _>>()?;

        let now = format_timestamp(Utc::now());
        let mut cancelled = Vec::new();
        for mut job in active {
            let changed = conn.execute(
                "UPDATE jobs SET status='cancelled', updated_at=?2
                 WHERE id=?1 AND status IN ('pending', 'running')",
                params![job.id, now],
            )?;
            // A worker finishing concurrently wins; skip it.
            if changed > 0 {
                job.status = JobStatus::Cancelled;
                cancelled.push(job);
            }
        }
        Ok(cancelled)
    })
}

/// Raises job progress, never lowering it. Writes only while running so
/// a straggling update cannot resurrect a terminal job.
pub fn update_progress(db: &Database, id: &str, progress: u8) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET progress=MAX(progress, ?2), updated_at=?3
             WHERE id=?1 AND status='running'",
            params![id, progress.min(100), format_timestamp(Utc::now())],
        )?;
        Ok(())
    })
}

/// Refreshes the liveness heartbeat of a running job.
pub fn heartbeat(db: &Database, id: &str, now: DateTime<Utc>) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET heartbeat_at=?2 WHERE id=?1 AND status='running'",
            params![id, format_timestamp(now)],
        )?;
        Ok(())
    })
}

/// Pending jobs that are due and directly executable (fan-out parents
/// are aggregation records, never dispatched). Oldest first.
pub fn list_runnable(db: &Database, now: DateTime<Utc>) -> Result<Vec<JobRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status='pending' AND run_at<=?1 AND fan_out=0
             ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![format_timestamp(now)], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(JobRow::into_record).collect()
    })
}

/// All children of a fan-out parent, in creation order.
pub fn list_by_parent(db: &Database, parent_id: &str) -> Result<Vec<JobRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM jobs WHERE parent_id = ?1 ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map(params![parent_id], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(JobRow::into_record).collect()
    })
}

/// All jobs of a project, in creation order.
pub fn list_by_project(db: &Database, project_id: &str) -> Result<Vec<JobRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM jobs WHERE project_id = ?1 ORDER BY created_at ASC")?;
        let rows = stmt
            .query_map(params![project_id], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(JobRow::into_record).collect()
    })
}

/// The live top-level job of a project stage, if any.
pub fn find_active(
    db: &Database,
    project_id: &str,
    stage: StageKind,
) -> Result<Option<JobRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE project_id=?1 AND stage=?2
             AND status IN ('pending', 'running') AND parent_id IS NULL",
        )?;
        let mut rows = stmt.query_map(params![project_id, stage.as_str()], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row.into_record()?)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Every running job, for the stale-heartbeat sweep. Expiry is decided
/// by the caller against each job's own timeout.
pub fn list_running(db: &Database) -> Result<Vec<JobRecord>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE status='running' AND fan_out=0")?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(JobRow::into_record).collect()
    })
}
