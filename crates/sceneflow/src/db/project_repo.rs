//! Project repository. The status column is updated only through a
//! compare-and-set transition, so concurrent stage completions cannot
//! double-advance a project.

use chrono::Utc;
use rusqlite::{params, Row};

use crate::model::{Project, ProjectStatus};

use super::{format_timestamp, parse_timestamp, Database, DatabaseError};

fn project_from_row(row: &Row<'_>) -> Result<(String, String, String, String, String), rusqlite::Error> {
    Ok((
        row.get("id")?,
        row.get("name")?,
        row.get("status")?,
        row.get("created_at")?,
        row.get("updated_at")?,
    ))
}

fn into_project(
    (id, name, status, created_at, updated_at): (String, String, String, String, String),
) -> Result<Project, DatabaseError> {
    Ok(Project {
        id,
        name,
        status: ProjectStatus::parse_db(&status)
            .ok_or_else(|| DatabaseError::Corrupt(format!("unknown project status '{status}'")))?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

/// Inserts a new project row.
pub fn insert(db: &Database, project: &Project) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO projects (id, name, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                project.id,
                project.name,
                project.status.as_db_str(),
                format_timestamp(project.created_at),
                format_timestamp(project.updated_at),
            ],
        )?;
        Ok(())
    })
}

/// Finds a project by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Project>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM projects WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], project_from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(into_project(row)?)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Fetches a project, erroring if it does not exist.
pub fn require(db: &Database, id: &str) -> Result<Project, DatabaseError> {
    find_by_id(db, id)?.ok_or_else(|| DatabaseError::NotFound(format!("project '{}'", id)))
}

/// Compare-and-set status transition: succeeds only if the stored
/// status still equals `from`.
pub fn transition(
    db: &Database,
    id: &str,
    from: ProjectStatus,
    to: ProjectStatus,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE projects SET status=?3, updated_at=?4 WHERE id=?1 AND status=?2",
            params![
                id,
                from.as_db_str(),
                to.as_db_str(),
                format_timestamp(Utc::now())
            ],
        )?;
        if changed == 0 {
            let actual: Option<String> = conn
                .query_row(
                    "SELECT status FROM projects WHERE id=?1",
                    params![id],
                    |r| r.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            return Err(match actual {
                Some(actual) => DatabaseError::Conflict {
                    id: id.to_string(),
                    expected: from.as_db_str(),
                    actual,
                },
                None => DatabaseError::NotFound(format!("project '{}'", id)),
            });
        }
        Ok(())
    })
}
