//! Scene repository: per-scene rows and their artifact columns
//! (prompt, image, clip), plus the append-only approval log.

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::model::{Approval, ArtifactKind, ArtifactStatus, Scene};

use super::{format_timestamp, parse_timestamp, Database, DatabaseError};

#[derive(Debug)]
struct SceneRow {
    id: String,
    project_id: String,
    order_idx: u32,
    start_s: f64,
    end_s: f64,
    excerpt: String,
    theme: String,
    reasoning: Option<String>,
    prompt: Option<String>,
    prompt_status: String,
    image_url: Option<String>,
    image_status: String,
    clip_url: Option<String>,
    clip_status: String,
    created_at: String,
    updated_at: String,
}

impl SceneRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            order_idx: row.get("order_idx")?,
            start_s: row.get("start_s")?,
            end_s: row.get("end_s")?,
            excerpt: row.get("excerpt")?,
            theme: row.get("theme")?,
            reasoning: row.get("reasoning")?,
            prompt: row.get("prompt")?,
            prompt_status: row.get("prompt_status")?,
            image_url: row.get("image_url")?,
            image_status: row.get("image_status")?,
            clip_url: row.get("clip_url")?,
            clip_status: row.get("clip_status")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_scene(self) -> Result<Scene, DatabaseError> {
        let parse_status = |s: &str| {
            ArtifactStatus::parse(s)
                .ok_or_else(|| DatabaseError::Corrupt(format!("unknown artifact status '{s}'")))
        };
        Ok(Scene {
            order_idx: self.order_idx,
            start_s: self.start_s,
            end_s: self.end_s,
            prompt_status: parse_status(&self.prompt_status)?,
            image_status: parse_status(&self.image_status)?,
            clip_status: parse_status(&self.clip_status)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            project_id: self.project_id,
            excerpt: self.excerpt,
            theme: self.theme,
            reasoning: self.reasoning,
            prompt: self.prompt,
            image_url: self.image_url,
            clip_url: self.clip_url,
        })
    }
}

fn insert_in(conn: &Connection, scene: &Scene) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO scenes (id, project_id, order_idx, start_s, end_s, excerpt, theme,
         reasoning, prompt, prompt_status, image_url, image_status, clip_url, clip_status,
         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            scene.id,
            scene.project_id,
            scene.order_idx,
            scene.start_s,
            scene.end_s,
            scene.excerpt,
            scene.theme,
            scene.reasoning,
            scene.prompt,
            scene.prompt_status.as_str(),
            scene.image_url,
            scene.image_status.as_str(),
            scene.clip_url,
            scene.clip_status.as_str(),
            format_timestamp(scene.created_at),
            format_timestamp(scene.updated_at),
        ],
    )?;
    Ok(())
}

/// Inserts all scenes of a project in one batch.
pub fn insert_scenes(db: &Database, scenes: &[Scene]) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        for scene in scenes {
            insert_in(conn, scene)?;
        }
        Ok(())
    })
}

/// Finds a scene by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Scene>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM scenes WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], SceneRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row.into_scene()?)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// All scenes of a project in playback order.
pub fn list_by_project(db: &Database, project_id: &str) -> Result<Vec<Scene>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM scenes WHERE project_id = ?1 ORDER BY order_idx ASC")?;
        let rows = stmt
            .query_map(params![project_id], SceneRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SceneRow::into_scene).collect()
    })
}

/// Stores a generated prompt on a scene.
pub fn set_prompt(
    db: &Database,
    scene_id: &str,
    prompt: &str,
    status: ArtifactStatus,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE scenes SET prompt=?2, prompt_status=?3, updated_at=?4 WHERE id=?1",
            params![
                scene_id,
                prompt,
                status.as_str(),
                format_timestamp(Utc::now())
            ],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound(format!("scene '{}'", scene_id)));
        }
        Ok(())
    })
}

/// Stores a generated artifact URL and its status.
pub fn set_artifact(
    db: &Database,
    scene_id: &str,
    kind: ArtifactKind,
    url: Option<&str>,
    status: ArtifactStatus,
) -> Result<(), DatabaseError> {
    let (url_col, status_col) = artifact_columns(kind);
    db.with_conn(|conn| {
        let changed = conn.execute(
            &format!("UPDATE scenes SET {url_col}=?2, {status_col}=?3, updated_at=?4 WHERE id=?1"),
            params![scene_id, url, status.as_str(), format_timestamp(Utc::now())],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound(format!("scene '{}'", scene_id)));
        }
        Ok(())
    })
}

/// Conditionally advances an artifact status: writes only when the
/// current status matches `from`. Returns whether a row changed, so
/// callers can make approval submission idempotent.
pub fn advance_artifact_status(
    db: &Database,
    scene_id: &str,
    kind: ArtifactKind,
    from: ArtifactStatus,
    to: ArtifactStatus,
) -> Result<bool, DatabaseError> {
    let (_, status_col) = artifact_columns(kind);
    db.with_conn(|conn| {
        let changed = conn.execute(
            &format!("UPDATE scenes SET {status_col}=?3, updated_at=?4 WHERE id=?1 AND {status_col}=?2"),
            params![
                scene_id,
                from.as_str(),
                to.as_str(),
                format_timestamp(Utc::now())
            ],
        )?;
        Ok(changed > 0)
    })
}

/// Marks an artifact as `generating` on every listed scene. Used when a
/// fan-out stage starts.
pub fn mark_artifacts_generating(
    db: &Database,
    scene_ids: &[String],
    kind: ArtifactKind,
) -> Result<(), DatabaseError> {
    let (_, status_col) = artifact_columns(kind);
    db.with_conn(|conn| {
        let now = format_timestamp(Utc::now());
        for scene_id in scene_ids {
            conn.execute(
                &format!("UPDATE scenes SET {status_col}='generating', updated_at=?2 WHERE id=?1"),
                params![scene_id, now],
            )?;
        }
        Ok(())
    })
}

fn artifact_columns(kind: ArtifactKind) -> (&'static str, &'static str) {
    match kind {
        ArtifactKind::Prompt => ("prompt", "prompt_status"),
        ArtifactKind::Image => ("image_url", "image_status"),
        ArtifactKind::Clip => ("clip_url", "clip_status"),
    }
}

/// Appends an approval decision to the audit log.
pub fn insert_approval(db: &Database, approval: &Approval) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO approvals (id, project_id, scene_id, target, approved, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                approval.id,
                approval.project_id,
                approval.scene_id,
                approval.target.as_str(),
                approval.approved,
                format_timestamp(approval.created_at),
            ],
        )?;
        Ok(())
    })
}

/// All approval decisions recorded for a project, oldest first.
pub fn list_approvals(db: &Database, project_id: &str) -> Result<Vec<Approval>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, project_id, scene_id, target, approved, created_at
             FROM approvals WHERE project_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![project_id], |row| {
                Ok((
                    row.get::<_, String>("id")?,
                    row.get::<_, String>("project_id")?,
                    row.get::<_, String>("scene_id")?,
                    row.get::<_, String>("target")?,
                    row.get::<_, bool>("approved")?,
                    row.get::<_, String>("created_at")?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, project_id, scene_id, target, approved, created_at)| {
                Ok(Approval {
                    target: ArtifactKind::parse(&target).ok_or_else(|| {
                        DatabaseError::Corrupt(format!("unknown approval target '{target}'"))
                    })?,
                    created_at: parse_timestamp(&created_at)?,
                    id,
                    project_id,
                    scene_id,
                    approved,
                })
            })
            .collect()
    })
}
