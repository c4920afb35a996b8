//! Fan-out / fan-in for the per-scene stages.
//!
//! Fan-out creates one aggregating parent job plus one child per scene,
//! inserted in a single batch so no child can be claimed before its
//! siblings exist. Fan-in runs on every child terminal event: parent
//! progress is recomputed from the store, and once every child is
//! terminal exactly one caller wins the parent's `running -> terminal`
//! compare-and-set.

use serde_json::json;

use crate::config::PartialSuccessPolicy;
use crate::db::{job_repo, Database, DatabaseError};
use crate::model::{JobFailure, JobRecord, JobStatus, StageKind};

/// What a child's terminal event did to its parent.
#[derive(Debug)]
pub struct FanInUpdate {
    /// Parent progress after this child: `terminal_children * 100 / total`.
    pub progress: u8,
    /// Set when this call settled the parent (all children terminal and
    /// this caller won the completion race).
    pub settled_parent: Option<JobRecord>,
}

/// Creates the parent and one child per seed, then moves the parent to
/// `running`. Returns the parent record.
pub fn expand(
    db: &Database,
    project_id: &str,
    stage: StageKind,
    seeds: &[(String, serde_json::Value)],
    max_attempts: u32,
    timeout_secs: u64,
) -> Result<JobRecord, DatabaseError> {
    let parent = JobRecord::fan_out_parent(project_id, stage, timeout_secs);
    let mut batch = vec![parent.clone()];
    for (scene_id, payload) in seeds {
        let mut payload = payload.clone();
        if let Some(map) = payload.as_object_mut() {
            map.insert("scene_id".to_string(), json!(scene_id));
        }
        batch.push(JobRecord::child(&parent, payload, max_attempts, timeout_secs));
    }
    job_repo::insert_many(db, &batch)?;

    // The parent tracks aggregation, not execution; mark it running so
    // fan-in can settle it with a normal terminal transition.
    job_repo::claim(db, &parent.id, parent.run_at)?;
    job_repo::find_by_id(db, &parent.id)?
        .ok_or_else(|| DatabaseError::NotFound(format!("job '{}'", parent.id)))
}

/// Adds children for seeds that do not already have one under this
/// parent. Used when a late approval batch joins an in-flight video
/// fan-out. Returns the new children; a parent that settled since the
/// caller looked it up surfaces as `Conflict`.
pub fn merge(
    db: &Database,
    parent: &JobRecord,
    seeds: &[(String, serde_json::Value)],
    max_attempts: u32,
    timeout_secs: u64,
) -> Result<Vec<JobRecord>, DatabaseError> {
    let existing = job_repo::list_by_parent(db, &parent.id)?;
    let mut added = Vec::new();
    for (scene_id, payload) in seeds {
        if existing
            .iter()
            .any(|c| c.scene_id() == Some(scene_id.as_str()))
        {
            continue;
        }
        let mut payload = payload.clone();
        if let Some(map) = payload.as_object_mut() {
            map.insert("scene_id".to_string(), json!(scene_id));
        }
        added.push(JobRecord::child(parent, payload, max_attempts, timeout_secs));
    }
    if !added.is_empty() {
        job_repo::insert_children(db, &parent.id, &added)?;
    }
    Ok(added)
}

/// Recomputes the parent after one of its children went terminal, and
/// settles the parent once the last child finishes.
pub fn on_child_terminal(
    db: &Database,
    parent_id: &str,
    policy: PartialSuccessPolicy,
) -> Result<FanInUpdate, DatabaseError> {
    let children = job_repo::list_by_parent(db, parent_id)?;
    let total = children.len();
    let terminal = children.iter().filter(|c| c.is_terminal()).count();
    let succeeded = children
        .iter()
        .filter(|c| c.status == JobStatus::Succeeded)
        .count();
    let failed = children
        .iter()
        .filter(|c| c.status == JobStatus::Failed)
        .count();

    let progress = if total == 0 {
        100
    } else {
        (terminal * 100 / total) as u8
    };
    job_repo::update_progress(db, parent_id, progress)?;

    if terminal < total {
        return Ok(FanInUpdate {
            progress,
            settled_parent: None,
        });
    }

    // All children terminal: settle the parent. Concurrent last-child
    // events both reach this point; the compare-and-set picks a winner.
    let parent_failed = match policy {
        PartialSuccessPolicy::AllOrNothing => failed > 0 || succeeded < total,
        PartialSuccessPolicy::BestEffort => succeeded == 0 && total > 0,
    };

    let outcome = if parent_failed {
        job_repo::fail(
            db,
            parent_id,
            &JobFailure::new(
                format!("{failed} of {total} scene jobs failed"),
                false,
            ),
        )
    } else {
        job_repo::complete(
            db,
            parent_id,
            &json!({
                "total": total,
                "succeeded": succeeded,
                "failed": failed,
            }),
        )
    };

    match outcome {
        Ok(()) => {
            let parent = job_repo::find_by_id(db, parent_id)?
                .ok_or_else(|| DatabaseError::NotFound(format!("job '{}'", parent_id)))?;
            Ok(FanInUpdate {
                progress,
                settled_parent: Some(parent),
            })
        }
        // Someone else settled it first.
        Err(e) if e.is_conflict() => Ok(FanInUpdate {
            progress,
            settled_parent: None,
        }),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::project_repo;
    use crate::model::Project;
    use chrono::Utc;

    fn setup() -> (Database, Project) {
        let db = Database::open_in_memory().unwrap();
        let project = Project::new("test");
        project_repo::insert(&db, &project).unwrap();
        (db, project)
    }

    fn seeds(n: usize) -> Vec<(String, serde_json::Value)> {
        (0..n)
            .map(|i| (format!("s{i}"), json!({"prompt": format!("p{i}")})))
            .collect()
    }

    fn finish_child(db: &Database, child: &JobRecord, ok: bool) {
        job_repo::claim(db, &child.id, Utc::now()).unwrap();
        if ok {
            job_repo::complete(db, &child.id, &json!({"url": "u"})).unwrap();
        } else {
            job_repo::fail(db, &child.id, &JobFailure::new("boom", false)).unwrap();
        }
    }

    #[test]
    fn test_expand_creates_running_parent_and_children() {
        let (db, project) = setup();
        let parent = expand(
            &db,
            &project.id,
            StageKind::ImageGeneration,
            &seeds(3),
            3,
            600,
        )
        .unwrap();
        assert_eq!(parent.status, JobStatus::Running);
        assert!(parent.fan_out);

        let children = job_repo::list_by_parent(&db, &parent.id).unwrap();
        assert_eq!(children.len(), 3);
        assert!(children.iter().all(|c| c.status == JobStatus::Pending));
        assert_eq!(children[0].scene_id(), Some("s0"));
        assert_eq!(children[0].payload["prompt"], "p0");
    }

    #[test]
    fn test_fan_in_progress_and_settlement() {
        let (db, project) = setup();
        let parent = expand(
            &db,
            &project.id,
            StageKind::ImageGeneration,
            &seeds(4),
            3,
            600,
        )
        .unwrap();
        let children = job_repo::list_by_parent(&db, &parent.id).unwrap();

        finish_child(&db, &children[0], true);
        let update =
            on_child_terminal(&db, &parent.id, PartialSuccessPolicy::BestEffort).unwrap();
        assert_eq!(update.progress, 25);
        assert!(update.settled_parent.is_none());

        for child in &children[1..] {
            finish_child(&db, child, true);
        }
        let update =
            on_child_terminal(&db, &parent.id, PartialSuccessPolicy::BestEffort).unwrap();
        assert_eq!(update.progress, 100);
        let settled = update.settled_parent.unwrap();
        assert_eq!(settled.status, JobStatus::Succeeded);
        assert_eq!(settled.result.as_ref().unwrap()["succeeded"], 4);
    }

    #[test]
    fn test_settlement_is_exactly_once() {
        let (db, project) = setup();
        let parent = expand(
            &db,
            &project.id,
            StageKind::ImageGeneration,
            &seeds(1),
            3,
            600,
        )
        .unwrap();
        let children = job_repo::list_by_parent(&db, &parent.id).unwrap();
        finish_child(&db, &children[0], true);

        let first = on_child_terminal(&db, &parent.id, PartialSuccessPolicy::BestEffort).unwrap();
        assert!(first.settled_parent.is_some());
        // A duplicate terminal notification loses the race quietly.
        let second = on_child_terminal(&db, &parent.id, PartialSuccessPolicy::BestEffort).unwrap();
        assert!(second.settled_parent.is_none());
    }

    #[test]
    fn test_best_effort_tolerates_partial_failure() {
        let (db, project) = setup();
        let parent = expand(
            &db,
            &project.id,
            StageKind::ImageGeneration,
            &seeds(3),
            3,
            600,
        )
        .unwrap();
        let children = job_repo::list_by_parent(&db, &parent.id).unwrap();
        finish_child(&db, &children[0], true);
        finish_child(&db, &children[1], false);
        finish_child(&db, &children[2], true);

        let update =
            on_child_terminal(&db, &parent.id, PartialSuccessPolicy::BestEffort).unwrap();
        let settled = update.settled_parent.unwrap();
        assert_eq!(settled.status, JobStatus::Succeeded);
        assert_eq!(settled.result.as_ref().unwrap()["failed"], 1);
    }

    #[test]
    fn test_all_or_nothing_fails_on_any_child_failure() {
        let (db, project) = setup();
        let parent = expand(
            &db,
            &project.id,
            StageKind::VideoGeneration,
            &seeds(2),
            3,
            600,
        )
        .unwrap();
        let children = job_repo::list_by_parent(&db, &parent.id).unwrap();
        finish_child(&db, &children[0], true);
        finish_child(&db, &children[1], false);

        let update =
            on_child_terminal(&db, &parent.id, PartialSuccessPolicy::AllOrNothing).unwrap();
        let settled = update.settled_parent.unwrap();
        assert_eq!(settled.status, JobStatus::Failed);
    }

    #[test]
    fn test_best_effort_fails_when_everything_failed() {
        let (db, project) = setup();
        let parent = expand(
            &db,
            &project.id,
            StageKind::ImageGeneration,
            &seeds(2),
            3,
            600,
        )
        .unwrap();
        let children = job_repo::list_by_parent(&db, &parent.id).unwrap();
        finish_child(&db, &children[0], false);
        finish_child(&db, &children[1], false);

        let update =
            on_child_terminal(&db, &parent.id, PartialSuccessPolicy::BestEffort).unwrap();
        assert_eq!(update.settled_parent.unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_merge_skips_existing_scenes() {
        let (db, project) = setup();
        let parent = expand(
            &db,
            &project.id,
            StageKind::VideoGeneration,
            &seeds(2),
            3,
            600,
        )
        .unwrap();

        let mut late = seeds(3);
        late.remove(0);
        let added = merge(&db, &parent, &late, 3, 600).unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].scene_id(), Some("s2"));
        assert_eq!(job_repo::list_by_parent(&db, &parent.id).unwrap().len(), 3);
    }

    #[test]
    fn test_merge_rejects_settled_parent() {
        let (db, project) = setup();
        let parent = expand(
            &db,
            &project.id,
            StageKind::VideoGeneration,
            &seeds(1),
            3,
            600,
        )
        .unwrap();
        let children = job_repo::list_by_parent(&db, &parent.id).unwrap();
        finish_child(&db, &children[0], true);
        let update =
            on_child_terminal(&db, &parent.id, PartialSuccessPolicy::BestEffort).unwrap();
        assert!(update.settled_parent.is_some());

        // A batch arriving after settlement must not append orphans
        // that would run with nobody left to aggregate them.
        let err = merge(&db, &parent, &seeds(2), 3, 600).unwrap_err();
        assert!(err.is_conflict(), "got {err}");
        assert_eq!(job_repo::list_by_parent(&db, &parent.id).unwrap().len(), 1);
        assert!(job_repo::list_runnable(&db, Utc::now()).unwrap().is_empty());
    }
}
