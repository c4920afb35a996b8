//! Crash recovery: running jobs whose heartbeat went quiet past their
//! timeout are returned to the queue, and their project is flagged
//! stale so operators can see something was interrupted.
//!
//! The attempt counter is not touched here; the next claim increments
//! it as usual.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use crate::broadcast::{ProgressEventKind, ProgressPublisher};
use crate::db::{job_repo, project_repo, Database, DatabaseError};
use crate::model::ProjectStatus;

/// Requeues every expired running job. Returns how many were requeued.
pub fn sweep_expired(
    db: &Database,
    publisher: &ProgressPublisher,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let running = job_repo::list_running(db)?;
    let mut requeued = 0;

    for job in running {
        let deadline = match job.heartbeat_at {
            Some(hb) => hb + Duration::seconds(job.timeout_secs as i64),
            // Running without a heartbeat: claimed by a process that
            // died before its first beat. Use updated_at instead.
            None => job.updated_at + Duration::seconds(job.timeout_secs as i64),
        };
        if deadline > now {
            continue;
        }

        match job_repo::requeue(db, &job.id, now) {
            Ok(()) => {
                warn!(
                    "Requeued stale job {} (stage {}, last heartbeat {:?})",
                    job.id, job.stage, job.heartbeat_at
                );
                requeued += 1;
            }
            // The owning worker finished in the meantime.
            Err(e) if e.is_conflict() => continue,
            Err(e) => return Err(e),
        }

        mark_project_stale(db, publisher, &job.project_id, job.stage)?;
    }

    Ok(requeued)
}

fn mark_project_stale(
    db: &Database,
    publisher: &ProgressPublisher,
    project_id: &str,
    stage: crate::model::StageKind,
) -> Result<(), DatabaseError> {
    let project = project_repo::require(db, project_id)?;
    let stale = ProjectStatus::Stale(stage);
    if !project.status.can_transition(stale) {
        return Ok(());
    }
    match project_repo::transition(db, project_id, project.status, stale) {
        Ok(()) => {
            info!("Project {} marked {}", project_id, stale);
            publisher.publish(
                project_id,
                ProgressEventKind::StageEntered {
                    status: stale.as_db_str(),
                },
            )?;
            Ok(())
        }
        Err(e) if e.is_conflict() => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::project_repo;
    use crate::model::{JobRecord, JobStatus, Project, StageKind};

    fn setup() -> (Database, ProgressPublisher, Project) {
        let db = Database::open_in_memory().unwrap();
        let project = Project::new("test");
        project_repo::insert(&db, &project).unwrap();
        let publisher = ProgressPublisher::new(db.clone(), 64);
        (db, publisher, project)
    }

    fn running_job(db: &Database, project: &Project, timeout_secs: u64) -> JobRecord {
        let job = JobRecord::new(
            &project.id,
            StageKind::Transcription,
            serde_json::json!({}),
            3,
            timeout_secs,
        );
        job_repo::insert(db, &job).unwrap();
        job_repo::claim(db, &job.id, Utc::now()).unwrap()
    }

    #[test]
    fn test_fresh_heartbeat_is_left_running() {
        let (db, publisher, project) = setup();
        let job = running_job(&db, &project, 60);

        let requeued = sweep_expired(&db, &publisher, Utc::now()).unwrap();
        assert_eq!(requeued, 0);
        let j = job_repo::find_by_id(&db, &job.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Running);
    }

    #[test]
    fn test_expired_job_is_requeued_and_project_marked_stale() {
        let (db, publisher, project) = setup();
        project_repo::transition(
            &db,
            &project.id,
            ProjectStatus::Created,
            ProjectStatus::Transcribing,
        )
        .unwrap();
        let job = running_job(&db, &project, 60);

        let later = Utc::now() + Duration::seconds(120);
        let requeued = sweep_expired(&db, &publisher, later).unwrap();
        assert_eq!(requeued, 1);

        let j = job_repo::find_by_id(&db, &job.id).unwrap().unwrap();
        assert_eq!(j.status, JobStatus::Pending);
        // The claim already counted the lost attempt; the sweep adds none.
        assert_eq!(j.attempts, 1);

        let p = project_repo::require(&db, &project.id).unwrap();
        assert_eq!(p.status, ProjectStatus::Stale(StageKind::Transcription));
    }

    #[test]
    fn test_requeued_job_is_claimable_again() {
        let (db, publisher, project) = setup();
        let job = running_job(&db, &project, 60);

        let later = Utc::now() + Duration::seconds(120);
        sweep_expired(&db, &publisher, later).unwrap();
        let reclaimed = job_repo::claim(&db, &job.id, later).unwrap();
        assert_eq!(reclaimed.status, JobStatus::Running);
        assert_eq!(reclaimed.attempts, 2);
    }
}
