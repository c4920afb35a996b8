//! Ordered progress events, persisted per project and fanned out over
//! tokio broadcast channels.
//!
//! Delivery contract: every event carries a per-project sequence number
//! that is gapless in the store. Live delivery is at-least-once; a
//! subscriber that resumes with `last_seen` gets the stored backlog
//! plus the live stream and deduplicates by `seq`.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::{event_repo, project_repo, scene_repo, Database, DatabaseError};
use crate::model::{ArtifactKind, ArtifactStatus, JobStatus, StageKind};

/// What happened. Serialized with a `type` tag so subscribers can
/// switch on it without knowing every variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEventKind {
    /// The project moved to a new status.
    StageEntered { status: String },
    /// A job (or fan-out parent) reported progress.
    JobProgress {
        job_id: String,
        stage: StageKind,
        progress: u8,
    },
    /// A job reached a terminal status.
    JobTerminal {
        job_id: String,
        stage: StageKind,
        status: JobStatus,
        error: Option<String>,
    },
    /// An approval decision was applied to a scene artifact.
    ApprovalRecorded {
        scene_id: String,
        target: ArtifactKind,
        approved: bool,
    },
}

/// One progress event as stored and delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Strictly increasing, gapless per project.
    pub seq: u64,
    pub project_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ProgressEventKind,
}

/// Per-scene artifact states at subscription time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneSnapshot {
    pub scene_id: String,
    pub order_idx: u32,
    pub prompt_status: ArtifactStatus,
    pub image_status: ArtifactStatus,
    pub clip_status: ArtifactStatus,
}

/// Current project state delivered alongside a new subscription, so a
/// late subscriber does not need to replay from seq 0 to know where
/// things stand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub project_id: String,
    pub status: String,
    pub last_seq: u64,
    pub scenes: Vec<SceneSnapshot>,
}

/// A live subscription: snapshot, missed backlog, and the live channel.
pub struct Subscription {
    pub snapshot: ProjectSnapshot,
    /// Stored events with `seq > last_seen`, in order. May overlap with
    /// the first live deliveries; dedup by `seq`.
    pub backlog: Vec<ProgressEvent>,
    pub live: broadcast::Receiver<ProgressEvent>,
}

/// Persists and broadcasts progress events, one channel per project.
pub struct ProgressPublisher {
    db: Database,
    channels: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl ProgressPublisher {
    pub fn new(db: Database, capacity: usize) -> Self {
        Self {
            db,
            channels: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn sender(&self, project_id: &str) -> Result<broadcast::Sender<ProgressEvent>, DatabaseError> {
        let mut channels = self.channels.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        Ok(channels
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone())
    }

    /// Persists the event, then broadcasts it. Returns the assigned
    /// sequence number. A send with no live subscribers is fine.
    pub fn publish(
        &self,
        project_id: &str,
        kind: ProgressEventKind,
    ) -> Result<u64, DatabaseError> {
        let mut built: Option<ProgressEvent> = None;
        let seq = event_repo::append(&self.db, project_id, |seq| {
            let event = ProgressEvent {
                seq,
                project_id: project_id.to_string(),
                timestamp: Utc::now(),
                kind: kind.clone(),
            };
            let body = serde_json::to_string(&event)?;
            built = Some(event);
            Ok(body)
        })?;

        if let Some(event) = built {
            log::debug!("progress event {} seq {}: {:?}", project_id, seq, event.kind);
            let _ = self.sender(project_id)?.send(event);
        }
        Ok(seq)
    }

    /// Subscribes to a project's progress from `last_seen` (0 for the
    /// full history). The receiver is attached before the backlog is
    /// read, so an event published during subscription shows up in the
    /// backlog, the live stream, or both, and never in neither.
    pub fn subscribe(
        &self,
        project_id: &str,
        last_seen: u64,
    ) -> Result<Subscription, DatabaseError> {
        let live = self.sender(project_id)?.subscribe();

        let project = project_repo::require(&self.db, project_id)?;
        let scenes = scene_repo::list_by_project(&self.db, project_id)?;
        let rows = event_repo::list_after(&self.db, project_id, last_seen)?;
        let backlog = rows
            .into_iter()
            .map(|row| serde_json::from_str(&row.body).map_err(DatabaseError::Json))
            .collect::<Result<Vec<ProgressEvent>, _>>()?;
        let last_seq = backlog
            .last()
            .map(|e| e.seq)
            .unwrap_or(last_seen)
            .max(last_seen);

        Ok(Subscription {
            snapshot: ProjectSnapshot {
                project_id: project_id.to_string(),
                status: project.status.as_db_str(),
                last_seq,
                scenes: scenes
                    .into_iter()
                    .map(|s| SceneSnapshot {
                        scene_id: s.id,
                        order_idx: s.order_idx,
                        prompt_status: s.prompt_status,
                        image_status: s.image_status,
                        clip_status: s.clip_status,
                    })
                    .collect(),
            },
            backlog,
            live,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::project_repo;
    use crate::model::Project;

    fn setup() -> (ProgressPublisher, Project) {
        let db = Database::open_in_memory().unwrap();
        let project = Project::new("test");
        project_repo::insert(&db, &project).unwrap();
        (ProgressPublisher::new(db, 64), project)
    }

    #[test]
    fn test_publish_assigns_increasing_seq() {
        let (publisher, project) = setup();
        let s1 = publisher
            .publish(
                &project.id,
                ProgressEventKind::StageEntered {
                    status: "transcribing".to_string(),
                },
            )
            .unwrap();
        let s2 = publisher
            .publish(
                &project.id,
                ProgressEventKind::JobProgress {
                    job_id: "j1".to_string(),
                    stage: StageKind::Transcription,
                    progress: 50,
                },
            )
            .unwrap();
        assert_eq!((s1, s2), (1, 2));
    }

    #[test]
    fn test_event_body_round_trips() {
        let event = ProgressEvent {
            seq: 7,
            project_id: "p1".to_string(),
            timestamp: Utc::now(),
            kind: ProgressEventKind::JobTerminal {
                job_id: "j1".to_string(),
                stage: StageKind::ImageGeneration,
                status: JobStatus::Failed,
                error: Some("quota".to_string()),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"job_terminal\""));
        let back: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_subscribe_replays_backlog_and_streams_live() {
        let (publisher, project) = setup();
        for i in 0..3u8 {
            publisher
                .publish(
                    &project.id,
                    ProgressEventKind::JobProgress {
                        job_id: "j1".to_string(),
                        stage: StageKind::Transcription,
                        progress: i * 10,
                    },
                )
                .unwrap();
        }

        let mut sub = publisher.subscribe(&project.id, 1).unwrap();
        assert_eq!(
            sub.backlog.iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert_eq!(sub.snapshot.last_seq, 3);
        assert_eq!(sub.snapshot.status, "created");

        publisher
            .publish(
                &project.id,
                ProgressEventKind::StageEntered {
                    status: "transcribing".to_string(),
                },
            )
            .unwrap();
        let live = sub.live.recv().await.unwrap();
        assert_eq!(live.seq, 4);
    }

    #[test]
    fn test_channels_are_per_project() {
        let (publisher, project) = setup();
        let other = Project::new("other");
        project_repo::insert(&publisher.db, &other).unwrap();

        let mut sub = publisher.subscribe(&other.id, 0).unwrap();
        publisher
            .publish(
                &project.id,
                ProgressEventKind::StageEntered {
                    status: "transcribing".to_string(),
                },
            )
            .unwrap();
        // Nothing on the other project's channel.
        assert!(matches!(
            sub.live.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
