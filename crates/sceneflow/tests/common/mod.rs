//! Shared test utilities: a full orchestrator wired onto an in-memory
//! database with scripted stage handlers, plus polling helpers to
//! drive the scheduler deterministically (no background loop).

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use sceneflow::db::{job_repo, project_repo};
use sceneflow::{
    AudioLocator, CancelRegistry, CancelToken, Database, HandlerRegistry, JobStatus,
    OrchestratorConfig, PipelineCoordinator, Project, ProgressPublisher, ProjectStatus, Scheduler,
    StageKind, TaskError, TaskHandler,
};

/// Markers the scripted media handlers keep failing on with a
/// retryable error: a child job fails while any marker is a substring
/// of its payload. Keyed by content (scene themes end up in prompts),
/// so tests can doom a scene before its ID even exists.
#[derive(Default)]
pub struct FailPlan {
    pub image_markers: Mutex<HashSet<String>>,
    pub video_markers: Mutex<HashSet<String>>,
}

impl FailPlan {
    pub fn fail_image(&self, marker: &str) {
        self.image_markers.lock().unwrap().insert(marker.to_string());
    }

    pub fn fail_video(&self, marker: &str) {
        self.video_markers.lock().unwrap().insert(marker.to_string());
    }

    pub fn clear(&self) {
        self.image_markers.lock().unwrap().clear();
        self.video_markers.lock().unwrap().clear();
    }
}

struct TranscriptionHandler;

#[async_trait]
impl TaskHandler for TranscriptionHandler {
    async fn execute(&self, payload: &Value, _cancel: &CancelToken) -> Result<Value, TaskError> {
        let audio_ref = payload["audio_ref"].as_str().unwrap_or_default().to_string();
        Ok(json!({
            "audio_ref": audio_ref,
            "text": "first verse / bright chorus / quiet outro",
            "segments": [
                {"start_s": 0.0, "end_s": 10.0, "text": "first verse"},
                {"start_s": 10.0, "end_s": 20.0, "text": "bright chorus"},
                {"start_s": 20.0, "end_s": 30.0, "text": "quiet outro"},
            ]
        }))
    }
}

struct SceneSelectionHandler;

#[async_trait]
impl TaskHandler for SceneSelectionHandler {
    async fn execute(&self, _payload: &Value, _cancel: &CancelToken) -> Result<Value, TaskError> {
        Ok(json!({
            "scenes": [
                {"start_s": 0.0, "end_s": 10.0, "excerpt": "first verse", "theme": "dawn"},
                {"start_s": 10.0, "end_s": 20.0, "excerpt": "bright chorus", "theme": "flight"},
                {"start_s": 20.0, "end_s": 30.0, "excerpt": "quiet outro", "theme": "dusk"},
            ]
        }))
    }
}

struct PromptHandler;

#[async_trait]
impl TaskHandler for PromptHandler {
    async fn execute(&self, payload: &Value, _cancel: &CancelToken) -> Result<Value, TaskError> {
        let scenes = payload["scenes"]
            .as_array()
            .ok_or_else(|| TaskError::permanent("payload missing scenes"))?;
        let prompts: Vec<Value> = scenes
            .iter()
            .map(|s| {
                json!({
                    "scene_id": s["scene_id"],
                    "prompt": format!("cinematic shot of {}", s["theme"].as_str().unwrap_or("?")),
                })
            })
            .collect();
        Ok(json!({ "prompts": prompts }))
    }
}

/// Generates a fake media URL per scene, failing the scenes listed in
/// the plan with a retryable error every time.
struct MediaHandler {
    prefix: &'static str,
    plan: Arc<FailPlan>,
    image: bool,
}

#[async_trait]
impl TaskHandler for MediaHandler {
    async fn execute(&self, payload: &Value, _cancel: &CancelToken) -> Result<Value, TaskError> {
        let scene_id = payload["scene_id"]
            .as_str()
            .ok_or_else(|| TaskError::permanent("payload missing scene_id"))?;
        let haystack = payload.to_string();
        let markers = if self.image {
            self.plan.image_markers.lock().unwrap()
        } else {
            self.plan.video_markers.lock().unwrap()
        };
        if markers.iter().any(|m| haystack.contains(m.as_str())) {
            return Err(TaskError::transient("upstream 429"));
        }
        drop(markers);
        Ok(json!({ "url": format!("{}/{}", self.prefix, scene_id) }))
    }
}

struct AssemblyHandler;

#[async_trait]
impl TaskHandler for AssemblyHandler {
    async fn execute(&self, payload: &Value, _cancel: &CancelToken) -> Result<Value, TaskError> {
        let clips = payload["clips"]
            .as_array()
            .ok_or_else(|| TaskError::permanent("payload missing clips"))?;
        if clips.is_empty() {
            return Err(TaskError::permanent("no clips to assemble"));
        }
        Ok(json!({
            "video_url": "https://cdn.test/final.mp4",
            "clip_count": clips.len(),
        }))
    }
}

struct StorageStub;

impl AudioLocator for StorageStub {
    fn resolve(&self, project_id: &str) -> Result<String, TaskError> {
        Ok(format!("audio://{project_id}/track.mp3"))
    }
}

/// Installs a fmt subscriber once so `RUST_LOG=debug` works on tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config tuned for tests: millisecond backoffs, small retry budgets.
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    for stage in StageKind::ALL {
        let mut policy = config.stage(stage);
        policy.backoff_base_ms = 1;
        policy.backoff_cap_ms = 10;
        policy.max_attempts = 2;
        policy.timeout_secs = 5;
        config.stages.insert(stage, policy);
    }
    config
}

pub struct TestHarness {
    pub db: Database,
    pub coordinator: Arc<PipelineCoordinator>,
    pub scheduler: Scheduler,
    pub publisher: Arc<ProgressPublisher>,
    pub plan: Arc<FailPlan>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        init_tracing();
        let db = Database::open_in_memory().expect("in-memory db");
        let publisher = Arc::new(ProgressPublisher::new(db.clone(), 256));
        let cancels = Arc::new(CancelRegistry::new());
        let plan = Arc::new(FailPlan::default());

        let coordinator = Arc::new(PipelineCoordinator::new(
            db.clone(),
            config.clone(),
            publisher.clone(),
            Arc::new(StorageStub),
            cancels.clone(),
        ));

        let mut registry = HandlerRegistry::new();
        registry.register(StageKind::Transcription, Arc::new(TranscriptionHandler));
        registry.register(StageKind::SceneSelection, Arc::new(SceneSelectionHandler));
        registry.register(StageKind::PromptGeneration, Arc::new(PromptHandler));
        registry.register(
            StageKind::ImageGeneration,
            Arc::new(MediaHandler {
                prefix: "https://cdn.test/images",
                plan: plan.clone(),
                image: true,
            }),
        );
        registry.register(
            StageKind::VideoGeneration,
            Arc::new(MediaHandler {
                prefix: "https://cdn.test/clips",
                plan: plan.clone(),
                image: false,
            }),
        );
        registry.register(StageKind::Assembly, Arc::new(AssemblyHandler));

        let scheduler = Scheduler::new(
            db.clone(),
            registry,
            config,
            coordinator.clone(),
            publisher.clone(),
            cancels,
        );

        Self {
            db,
            coordinator,
            scheduler,
            publisher,
            plan,
        }
    }

    /// Creates a project and starts its pipeline.
    pub fn start_project(&self, name: &str) -> Project {
        let project = self.coordinator.create_project(name).expect("create project");
        self.coordinator
            .on_audio_uploaded(&project.id)
            .expect("start pipeline");
        project
    }

    /// Drives dispatch passes until the project reaches `status` or the
    /// deadline expires.
    pub async fn drive_until_status(&self, project_id: &str, status: ProjectStatus) {
        let ok = self
            .drive_until(|| {
                project_repo::require(&self.db, project_id)
                    .map(|p| p.status == status)
                    .unwrap_or(false)
            })
            .await;
        let actual = project_repo::require(&self.db, project_id).unwrap().status;
        assert!(ok, "project never reached {status}, stuck at {actual}");
    }

    /// Drives dispatch passes until `done` returns true (roughly two
    /// seconds of budget; handlers are all sub-millisecond).
    pub async fn drive_until<F: FnMut() -> bool>(&self, mut done: F) -> bool {
        for _ in 0..400 {
            self.scheduler.poll_once().expect("poll");
            tokio::time::sleep(Duration::from_millis(5)).await;
            if done() {
                return true;
            }
        }
        false
    }

    /// Scene IDs of a project in playback order.
    pub fn scene_ids(&self, project_id: &str) -> Vec<String> {
        sceneflow::db::scene_repo::list_by_project(&self.db, project_id)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect()
    }

    /// True when no job of the project is pending or running.
    pub fn quiescent(&self, project_id: &str) -> bool {
        job_repo::list_by_project(&self.db, project_id)
            .unwrap()
            .iter()
            .all(|j| !matches!(j.status, JobStatus::Pending | JobStatus::Running))
    }
}
