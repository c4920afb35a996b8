use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One ordered step of the pipeline.
///
/// `ImageGeneration` and `VideoGeneration` fan out into one child job per
/// scene; the remaining stages run as a single project-level job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Transcription,
    SceneSelection,
    PromptGeneration,
    ImageGeneration,
    VideoGeneration,
    Assembly,
}

impl StageKind {
    /// All stages in pipeline order.
    pub const ALL: [StageKind; 6] = [
        StageKind::Transcription,
        StageKind::SceneSelection,
        StageKind::PromptGeneration,
        StageKind::ImageGeneration,
        StageKind::VideoGeneration,
        StageKind::Assembly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Transcription => "transcription",
            StageKind::SceneSelection => "scene_selection",
            StageKind::PromptGeneration => "prompt_generation",
            StageKind::ImageGeneration => "image_generation",
            StageKind::VideoGeneration => "video_generation",
            StageKind::Assembly => "assembly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transcription" => Some(StageKind::Transcription),
            "scene_selection" => Some(StageKind::SceneSelection),
            "prompt_generation" => Some(StageKind::PromptGeneration),
            "image_generation" => Some(StageKind::ImageGeneration),
            "video_generation" => Some(StageKind::VideoGeneration),
            "assembly" => Some(StageKind::Assembly),
            _ => None,
        }
    }

    /// Whether this stage expands into per-scene child jobs.
    pub fn is_fan_out(&self) -> bool {
        matches!(
            self,
            StageKind::ImageGeneration | StageKind::VideoGeneration
        )
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a schedulable unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal lifecycle edges. Success and cancellation are final;
    /// `Running -> Pending` is the requeue path (retry backoff, stale
    /// sweep), `Failed -> Pending` the manual retry path, and
    /// `Failed -> Running` reopens a fan-out parent on resume.
    /// `Cancelled -> Pending` lets a resumed project requeue work that a
    /// cancel swept up.
    pub fn can_transition(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Pending)
                | (Failed, Pending)
                | (Failed, Running)
                | (Cancelled, Pending)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    /// Whether the failing operation could have succeeded on retry
    /// (rate limit, network) as opposed to a malformed payload.
    pub retryable: bool,
}

impl JobFailure {
    pub fn new(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            message: message.into(),
            retryable,
        }
    }
}

/// A durable, schedulable unit of work.
///
/// Fan-out parents (`fan_out == true`) are never claimed by the worker
/// pool; they aggregate their children and are completed by the fan-in
/// path. Exactly one of `result`/`error` is set once the job is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub project_id: String,
    pub stage: StageKind,
    pub status: JobStatus,
    /// 0-100, monotonically non-decreasing while running.
    pub progress: u8,
    /// Immutable input for the stage handler.
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<JobFailure>,
    /// Executions started so far (incremented on claim).
    pub attempts: u32,
    pub max_attempts: u32,
    /// Set on fan-out children; points at the aggregating parent.
    pub parent_id: Option<String>,
    pub fan_out: bool,
    /// Earliest claimable time; encodes the retry backoff delay.
    pub run_at: DateTime<Utc>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Creates a pending project-level job.
    pub fn new(
        project_id: &str,
        stage: StageKind,
        payload: serde_json::Value,
        max_attempts: u32,
        timeout_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            stage,
            status: JobStatus::Pending,
            progress: 0,
            payload,
            result: None,
            error: None,
            attempts: 0,
            max_attempts,
            parent_id: None,
            fan_out: false,
            run_at: now,
            heartbeat_at: None,
            timeout_secs,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates the aggregating parent of a fan-out stage.
    pub fn fan_out_parent(project_id: &str, stage: StageKind, timeout_secs: u64) -> Self {
        let mut job = Self::new(project_id, stage, serde_json::json!({}), 1, timeout_secs);
        job.fan_out = true;
        job
    }

    /// Creates one per-scene child under a fan-out parent.
    pub fn child(
        parent: &JobRecord,
        payload: serde_json::Value,
        max_attempts: u32,
        timeout_secs: u64,
    ) -> Self {
        let mut job = Self::new(
            &parent.project_id,
            parent.stage,
            payload,
            max_attempts,
            timeout_secs,
        );
        job.parent_id = Some(parent.id.clone());
        job
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The scene this fan-out child works on, if its payload carries one.
    pub fn scene_id(&self) -> Option<&str> {
        self.payload.get("scene_id").and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_round_trip() {
        for stage in StageKind::ALL {
            assert_eq!(StageKind::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(StageKind::parse("muxing"), None);
    }

    #[test]
    fn test_fan_out_stages() {
        assert!(StageKind::ImageGeneration.is_fan_out());
        assert!(StageKind::VideoGeneration.is_fan_out());
        assert!(!StageKind::Transcription.is_fan_out());
        assert!(!StageKind::Assembly.is_fan_out());
    }

    #[test]
    fn test_status_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition(Running));
        assert!(Running.can_transition(Succeeded));
        assert!(Running.can_transition(Failed));
        assert!(Running.can_transition(Pending));
        assert!(Failed.can_transition(Pending));

        // No terminal state may be skipped into from pending.
        assert!(!Pending.can_transition(Succeeded));
        assert!(!Pending.can_transition(Failed));
        // Success is final.
        assert!(!Succeeded.can_transition(Pending));
        assert!(!Succeeded.can_transition(Running));
    }

    #[test]
    fn test_new_job_is_pending() {
        let job = JobRecord::new("p1", StageKind::Transcription, serde_json::json!({}), 3, 60);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempts, 0);
        assert!(!job.fan_out);
        assert!(job.parent_id.is_none());
        assert!(!job.id.is_empty());
    }

    #[test]
    fn test_child_references_parent() {
        let parent = JobRecord::fan_out_parent("p1", StageKind::ImageGeneration, 600);
        assert!(parent.fan_out);

        let child = JobRecord::child(
            &parent,
            serde_json::json!({"scene_id": "s1"}),
            3,
            600,
        );
        assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(child.stage, StageKind::ImageGeneration);
        assert!(!child.fan_out);
        assert_eq!(child.scene_id(), Some("s1"));
    }

    #[test]
    fn test_failure_serde() {
        let failure = JobFailure::new("rate limited", true);
        let json = serde_json::to_string(&failure).unwrap();
        let back: JobFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, failure);
    }
}
