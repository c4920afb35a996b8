use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::StageKind;

/// Project lifecycle state.
///
/// The happy path advances along the stage chain; `Failed` and `Stale`
/// remember which stage was interrupted so the project can be resumed
/// from that point. Stored as a string, with the stage suffixed after a
/// colon for the parameterized states (`failed:image_generation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Created,
    Transcribing,
    Analyzing,
    Prompting,
    GeneratingImages,
    ReviewingImages,
    GeneratingVideos,
    Assembling,
    Complete,
    Failed(StageKind),
    Stale(StageKind),
}

impl ProjectStatus {
    pub fn as_db_str(&self) -> String {
        match self {
            ProjectStatus::Created => "created".to_string(),
            ProjectStatus::Transcribing => "transcribing".to_string(),
            ProjectStatus::Analyzing => "analyzing".to_string(),
            ProjectStatus::Prompting => "prompting".to_string(),
            ProjectStatus::GeneratingImages => "generating_images".to_string(),
            ProjectStatus::ReviewingImages => "reviewing_images".to_string(),
            ProjectStatus::GeneratingVideos => "generating_videos".to_string(),
            ProjectStatus::Assembling => "assembling".to_string(),
            ProjectStatus::Complete => "complete".to_string(),
            ProjectStatus::Failed(stage) => format!("failed:{}", stage.as_str()),
            ProjectStatus::Stale(stage) => format!("stale:{}", stage.as_str()),
        }
    }

    pub fn parse_db(s: &str) -> Option<Self> {
        if let Some(stage) = s.strip_prefix("failed:") {
            return StageKind::parse(stage).map(ProjectStatus::Failed);
        }
        if let Some(stage) = s.strip_prefix("stale:") {
            return StageKind::parse(stage).map(ProjectStatus::Stale);
        }
        match s {
            "created" => Some(ProjectStatus::Created),
            "transcribing" => Some(ProjectStatus::Transcribing),
            "analyzing" => Some(ProjectStatus::Analyzing),
            "prompting" => Some(ProjectStatus::Prompting),
            "generating_images" => Some(ProjectStatus::GeneratingImages),
            "reviewing_images" => Some(ProjectStatus::ReviewingImages),
            "generating_videos" => Some(ProjectStatus::GeneratingVideos),
            "assembling" => Some(ProjectStatus::Assembling),
            "complete" => Some(ProjectStatus::Complete),
            _ => None,
        }
    }

    /// The working status a project shows while the given stage runs.
    pub fn working_status(stage: StageKind) -> ProjectStatus {
        match stage {
            StageKind::Transcription => ProjectStatus::Transcribing,
            StageKind::SceneSelection => ProjectStatus::Analyzing,
            StageKind::PromptGeneration => ProjectStatus::Prompting,
            StageKind::ImageGeneration => ProjectStatus::GeneratingImages,
            StageKind::VideoGeneration => ProjectStatus::GeneratingVideos,
            StageKind::Assembly => ProjectStatus::Assembling,
        }
    }

    /// The stage the project is working on, waiting on, or was
    /// interrupted in. `None` for `Created` and `Complete`.
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            ProjectStatus::Created | ProjectStatus::Complete => None,
            ProjectStatus::Transcribing => Some(StageKind::Transcription),
            ProjectStatus::Analyzing => Some(StageKind::SceneSelection),
            ProjectStatus::Prompting => Some(StageKind::PromptGeneration),
            ProjectStatus::GeneratingImages | ProjectStatus::ReviewingImages => {
                Some(StageKind::ImageGeneration)
            }
            ProjectStatus::GeneratingVideos => Some(StageKind::VideoGeneration),
            ProjectStatus::Assembling => Some(StageKind::Assembly),
            ProjectStatus::Failed(stage) | ProjectStatus::Stale(stage) => Some(*stage),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectStatus::Complete)
    }

    /// Legal status edges. The forward chain admits exactly one next
    /// working state; any non-terminal state may drop to `Failed` or
    /// `Stale`, and those recover only into the working state of the
    /// stage they recorded.
    pub fn can_transition(self, next: ProjectStatus) -> bool {
        use ProjectStatus::*;
        match (self, next) {
            (Created, Transcribing)
            | (Transcribing, Analyzing)
            | (Analyzing, Prompting)
            | (Prompting, GeneratingImages)
            | (GeneratingImages, ReviewingImages)
            | (ReviewingImages, GeneratingVideos)
            | (GeneratingVideos, Assembling)
            | (Assembling, Complete) => true,
            (from, Failed(_)) | (from, Stale(_)) => !matches!(from, Complete | Failed(_)),
            (Failed(stage), to) | (Stale(stage), to) => to == Self::working_status(stage),
            _ => false,
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_db_str())
    }
}

/// A music-video project: one audio track driving the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            status: ProjectStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_db_round_trip() {
        let all = [
            ProjectStatus::Created,
            ProjectStatus::Transcribing,
            ProjectStatus::Analyzing,
            ProjectStatus::Prompting,
            ProjectStatus::GeneratingImages,
            ProjectStatus::ReviewingImages,
            ProjectStatus::GeneratingVideos,
            ProjectStatus::Assembling,
            ProjectStatus::Complete,
            ProjectStatus::Failed(StageKind::ImageGeneration),
            ProjectStatus::Stale(StageKind::Transcription),
        ];
        for status in all {
            assert_eq!(ProjectStatus::parse_db(&status.as_db_str()), Some(status));
        }
        assert_eq!(
            ProjectStatus::Failed(StageKind::ImageGeneration).as_db_str(),
            "failed:image_generation"
        );
        assert_eq!(ProjectStatus::parse_db("failed:muxing"), None);
        assert_eq!(ProjectStatus::parse_db("paused"), None);
    }

    #[test]
    fn test_forward_chain() {
        use ProjectStatus::*;
        let chain = [
            Created,
            Transcribing,
            Analyzing,
            Prompting,
            GeneratingImages,
            ReviewingImages,
            GeneratingVideos,
            Assembling,
            Complete,
        ];
        for pair in chain.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        // No skipping.
        assert!(!Created.can_transition(Analyzing));
        assert!(!GeneratingImages.can_transition(GeneratingVideos));
        // No going back.
        assert!(!Analyzing.can_transition(Transcribing));
    }

    #[test]
    fn test_failure_and_recovery_edges() {
        use ProjectStatus::*;
        let stage = StageKind::VideoGeneration;
        assert!(GeneratingVideos.can_transition(Failed(stage)));
        assert!(GeneratingVideos.can_transition(Stale(stage)));
        assert!(!Complete.can_transition(Failed(stage)));
        // Failure is sticky until resumed into the recorded stage.
        assert!(!Failed(stage).can_transition(Failed(stage)));
        assert!(Failed(stage).can_transition(GeneratingVideos));
        assert!(!Failed(stage).can_transition(Assembling));
        assert!(Stale(stage).can_transition(GeneratingVideos));
        assert!(!Stale(stage).can_transition(Complete));
    }

    #[test]
    fn test_working_status_stage_inverse() {
        for stage in StageKind::ALL {
            assert_eq!(ProjectStatus::working_status(stage).stage(), Some(stage));
        }
        assert_eq!(ProjectStatus::Created.stage(), None);
        assert_eq!(ProjectStatus::Complete.stage(), None);
        assert_eq!(
            ProjectStatus::ReviewingImages.stage(),
            Some(StageKind::ImageGeneration)
        );
    }
}
