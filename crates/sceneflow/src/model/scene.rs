use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a single generated artifact on a scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    NotStarted,
    Generating,
    AwaitingApproval,
    Approved,
    Failed,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::NotStarted => "not_started",
            ArtifactStatus::Generating => "generating",
            ArtifactStatus::AwaitingApproval => "awaiting_approval",
            ArtifactStatus::Approved => "approved",
            ArtifactStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(ArtifactStatus::NotStarted),
            "generating" => Some(ArtifactStatus::Generating),
            "awaiting_approval" => Some(ArtifactStatus::AwaitingApproval),
            "approved" => Some(ArtifactStatus::Approved),
            "failed" => Some(ArtifactStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which per-scene artifact an approval or status update refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Prompt,
    Image,
    Clip,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Prompt => "prompt",
            ArtifactKind::Image => "image",
            ArtifactKind::Clip => "clip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prompt" => Some(ArtifactKind::Prompt),
            "image" => Some(ArtifactKind::Image),
            "clip" => Some(ArtifactKind::Clip),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lyric segment chosen for visualization, with its generated
/// artifacts. One scene produces at most one prompt, one image, and one
/// clip; each artifact tracks its own status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub project_id: String,
    /// Position in the final video, 0-based.
    pub order_idx: u32,
    pub start_s: f64,
    pub end_s: f64,
    /// The lyric excerpt this scene covers.
    pub excerpt: String,
    pub theme: String,
    pub reasoning: Option<String>,
    pub prompt: Option<String>,
    pub prompt_status: ArtifactStatus,
    pub image_url: Option<String>,
    pub image_status: ArtifactStatus,
    pub clip_url: Option<String>,
    pub clip_status: ArtifactStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Scene {
    pub fn new(
        project_id: &str,
        order_idx: u32,
        start_s: f64,
        end_s: f64,
        excerpt: &str,
        theme: &str,
        reasoning: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            order_idx,
            start_s,
            end_s,
            excerpt: excerpt.to_string(),
            theme: theme.to_string(),
            reasoning,
            prompt: None,
            prompt_status: ArtifactStatus::NotStarted,
            image_url: None,
            image_status: ArtifactStatus::NotStarted,
            clip_url: None,
            clip_status: ArtifactStatus::NotStarted,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An approval decision recorded against a scene artifact. Rows are
/// append-only; the effective state lives on the scene's artifact status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub project_id: String,
    pub scene_id: String,
    pub target: ArtifactKind,
    pub approved: bool,
    pub created_at: DateTime<Utc>,
}

impl Approval {
    pub fn new(project_id: &str, scene_id: &str, target: ArtifactKind, approved: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            scene_id: scene_id.to_string(),
            target,
            approved,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_status_round_trip() {
        for status in [
            ArtifactStatus::NotStarted,
            ArtifactStatus::Generating,
            ArtifactStatus::AwaitingApproval,
            ArtifactStatus::Approved,
            ArtifactStatus::Failed,
        ] {
            assert_eq!(ArtifactStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ArtifactStatus::parse("pending_review"), None);
    }

    #[test]
    fn test_new_scene_has_no_artifacts() {
        let scene = Scene::new("p1", 0, 12.5, 18.0, "chorus line", "neon city", None);
        assert_eq!(scene.prompt_status, ArtifactStatus::NotStarted);
        assert_eq!(scene.image_status, ArtifactStatus::NotStarted);
        assert_eq!(scene.clip_status, ArtifactStatus::NotStarted);
        assert!(scene.prompt.is_none());
        assert!(scene.image_url.is_none());
        assert!(scene.clip_url.is_none());
    }
}
