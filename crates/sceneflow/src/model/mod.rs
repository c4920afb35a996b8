//! Domain types: projects, jobs, scenes, and their lifecycle enums.

pub mod job;
pub mod project;
pub mod scene;

pub use job::{JobFailure, JobRecord, JobStatus, StageKind};
pub use project::{Project, ProjectStatus};
pub use scene::{Approval, ArtifactKind, ArtifactStatus, Scene};
