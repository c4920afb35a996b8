//! Orchestration engine for multi-stage music-video generation
//! pipelines: a durable SQLite-backed job store, a bounded worker pool
//! with retry and crash recovery, per-scene fan-out with configurable
//! partial-success handling, a project state machine with a human
//! approval gate, and ordered, replayable progress events.

pub mod aggregator;
pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod model;
pub mod scheduler;
pub mod task;

pub use broadcast::{ProgressEvent, ProgressEventKind, ProgressPublisher, Subscription};
pub use config::{load_config, OrchestratorConfig, PartialSuccessPolicy, StagePolicy};
pub use coordinator::{CoordinatorError, PipelineCoordinator, ProjectState};
pub use db::{Database, DatabaseError};
pub use error::{Result, SceneflowError};
pub use model::{
    Approval, ArtifactKind, ArtifactStatus, JobFailure, JobRecord, JobStatus, Project,
    ProjectStatus, Scene, StageKind,
};
pub use scheduler::{JobListener, Scheduler};
pub use task::{AudioLocator, CancelRegistry, CancelToken, HandlerRegistry, TaskError, TaskHandler};
