//! The pipeline coordinator: the only writer of project status.
//!
//! It reacts to terminal job events from the scheduler, materializes
//! scenes from stage results, launches the next stage, and handles the
//! human approval gate between image and video generation. All of its
//! decisions go through compare-and-set transitions, so a duplicate or
//! late event loses its race and is dropped instead of corrupting the
//! pipeline.

use std::sync::Arc;

use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::aggregator;
use crate::broadcast::{ProgressEventKind, ProgressPublisher};
use crate::config::OrchestratorConfig;
use crate::db::{job_repo, project_repo, scene_repo, Database, DatabaseError};
use crate::model::{
    Approval, ArtifactKind, ArtifactStatus, JobRecord, JobStatus, Project, ProjectStatus, Scene,
    StageKind,
};
use crate::scheduler::JobListener;
use crate::task::{AudioLocator, CancelRegistry};

/// Errors from coordinator operations.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// The operation does not apply in the project's current status.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A stage handler returned a result the next stage cannot consume.
    #[error("Malformed stage result: {0}")]
    MalformedResult(String),

    /// The project's audio could not be resolved.
    #[error("Audio unavailable: {0}")]
    Audio(String),
}

/// Everything a UI needs to render a project.
#[derive(Debug)]
pub struct ProjectState {
    pub project: Project,
    pub scenes: Vec<Scene>,
    pub jobs: Vec<JobRecord>,
}

/// Shape of a `scene_selection` result.
#[derive(Debug, Deserialize)]
struct SceneSpec {
    start_s: f64,
    end_s: f64,
    excerpt: String,
    theme: String,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Shape of a `prompt_generation` result entry.
#[derive(Debug, Deserialize)]
struct PromptSpec {
    scene_id: String,
    prompt: String,
}

pub struct PipelineCoordinator {
    db: Database,
    config: OrchestratorConfig,
    publisher: Arc<ProgressPublisher>,
    audio: Arc<dyn AudioLocator>,
    cancels: Arc<CancelRegistry>,
}

impl PipelineCoordinator {
    pub fn new(
        db: Database,
        config: OrchestratorConfig,
        publisher: Arc<ProgressPublisher>,
        audio: Arc<dyn AudioLocator>,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            db,
            config,
            publisher,
            audio,
            cancels,
        }
    }

    pub fn create_project(&self, name: &str) -> Result<Project, CoordinatorError> {
        let project = Project::new(name);
        project_repo::insert(&self.db, &project)?;
        info!("Created project {} ({})", project.id, name);
        Ok(project)
    }

    /// Kicks off the pipeline once the project's audio is in storage.
    pub fn on_audio_uploaded(&self, project_id: &str) -> Result<JobRecord, CoordinatorError> {
        let audio_ref = self
            .audio
            .resolve(project_id)
            .map_err(|e| CoordinatorError::Audio(e.message))?;

        self.set_status(project_id, ProjectStatus::Created, ProjectStatus::Transcribing)?;

        let policy = self.config.stage(StageKind::Transcription);
        let job = JobRecord::new(
            project_id,
            StageKind::Transcription,
            json!({ "audio_ref": audio_ref }),
            policy.max_attempts,
            policy.timeout_secs,
        );
        job_repo::insert(&self.db, &job)?;
        info!("Project {} started: transcription job {}", project_id, job.id);
        Ok(job)
    }

    /// Records image approval decisions and, once at least one image is
    /// approved, moves the project into video generation. Idempotent:
    /// re-submitting a decision for an already-settled scene is a no-op.
    /// A late batch while videos are already generating is merged into
    /// the in-flight fan-out.
    pub fn submit_approvals(
        &self,
        project_id: &str,
        decisions: &[(String, bool)],
    ) -> Result<(), CoordinatorError> {
        let project = project_repo::require(&self.db, project_id)?;
        if !matches!(
            project.status,
            ProjectStatus::ReviewingImages | ProjectStatus::GeneratingVideos
        ) {
            return Err(CoordinatorError::InvalidState(format!(
                "project {} is {}, approvals apply only during image review",
                project_id, project.status
            )));
        }

        let mut newly_approved = Vec::new();
        for (scene_id, approved) in decisions {
            let to = if *approved {
                ArtifactStatus::Approved
            } else {
                ArtifactStatus::Failed
            };
            let changed = scene_repo::advance_artifact_status(
                &self.db,
                scene_id,
                ArtifactKind::Image,
                ArtifactStatus::AwaitingApproval,
                to,
            )?;
            if !changed {
                continue;
            }
            scene_repo::insert_approval(
                &self.db,
                &Approval::new(project_id, scene_id, ArtifactKind::Image, *approved),
            )?;
            self.publisher.publish(
                project_id,
                ProgressEventKind::ApprovalRecorded {
                    scene_id: scene_id.clone(),
                    target: ArtifactKind::Image,
                    approved: *approved,
                },
            )?;
            if *approved {
                newly_approved.push(scene_id.clone());
            }
        }

        if newly_approved.is_empty() {
            return Ok(());
        }

        let seeds = self.video_seeds(project_id, &newly_approved)?;
        let policy = self.config.stage(StageKind::VideoGeneration);
        match project.status {
            ProjectStatus::ReviewingImages => {
                scene_repo::mark_artifacts_generating(&self.db, &newly_approved, ArtifactKind::Clip)?;
                // The fan-out must exist before the project reports
                // generating_videos.
                aggregator::expand(
                    &self.db,
                    project_id,
                    StageKind::VideoGeneration,
                    &seeds,
                    policy.max_attempts,
                    policy.timeout_secs,
                )?;
                self.set_status(
                    project_id,
                    ProjectStatus::ReviewingImages,
                    ProjectStatus::GeneratingVideos,
                )?;
            }
            ProjectStatus::GeneratingVideos => {
                let parent = job_repo::find_active(&self.db, project_id, StageKind::VideoGeneration)?
                    .ok_or_else(|| {
                        CoordinatorError::InvalidState(format!(
                            "project {} is generating videos but has no active fan-out",
                            project_id
                        ))
                    })?;
                scene_repo::mark_artifacts_generating(&self.db, &newly_approved, ArtifactKind::Clip)?;
                let added = match aggregator::merge(
                    &self.db,
                    &parent,
                    &seeds,
                    policy.max_attempts,
                    policy.timeout_secs,
                ) {
                    Ok(added) => added,
                    // The fan-out settled between the lookup and the
                    // insert; the project has already moved on.
                    Err(e) if e.is_conflict() => {
                        let current = project_repo::require(&self.db, project_id)?.status;
                        return Err(CoordinatorError::InvalidState(format!(
                            "video fan-out settled before the batch landed; project {} is {}",
                            project_id, current
                        )));
                    }
                    Err(e) => return Err(e.into()),
                };
                info!(
                    "Merged {} late-approved scenes into video fan-out {}",
                    added.len(),
                    parent.id
                );
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Returns a failed or cancelled job to the queue and restores the
    /// project's working status.
    pub fn retry_failed_job(&self, job_id: &str) -> Result<(), CoordinatorError> {
        let job = job_repo::find_by_id(&self.db, job_id)?
            .ok_or_else(|| DatabaseError::NotFound(format!("job '{}'", job_id)))?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(CoordinatorError::InvalidState(format!(
                "job {} is {}, only failed or cancelled jobs can be retried",
                job_id, job.status
            )));
        }
        job_repo::retry(&self.db, job_id)?;
        if let Some(scene_id) = job.scene_id() {
            let kind = match job.stage {
                StageKind::ImageGeneration => Some(ArtifactKind::Image),
                StageKind::VideoGeneration => Some(ArtifactKind::Clip),
                _ => None,
            };
            if let Some(kind) = kind {
                scene_repo::advance_artifact_status(
                    &self.db,
                    scene_id,
                    kind,
                    ArtifactStatus::Failed,
                    ArtifactStatus::Generating,
                )?;
            }
        }
        self.restore_working_status(&job.project_id, job.stage)?;
        Ok(())
    }

    /// Resumes a failed or stale project: requeues every failed or
    /// cancelled job of the interrupted stage, reopens a settled
    /// fan-out parent, and restores the working status.
    pub fn resume_project(&self, project_id: &str) -> Result<(), CoordinatorError> {
        let project = project_repo::require(&self.db, project_id)?;
        let stage = match project.status {
            ProjectStatus::Failed(stage) | ProjectStatus::Stale(stage) => stage,
            other => {
                return Err(CoordinatorError::InvalidState(format!(
                    "project {} is {}, nothing to resume",
                    project_id, other
                )))
            }
        };

        let jobs = job_repo::list_by_project(&self.db, project_id)?;
        for job in jobs.iter().filter(|j| j.stage == stage) {
            match job.status {
                JobStatus::Failed if job.fan_out => {
                    // The parent settles again once its retried
                    // children finish.
                    job_repo::reopen(&self.db, &job.id)?;
                }
                JobStatus::Failed | JobStatus::Cancelled => {
                    job_repo::retry(&self.db, &job.id)?;
                    if let Some(scene_id) = job.scene_id() {
                        let kind = match stage {
                            StageKind::ImageGeneration => Some(ArtifactKind::Image),
                            StageKind::VideoGeneration => Some(ArtifactKind::Clip),
                            _ => None,
                        };
                        if let Some(kind) = kind {
                            scene_repo::advance_artifact_status(
                                &self.db,
                                scene_id,
                                kind,
                                ArtifactStatus::Failed,
                                ArtifactStatus::Generating,
                            )?;
                        }
                    }
                }
                _ => {}
            }
        }

        self.set_status(project_id, project.status, ProjectStatus::working_status(stage))?;
        info!("Project {} resumed at {}", project_id, stage);
        Ok(())
    }

    /// Cancels every non-terminal job of a project and flips the cancel
    /// flags of executions in flight. The project keeps its status; a
    /// later `resume_project` is not applicable, but new approvals or a
    /// retry of individual jobs are.
    pub fn cancel_project(&self, project_id: &str) -> Result<usize, CoordinatorError> {
        let cancelled = job_repo::cancel_active_for_project(&self.db, project_id)?;
        for job in &cancelled {
            self.cancels.cancel(&job.id);
            self.publisher.publish(
                project_id,
                ProgressEventKind::JobTerminal {
                    job_id: job.id.clone(),
                    stage: job.stage,
                    status: JobStatus::Cancelled,
                    error: None,
                },
            )?;
        }
        info!("Cancelled {} jobs for project {}", cancelled.len(), project_id);
        Ok(cancelled.len())
    }

    /// Full project snapshot for UIs and debugging.
    pub fn project_state(&self, project_id: &str) -> Result<ProjectState, CoordinatorError> {
        Ok(ProjectState {
            project: project_repo::require(&self.db, project_id)?,
            scenes: scene_repo::list_by_project(&self.db, project_id)?,
            jobs: job_repo::list_by_project(&self.db, project_id)?,
        })
    }

    /// Reacts to a terminal job. Invoked by the scheduler through the
    /// `JobListener` seam.
    fn handle_terminal(&self, job: &JobRecord) -> Result<(), CoordinatorError> {
        if job.parent_id.is_some() {
            return self.handle_child_terminal(job);
        }
        match job.status {
            JobStatus::Succeeded => self.stage_completed(job),
            JobStatus::Failed => self.project_failed(&job.project_id, job.stage),
            _ => Ok(()),
        }
    }

    fn handle_child_terminal(&self, child: &JobRecord) -> Result<(), CoordinatorError> {
        let parent_id = child.parent_id.as_deref().unwrap_or_default();

        // Reflect the child outcome on its scene's artifact.
        if let Some(scene_id) = child.scene_id() {
            let kind = match child.stage {
                StageKind::ImageGeneration => ArtifactKind::Image,
                StageKind::VideoGeneration => ArtifactKind::Clip,
                other => {
                    return Err(CoordinatorError::MalformedResult(format!(
                        "fan-out child {} has non-fan-out stage {}",
                        child.id, other
                    )))
                }
            };
            match child.status {
                JobStatus::Succeeded => {
                    let url = child
                        .result
                        .as_ref()
                        .and_then(|r| r.get("url"))
                        .and_then(|u| u.as_str())
                        .ok_or_else(|| {
                            CoordinatorError::MalformedResult(format!(
                                "child {} succeeded without a 'url' in its result",
                                child.id
                            ))
                        })?;
                    // Images wait for human review; clips go straight
                    // to approved, assembly is gated on images only.
                    let status = match kind {
                        ArtifactKind::Image => ArtifactStatus::AwaitingApproval,
                        _ => ArtifactStatus::Approved,
                    };
                    scene_repo::set_artifact(&self.db, scene_id, kind, Some(url), status)?;
                }
                JobStatus::Failed => {
                    scene_repo::advance_artifact_status(
                        &self.db,
                        scene_id,
                        kind,
                        ArtifactStatus::Generating,
                        ArtifactStatus::Failed,
                    )?;
                }
                _ => {}
            }
        }

        let policy = self.config.stage(child.stage).partial_success;
        let update = aggregator::on_child_terminal(&self.db, parent_id, policy)?;
        self.publisher.publish(
            &child.project_id,
            ProgressEventKind::JobProgress {
                job_id: parent_id.to_string(),
                stage: child.stage,
                progress: update.progress,
            },
        )?;

        if let Some(parent) = update.settled_parent {
            self.publisher.publish(
                &parent.project_id,
                ProgressEventKind::JobTerminal {
                    job_id: parent.id.clone(),
                    stage: parent.stage,
                    status: parent.status,
                    error: parent.error.as_ref().map(|e| e.message.clone()),
                },
            )?;
            match parent.status {
                JobStatus::Succeeded => self.stage_completed(&parent)?,
                JobStatus::Failed => self.project_failed(&parent.project_id, parent.stage)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Advances the project and launches the next stage after a
    /// successful top-level (or fan-out parent) job.
    fn stage_completed(&self, job: &JobRecord) -> Result<(), CoordinatorError> {
        let project_id = &job.project_id;
        match job.stage {
            StageKind::Transcription => {
                self.advance(project_id, job.stage, ProjectStatus::Analyzing)?;
                let transcript = job.result.clone().unwrap_or(json!(null));
                self.enqueue(project_id, StageKind::SceneSelection, json!({ "transcript": transcript }))?;
            }
            StageKind::SceneSelection => {
                let scenes = self.materialize_scenes(job)?;
                self.advance(project_id, job.stage, ProjectStatus::Prompting)?;
                let scene_inputs: Vec<_> = scenes
                    .iter()
                    .map(|s| {
                        json!({
                            "scene_id": s.id,
                            "excerpt": s.excerpt,
                            "theme": s.theme,
                            "reasoning": s.reasoning,
                        })
                    })
                    .collect();
                self.enqueue(project_id, StageKind::PromptGeneration, json!({ "scenes": scene_inputs }))?;
            }
            StageKind::PromptGeneration => {
                self.store_prompts(job)?;
                self.advance(project_id, job.stage, ProjectStatus::GeneratingImages)?;
                self.fan_out_images(project_id)?;
            }
            StageKind::ImageGeneration => {
                self.advance(project_id, job.stage, ProjectStatus::ReviewingImages)?;
                info!("Project {} awaiting image approvals", project_id);
            }
            StageKind::VideoGeneration => {
                self.advance(project_id, job.stage, ProjectStatus::Assembling)?;
                let clips = self.assembly_clips(project_id)?;
                self.enqueue(project_id, StageKind::Assembly, json!({ "clips": clips }))?;
            }
            StageKind::Assembly => {
                self.advance(project_id, job.stage, ProjectStatus::Complete)?;
                info!("Project {} complete", project_id);
            }
        }
        Ok(())
    }

    fn materialize_scenes(&self, job: &JobRecord) -> Result<Vec<Scene>, CoordinatorError> {
        let specs: Vec<SceneSpec> = job
            .result
            .as_ref()
            .and_then(|r| r.get("scenes"))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CoordinatorError::MalformedResult(format!("scene list: {e}")))?
            .ok_or_else(|| {
                CoordinatorError::MalformedResult(format!(
                    "scene selection job {} returned no 'scenes'",
                    job.id
                ))
            })?;
        if specs.is_empty() {
            return Err(CoordinatorError::MalformedResult(format!(
                "scene selection job {} selected zero scenes",
                job.id
            )));
        }

        let scenes: Vec<Scene> = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                Scene::new(
                    &job.project_id,
                    i as u32,
                    spec.start_s,
                    spec.end_s,
                    &spec.excerpt,
                    &spec.theme,
                    spec.reasoning,
                )
            })
            .collect();
        scene_repo::insert_scenes(&self.db, &scenes)?;
        info!("Project {}: {} scenes selected", job.project_id, scenes.len());
        Ok(scenes)
    }

    /// Stores generated prompts. Prompts are auto-approved; the human
    /// checkpoint is on images, where rejection is actionable.
    fn store_prompts(&self, job: &JobRecord) -> Result<(), CoordinatorError> {
        let prompts: Vec<PromptSpec> = job
            .result
            .as_ref()
            .and_then(|r| r.get("prompts"))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| CoordinatorError::MalformedResult(format!("prompt list: {e}")))?
            .ok_or_else(|| {
                CoordinatorError::MalformedResult(format!(
                    "prompt job {} returned no 'prompts'",
                    job.id
                ))
            })?;
        for spec in prompts {
            scene_repo::set_prompt(&self.db, &spec.scene_id, &spec.prompt, ArtifactStatus::Approved)?;
        }
        Ok(())
    }

    fn fan_out_images(&self, project_id: &str) -> Result<(), CoordinatorError> {
        let scenes = scene_repo::list_by_project(&self.db, project_id)?;
        let seeds: Vec<(String, serde_json::Value)> = scenes
            .iter()
            .filter_map(|s| {
                s.prompt
                    .as_ref()
                    .map(|p| (s.id.clone(), json!({ "prompt": p })))
            })
            .collect();
        if seeds.is_empty() {
            return Err(CoordinatorError::InvalidState(format!(
                "project {} has no prompted scenes to render",
                project_id
            )));
        }
        let scene_ids: Vec<String> = seeds.iter().map(|(id, _)| id.clone()).collect();
        scene_repo::mark_artifacts_generating(&self.db, &scene_ids, ArtifactKind::Image)?;

        let policy = self.config.stage(StageKind::ImageGeneration);
        aggregator::expand(
            &self.db,
            project_id,
            StageKind::ImageGeneration,
            &seeds,
            policy.max_attempts,
            policy.timeout_secs,
        )?;
        Ok(())
    }

    fn video_seeds(
        &self,
        project_id: &str,
        scene_ids: &[String],
    ) -> Result<Vec<(String, serde_json::Value)>, CoordinatorError> {
        let scenes = scene_repo::list_by_project(&self.db, project_id)?;
        scene_ids
            .iter()
            .map(|id| {
                let scene = scenes.iter().find(|s| &s.id == id).ok_or_else(|| {
                    CoordinatorError::InvalidState(format!("unknown scene '{id}'"))
                })?;
                let image_url = scene.image_url.as_ref().ok_or_else(|| {
                    CoordinatorError::InvalidState(format!("scene '{id}' has no image"))
                })?;
                Ok((
                    scene.id.clone(),
                    json!({
                        "image_url": image_url,
                        "start_s": scene.start_s,
                        "end_s": scene.end_s,
                    }),
                ))
            })
            .collect()
    }

    /// Approved clips in playback order, for the assembly payload.
    fn assembly_clips(&self, project_id: &str) -> Result<Vec<serde_json::Value>, CoordinatorError> {
        let scenes = scene_repo::list_by_project(&self.db, project_id)?;
        let clips: Vec<_> = scenes
            .iter()
            .filter(|s| s.clip_status == ArtifactStatus::Approved && s.clip_url.is_some())
            .map(|s| {
                json!({
                    "scene_id": s.id,
                    "clip_url": s.clip_url,
                    "start_s": s.start_s,
                    "end_s": s.end_s,
                })
            })
            .collect();
        if clips.is_empty() {
            return Err(CoordinatorError::InvalidState(format!(
                "project {} has no approved clips to assemble",
                project_id
            )));
        }
        Ok(clips)
    }

    fn enqueue(
        &self,
        project_id: &str,
        stage: StageKind,
        payload: serde_json::Value,
    ) -> Result<JobRecord, CoordinatorError> {
        let policy = self.config.stage(stage);
        let job = JobRecord::new(
            project_id,
            stage,
            payload,
            policy.max_attempts,
            policy.timeout_secs,
        );
        job_repo::insert(&self.db, &job)?;
        Ok(job)
    }

    /// Moves a project from the working status of `stage` to `to`,
    /// first restoring the working status if the sweep marked the
    /// project stale while the stage was finishing.
    fn advance(
        &self,
        project_id: &str,
        stage: StageKind,
        to: ProjectStatus,
    ) -> Result<(), CoordinatorError> {
        let working = ProjectStatus::working_status(stage);
        let current = project_repo::require(&self.db, project_id)?.status;
        let from = if current == ProjectStatus::Stale(stage) {
            self.set_status(project_id, current, working)?;
            working
        } else {
            current
        };
        self.set_status(project_id, from, to)
    }

    fn project_failed(&self, project_id: &str, stage: StageKind) -> Result<(), CoordinatorError> {
        let current = project_repo::require(&self.db, project_id)?.status;
        let failed = ProjectStatus::Failed(stage);
        if !current.can_transition(failed) {
            warn!(
                "Project {} is {}, not marking {} after stage failure",
                project_id, current, failed
            );
            return Ok(());
        }
        self.set_status(project_id, current, failed)
    }

    /// CAS project transition plus the matching progress event. Only
    /// edges the status machine allows go through.
    fn set_status(
        &self,
        project_id: &str,
        from: ProjectStatus,
        to: ProjectStatus,
    ) -> Result<(), CoordinatorError> {
        if !from.can_transition(to) {
            return Err(CoordinatorError::InvalidState(format!(
                "illegal project transition {from} -> {to}"
            )));
        }
        project_repo::transition(&self.db, project_id, from, to)?;
        self.publisher.publish(
            project_id,
            ProgressEventKind::StageEntered {
                status: to.as_db_str(),
            },
        )?;
        Ok(())
    }

    fn restore_working_status(
        &self,
        project_id: &str,
        stage: StageKind,
    ) -> Result<(), CoordinatorError> {
        let current = project_repo::require(&self.db, project_id)?.status;
        match current {
            ProjectStatus::Failed(s) | ProjectStatus::Stale(s) if s == stage => {
                self.set_status(project_id, current, ProjectStatus::working_status(stage))
            }
            _ => Ok(()),
        }
    }
}

impl JobListener for PipelineCoordinator {
    fn on_job_terminal(&self, job: &JobRecord) {
        if let Err(e) = self.handle_terminal(job) {
            // A conflict means a duplicate or late event lost its race.
            if matches!(&e, CoordinatorError::Database(db) if db.is_conflict()) {
                return;
            }
            error!(
                "Failed to handle terminal job {} ({} {}): {e}",
                job.id, job.stage, job.status
            );
        }
    }
}
