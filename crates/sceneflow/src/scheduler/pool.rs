//! The worker pool: claims due jobs, runs their stage handlers under
//! concurrency and wall-clock limits, and settles the outcome.
//!
//! Claiming is a compare-and-set, so several dispatchers (or a restart
//! racing an old process) can poll the same store: losing a claim race
//! skips the job rather than double-running it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::broadcast::{ProgressEventKind, ProgressPublisher};
use crate::config::OrchestratorConfig;
use crate::db::{job_repo, Database, DatabaseError};
use crate::model::{JobFailure, JobRecord, JobStatus, StageKind};
use crate::task::{CancelRegistry, CancelToken, HandlerRegistry, TaskError, TaskHandler};

use super::{backoff, sweep};

/// Callback for terminal job outcomes. The coordinator hangs its stage
/// sequencing off this seam; tests plug in recorders.
pub trait JobListener: Send + Sync {
    fn on_job_terminal(&self, job: &JobRecord);
}

/// A listener that does nothing. Useful for running the pool bare.
pub struct NoopListener;

impl JobListener for NoopListener {
    fn on_job_terminal(&self, _job: &JobRecord) {}
}

struct SchedulerInner {
    db: Database,
    registry: HandlerRegistry,
    config: OrchestratorConfig,
    listener: Arc<dyn JobListener>,
    publisher: Arc<ProgressPublisher>,
    cancels: Arc<CancelRegistry>,
    global: Arc<Semaphore>,
    stage_slots: HashMap<StageKind, Arc<Semaphore>>,
    shutdown: AtomicBool,
}

/// Polls the job store and runs due jobs on the tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        db: Database,
        registry: HandlerRegistry,
        config: OrchestratorConfig,
        listener: Arc<dyn JobListener>,
        publisher: Arc<ProgressPublisher>,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        let global = Arc::new(Semaphore::new(config.global_concurrency));
        let stage_slots = StageKind::ALL
            .iter()
            .map(|&stage| {
                (
                    stage,
                    Arc::new(Semaphore::new(config.stage(stage).concurrency)),
                )
            })
            .collect();

        Self {
            inner: Arc::new(SchedulerInner {
                db,
                registry,
                config,
                listener,
                publisher,
                cancels,
                global,
                stage_slots,
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Starts the polling loop. It runs until `shutdown()` is called;
    /// jobs already executing finish on their own.
    pub fn spawn(&self) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!(
                "Scheduler started (global concurrency {})",
                scheduler.inner.config.global_concurrency
            );
            let poll = Duration::from_millis(scheduler.inner.config.poll_interval_ms);
            let sweep_every = Duration::from_millis(scheduler.inner.config.sweep_interval_ms);
            let mut last_sweep = tokio::time::Instant::now();

            while !scheduler.inner.shutdown.load(Ordering::Relaxed) {
                if last_sweep.elapsed() >= sweep_every {
                    if let Err(e) = scheduler.sweep_once() {
                        error!("Stale-job sweep failed: {e}");
                    }
                    last_sweep = tokio::time::Instant::now();
                }
                if let Err(e) = scheduler.poll_once() {
                    error!("Dispatch poll failed: {e}");
                }
                tokio::time::sleep(poll).await;
            }
            info!("Scheduler stopped");
        })
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Relaxed)
    }

    /// One dispatch pass: claim and launch every due job that fits
    /// under the concurrency limits. Returns how many were launched.
    pub fn poll_once(&self) -> Result<usize, DatabaseError> {
        let inner = &self.inner;
        let due = job_repo::list_runnable(&inner.db, Utc::now())?;
        let mut launched = 0;

        for job in due {
            let Some(handler) = inner.registry.get(job.stage) else {
                debug!("No handler registered for stage {}, leaving job {}", job.stage, job.id);
                continue;
            };
            let Ok(global_permit) = Arc::clone(&inner.global).try_acquire_owned() else {
                break;
            };
            // Built for every stage in the constructor.
            let stage_sem = Arc::clone(&inner.stage_slots[&job.stage]);
            let Ok(stage_permit) = stage_sem.try_acquire_owned() else {
                continue;
            };

            let claimed = match job_repo::claim(&inner.db, &job.id, Utc::now()) {
                Ok(claimed) => claimed,
                // Another dispatcher got it, or it was cancelled.
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            };

            let scheduler = self.clone();
            let span = tracing::info_span!(
                "job",
                id = %claimed.id,
                stage = %claimed.stage,
                attempt = claimed.attempts,
            );
            tokio::spawn(
                async move {
                    scheduler.execute(claimed, handler).await;
                    drop(global_permit);
                    drop(stage_permit);
                }
                .instrument(span),
            );
            launched += 1;
        }
        Ok(launched)
    }

    /// One stale-job sweep pass.
    pub fn sweep_once(&self) -> Result<usize, DatabaseError> {
        sweep::sweep_expired(&self.inner.db, &self.inner.publisher, Utc::now())
    }

    async fn execute(&self, job: JobRecord, handler: Arc<dyn TaskHandler>) {
        let inner = &self.inner;
        let token = CancelToken::new();
        inner.cancels.register(&job.id, token.clone());

        let heartbeat = {
            let db = inner.db.clone();
            let job_id = job.id.clone();
            let every = Duration::from_millis(inner.config.heartbeat_interval_ms);
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(every);
                tick.tick().await; // first tick fires immediately
                loop {
                    tick.tick().await;
                    if let Err(e) = job_repo::heartbeat(&db, &job_id, Utc::now()) {
                        warn!("Heartbeat for job {job_id} failed: {e}");
                    }
                }
            })
        };

        debug!("Executing job {} (attempt {})", job.id, job.attempts);
        let budget = Duration::from_secs(job.timeout_secs);
        let outcome = match tokio::time::timeout(budget, handler.execute(&job.payload, &token)).await
        {
            Ok(result) => result,
            Err(_) => Err(TaskError::transient(format!(
                "timed out after {}s",
                job.timeout_secs
            ))),
        };

        heartbeat.abort();
        inner.cancels.remove(&job.id);

        if let Err(e) = self.settle(&job, outcome) {
            error!("Failed to settle job {}: {e}", job.id);
        }
    }

    /// Records the outcome of one execution and fires events. A
    /// compare-and-set conflict here means the job was cancelled (or
    /// swept) while running; the outcome is discarded.
    fn settle(&self, job: &JobRecord, outcome: Result<serde_json::Value, TaskError>) -> Result<(), DatabaseError> {
        let inner = &self.inner;
        match outcome {
            Ok(result) => match job_repo::complete(&inner.db, &job.id, &result) {
                Ok(()) => {
                    debug!("Job {} succeeded", job.id);
                    self.publish_terminal(job, JobStatus::Succeeded, None)?;
                    self.notify_terminal(&job.id)?;
                    Ok(())
                }
                Err(e) if e.is_conflict() => {
                    warn!("Discarding result of job {}: {e}", job.id);
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Err(task_err) => {
                if task_err.retryable && job.attempts < job.max_attempts {
                    let delay = {
                        let policy = inner.config.stage(job.stage);
                        backoff::retry_delay(
                            policy.backoff_base_ms,
                            policy.backoff_cap_ms,
                            job.attempts,
                        )
                    };
                    let run_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    match job_repo::requeue(&inner.db, &job.id, run_at) {
                        Ok(()) => {
                            info!(
                                "Job {} attempt {}/{} failed ({}), retrying in {:?}",
                                job.id, job.attempts, job.max_attempts, task_err.message, delay
                            );
                            Ok(())
                        }
                        Err(e) if e.is_conflict() => Ok(()),
                        Err(e) => Err(e),
                    }
                } else {
                    let failure = JobFailure::from(&task_err);
                    match job_repo::fail(&inner.db, &job.id, &failure) {
                        Ok(()) => {
                            warn!(
                                "Job {} failed permanently after {} attempts: {}",
                                job.id, job.attempts, task_err.message
                            );
                            self.publish_terminal(job, JobStatus::Failed, Some(failure.message))?;
                            self.notify_terminal(&job.id)?;
                            Ok(())
                        }
                        Err(e) if e.is_conflict() => Ok(()),
                        Err(e) => Err(e),
                    }
                }
            }
        }
    }

    fn publish_terminal(
        &self,
        job: &JobRecord,
        status: JobStatus,
        error_msg: Option<String>,
    ) -> Result<(), DatabaseError> {
        self.inner.publisher.publish(
            &job.project_id,
            ProgressEventKind::JobTerminal {
                job_id: job.id.clone(),
                stage: job.stage,
                status,
                error: error_msg,
            },
        )?;
        Ok(())
    }

    fn notify_terminal(&self, job_id: &str) -> Result<(), DatabaseError> {
        let job = job_repo::find_by_id(&self.inner.db, job_id)?
            .ok_or_else(|| DatabaseError::NotFound(format!("job '{}'", job_id)))?;
        self.inner.listener.on_job_terminal(&job);
        Ok(())
    }
}
