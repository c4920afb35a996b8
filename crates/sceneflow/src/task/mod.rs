//! Stage task handlers: the seam between the orchestrator and the
//! actual generation work (transcription models, image/video APIs,
//! rendering). The orchestrator never calls external services itself;
//! it invokes a registered `TaskHandler` per stage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::model::{JobFailure, StageKind};

/// A failed handler execution. `retryable` separates faults worth
/// retrying (rate limits, network, upstream 5xx) from ones that will
/// fail identically on every attempt (malformed payload, content
/// policy rejection).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskError {
    pub message: String,
    pub retryable: bool,
}

impl TaskError {
    /// An error worth retrying with backoff.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// An error that no amount of retrying will fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl From<&TaskError> for JobFailure {
    fn from(e: &TaskError) -> Self {
        JobFailure::new(e.message.clone(), e.retryable)
    }
}

/// Cooperative cancellation flag handed to running handlers. Handlers
/// poll it at convenient points; the orchestrator never kills a task
/// mid-write.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// One pipeline stage's execution logic.
///
/// Implementations receive the job payload and return the stage result
/// as JSON. They must be side-effect safe under retry: a claim that
/// timed out may still be running when the retry starts.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, payload: &Value, cancel: &CancelToken) -> Result<Value, TaskError>;
}

/// Maps stages to their handlers. Stages without a handler are simply
/// never dispatched, which lets a deployment run a subset of the
/// pipeline.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StageKind, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: StageKind, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(stage, handler);
    }

    pub fn get(&self, stage: StageKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&stage).cloned()
    }
}

/// Resolves a project's uploaded audio to a reference the transcription
/// handler understands (a path, a signed URL). Implemented by the
/// hosting application's storage layer.
pub trait AudioLocator: Send + Sync {
    fn resolve(&self, project_id: &str) -> Result<String, TaskError>;
}

/// Cancel tokens of currently executing jobs, shared between the
/// scheduler (which registers them) and the coordinator (which flips
/// them on cancel).
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: &str, token: CancelToken) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(job_id.to_string(), token);
        }
    }

    pub fn remove(&self, job_id: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(job_id);
        }
    }

    /// Flips the cancel flag for a job if it is currently executing.
    pub fn cancel(&self, job_id: &str) {
        if let Ok(tokens) = self.tokens.lock() {
            if let Some(token) = tokens.get(job_id) {
                token.cancel();
            }
        }
    }
}
