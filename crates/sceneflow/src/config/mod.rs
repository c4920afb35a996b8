//! Orchestrator configuration: per-stage execution policies plus
//! global scheduler knobs. Loaded from JSON; every field has a default
//! so an empty `{}` config is valid.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::StageKind;

/// How a fan-out stage settles when some children fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialSuccessPolicy {
    /// Any failed child fails the whole stage.
    AllOrNothing,
    /// The stage succeeds with whatever children succeeded; failed
    /// scenes carry a failed artifact and can be retried individually.
    BestEffort,
}

/// Execution policy for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicy {
    /// Wall-clock budget for one handler execution.
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Concurrent executions of this stage across all projects.
    pub concurrency: usize,
    pub partial_success: PartialSuccessPolicy,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            concurrency: 2,
            partial_success: PartialSuccessPolicy::BestEffort,
        }
    }
}

/// Full orchestrator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent handler executions across all stages.
    pub global_concurrency: usize,
    pub poll_interval_ms: u64,
    pub sweep_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Per-stage overrides, keyed by stage name.
    pub stages: HashMap<StageKind, StagePolicy>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 8,
            poll_interval_ms: 250,
            sweep_interval_ms: 5_000,
            heartbeat_interval_ms: 2_000,
            stages: default_stage_policies(),
        }
    }
}

/// Built-in per-stage defaults: media generation gets long budgets and
/// bounded parallelism, the LLM stages shorter ones, assembly runs one
/// at a time (it is ffmpeg-bound).
fn default_stage_policies() -> HashMap<StageKind, StagePolicy> {
    let mut stages = HashMap::new();
    stages.insert(
        StageKind::Transcription,
        StagePolicy {
            timeout_secs: 300,
            ..StagePolicy::default()
        },
    );
    stages.insert(
        StageKind::SceneSelection,
        StagePolicy {
            timeout_secs: 120,
            ..StagePolicy::default()
        },
    );
    stages.insert(
        StageKind::PromptGeneration,
        StagePolicy {
            timeout_secs: 120,
            ..StagePolicy::default()
        },
    );
    stages.insert(
        StageKind::ImageGeneration,
        StagePolicy {
            timeout_secs: 600,
            concurrency: 3,
            ..StagePolicy::default()
        },
    );
    stages.insert(
        StageKind::VideoGeneration,
        StagePolicy {
            timeout_secs: 1_200,
            concurrency: 2,
            ..StagePolicy::default()
        },
    );
    stages.insert(
        StageKind::Assembly,
        StagePolicy {
            timeout_secs: 900,
            max_attempts: 2,
            concurrency: 1,
            ..StagePolicy::default()
        },
    );
    stages
}

impl OrchestratorConfig {
    /// The effective policy for a stage (built-in default if the config
    /// file did not mention it).
    pub fn stage(&self, stage: StageKind) -> StagePolicy {
        self.stages
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| default_stage_policies().remove(&stage).unwrap_or_default())
    }

    /// Validates cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_concurrency == 0 {
            return Err(ConfigError::Validation(
                "global_concurrency must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        for (stage, policy) in &self.stages {
            if policy.max_attempts == 0 {
                return Err(ConfigError::Validation(format!(
                    "{stage}: max_attempts must be at least 1"
                )));
            }
            if policy.concurrency == 0 {
                return Err(ConfigError::Validation(format!(
                    "{stage}: concurrency must be at least 1"
                )));
            }
            if policy.backoff_cap_ms < policy.backoff_base_ms {
                return Err(ConfigError::Validation(format!(
                    "{stage}: backoff_cap_ms must be >= backoff_base_ms"
                )));
            }
        }
        Ok(())
    }
}

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Validation(String),
}

/// Loads and validates a config file.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    load_config_from_str(&content)
}

/// Parses and validates config JSON.
pub fn load_config_from_str(content: &str) -> Result<OrchestratorConfig, ConfigError> {
    let config: OrchestratorConfig = serde_json::from_str(content)?;
    config.validate()?;
    Ok(config)
}
