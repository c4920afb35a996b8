use thiserror::Error;

use crate::config::ConfigError;
use crate::coordinator::CoordinatorError;
use crate::db::DatabaseError;

/// Top-level error rollup for embedding applications.
#[derive(Error, Debug)]
pub enum SceneflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),
}

pub type Result<T> = std::result::Result<T, SceneflowError>;
