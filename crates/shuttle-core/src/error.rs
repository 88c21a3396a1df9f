use thiserror::Error;

use crate::app::BuildError;
use crate::config::ConfigError;
use crate::ports::ClientError;

/// Top-level error for setting up and running a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("engine unavailable: {0}")]
    Engine(#[from] ClientError),

    #[error("worker task failed: {0}")]
    Join(String),
}
