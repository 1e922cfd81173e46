use thiserror::Error;

use crate::cache::{EngineError, PurgeError};
use crate::config::LoadError;
use crate::infra::error::InfraError;

/// Top-level failure for the `cachekeeper` binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error("failed to build cache engine: {0}")]
    Engine(#[from] EngineError),
    #[error("failed to build purge client: {0}")]
    Purge(#[from] PurgeError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
