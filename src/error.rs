use thiserror::Error;

use crate::collaborators::{StoreError, UtilityError};
use crate::compilation::CompilationError;

/// Fatal errors: conditions that make continued evaluation meaningless.
///
/// User-input problems (bad arguments, failed lookups, exceeded limits)
/// never appear here; those flow through the context's non-fatal error log
/// and the surrounding statement keeps evaluating.
#[derive(Debug, Error)]
pub enum Error {
    #[error("signature compilation failed: {0}")]
    Compilation(#[from] CompilationError),
    #[error("collaborator failure: {0}")]
    Utility(#[from] UtilityError),
    #[error("variable store failure: {0}")]
    Store(#[from] StoreError),
    #[error("cannot restore context: {0}")]
    Restore(String),
    #[error("no continuation scheduler is configured")]
    NoScheduler,
    #[error("internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }

    pub fn restore<S: Into<String>>(message: S) -> Self {
        Error::Restore(message.into())
    }
}
