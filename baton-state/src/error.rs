//! Error types
//!
//! Persistence and lock errors are returned to the immediate caller.
//! Writes to an already completed stage or job are not errors: they are
//! reported as an [`InvalidTransitionWarning`] value and logged.

use baton_core::domain::name::PipelineName;
use baton_core::domain::pipeline::PipelineIdentity;
use baton_core::domain::status::ExecutionResult;
use std::fmt;
use thiserror::Error;

/// Failure reported by the persistence layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// A lock attempt found the pipeline locked by another instance
///
/// Never retried automatically; the caller must not schedule work for the
/// rejected instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "Pipeline '{}' is already locked by instance {} (counter = {}, label = {})",
    .pipeline, .locked_by.id, .locked_by.counter, .locked_by.label
)]
pub struct PipelineAlreadyLockedError {
    pub pipeline: PipelineName,
    pub locked_by: PipelineIdentity,
}

/// Errors from lock and unlock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error(transparent)]
    AlreadyLocked(#[from] PipelineAlreadyLockedError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from execution-state operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Invalid page request: {0}")]
    InvalidPage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// What kind of instance a rejected transition targeted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionSubject {
    Stage,
    Job,
}

impl fmt::Display for TransitionSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionSubject::Stage => write!(f, "stage"),
            TransitionSubject::Job => write!(f, "job"),
        }
    }
}

/// A state write that was rejected and not applied
///
/// Produced when a transition targets a completed instance or would move
/// its state backwards. It describes a racing or duplicate status update,
/// not a request failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransitionWarning {
    pub subject: TransitionSubject,
    /// Display form of the stage or job identifier
    pub identity: String,
    pub current_state: String,
    pub current_result: Option<ExecutionResult>,
    pub attempted_state: String,
    pub attempted_result: Option<ExecutionResult>,
}

impl fmt::Display for InvalidTransitionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "State change for {} {} is not allowed: currently State={}, Result={}; attempted State={}, Result={}",
            self.subject,
            self.identity,
            self.current_state,
            display_result(self.current_result),
            self.attempted_state,
            display_result(self.attempted_result),
        )
    }
}

fn display_result(result: Option<ExecutionResult>) -> String {
    result.map_or_else(|| "Unknown".to_string(), |r| r.to_string())
}
