//! Engine error types.
//!
//! Three layers with different blast radius:
//!
//! - [`StageError`]: raised by a stage handler; fails the process and its job.
//! - [`DispatchError`]: what the execution wrapper hands back to the loop.
//! - [`EngineError`]: a contract violation or an unusable store; stops the worker.

use pipesync_core::{DomainError, PipelineType, ProcessId, TenantId};

use crate::config::ConfigError;
use crate::store::StoreError;

/// Failure of one stage execution.
///
/// The display text ends up verbatim in the process (and job) `log_message`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl StageError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Payload(err.to_string())
    }
}

/// Outcome of a failed dispatch through the execution wrapper.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("tenant not found: {0}")]
    TenantNotFound(TenantId),
    #[error(transparent)]
    Stage(#[from] StageError),
    /// The wrapper's own bookkeeping could not be written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that end a worker loop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("no handler registered for stage `{stage}` of pipeline {pipeline}")]
    UnregisteredStage {
        pipeline: PipelineType,
        stage: String,
    },
    #[error("unknown stage `{stage}` for pipeline {pipeline}")]
    UnknownStage {
        pipeline: PipelineType,
        stage: String,
    },
    #[error("process {process_id} has stage `{stage}` but its payload is tagged `{payload}`")]
    PayloadStageMismatch {
        process_id: ProcessId,
        stage: String,
        payload: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("worker task failed: {0}")]
    Task(String),
}
