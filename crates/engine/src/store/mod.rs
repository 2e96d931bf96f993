//! Durable job/process storage.
//!
//! The store is the single source of truth and the only state shared between the
//! pipeline workers. Every status/counter mutation is a targeted single-row update
//! (or a scoped bulk update for the zombie sweep and the stop action).

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use pipesync_core::{
    DomainError, Job, JobId, PipelineType, Process, ProcessId, Status, TenantId,
};

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Shared handle used by workers, handlers and admin actions.
pub type SharedStore = Arc<dyn JobStore>;

/// Job/process persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a job together with its seed process (both rows or neither).
    async fn create_job(&self, job: Job, seed: Process) -> Result<(Job, Process), StoreError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

    async fn get_process(&self, process_id: ProcessId) -> Result<Option<Process>, StoreError>;

    /// Oldest `Pending`/`Processing` job of a pipeline, by creation time.
    async fn oldest_active_job(&self, pipeline: PipelineType) -> Result<Option<Job>, StoreError>;

    /// Next `Pending` process of a job.
    ///
    /// Ordered by `updated_at`, which for a pending row is its creation time
    /// unless it was requeued; a requeued process goes to the back of the queue.
    async fn oldest_pending_process(&self, job_id: JobId) -> Result<Option<Process>, StoreError>;

    /// All processes of a job in creation order.
    async fn list_processes(&self, job_id: JobId) -> Result<Vec<Process>, StoreError>;

    /// Insert successor processes (all or nothing).
    async fn insert_processes(&self, processes: Vec<Process>) -> Result<(), StoreError>;

    /// `Pending -> Processing`, `retry_count += 1`, `updated_at = now`.
    async fn begin_process_attempt(
        &self,
        process_id: ProcessId,
        now: DateTime<Utc>,
    ) -> Result<Process, StoreError>;

    /// `retry_count += 1`, `updated_at = now`; status untouched.
    async fn record_job_attempt(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, StoreError>;

    async fn update_process(
        &self,
        process_id: ProcessId,
        update: RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<Process, StoreError>;

    async fn update_job(
        &self,
        job_id: JobId,
        update: RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// Force-fail every `Processing` job and process last touched at or before `cutoff`.
    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        message: &str,
    ) -> Result<Affected, StoreError>;

    /// Fail every active job/process of a tenant's pipeline.
    async fn fail_active(
        &self,
        tenant_id: TenantId,
        pipeline: PipelineType,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Affected, StoreError>;

    /// The active job if there is one, otherwise the most recently created job.
    async fn latest_job(
        &self,
        tenant_id: TenantId,
        pipeline: PipelineType,
    ) -> Result<Option<Job>, StoreError>;

    async fn job_counts(
        &self,
        tenant_id: TenantId,
        pipeline: PipelineType,
    ) -> Result<JobCounts, StoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("process not found: {0}")]
    ProcessNotFound(ProcessId),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Targeted update of a job or process row.
///
/// `None` fields are left untouched. A status change is validated against the
/// state machine before it is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub status: Option<Status>,
    pub log_message: Option<String>,
    pub payload: Option<serde_json::Value>,
}

impl RecordUpdate {
    pub fn status(status: Status) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::status(Status::Failed).with_message(message)
    }

    pub fn payload(payload: serde_json::Value) -> Self {
        Self {
            payload: Some(payload),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.log_message = Some(message.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Rows touched by a bulk update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Affected {
    pub jobs: usize,
    pub processes: usize,
}

impl Affected {
    pub fn total(&self) -> usize {
        self.jobs + self.processes
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Job counts per status for one tenant/pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn add(&mut self, status: Status) {
        match status {
            Status::Pending => self.pending += 1,
            Status::Processing => self.processing += 1,
            Status::Completed => self.completed += 1,
            Status::Failed => self.failed += 1,
        }
    }

    pub fn active(&self) -> usize {
        self.pending + self.processing
    }
}
