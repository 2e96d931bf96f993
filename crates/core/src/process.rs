//! Process: one stage-execution unit belonging to a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Tracked};
use crate::error::DomainResult;
use crate::id::{JobId, ProcessId, TenantId};
use crate::job::Job;
use crate::pipeline::PipelineType;
use crate::status::Status;

/// A stage execution unit.
///
/// `stage` is the pipeline-specific stage tag (e.g. `download_file`); the engine
/// maps it back to a typed stage through the pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    /// Owning job (immutable)
    pub job_id: JobId,
    /// Denormalized from the job
    pub tenant_id: TenantId,
    /// Denormalized from the job
    pub pipeline: PipelineType,
    /// Stage tag
    pub stage: String,
    pub status: Status,
    /// Number of times this process was dispatched
    pub retry_count: u32,
    pub log_message: Option<String>,
    /// Stage-specific input/output data
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Process {
    /// Create a pending process for `job`.
    pub fn new(job: &Job, stage: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::for_job(job.id, job.tenant_id, job.pipeline, stage, payload)
    }

    /// Create a pending process from the owning job's identity fields.
    pub fn for_job(
        job_id: JobId,
        tenant_id: TenantId,
        pipeline: PipelineType,
        stage: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ProcessId::new(),
            job_id,
            tenant_id,
            pipeline,
            stage: stage.into(),
            status: Status::Pending,
            retry_count: 0,
            log_message: None,
            payload,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Start a dispatch attempt: `Processing`, one more retry, fresh `updated_at`.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.status.check_transition(Status::Processing)?;
        self.status = Status::Processing;
        self.retry_count += 1;
        self.updated_at = now;
        Ok(())
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: Status, now: DateTime<Utc>) -> DomainResult<()> {
        self.status.check_transition(next)?;
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for Process {
    type Id = ProcessId;

    fn id(&self) -> ProcessId {
        self.id
    }
}

impl Tracked for Process {
    fn status(&self) -> Status {
        self.status
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn force_fail(&mut self, message: &str, now: DateTime<Utc>) {
        self.status = Status::Failed;
        self.retry_count += 1;
        self.log_message = Some(message.to_string());
        self.updated_at = now;
    }
}
