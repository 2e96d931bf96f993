//! Job: one run of a pipeline for one tenant.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Tracked};
use crate::error::DomainResult;
use crate::id::{JobId, TenantId};
use crate::pipeline::PipelineType;
use crate::status::Status;

/// A pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Pipeline this run belongs to
    pub pipeline: PipelineType,
    /// Current status
    pub status: Status,
    /// Number of process dispatches performed for this job
    pub retry_count: u32,
    /// Latest human-readable status note (overwritten, never appended)
    pub log_message: Option<String>,
    /// Pipeline-specific data carried across stages
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Zombie-detection clock
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(tenant_id: TenantId, pipeline: PipelineType, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant_id,
            pipeline,
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

    /// Count one dispatch attempt of any of this job's processes.
    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.updated_at = now;
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: Status, now: DateTime<Utc>) -> DomainResult<()> {
        self.status.check_transition(next)?;
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

impl Entity for Job {
    type Id = JobId;

    fn id(&self) -> JobId {
        self.id
    }
}

impl Tracked for Job {
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job() -> Job {
        Job::new(TenantId::new(), PipelineType::VariantSync, serde_json::json!({}))
    }

    #[test]
    fn new_job_is_pending_with_no_attempts() {
        let job = job();
        assert_eq!(job.status, Status::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.log_message.is_none());
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn record_attempt_counts_and_touches() {
        let mut job = job();
        let later = job.updated_at + Duration::seconds(5);
        job.record_attempt(later);
        job.record_attempt(later);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.updated_at, later);
        assert_eq!(job.status, Status::Pending);
    }

    #[test]
    fn transition_rejects_completing_a_pending_job() {
        let mut job = job();
        assert!(job.transition(Status::Completed, Utc::now()).is_err());
        assert_eq!(job.status, Status::Pending);
    }

    #[test]
    fn stale_only_when_processing_and_old() {
        let mut job = job();
        let cutoff = job.updated_at + Duration::minutes(1);
        assert!(!job.is_stale(cutoff));

        job.transition(Status::Processing, job.updated_at).unwrap();
        assert!(job.is_stale(cutoff));
        assert!(!job.is_stale(job.updated_at - Duration::seconds(1)));
    }
}
