//! Operator and integration entry points: trigger, stop, callback intake, status.

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use pipesync_core::{Job, JobId, PipelineType, Process, Status, TenantId};

use crate::pipeline::{Pipeline, StageKind, StagePayload};
use crate::store::{Affected, JobCounts, SharedStore, StoreError};
use crate::tenants::SharedTenants;

pub const STOP_MESSAGE: &str = "stopped by operator";

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdminError {
    #[error("tenant not found: {0}")]
    TenantNotFound(TenantId),
    #[error("tenant {tenant_id} already has an active {pipeline} job ({job_id})")]
    AlreadyActive {
        tenant_id: TenantId,
        pipeline: PipelineType,
        job_id: JobId,
    },
    #[error("pipeline {0} is not registered")]
    PipelineNotRegistered(PipelineType),
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("job {job_id} is {status}; no more processes can be added")]
    JobTerminal { job_id: JobId, status: Status },
    #[error("job {job_id} belongs to {actual}, not {expected}")]
    WrongPipeline {
        job_id: JobId,
        expected: PipelineType,
        actual: PipelineType,
    },
    #[error("invalid payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Seed process of a pipeline, captured from its definition.
#[derive(Debug, Clone)]
struct Seed {
    stage: &'static str,
    payload: serde_json::Value,
}

/// Snapshot for dashboards: the active (or most recent) job of a tenant's pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub tenant_id: TenantId,
    pub pipeline: PipelineType,
    pub job: Option<Job>,
    pub processes: Vec<Process>,
    pub counts: JobCounts,
}

#[derive(Clone)]
pub struct Admin {
    store: SharedStore,
    tenants: SharedTenants,
    seeds: HashMap<PipelineType, Seed>,
}

impl Admin {
    pub fn new(store: SharedStore, tenants: SharedTenants) -> Self {
        Self {
            store,
            tenants,
            seeds: HashMap::new(),
        }
    }

    /// Make `P` triggerable.
    pub fn with_pipeline<P: Pipeline>(mut self) -> Result<Self, AdminError> {
        let seed = P::seed_payload();
        let payload = seed
            .to_value()
            .map_err(|e| AdminError::Payload(e.to_string()))?;
        self.seeds.insert(
            P::TYPE,
            Seed {
                stage: seed.stage().as_str(),
                payload,
            },
        );
        Ok(self)
    }

    pub fn pipelines(&self) -> Vec<PipelineType> {
        PipelineType::ALL
            .into_iter()
            .filter(|p| self.seeds.contains_key(p))
            .collect()
    }

    /// Create a job and its seed process.
    ///
    /// Refuses while the tenant already has an active job of that pipeline.
    pub async fn trigger(
        &self,
        tenant_id: TenantId,
        pipeline: PipelineType,
    ) -> Result<(Job, Process), AdminError> {
        let seed = self
            .seeds
            .get(&pipeline)
            .ok_or(AdminError::PipelineNotRegistered(pipeline))?;
        if self.tenants.get(tenant_id).await?.is_none() {
            return Err(AdminError::TenantNotFound(tenant_id));
        }
        if let Some(active) = self.store.latest_job(tenant_id, pipeline).await? {
            if active.is_active() {
                return Err(AdminError::AlreadyActive {
                    tenant_id,
                    pipeline,
                    job_id: active.id,
                });
            }
        }

        let job = Job::new(tenant_id, pipeline, serde_json::json!({}));
        let process = Process::new(&job, seed.stage, seed.payload.clone());
        let created = self.store.create_job(job, process).await?;
        info!(
            tenant_id = %tenant_id,
            pipeline = %pipeline,
            job_id = %created.0.id,
            "job triggered"
        );
        Ok(created)
    }

    /// Fail every active job/process of a tenant's pipeline.
    pub async fn stop(
        &self,
        tenant_id: TenantId,
        pipeline: PipelineType,
    ) -> Result<Affected, AdminError> {
        let stopped = self
            .store
            .fail_active(tenant_id, pipeline, STOP_MESSAGE, Utc::now())
            .await?;
        info!(
            tenant_id = %tenant_id,
            pipeline = %pipeline,
            jobs = stopped.jobs,
            processes = stopped.processes,
            "pipeline stopped"
        );
        Ok(stopped)
    }

    /// Add the next process of a waiting job (e.g. from a completion webhook).
    pub async fn append_process<P: Pipeline>(
        &self,
        job_id: JobId,
        payload: P::Payload,
    ) -> Result<Process, AdminError> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(AdminError::JobNotFound(job_id))?;
        if job.pipeline != P::TYPE {
            return Err(AdminError::WrongPipeline {
                job_id,
                expected: P::TYPE,
                actual: job.pipeline,
            });
        }
        if job.status.is_terminal() {
            return Err(AdminError::JobTerminal {
                job_id,
                status: job.status,
            });
        }

        let value = payload
            .to_value()
            .map_err(|e| AdminError::Payload(e.to_string()))?;
        let process = Process::new(&job, payload.stage().as_str(), value);
        self.store.insert_processes(vec![process.clone()]).await?;
        info!(job_id = %job_id, stage = %process.stage, "process appended");
        Ok(process)
    }

    pub async fn status(
        &self,
        tenant_id: TenantId,
        pipeline: PipelineType,
    ) -> Result<PipelineStatus, AdminError> {
        let job = self.store.latest_job(tenant_id, pipeline).await?;
        let processes = match &job {
            Some(job) => self.store.list_processes(job.id).await?,
            None => Vec::new(),
        };
        let counts = self.store.job_counts(tenant_id, pipeline).await?;
        Ok(PipelineStatus {
            tenant_id,
            pipeline,
            job,
            processes,
            counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use crate::tenants::InMemoryTenantDirectory;
    use crate::testing::{Demo, DemoPayload, tenant};
    use std::sync::Arc;

    fn admin_with_tenant() -> (Admin, SharedStore, TenantId) {
        let tenant = tenant();
        let store: SharedStore = Arc::new(InMemoryJobStore::new());
        let tenants: SharedTenants =
            Arc::new(InMemoryTenantDirectory::new().with_tenant(tenant.clone()));
        let admin = Admin::new(store.clone(), tenants)
            .with_pipeline::<Demo>()
            .unwrap();
        (admin, store, tenant.id)
    }

    #[tokio::test]
    async fn trigger_creates_job_with_seed() {
        let (admin, store, tenant_id) = admin_with_tenant();
        let (job, seed) = admin.trigger(tenant_id, Demo::TYPE).await.unwrap();

        assert_eq!(job.status, Status::Pending);
        assert_eq!(seed.stage, "start");
        assert_eq!(seed.payload, serde_json::json!({ "stage": "start" }));
        assert_eq!(store.list_processes(job.id).await.unwrap(), vec![seed]);
    }

    #[tokio::test]
    async fn trigger_refuses_stacked_runs_and_unknown_tenants() {
        let (admin, _, tenant_id) = admin_with_tenant();
        let (job, _) = admin.trigger(tenant_id, Demo::TYPE).await.unwrap();

        let err = admin.trigger(tenant_id, Demo::TYPE).await.unwrap_err();
        assert!(matches!(err, AdminError::AlreadyActive { job_id, .. } if job_id == job.id));

        let err = admin.trigger(TenantId::new(), Demo::TYPE).await.unwrap_err();
        assert!(matches!(err, AdminError::TenantNotFound(_)));

        let err = admin
            .trigger(tenant_id, PipelineType::TrackingSync)
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::PipelineNotRegistered(_)));
    }

    #[tokio::test]
    async fn stop_fails_active_rows_and_allows_new_trigger() {
        let (admin, _, tenant_id) = admin_with_tenant();
        let (job, _) = admin.trigger(tenant_id, Demo::TYPE).await.unwrap();

        let stopped = admin.stop(tenant_id, Demo::TYPE).await.unwrap();
        assert_eq!(stopped, Affected { jobs: 1, processes: 1 });

        let status = admin.status(tenant_id, Demo::TYPE).await.unwrap();
        let shown = status.job.unwrap();
        assert_eq!(shown.id, job.id);
        assert_eq!(shown.log_message.as_deref(), Some(STOP_MESSAGE));
        assert_eq!(status.counts.failed, 1);
        assert_eq!(status.processes[0].status, Status::Failed);

        assert!(admin.trigger(tenant_id, Demo::TYPE).await.is_ok());
    }

    #[tokio::test]
    async fn append_process_rejects_terminal_jobs() {
        let (admin, _, tenant_id) = admin_with_tenant();
        let (job, _) = admin.trigger(tenant_id, Demo::TYPE).await.unwrap();

        let appended = admin
            .append_process::<Demo>(job.id, DemoPayload::Work { n: 7 })
            .await
            .unwrap();
        assert_eq!(appended.stage, "work");
        assert_eq!(appended.job_id, job.id);

        admin.stop(tenant_id, Demo::TYPE).await.unwrap();
        let err = admin
            .append_process::<Demo>(job.id, DemoPayload::Finish)
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::JobTerminal { status: Status::Failed, .. }));

        let err = admin
            .append_process::<Demo>(JobId::new(), DemoPayload::Finish)
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn status_without_jobs_is_empty() {
        let (admin, _, tenant_id) = admin_with_tenant();
        let status = admin.status(tenant_id, Demo::TYPE).await.unwrap();
        assert!(status.job.is_none());
        assert!(status.processes.is_empty());
        assert_eq!(status.counts, JobCounts::default());
    }
}
