//! Per-dispatch context handed to stage handlers.

use chrono::Utc;
use tracing::debug;

use pipesync_core::{Job, Process, ProcessId, Status, Tenant};

use crate::error::StageError;
use crate::pipeline::{Pipeline, StageKind, StagePayload};
use crate::store::{RecordUpdate, SharedStore};

/// What a handler sees: resolved tenant, snapshots of its job and process, and the
/// decoded payload. Writes go straight to the store through the helpers below.
pub struct StageContext<P: Pipeline> {
    pub tenant: Tenant,
    /// Job as of the start of this dispatch
    pub job: Job,
    /// Process as of the start of this dispatch (already `Processing`)
    pub process: Process,
    pub payload: P::Payload,
    store: SharedStore,
}

impl<P: Pipeline> StageContext<P> {
    pub fn new(
        store: SharedStore,
        tenant: Tenant,
        job: Job,
        process: Process,
        payload: P::Payload,
    ) -> Self {
        Self {
            tenant,
            job,
            process,
            payload,
            store,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn stage(&self) -> P::Stage {
        self.payload.stage()
    }

    /// Mark this process `Completed`.
    pub async fn complete(&self) -> Result<(), StageError> {
        self.store
            .update_process(self.process.id, RecordUpdate::status(Status::Completed), Utc::now())
            .await?;
        Ok(())
    }

    /// Mark this process `Completed` with a note.
    pub async fn complete_with(&self, message: impl Into<String>) -> Result<(), StageError> {
        let update = RecordUpdate::status(Status::Completed).with_message(message);
        self.store
            .update_process(self.process.id, update, Utc::now())
            .await?;
        Ok(())
    }

    /// Mark this process `Completed` and keep `payload` (e.g. with results) on it.
    pub async fn complete_with_payload(
        &self,
        payload: P::Payload,
        message: impl Into<String>,
    ) -> Result<(), StageError> {
        let update = RecordUpdate::status(Status::Completed)
            .with_message(message)
            .with_payload(payload.to_value()?);
        self.store
            .update_process(self.process.id, update, Utc::now())
            .await?;
        Ok(())
    }

    /// Create one successor process.
    pub async fn spawn(&self, payload: P::Payload) -> Result<ProcessId, StageError> {
        let mut ids = self.spawn_all([payload]).await?;
        ids.pop()
            .ok_or_else(|| StageError::failed("successor was not created"))
    }

    /// Create successors in the given order (all or nothing).
    pub async fn spawn_all(
        &self,
        payloads: impl IntoIterator<Item = P::Payload> + Send,
    ) -> Result<Vec<ProcessId>, StageError> {
        let mut processes = Vec::new();
        for payload in payloads {
            let stage = payload.stage();
            processes.push(Process::new(&self.job, stage.as_str(), payload.to_value()?));
        }
        let ids = processes.iter().map(|p| p.id).collect();

        debug!(
            job_id = %self.job.id,
            from = %self.process.stage,
            count = processes.len(),
            "spawning successor processes"
        );
        self.store.insert_processes(processes).await?;
        Ok(ids)
    }

    /// Every other process of this job, fresh from the store, in creation order.
    pub async fn siblings(&self) -> Result<Vec<Process>, StageError> {
        let mut processes = self.store.list_processes(self.job.id).await?;
        processes.retain(|p| p.id != self.process.id);
        Ok(processes)
    }

    /// Put this process back to `Pending` so a later cycle runs it again.
    pub async fn requeue(&self, message: impl Into<String>) -> Result<(), StageError> {
        let update = RecordUpdate::status(Status::Pending).with_message(message);
        self.store
            .update_process(self.process.id, update, Utc::now())
            .await?;
        Ok(())
    }

    pub async fn complete_job(&self, message: impl Into<String>) -> Result<Job, StageError> {
        let update = RecordUpdate::status(Status::Completed).with_message(message);
        Ok(self.store.update_job(self.job.id, update, Utc::now()).await?)
    }

    pub async fn fail_job(&self, message: impl Into<String>) -> Result<Job, StageError> {
        Ok(self
            .store
            .update_job(self.job.id, RecordUpdate::failed(message), Utc::now())
            .await?)
    }

    /// Replace the job payload (e.g. the downloaded file name, a run summary).
    pub async fn update_job_payload(&self, payload: serde_json::Value) -> Result<Job, StageError> {
        Ok(self
            .store
            .update_job(self.job.id, RecordUpdate::payload(payload), Utc::now())
            .await?)
    }
}
