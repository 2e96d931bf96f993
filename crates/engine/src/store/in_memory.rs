//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pipesync_core::{
    DomainError, Job, JobId, PipelineType, Process, ProcessId, Status, TenantId, Tracked,
};

use super::{Affected, JobCounts, JobStore, RecordUpdate, StoreError};

/// A row plus its insertion sequence.
///
/// Fan-out inserts many processes with the same `created_at`; the sequence keeps
/// "creation order" total, like the `seq` column of the Postgres tables.
#[derive(Debug, Clone)]
struct Sequenced<T> {
    seq: u64,
    row: T,
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Sequenced<Job>>,
    processes: HashMap<ProcessId, Sequenced<Process>>,
    next_seq: u64,
}

impl Tables {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job, StoreError> {
        self.jobs
            .get_mut(&job_id)
            .map(|s| &mut s.row)
            .ok_or(StoreError::JobNotFound(job_id))
    }

    fn process_mut(&mut self, process_id: ProcessId) -> Result<&mut Process, StoreError> {
        self.processes
            .get_mut(&process_id)
            .map(|s| &mut s.row)
            .ok_or(StoreError::ProcessNotFound(process_id))
    }

    fn processes_of(&self, job_id: JobId) -> Vec<&Sequenced<Process>> {
        let mut rows: Vec<_> = self
            .processes
            .values()
            .filter(|p| p.row.job_id == job_id)
            .collect();
        rows.sort_by_key(|p| (p.row.created_at, p.seq));
        rows
    }

    fn check_insertable(&self, process: &Process) -> Result<(), StoreError> {
        if self.processes.contains_key(&process.id) {
            return Err(StoreError::AlreadyExists(format!("process {}", process.id)));
        }
        let job = self
            .jobs
            .get(&process.job_id)
            .ok_or(StoreError::JobNotFound(process.job_id))?;
        if job.row.tenant_id != process.tenant_id {
            return Err(StoreError::TenantIsolation(format!(
                "process {} tenant does not match job {}",
                process.id, process.job_id
            )));
        }
        Ok(())
    }
}

/// In-memory job store.
///
/// All tables sit behind a single lock so multi-row writes (job + seed, fan-out)
/// are atomic, matching the transactional Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
    }
}

/// Field-level patching shared by jobs and processes.
trait Patchable: Clone {
    fn set_status(&mut self, status: Status, now: DateTime<Utc>) -> Result<(), DomainError>;
    fn fields(&mut self) -> (&mut Option<String>, &mut serde_json::Value, &mut DateTime<Utc>);
}

impl Patchable for Job {
    fn set_status(&mut self, status: Status, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.transition(status, now)
    }

    fn fields(&mut self) -> (&mut Option<String>, &mut serde_json::Value, &mut DateTime<Utc>) {
        (&mut self.log_message, &mut self.payload, &mut self.updated_at)
    }
}

impl Patchable for Process {
    fn set_status(&mut self, status: Status, now: DateTime<Utc>) -> Result<(), DomainError> {
        self.transition(status, now)
    }

    fn fields(&mut self) -> (&mut Option<String>, &mut serde_json::Value, &mut DateTime<Utc>) {
        (&mut self.log_message, &mut self.payload, &mut self.updated_at)
    }
}

/// Apply `update` to a copy first so a rejected transition leaves the row untouched.
fn patch<T: Patchable>(row: &mut T, update: RecordUpdate, now: DateTime<Utc>) -> Result<T, StoreError> {
    let mut next = row.clone();
    if let Some(status) = update.status {
        next.set_status(status, now)?;
    }
    let (log_message, payload, updated_at) = next.fields();
    if let Some(message) = update.log_message {
        *log_message = Some(message);
    }
    if let Some(value) = update.payload {
        *payload = value;
    }
    *updated_at = now;

    *row = next.clone();
    Ok(next)
}

fn reap<'a, T: Tracked + 'a>(
    rows: impl Iterator<Item = &'a mut T>,
    cutoff: DateTime<Utc>,
    now: DateTime<Utc>,
    message: &str,
) -> usize {
    let mut count = 0;
    for row in rows {
        if row.is_stale(cutoff) {
            row.force_fail(message, now);
            count += 1;
        }
    }
    count
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: Job, seed: Process) -> Result<(Job, Process), StoreError> {
        let mut tables = self.write()?;
        if tables.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(format!("job {}", job.id)));
        }
        if seed.job_id != job.id {
            return Err(StoreError::JobNotFound(seed.job_id));
        }
        if seed.tenant_id != job.tenant_id {
            return Err(StoreError::TenantIsolation(format!(
                "seed process {} tenant does not match job {}",
                seed.id, job.id
            )));
        }

        let job_seq = tables.next_seq();
        tables.jobs.insert(
            job.id,
            Sequenced {
                seq: job_seq,
                row: job.clone(),
            },
        );
        let seed_seq = tables.next_seq();
        tables.processes.insert(
            seed.id,
            Sequenced {
                seq: seed_seq,
                row: seed.clone(),
            },
        );
        Ok((job, seed))
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&job_id).map(|s| s.row.clone()))
    }

    async fn get_process(&self, process_id: ProcessId) -> Result<Option<Process>, StoreError> {
        Ok(self.read()?.processes.get(&process_id).map(|s| s.row.clone()))
    }

    async fn oldest_active_job(&self, pipeline: PipelineType) -> Result<Option<Job>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .jobs
            .values()
            .filter(|j| j.row.pipeline == pipeline && j.row.is_active())
            .min_by_key(|j| (j.row.created_at, j.seq))
            .map(|j| j.row.clone()))
    }

    async fn oldest_pending_process(&self, job_id: JobId) -> Result<Option<Process>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .processes_of(job_id)
            .into_iter()
            .filter(|p| p.row.status == Status::Pending)
            .min_by_key(|p| (p.row.updated_at, p.seq))
            .map(|p| p.row.clone()))
    }

    async fn list_processes(&self, job_id: JobId) -> Result<Vec<Process>, StoreError> {
        let tables = self.read()?;
        Ok(tables
            .processes_of(job_id)
            .into_iter()
            .map(|p| p.row.clone())
            .collect())
    }

    async fn insert_processes(&self, processes: Vec<Process>) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        for process in &processes {
            tables.check_insertable(process)?;
        }
        for process in processes {
            let seq = tables.next_seq();
            tables.processes.insert(process.id, Sequenced { seq, row: process });
        }
        Ok(())
    }

    async fn begin_process_attempt(
        &self,
        process_id: ProcessId,
        now: DateTime<Utc>,
    ) -> Result<Process, StoreError> {
        let mut tables = self.write()?;
        let process = tables.process_mut(process_id)?;
        process.begin_attempt(now)?;
        Ok(process.clone())
    }

    async fn record_job_attempt(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Job, StoreError> {
        let mut tables = self.write()?;
        let job = tables.job_mut(job_id)?;
        job.record_attempt(now);
        Ok(job.clone())
    }

    async fn update_process(
        &self,
        process_id: ProcessId,
        update: RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<Process, StoreError> {
        let mut tables = self.write()?;
        let process = tables.process_mut(process_id)?;
        patch(process, update, now)
    }

    async fn update_job(
        &self,
        job_id: JobId,
        update: RecordUpdate,
        now: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        let mut tables = self.write()?;
        let job = tables.job_mut(job_id)?;
        patch(job, update, now)
    }

    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        message: &str,
    ) -> Result<Affected, StoreError> {
        let mut tables = self.write()?;
        let jobs = reap(tables.jobs.values_mut().map(|s| &mut s.row), cutoff, now, message);
        let processes = reap(
            tables.processes.values_mut().map(|s| &mut s.row),
            cutoff,
            now,
            message,
        );
        Ok(Affected { jobs, processes })
    }

    async fn fail_active(
        &self,
        tenant_id: TenantId,
        pipeline: PipelineType,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Affected, StoreError> {
        let mut tables = self.write()?;
        let mut affected = Affected::default();

        for job in tables.jobs.values_mut().map(|s| &mut s.row) {
            if job.tenant_id == tenant_id && job.pipeline == pipeline && job.is_active() {
                job.transition(Status::Failed, now)?;
                job.log_message = Some(message.to_string());
                affected.jobs += 1;
            }
        }
        for process in tables.processes.values_mut().map(|s| &mut s.row) {
            if process.tenant_id == tenant_id && process.pipeline == pipeline && process.is_active() {
                process.transition(Status::Failed, now)?;
                process.log_message = Some(message.to_string());
                affected.processes += 1;
            }
        }
        Ok(affected)
    }

    async fn latest_job(
        &self,
        tenant_id: TenantId,
        pipeline: PipelineType,
    ) -> Result<Option<Job>, StoreError> {
        let tables = self.read()?;
        let mut candidates: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| j.row.tenant_id == tenant_id && j.row.pipeline == pipeline)
            .collect();
        candidates.sort_by_key(|j| (j.row.created_at, j.seq));

        let active = candidates.iter().find(|j| j.row.is_active());
        Ok(active
            .or_else(|| candidates.last())
            .map(|j| j.row.clone()))
    }

    async fn job_counts(
        &self,
        tenant_id: TenantId,
        pipeline: PipelineType,
    ) -> Result<JobCounts, StoreError> {
        let tables = self.read()?;
        let mut counts = JobCounts::default();
        for job in tables.jobs.values() {
            if job.row.tenant_id == tenant_id && job.row.pipeline == pipeline {
                counts.add(job.row.status);
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_job(tenant: TenantId) -> (Job, Process) {
        let job = Job::new(tenant, PipelineType::VariantSync, serde_json::json!({}));
        let seed = Process::new(&job, "download_file", serde_json::json!({}));
        (job, seed)
    }

    #[tokio::test]
    async fn create_and_select_oldest() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();

        let (first, first_seed) = new_job(tenant);
        let (second, _) = {
            let (job, seed) = new_job(tenant);
            store.create_job(first.clone(), first_seed.clone()).await.unwrap();
            store.create_job(job, seed).await.unwrap()
        };

        let oldest = store
            .oldest_active_job(PipelineType::VariantSync)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(oldest.id, first.id);
        assert_ne!(oldest.id, second.id);

        let pending = store.oldest_pending_process(first.id).await.unwrap().unwrap();
        assert_eq!(pending.id, first_seed.id);

        // Other pipelines see nothing.
        assert!(store
            .oldest_active_job(PipelineType::TrackingSync)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn seed_must_belong_to_job() {
        let store = InMemoryJobStore::new();
        let (job, _) = new_job(TenantId::new());
        let (_, foreign_seed) = new_job(TenantId::new());

        assert!(store.create_job(job.clone(), foreign_seed).await.is_err());
        assert!(store.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fan_out_preserves_creation_order() {
        let store = InMemoryJobStore::new();
        let (job, seed) = new_job(TenantId::new());
        store.create_job(job.clone(), seed.clone()).await.unwrap();

        let batches: Vec<_> = (0..5)
            .map(|i| Process::new(&job, "update_batch", serde_json::json!({ "i": i })))
            .collect();
        let ids: Vec<_> = batches.iter().map(|p| p.id).collect();
        store.insert_processes(batches).await.unwrap();

        let listed: Vec<_> = store
            .list_processes(job.id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(listed[0], seed.id);
        assert_eq!(&listed[1..], ids.as_slice());
    }

    #[tokio::test]
    async fn requeued_process_goes_to_the_back() {
        let store = InMemoryJobStore::new();
        let (job, seed) = new_job(TenantId::new());
        store.create_job(job.clone(), seed.clone()).await.unwrap();
        let later = Process::new(&job, "update_batch", serde_json::json!({}));
        store.insert_processes(vec![later.clone()]).await.unwrap();

        let t0 = Utc::now() + Duration::seconds(1);
        store.begin_process_attempt(seed.id, t0).await.unwrap();
        store
            .update_process(seed.id, RecordUpdate::status(Status::Pending), t0)
            .await
            .unwrap();

        let next = store.oldest_pending_process(job.id).await.unwrap().unwrap();
        assert_eq!(next.id, later.id);
    }

    #[tokio::test]
    async fn insert_processes_is_all_or_nothing() {
        let store = InMemoryJobStore::new();
        let (job, seed) = new_job(TenantId::new());
        store.create_job(job.clone(), seed).await.unwrap();

        let good = Process::new(&job, "update_batch", serde_json::json!({}));
        let (orphan_job, _) = new_job(TenantId::new());
        let orphan = Process::new(&orphan_job, "update_batch", serde_json::json!({}));

        assert!(matches!(
            store.insert_processes(vec![good, orphan]).await,
            Err(StoreError::JobNotFound(_))
        ));
        assert_eq!(store.list_processes(job.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn begin_attempt_counts_and_rejects_non_pending() {
        let store = InMemoryJobStore::new();
        let (job, seed) = new_job(TenantId::new());
        store.create_job(job, seed.clone()).await.unwrap();

        let started = store.begin_process_attempt(seed.id, Utc::now()).await.unwrap();
        assert_eq!(started.status, Status::Processing);
        assert_eq!(started.retry_count, 1);

        let err = store
            .begin_process_attempt(seed.id, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn rejected_update_leaves_row_untouched() {
        let store = InMemoryJobStore::new();
        let (job, seed) = new_job(TenantId::new());
        store.create_job(job, seed.clone()).await.unwrap();

        let update = RecordUpdate::status(Status::Completed).with_message("done");
        assert!(store.update_process(seed.id, update, Utc::now()).await.is_err());

        let row = store.get_process(seed.id).await.unwrap().unwrap();
        assert_eq!(row.status, Status::Pending);
        assert!(row.log_message.is_none());
    }

    #[tokio::test]
    async fn reap_only_touches_stale_processing_rows() {
        let store = InMemoryJobStore::new();
        let (job, seed) = new_job(TenantId::new());
        store.create_job(job.clone(), seed.clone()).await.unwrap();

        let t0 = Utc::now();
        store.begin_process_attempt(seed.id, t0).await.unwrap();
        store
            .update_job(job.id, RecordUpdate::status(Status::Processing), t0)
            .await
            .unwrap();

        // Not stale yet.
        let early = store
            .reap_stale(t0 - Duration::seconds(1), t0, "timed out (zombie)")
            .await
            .unwrap();
        assert!(early.is_empty());

        let now = t0 + Duration::minutes(31);
        let reaped = store
            .reap_stale(now - Duration::minutes(30), now, "timed out (zombie)")
            .await
            .unwrap();
        assert_eq!(reaped, Affected { jobs: 1, processes: 1 });

        let again = store
            .reap_stale(now - Duration::minutes(30), now, "timed out (zombie)")
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn latest_job_prefers_active_then_most_recent() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();

        let (old, old_seed) = new_job(tenant);
        store.create_job(old.clone(), old_seed).await.unwrap();
        let (new, new_seed) = new_job(tenant);
        store.create_job(new.clone(), new_seed).await.unwrap();

        let latest = store.latest_job(tenant, PipelineType::VariantSync).await.unwrap();
        assert_eq!(latest.unwrap().id, old.id);

        store
            .fail_active(tenant, PipelineType::VariantSync, "stopped by operator", Utc::now())
            .await
            .unwrap();
        let latest = store.latest_job(tenant, PipelineType::VariantSync).await.unwrap();
        assert_eq!(latest.unwrap().id, new.id);

        let counts = store.job_counts(tenant, PipelineType::VariantSync).await.unwrap();
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.active(), 0);
    }

    #[tokio::test]
    async fn fail_active_is_tenant_and_pipeline_scoped() {
        let store = InMemoryJobStore::new();
        let tenant = TenantId::new();
        let other = TenantId::new();

        let (mine, mine_seed) = new_job(tenant);
        store.create_job(mine.clone(), mine_seed).await.unwrap();
        let (theirs, theirs_seed) = new_job(other);
        store.create_job(theirs.clone(), theirs_seed).await.unwrap();

        let affected = store
            .fail_active(tenant, PipelineType::VariantSync, "stopped by operator", Utc::now())
            .await
            .unwrap();
        assert_eq!(affected, Affected { jobs: 1, processes: 1 });

        let mine = store.get_job(mine.id).await.unwrap().unwrap();
        assert_eq!(mine.status, Status::Failed);
        assert_eq!(mine.log_message.as_deref(), Some("stopped by operator"));
        let theirs = store.get_job(theirs.id).await.unwrap().unwrap();
        assert_eq!(theirs.status, Status::Pending);
    }
}
