//! Dispatch loop: one worker per pipeline type.
//!
//! Each cycle picks the oldest active job of the pipeline, fails it if one of its
//! processes already failed, otherwise runs its oldest pending process through
//! the execution wrapper. The zombie reaper runs at the end of every cycle.
//!
//! A process no registered handler can run (unknown stage, payload tagged for
//! another stage) is failed together with its job without being invoked.
//!
//! The oldest active job always wins selection, even while it has nothing pending
//! (e.g. waiting for an external callback): the pipeline pauses behind it.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use pipesync_core::{JobId, Process, ProcessId, Status};

use crate::config::EngineConfig;
use crate::error::{DispatchError, EngineError};
use crate::pipeline::{HandlerRegistry, Pipeline, StageKind, resolve_stage};
use crate::reaper::ZombieReaper;
use crate::store::{Affected, RecordUpdate, SharedStore, StoreError};
use crate::tenants::SharedTenants;
use crate::wrapper::ExecutionWrapper;

/// What the dispatch half of a cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dispatch {
    /// No active job
    Idle,
    /// Head job has no pending process
    Waiting { job_id: JobId },
    /// Head job failed because one of its processes had failed
    Propagated { job_id: JobId, stage: String },
    /// Handler returned successfully
    Ran {
        job_id: JobId,
        process_id: ProcessId,
        stage: String,
    },
    /// Stage unknown, unregistered or disagreeing with its payload; process and
    /// job failed without invoking a handler
    Rejected {
        job_id: JobId,
        process_id: ProcessId,
        stage: String,
        message: String,
    },
    /// Handler (or tenant resolution) failed; job failed with it
    Failed {
        job_id: JobId,
        process_id: ProcessId,
        stage: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    pub dispatch: Dispatch,
    pub reaped: Affected,
}

/// Job log message for a failed stage.
pub fn stage_failure_message(stage: &str, error: &str) -> String {
    format!("{stage} failed: {error}")
}

pub struct PipelineWorker<P: Pipeline> {
    store: SharedStore,
    registry: HandlerRegistry<P>,
    wrapper: ExecutionWrapper,
    reaper: ZombieReaper,
    config: EngineConfig,
}

impl<P: Pipeline> PipelineWorker<P> {
    /// Build a worker; every stage of `P` must have a handler.
    pub fn new(
        store: SharedStore,
        tenants: SharedTenants,
        registry: HandlerRegistry<P>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        registry.validate()?;
        let reaper = ZombieReaper::new(store.clone(), config.zombie_delta()?);
        Ok(Self {
            wrapper: ExecutionWrapper::new(store.clone(), tenants),
            store,
            registry,
            reaper,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// One full cycle without the trailing sleep.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, EngineError> {
        let dispatch = self.dispatch_next().await?;
        let reaped = self.reaper.sweep().await?;
        Ok(CycleOutcome { dispatch, reaped })
    }

    async fn dispatch_next(&self) -> Result<Dispatch, EngineError> {
        let Some(job) = self.store.oldest_active_job(P::TYPE).await? else {
            return Ok(Dispatch::Idle);
        };

        let failed = self
            .store
            .list_processes(job.id)
            .await?
            .into_iter()
            .find(|p| p.status == Status::Failed);
        if let Some(failed) = failed {
            let reason = failed.log_message.as_deref().unwrap_or("failed");
            let message = stage_failure_message(&failed.stage, reason);
            self.fail_job(job.id, &message).await?;
            warn!(
                worker = %self.config.name,
                job_id = %job.id,
                stage = %failed.stage,
                "job failed by failed process"
            );
            return Ok(Dispatch::Propagated {
                job_id: job.id,
                stage: failed.stage,
            });
        }

        let Some(process) = self.store.oldest_pending_process(job.id).await? else {
            debug!(worker = %self.config.name, job_id = %job.id, "head job has no pending process");
            return Ok(Dispatch::Waiting { job_id: job.id });
        };

        let resolved = resolve_stage::<P>(&process)
            .and_then(|stage| Ok((stage, self.registry.resolve(stage)?)));
        let (stage, handler) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => return self.reject(job.id, process, err).await,
        };

        if job.status == Status::Pending {
            self.store
                .update_job(job.id, RecordUpdate::status(Status::Processing), Utc::now())
                .await?;
        }

        let process_id = process.id;
        match self.wrapper.run::<P>(process, handler.as_ref()).await {
            Ok(()) => {
                info!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    process_id = %process_id,
                    stage = stage.as_str(),
                    "stage completed"
                );
                Ok(Dispatch::Ran {
                    job_id: job.id,
                    process_id,
                    stage: stage.as_str().to_string(),
                })
            }
            Err(DispatchError::Store(err)) => Err(err.into()),
            Err(err) => {
                let message = stage_failure_message(stage.as_str(), &err.to_string());
                self.fail_job(job.id, &message).await?;
                warn!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    process_id = %process_id,
                    stage = stage.as_str(),
                    error = %err,
                    "stage failed"
                );
                Ok(Dispatch::Failed {
                    job_id: job.id,
                    process_id,
                    stage: stage.as_str().to_string(),
                    message,
                })
            }
        }
    }

    /// A process no handler can run: fail it and its job so it is never picked again.
    async fn reject(
        &self,
        job_id: JobId,
        process: Process,
        err: EngineError,
    ) -> Result<Dispatch, EngineError> {
        let reason = err.to_string();
        self.store
            .update_process(process.id, RecordUpdate::failed(reason.clone()), Utc::now())
            .await?;
        let message = stage_failure_message(&process.stage, &reason);
        self.fail_job(job_id, &message).await?;
        error!(
            worker = %self.config.name,
            job_id = %job_id,
            process_id = %process.id,
            stage = %process.stage,
            error = %err,
            "process rejected, no handler can run it"
        );
        Ok(Dispatch::Rejected {
            job_id,
            process_id: process.id,
            stage: process.stage,
            message,
        })
    }

    /// Fail the job; a job a handler already moved to a terminal state stays as is.
    async fn fail_job(&self, job_id: JobId, message: &str) -> Result<(), EngineError> {
        match self
            .store
            .update_job(job_id, RecordUpdate::failed(message), Utc::now())
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::Domain(err)) => {
                warn!(job_id = %job_id, error = %err, "job already terminal, not failed");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Cycle until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// Handler failures and unrunnable processes never end the loop; store errors do.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        info!(worker = %self.config.name, pipeline = %P::TYPE, "pipeline worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(outcome) => {
                    if outcome.dispatch == Dispatch::Idle {
                        debug!(worker = %self.config.name, "no active job");
                    }
                }
                Err(err) => {
                    error!(worker = %self.config.name, error = %err, "pipeline worker stopped on fatal error");
                    return Err(err);
                }
            }

            if !sleep_or_shutdown(self.config.poll_interval, &mut shutdown).await {
                break;
            }
        }

        info!(worker = %self.config.name, "pipeline worker stopped");
        Ok(())
    }

    /// Run on a tokio task.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });
        WorkerHandle::new(shutdown_tx, join)
    }
}

/// Sleep for `interval` or until the shutdown value changes.
///
/// Returns `false` once the sender is gone; the caller re-reads the value.
pub(crate) async fn sleep_or_shutdown(
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        changed = shutdown.changed() => changed.is_ok(),
    }
}

/// Handle to control and join a background loop.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<Result<(), EngineError>>>,
}

impl WorkerHandle {
    pub(crate) fn new(
        shutdown: watch::Sender<bool>,
        join: JoinHandle<Result<(), EngineError>>,
    ) -> Self {
        Self {
            shutdown,
            join: Some(join),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Request graceful shutdown and wait for the loop to stop.
    pub async fn shutdown(mut self) -> Result<(), EngineError> {
        let _ = self.shutdown.send(true);
        match self.join.take() {
            Some(join) => join.await.map_err(|e| EngineError::Task(e.to_string()))?,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use crate::tenants::InMemoryTenantDirectory;
    use crate::testing::{
        Advance, Demo, DemoStage, FailWith, Noop, Requeue, advancing_registry, seed_job, seeded,
        tenant,
    };
    use std::sync::Arc;

    fn worker(
        store: &SharedStore,
        tenants: &SharedTenants,
        registry: HandlerRegistry<Demo>,
    ) -> PipelineWorker<Demo> {
        PipelineWorker::new(
            store.clone(),
            tenants.clone(),
            registry,
            EngineConfig::default().with_name("demo"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn incomplete_registry_is_rejected() {
        let (store, tenants, _, _) = seeded().await;
        let registry = HandlerRegistry::<Demo>::new().with(DemoStage::Start, Noop);
        let err = PipelineWorker::new(store, tenants, registry, EngineConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::UnregisteredStage { .. }));
    }

    #[tokio::test]
    async fn idle_when_nothing_is_active() {
        let store: SharedStore = Arc::new(InMemoryJobStore::new());
        let tenants: SharedTenants = Arc::new(InMemoryTenantDirectory::new());
        let worker = worker(&store, &tenants, advancing_registry());
        let outcome = worker.run_cycle().await.unwrap();
        assert_eq!(outcome.dispatch, Dispatch::Idle);
        assert!(outcome.reaped.is_empty());
    }

    #[tokio::test]
    async fn cycles_drive_a_job_to_completion() {
        let (store, tenants, job, _) = seeded().await;
        let worker = worker(&store, &tenants, advancing_registry());

        for _ in 0..3 {
            let outcome = worker.run_cycle().await.unwrap();
            assert!(matches!(outcome.dispatch, Dispatch::Ran { .. }));
            for p in store.list_processes(job.id).await.unwrap() {
                assert_ne!(p.status, Status::Processing);
            }
        }

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, Status::Completed);
        assert_eq!(job.retry_count, 3);
        assert_eq!(worker.run_cycle().await.unwrap().dispatch, Dispatch::Idle);
    }

    #[tokio::test]
    async fn handler_failure_fails_job_in_same_cycle() {
        let (store, tenants, job, seed) = seeded().await;
        let registry = advancing_registry().with(DemoStage::Start, FailWith("file not found"));
        let worker = worker(&store, &tenants, registry);

        let outcome = worker.run_cycle().await.unwrap();
        assert!(matches!(outcome.dispatch, Dispatch::Failed { ref stage, .. } if stage == "start"));

        let process = store.get_process(seed.id).await.unwrap().unwrap();
        assert_eq!(process.status, Status::Failed);
        assert_eq!(process.log_message.as_deref(), Some("file not found"));
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, Status::Failed);
        assert_eq!(job.log_message.as_deref(), Some("start failed: file not found"));
    }

    #[tokio::test]
    async fn head_of_line_job_blocks_younger_jobs() {
        let (store, tenants, first, _) = seeded().await;
        let tenant_id = first.tenant_id;
        let registry = advancing_registry().with(DemoStage::Start, Requeue);
        let worker = worker(&store, &tenants, registry);

        // First cycle: the seed requeues itself and stays pending.
        worker.run_cycle().await.unwrap();
        let (second, _) = seed_job(&store, tenant_id).await;

        // Move the first job's seed out of Pending without finishing the job.
        let waiting = store.oldest_pending_process(first.id).await.unwrap().unwrap();
        store.begin_process_attempt(waiting.id, Utc::now()).await.unwrap();
        store
            .update_process(waiting.id, RecordUpdate::status(Status::Completed), Utc::now())
            .await
            .unwrap();

        let outcome = worker.run_cycle().await.unwrap();
        assert_eq!(outcome.dispatch, Dispatch::Waiting { job_id: first.id });
        let second = store.get_job(second.id).await.unwrap().unwrap();
        assert_eq!(second.status, Status::Pending);
        assert_eq!(second.retry_count, 0);
    }

    #[tokio::test]
    async fn requeued_process_yields_to_younger_siblings() {
        let (store, tenants, job, seed) = seeded().await;
        let work = Process::new(&job, "work", serde_json::json!({ "stage": "work", "data": { "n": 1 } }));
        store.insert_processes(vec![work.clone()]).await.unwrap();
        let registry = advancing_registry().with(DemoStage::Start, Requeue);
        let worker = worker(&store, &tenants, registry);

        let first = worker.run_cycle().await.unwrap();
        assert!(matches!(first.dispatch, Dispatch::Ran { process_id, .. } if process_id == seed.id));
        let second = worker.run_cycle().await.unwrap();
        assert!(matches!(second.dispatch, Dispatch::Ran { process_id, .. } if process_id == work.id));
    }

    #[tokio::test]
    async fn stale_rows_are_reaped_at_end_of_cycle() {
        let (store, tenants, job, seed) = seeded().await;
        let worker = worker(&store, &tenants, advancing_registry());

        let long_ago = Utc::now() - chrono::Duration::minutes(31);
        store.begin_process_attempt(seed.id, long_ago).await.unwrap();
        store
            .update_job(job.id, RecordUpdate::status(Status::Processing), long_ago)
            .await
            .unwrap();

        // No pending work: the cycle waits, then its reaper sweep fails both rows.
        let outcome = worker.run_cycle().await.unwrap();
        assert_eq!(outcome.dispatch, Dispatch::Waiting { job_id: job.id });
        assert_eq!(outcome.reaped, Affected { jobs: 1, processes: 1 });

        let process = store.get_process(seed.id).await.unwrap().unwrap();
        assert_eq!(process.status, Status::Failed);
        assert_eq!(process.retry_count, 2);
    }

    #[tokio::test]
    async fn failed_process_propagates_to_active_job() {
        let (store, tenants, job, seed) = seeded().await;
        let worker = worker(&store, &tenants, advancing_registry());

        let long_ago = Utc::now() - chrono::Duration::minutes(31);
        store.begin_process_attempt(seed.id, long_ago).await.unwrap();
        worker.run_cycle().await.unwrap();

        // Seed was reaped while the job was still Pending.
        let outcome = worker.run_cycle().await.unwrap();
        assert_eq!(
            outcome.dispatch,
            Dispatch::Propagated {
                job_id: job.id,
                stage: "start".to_string()
            }
        );
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, Status::Failed);
        assert_eq!(job.log_message.as_deref(), Some("start failed: timed out (zombie)"));
    }

    #[tokio::test]
    async fn unknown_stage_fails_its_job_and_is_not_redispatched() {
        let (store, tenants, job, seed) = seeded().await;

        store.begin_process_attempt(seed.id, Utc::now()).await.unwrap();
        store
            .update_process(seed.id, RecordUpdate::status(Status::Completed), Utc::now())
            .await
            .unwrap();
        let rogue = Process::new(&job, "publish", serde_json::json!({ "stage": "publish" }));
        store.insert_processes(vec![rogue.clone()]).await.unwrap();

        let outcome = worker(&store, &tenants, advancing_registry())
            .run_cycle()
            .await
            .unwrap();
        match outcome.dispatch {
            Dispatch::Rejected {
                process_id,
                stage,
                message,
                ..
            } => {
                assert_eq!(process_id, rogue.id);
                assert_eq!(stage, "publish");
                assert!(message.starts_with("publish failed: unknown stage `publish`"), "{message}");
            }
            other => panic!("unexpected dispatch: {other:?}"),
        }

        let rogue = store.get_process(rogue.id).await.unwrap().unwrap();
        assert_eq!(rogue.status, Status::Failed);
        assert_eq!(rogue.retry_count, 0);
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, Status::Failed);

        // a restarted worker finds nothing left to run
        let restarted = worker(&store, &tenants, advancing_registry());
        assert_eq!(restarted.run_cycle().await.unwrap().dispatch, Dispatch::Idle);
    }

    #[tokio::test]
    async fn payload_for_another_stage_is_rejected() {
        let (store, tenants, job, seed) = seeded().await;
        store
            .update_process(seed.id, RecordUpdate::failed("superseded"), Utc::now())
            .await
            .unwrap();
        let (other_job, _) = seed_job(&store, job.tenant_id).await;
        let skewed = Process::new(
            &other_job,
            "finish",
            serde_json::json!({ "stage": "work", "data": { "n": 1 } }),
        );
        store.insert_processes(vec![skewed.clone()]).await.unwrap();

        let worker = worker(&store, &tenants, advancing_registry());
        // first cycle propagates the failed seed of the older job
        assert!(matches!(
            worker.run_cycle().await.unwrap().dispatch,
            Dispatch::Propagated { .. }
        ));
        // the younger job's seed runs, then the skewed process is rejected
        assert!(matches!(
            worker.run_cycle().await.unwrap().dispatch,
            Dispatch::Ran { .. }
        ));
        assert!(matches!(
            worker.run_cycle().await.unwrap().dispatch,
            Dispatch::Rejected { .. }
        ));
        let skewed = store.get_process(skewed.id).await.unwrap().unwrap();
        assert_eq!(skewed.status, Status::Failed);
        let other_job = store.get_job(other_job.id).await.unwrap().unwrap();
        assert_eq!(other_job.status, Status::Failed);
    }

    #[tokio::test]
    async fn spawned_worker_shuts_down_cleanly() {
        let store: SharedStore = Arc::new(InMemoryJobStore::new());
        let tenant = tenant();
        let tenants: SharedTenants =
            Arc::new(InMemoryTenantDirectory::new().with_tenant(tenant.clone()));
        let (job, _) = seed_job(&store, tenant.id).await;

        let registry = HandlerRegistry::<Demo>::new()
            .with(DemoStage::Start, Advance)
            .with(DemoStage::Work, Advance)
            .with(DemoStage::Finish, Advance);
        let worker = PipelineWorker::new(
            store.clone(),
            tenants,
            registry,
            EngineConfig::default().with_poll_interval(Duration::from_millis(5)),
        )
        .unwrap();

        let handle = worker.spawn();
        for _ in 0..200 {
            let current = store.get_job(job.id).await.unwrap().unwrap();
            if current.status == Status::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await.unwrap();

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, Status::Completed);
    }
}
