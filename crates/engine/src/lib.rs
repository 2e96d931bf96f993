//! `pipesync-engine`: durable job/process orchestration.
//!
//! - [`store`]: job/process persistence (in-memory and Postgres)
//! - [`pipeline`]: pipeline definitions, stage handlers, handler registry
//! - [`wrapper`]: status/retry bookkeeping around one handler invocation
//! - [`worker`]: the per-pipeline dispatch loop
//! - [`reaper`]: zombie recovery
//! - [`admin`] / [`scheduler`]: trigger, stop, status, recurring runs

pub mod admin;
pub mod config;
pub mod context;
pub mod error;
pub mod pipeline;
pub mod reaper;
pub mod scheduler;
pub mod store;
pub mod tenants;
pub mod worker;
pub mod wrapper;

#[cfg(test)]
mod testing;

pub use admin::{Admin, AdminError, PipelineStatus, STOP_MESSAGE};
pub use config::{ConfigError, EngineConfig, SchedulerConfig};
pub use context::StageContext;
pub use error::{DispatchError, EngineError, StageError};
pub use pipeline::{HandlerRegistry, Pipeline, StageHandler, StageKind, StagePayload};
pub use reaper::{ZOMBIE_MESSAGE, ZombieReaper};
pub use scheduler::{ScheduleReport, Scheduler};
pub use store::{
    Affected, InMemoryJobStore, JobCounts, JobStore, PostgresJobStore, RecordUpdate, SharedStore,
    StoreError,
};
pub use tenants::{
    InMemoryTenantDirectory, PostgresTenantDirectory, SharedTenants, TenantDirectory,
};
pub use worker::{CycleOutcome, Dispatch, PipelineWorker, WorkerHandle};
pub use wrapper::ExecutionWrapper;
