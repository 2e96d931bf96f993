//! Small pipeline and handlers shared by the unit tests of this crate.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pipesync_core::{Job, PipelineType, Process, Tenant, TenantId};

use crate::context::StageContext;
use crate::error::StageError;
use crate::pipeline::{HandlerRegistry, Pipeline, StageHandler, StageKind, StagePayload};
use crate::store::{InMemoryJobStore, SharedStore};
use crate::tenants::{InMemoryTenantDirectory, SharedTenants};

pub struct Demo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DemoStage {
    Start,
    Work,
    Finish,
}

impl StageKind for DemoStage {
    const ALL: &'static [Self] = &[DemoStage::Start, DemoStage::Work, DemoStage::Finish];

    fn as_str(&self) -> &'static str {
        match self {
            DemoStage::Start => "start",
            DemoStage::Work => "work",
            DemoStage::Finish => "finish",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data", rename_all = "snake_case")]
pub enum DemoPayload {
    Start,
    Work { n: u32 },
    Finish,
}

impl StagePayload for DemoPayload {
    type Stage = DemoStage;

    fn stage(&self) -> DemoStage {
        match self {
            DemoPayload::Start => DemoStage::Start,
            DemoPayload::Work { .. } => DemoStage::Work,
            DemoPayload::Finish => DemoStage::Finish,
        }
    }
}

impl Pipeline for Demo {
    const TYPE: PipelineType = PipelineType::VariantSync;

    type Stage = DemoStage;
    type Payload = DemoPayload;

    fn seed_payload() -> DemoPayload {
        DemoPayload::Start
    }
}

/// Succeeds without touching anything.
pub struct Noop;

#[async_trait]
impl StageHandler<Demo> for Noop {
    async fn handle(&self, _ctx: &StageContext<Demo>) -> Result<(), StageError> {
        Ok(())
    }
}

pub struct FailWith(pub &'static str);

#[async_trait]
impl StageHandler<Demo> for FailWith {
    async fn handle(&self, _ctx: &StageContext<Demo>) -> Result<(), StageError> {
        Err(StageError::failed(self.0))
    }
}

/// Puts its process back to `Pending`.
pub struct Requeue;

#[async_trait]
impl StageHandler<Demo> for Requeue {
    async fn handle(&self, ctx: &StageContext<Demo>) -> Result<(), StageError> {
        ctx.requeue("waiting").await
    }
}

/// Spawns the next stage and completes itself; the last stage completes the job.
pub struct Advance;

#[async_trait]
impl StageHandler<Demo> for Advance {
    async fn handle(&self, ctx: &StageContext<Demo>) -> Result<(), StageError> {
        match ctx.stage() {
            DemoStage::Start => {
                ctx.spawn(DemoPayload::Work { n: 1 }).await?;
            }
            DemoStage::Work => {
                ctx.spawn(DemoPayload::Finish).await?;
            }
            DemoStage::Finish => {
                ctx.complete().await?;
                ctx.complete_job("done").await?;
                return Ok(());
            }
        }
        ctx.complete().await
    }
}

pub fn advancing_registry() -> HandlerRegistry<Demo> {
    HandlerRegistry::new()
        .with(DemoStage::Start, Advance)
        .with(DemoStage::Work, Advance)
        .with(DemoStage::Finish, Advance)
}

pub fn tenant() -> Tenant {
    Tenant::new(TenantId::new(), "demo.example.com").with_pipeline(Demo::TYPE)
}

/// Store with one registered tenant and one freshly created demo job.
pub async fn seeded() -> (SharedStore, SharedTenants, Job, Process) {
    let tenant = tenant();
    let store: SharedStore = Arc::new(InMemoryJobStore::new());
    let (job, seed) = seed_job(&store, tenant.id).await;
    let tenants: SharedTenants = Arc::new(InMemoryTenantDirectory::new().with_tenant(tenant));
    (store, tenants, job, seed)
}

pub async fn seed_job(store: &SharedStore, tenant_id: TenantId) -> (Job, Process) {
    let job = Job::new(tenant_id, Demo::TYPE, serde_json::json!({}));
    let payload = Demo::seed_payload()
        .to_value()
        .unwrap();
    let seed = Process::new(&job, DemoStage::Start.as_str(), payload);
    store.create_job(job, seed).await.unwrap()
}
