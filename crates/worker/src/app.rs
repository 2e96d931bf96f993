//! Process wiring: Postgres stores, collaborators, one loop per pipeline and the
//! scheduler.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use pipesync_core::PipelineType;
use pipesync_engine::{
    Admin, EngineConfig, EngineError, HandlerRegistry, Pipeline, PipelineWorker, PostgresJobStore,
    PostgresTenantDirectory, Scheduler, SharedStore, SharedTenants,
};
use pipesync_pipelines::{
    Collaborators, CsvSheetDecoder, SyncSettings, TrackingSync, VariantSync, tracking_sync,
    variant_sync,
};

use crate::commerce::HttpCommerceAdmin;
use crate::config::WorkerConfig;
use crate::inbox::DirectoryFileSource;

type Tasks = JoinSet<Result<(), EngineError>>;

/// Run every configured loop until `shutdown` flips to `true`.
///
/// The first loop that ends with an error stops the others and is returned.
pub async fn run(config: WorkerConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;

    let job_store = PostgresJobStore::new(pool.clone());
    job_store
        .ensure_schema()
        .await
        .context("failed to apply the sync engine schema")?;
    let store: SharedStore = Arc::new(job_store);
    let tenants: SharedTenants = Arc::new(PostgresTenantDirectory::new(pool));

    let commerce = HttpCommerceAdmin::new(&config.commerce)
        .context("failed to build the commerce admin client")?;
    let collaborators = Collaborators::new(
        Arc::new(DirectoryFileSource::new(&config.inbox_dir)),
        Arc::new(CsvSheetDecoder::default()),
        Arc::new(commerce),
    );
    let settings = SyncSettings::default().with_batch_size(config.batch_size);

    let mut tasks = Tasks::new();
    let mut admin = Admin::new(store.clone(), tenants.clone());
    for pipeline in &config.pipelines {
        let engine = config
            .engine
            .clone()
            .with_name(format!("{pipeline}-worker"));
        match pipeline {
            PipelineType::VariantSync => {
                let registry = variant_sync::registry(&collaborators, &settings);
                spawn_worker(&mut tasks, &store, &tenants, registry, engine, &shutdown)?;
                admin = admin.with_pipeline::<VariantSync>()?;
            }
            PipelineType::TrackingSync => {
                let registry = tracking_sync::registry(&collaborators, &settings);
                spawn_worker(&mut tasks, &store, &tenants, registry, engine, &shutdown)?;
                admin = admin.with_pipeline::<TrackingSync>()?;
            }
        }
    }

    if let Some(schedule) = config.schedule.clone() {
        let scheduler = Scheduler::new(admin, tenants.clone(), schedule);
        let rx = shutdown.clone();
        tasks.spawn(async move { scheduler.run(rx).await });
    }

    info!(
        pipelines = ?config.pipelines,
        scheduled = config.schedule.is_some(),
        inbox = %config.inbox_dir.display(),
        "pipesync worker started"
    );

    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result.map_err(anyhow::Error::from),
            Err(err) => Err(anyhow::anyhow!("worker task panicked or was cancelled: {err}")),
        };
        if let Err(err) = result {
            error!(error = %err, "worker loop stopped, shutting down");
            tasks.abort_all();
            return Err(err);
        }
    }

    info!("pipesync worker stopped");
    Ok(())
}

fn spawn_worker<P: Pipeline>(
    tasks: &mut Tasks,
    store: &SharedStore,
    tenants: &SharedTenants,
    registry: HandlerRegistry<P>,
    engine: EngineConfig,
    shutdown: &watch::Receiver<bool>,
) -> Result<(), EngineError> {
    let worker = PipelineWorker::new(store.clone(), tenants.clone(), registry, engine)?;
    let rx = shutdown.clone();
    tasks.spawn(async move { worker.run(rx).await });
    Ok(())
}
