//! Recurring trigger for every enabled tenant.

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::admin::{Admin, AdminError};
use crate::config::SchedulerConfig;
use crate::error::EngineError;
use crate::tenants::SharedTenants;
use crate::worker::{WorkerHandle, sleep_or_shutdown};

/// Result of one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    pub triggered: usize,
    /// Tenants that still had an active job
    pub skipped: usize,
}

pub struct Scheduler {
    admin: Admin,
    tenants: SharedTenants,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(admin: Admin, tenants: SharedTenants, config: SchedulerConfig) -> Self {
        Self {
            admin,
            tenants,
            config,
        }
    }

    /// Trigger each enabled tenant's pipelines once.
    pub async fn tick(&self) -> Result<ScheduleReport, AdminError> {
        let mut report = ScheduleReport::default();

        for pipeline in &self.config.pipelines {
            for tenant in self.tenants.list_enabled(*pipeline).await? {
                match self.admin.trigger(tenant.id, *pipeline).await {
                    Ok(_) => report.triggered += 1,
                    Err(AdminError::AlreadyActive { .. }) => report.skipped += 1,
                    Err(err @ (AdminError::TenantNotFound(_) | AdminError::PipelineNotRegistered(_))) => {
                        warn!(
                            scheduler = %self.config.name,
                            tenant_id = %tenant.id,
                            pipeline = %pipeline,
                            error = %err,
                            "skipping scheduled trigger"
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(report)
    }

    /// Tick every `interval` until shutdown. Failed passes are logged and retried
    /// on the next interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        info!(scheduler = %self.config.name, interval = ?self.config.interval, "scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(report) => info!(
                    scheduler = %self.config.name,
                    triggered = report.triggered,
                    skipped = report.skipped,
                    "scheduling pass done"
                ),
                Err(err) => warn!(scheduler = %self.config.name, error = %err, "scheduling pass failed"),
            }

            if !sleep_or_shutdown(self.config.interval, &mut shutdown).await {
                break;
            }
        }

        info!(scheduler = %self.config.name, "scheduler stopped");
        Ok(())
    }

    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move { self.run(shutdown_rx).await });
        WorkerHandle::new(shutdown_tx, join)
    }
}
