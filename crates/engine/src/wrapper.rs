//! Bookkeeping around one handler invocation.
//!
//! 1. resolve tenant (missing: fail the process, abort)
//! 2. process: `Processing`, `retry_count + 1`, `updated_at = now`
//! 3. job: `retry_count + 1`, `updated_at = now` (status untouched)
//! 4. decode payload, invoke handler
//! 5. success: nothing implicit, the handler moved its own process
//! 6. error: process `Failed` with the error text, re-raise

use chrono::Utc;
use tracing::{debug, warn};

use pipesync_core::Process;

use crate::context::StageContext;
use crate::error::{DispatchError, StageError};
use crate::pipeline::{Pipeline, StageHandler, decode_payload};
use crate::store::{RecordUpdate, SharedStore};
use crate::tenants::SharedTenants;

#[derive(Clone)]
pub struct ExecutionWrapper {
    store: SharedStore,
    tenants: SharedTenants,
}

impl ExecutionWrapper {
    pub fn new(store: SharedStore, tenants: SharedTenants) -> Self {
        Self { store, tenants }
    }

    pub async fn run<P: Pipeline>(
        &self,
        process: Process,
        handler: &dyn StageHandler<P>,
    ) -> Result<(), DispatchError> {
        let Some(tenant) = self.tenants.get(process.tenant_id).await? else {
            let err = DispatchError::TenantNotFound(process.tenant_id);
            self.store
                .update_process(process.id, RecordUpdate::failed(err.to_string()), Utc::now())
                .await?;
            return Err(err);
        };

        let now = Utc::now();
        let process = self.store.begin_process_attempt(process.id, now).await?;
        let job = self.store.record_job_attempt(process.job_id, now).await?;

        debug!(
            pipeline = %P::TYPE,
            job_id = %job.id,
            process_id = %process.id,
            stage = %process.stage,
            attempt = process.retry_count,
            tenant = %tenant.shop_domain,
            "invoking stage handler"
        );

        let process_id = process.id;
        let result = match decode_payload::<P>(&process) {
            Ok(payload) => {
                let ctx = StageContext::<P>::new(self.store.clone(), tenant, job, process, payload);
                handler.handle(&ctx).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.mark_failed(process_id, &err).await;
                Err(err.into())
            }
        }
    }

    /// Record a handler failure on the process; the handler error wins over a
    /// bookkeeping error here.
    async fn mark_failed(&self, process_id: pipesync_core::ProcessId, err: &StageError) {
        let update = RecordUpdate::failed(err.to_string());
        if let Err(store_err) = self.store.update_process(process_id, update, Utc::now()).await {
            warn!(
                process_id = %process_id,
                error = %store_err,
                "could not record stage failure on process"
            );
        }
    }
}
