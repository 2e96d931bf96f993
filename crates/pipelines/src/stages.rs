//! Stages shared by spreadsheet-driven pipelines.
//!
//! Both sync pipelines have the same shape:
//!
//! ```text
//! download_file -> parse_file -> <batch> x N -> finish
//! ```
//!
//! Only the row type and the commerce call of the batch stage differ, so the
//! download, parse and finish handlers are generic over [`SheetPipeline`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use pipesync_core::Status;
use pipesync_engine::{Pipeline, StageContext, StageError, StageHandler, StageKind};

use crate::batch::{BatchResult, DEFAULT_BATCH_SIZE, RunSummary, partition};
use crate::collaborators::{FileSource, SheetDecoder, SheetRow};

/// Handler settings shared by the sync pipelines.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub batch_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl SyncSettings {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// A pipeline fed by a spreadsheet dropped into the tenant's inbox.
pub trait SheetPipeline: Pipeline {
    type Row: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static;

    const BATCH_STAGE: Self::Stage;
    const FINISH_STAGE: Self::Stage;

    fn parse_file(file_name: String) -> Self::Payload;
    fn file_name(payload: &Self::Payload) -> Option<&str>;
    fn batch(index: usize, rows: Vec<Self::Row>) -> Self::Payload;
    /// Counters of a completed batch payload.
    fn batch_result(payload: &Self::Payload) -> Option<BatchResult>;
    fn finish() -> Self::Payload;

    /// Map one decoded row; `Err` carries the reason the row is skipped.
    fn map_row(row: &SheetRow) -> Result<Self::Row, String>;
}

/// Locate the newest inbox file and hand it to the parse stage.
pub struct DownloadFile<P> {
    files: Arc<dyn FileSource>,
    _pipeline: PhantomData<fn() -> P>,
}

impl<P> DownloadFile<P> {
    pub fn new(files: Arc<dyn FileSource>) -> Self {
        Self {
            files,
            _pipeline: PhantomData,
        }
    }
}

#[async_trait]
impl<P: SheetPipeline> StageHandler<P> for DownloadFile<P> {
    async fn handle(&self, ctx: &StageContext<P>) -> Result<(), StageError> {
        let Some(file) = self.files.latest(&ctx.tenant, P::TYPE).await? else {
            return Err(StageError::failed("file not found"));
        };

        let mut summary = RunSummary::from_payload(&ctx.job.payload)?;
        summary.file_name = Some(file.name.clone());
        ctx.update_job_payload(summary.to_payload()?).await?;

        ctx.spawn(P::parse_file(file.name.clone())).await?;
        ctx.complete_with(format!("found {}", file.name)).await
    }
}

/// Decode the file, skip malformed rows and fan out fixed-size batches.
pub struct ParseFile<P> {
    files: Arc<dyn FileSource>,
    decoder: Arc<dyn SheetDecoder>,
    batch_size: usize,
    _pipeline: PhantomData<fn() -> P>,
}

impl<P> ParseFile<P> {
    pub fn new(
        files: Arc<dyn FileSource>,
        decoder: Arc<dyn SheetDecoder>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            files,
            decoder,
            batch_size: settings.batch_size.max(1),
            _pipeline: PhantomData,
        }
    }
}

#[async_trait]
impl<P: SheetPipeline> StageHandler<P> for ParseFile<P> {
    async fn handle(&self, ctx: &StageContext<P>) -> Result<(), StageError> {
        let name = P::file_name(&ctx.payload)
            .ok_or_else(|| StageError::Payload("parse stage without a file name".to_string()))?;
        let bytes = self.files.fetch(&ctx.tenant, P::TYPE, name).await?;
        let sheet = self.decoder.decode(&bytes)?;

        let mut rows = Vec::with_capacity(sheet.len());
        let mut malformed = 0;
        for row in &sheet {
            match P::map_row(row) {
                Ok(mapped) => rows.push(mapped),
                Err(reason) => {
                    malformed += 1;
                    warn!(
                        job_id = %ctx.job.id,
                        file = name,
                        line = row.line,
                        reason = %reason,
                        "skipping malformed row"
                    );
                }
            }
        }

        let mut summary = RunSummary::from_payload(&ctx.job.payload)?;
        summary.rows = rows.len();
        summary.malformed = malformed;

        let successors: Vec<P::Payload> = if rows.is_empty() {
            vec![P::finish()]
        } else {
            partition(rows, self.batch_size)
                .into_iter()
                .enumerate()
                .map(|(index, batch)| P::batch(index, batch))
                .collect()
        };
        summary.batches = if summary.rows == 0 { 0 } else { successors.len() };
        ctx.update_job_payload(summary.to_payload()?).await?;

        ctx.spawn_all(successors).await?;
        ctx.complete_with(format!(
            "parsed {} rows into {} batches ({} malformed)",
            summary.rows, summary.batches, malformed
        ))
        .await
    }
}

/// Complete a batch process and create the `Finish` process when it is the last
/// active batch of its job.
pub async fn complete_batch<P: SheetPipeline>(
    ctx: &StageContext<P>,
    completed: P::Payload,
    result: BatchResult,
) -> Result<(), StageError> {
    let siblings = ctx.siblings().await?;
    let batch = P::BATCH_STAGE.as_str();
    let finish = P::FINISH_STAGE.as_str();

    let batches_active = siblings.iter().any(|p| p.stage == batch && p.is_active());
    let finish_exists = siblings.iter().any(|p| p.stage == finish);
    if !batches_active && !finish_exists {
        debug!(job_id = %ctx.job.id, "last batch done, creating finish");
        ctx.spawn(P::finish()).await?;
    }

    ctx.complete_with_payload(
        completed,
        format!("updated {}, skipped {}", result.updated, result.skipped),
    )
    .await
}

/// Fan-in: complete the job once every other process is done.
pub struct Finish<P> {
    _pipeline: PhantomData<fn() -> P>,
}

impl<P> Default for Finish<P> {
    fn default() -> Self {
        Self {
            _pipeline: PhantomData,
        }
    }
}

#[async_trait]
impl<P: SheetPipeline> StageHandler<P> for Finish<P> {
    async fn handle(&self, ctx: &StageContext<P>) -> Result<(), StageError> {
        let siblings = ctx.siblings().await?;

        let failed: Vec<_> = siblings
            .iter()
            .filter(|p| p.status == Status::Failed)
            .collect();
        if !failed.is_empty() {
            let detail = failed
                .iter()
                .map(|p| format!("{} ({})", p.stage, p.log_message.as_deref().unwrap_or("no message")))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(StageError::failed(format!(
                "{} of {} processes failed: {}",
                failed.len(),
                siblings.len(),
                detail
            )));
        }

        let active = siblings.iter().filter(|p| p.is_active()).count();
        if active > 0 {
            debug!(job_id = %ctx.job.id, active, "finish deferred");
            return ctx.requeue(format!("waiting for {active} processes")).await;
        }

        let mut summary = RunSummary::from_payload(&ctx.job.payload)?;
        summary.updated = 0;
        summary.skipped = 0;
        let batch = P::BATCH_STAGE.as_str();
        for process in siblings.iter().filter(|p| p.stage == batch) {
            let payload: P::Payload = serde_json::from_value(process.payload.clone())?;
            if let Some(result) = P::batch_result(&payload) {
                summary.add(result);
            }
        }

        let message = summary.message();
        ctx.update_job_payload(summary.to_payload()?).await?;
        ctx.complete_with(message.clone()).await?;
        ctx.complete_job(message.clone()).await?;
        info!(
            pipeline = %P::TYPE,
            job_id = %ctx.job.id,
            tenant = %ctx.tenant.shop_domain,
            summary = %message,
            "job completed"
        );
        Ok(())
    }
}
