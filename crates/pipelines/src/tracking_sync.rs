//! Order fulfillment tracking-number sync.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use pipesync_core::PipelineType;
use pipesync_engine::{
    HandlerRegistry, Pipeline, StageContext, StageError, StageHandler, StageKind, StagePayload,
};

use crate::batch::BatchResult;
use crate::collaborators::{Collaborators, CommerceAdmin, SheetRow};
use crate::stages::{DownloadFile, Finish, ParseFile, SheetPipeline, SyncSettings, complete_batch};

pub struct TrackingSync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingStage {
    DownloadFile,
    ParseFile,
    UpdateTracking,
    Finish,
}

impl StageKind for TrackingStage {
    const ALL: &'static [Self] = &[
        TrackingStage::DownloadFile,
        TrackingStage::ParseFile,
        TrackingStage::UpdateTracking,
        TrackingStage::Finish,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            TrackingStage::DownloadFile => "download_file",
            TrackingStage::ParseFile => "parse_file",
            TrackingStage::UpdateTracking => "update_tracking",
            TrackingStage::Finish => "finish",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRow {
    /// Order name as shown in the shop admin, e.g. `#1001`
    pub order_name: String,
    pub tracking_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
}

impl TrackingRow {
    pub fn from_sheet(row: &SheetRow) -> Result<Self, String> {
        let order_name = row.get("order_name").ok_or("missing order_name")?;
        let tracking_number = row
            .get("tracking_number")
            .ok_or_else(|| format!("order {order_name} has no tracking_number"))?;
        if tracking_number.chars().any(char::is_whitespace) {
            return Err(format!("tracking number `{tracking_number}` contains whitespace"));
        }

        let order_name = if order_name.starts_with('#') {
            order_name.to_string()
        } else {
            format!("#{order_name}")
        };
        Ok(Self {
            order_name,
            tracking_number: tracking_number.to_string(),
            carrier: row.get("carrier").map(str::to_string),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data", rename_all = "snake_case")]
pub enum TrackingPayload {
    DownloadFile,
    ParseFile {
        file_name: String,
    },
    UpdateTracking {
        index: usize,
        rows: Vec<TrackingRow>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<BatchResult>,
    },
    Finish,
}

impl StagePayload for TrackingPayload {
    type Stage = TrackingStage;

    fn stage(&self) -> TrackingStage {
        match self {
            TrackingPayload::DownloadFile => TrackingStage::DownloadFile,
            TrackingPayload::ParseFile { .. } => TrackingStage::ParseFile,
            TrackingPayload::UpdateTracking { .. } => TrackingStage::UpdateTracking,
            TrackingPayload::Finish => TrackingStage::Finish,
        }
    }
}

impl Pipeline for TrackingSync {
    const TYPE: PipelineType = PipelineType::TrackingSync;

    type Stage = TrackingStage;
    type Payload = TrackingPayload;

    fn seed_payload() -> TrackingPayload {
        TrackingPayload::DownloadFile
    }
}

impl SheetPipeline for TrackingSync {
    type Row = TrackingRow;

    const BATCH_STAGE: TrackingStage = TrackingStage::UpdateTracking;
    const FINISH_STAGE: TrackingStage = TrackingStage::Finish;

    fn parse_file(file_name: String) -> TrackingPayload {
        TrackingPayload::ParseFile { file_name }
    }

    fn file_name(payload: &TrackingPayload) -> Option<&str> {
        match payload {
            TrackingPayload::ParseFile { file_name } => Some(file_name),
            _ => None,
        }
    }

    fn batch(index: usize, rows: Vec<TrackingRow>) -> TrackingPayload {
        TrackingPayload::UpdateTracking {
            index,
            rows,
            result: None,
        }
    }

    fn batch_result(payload: &TrackingPayload) -> Option<BatchResult> {
        match payload {
            TrackingPayload::UpdateTracking { result, .. } => *result,
            _ => None,
        }
    }

    fn finish() -> TrackingPayload {
        TrackingPayload::Finish
    }

    fn map_row(row: &SheetRow) -> Result<TrackingRow, String> {
        TrackingRow::from_sheet(row)
    }
}

pub struct UpdateTracking {
    commerce: Arc<dyn CommerceAdmin>,
}

impl UpdateTracking {
    pub fn new(commerce: Arc<dyn CommerceAdmin>) -> Self {
        Self { commerce }
    }
}

#[async_trait]
impl StageHandler<TrackingSync> for UpdateTracking {
    async fn handle(&self, ctx: &StageContext<TrackingSync>) -> Result<(), StageError> {
        let TrackingPayload::UpdateTracking { index, rows, .. } = &ctx.payload else {
            return Err(StageError::Payload("expected an update_tracking payload".to_string()));
        };

        let outcome = self.commerce.update_tracking(&ctx.tenant, rows).await?;
        for item in &outcome.skipped {
            warn!(
                job_id = %ctx.job.id,
                batch = index,
                order = %item.key,
                reason = %item.reason,
                "tracking update skipped"
            );
        }

        let result = BatchResult {
            updated: outcome.updated,
            skipped: outcome.skipped.len(),
        };
        let completed = TrackingPayload::UpdateTracking {
            index: *index,
            rows: rows.clone(),
            result: Some(result),
        };
        complete_batch(ctx, completed, result).await
    }
}

pub fn registry(collaborators: &Collaborators, settings: &SyncSettings) -> HandlerRegistry<TrackingSync> {
    HandlerRegistry::new()
        .with(
            TrackingStage::DownloadFile,
            DownloadFile::new(collaborators.files.clone()),
        )
        .with(
            TrackingStage::ParseFile,
            ParseFile::new(collaborators.files.clone(), collaborators.decoder.clone(), settings),
        )
        .with(
            TrackingStage::UpdateTracking,
            UpdateTracking::new(collaborators.commerce.clone()),
        )
        .with(TrackingStage::Finish, Finish::default())
}
