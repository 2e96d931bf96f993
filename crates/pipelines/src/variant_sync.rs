//! Product variant price & inventory sync.
//!
//! ```text
//! download_file -> parse_file -> update_batch x N -> finish
//! ```

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

pub struct VariantSync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantStage {
    DownloadFile,
    ParseFile,
    UpdateBatch,
    Finish,
}

impl StageKind for VariantStage {
    const ALL: &'static [Self] = &[
        VariantStage::DownloadFile,
        VariantStage::ParseFile,
        VariantStage::UpdateBatch,
        VariantStage::Finish,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            VariantStage::DownloadFile => "download_file",
            VariantStage::ParseFile => "parse_file",
            VariantStage::UpdateBatch => "update_batch",
            VariantStage::Finish => "finish",
        }
    }
}

/// One variant update: at least one of price / inventory is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRow {
    pub sku: String,
    /// Decimal string as sent to the commerce API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<i64>,
}

impl VariantRow {
    pub fn from_sheet(row: &SheetRow) -> Result<Self, String> {
        let sku = row.get("sku").ok_or("missing sku")?.to_string();

        let price = match row.get("price") {
            Some(raw) => Some(parse_price(raw)?),
            None => None,
        };
        let inventory = match row.get("inventory") {
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| format!("inventory `{raw}` is not a whole number"))?,
            ),
            None => None,
        };
        if price.is_none() && inventory.is_none() {
            return Err(format!("sku {sku} has neither price nor inventory"));
        }

        Ok(Self {
            sku,
            price,
            inventory,
        })
    }
}

fn parse_price(raw: &str) -> Result<String, String> {
    let cleaned = raw.trim_start_matches('$').replace(',', "");
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(cleaned),
        _ => Err(format!("price `{raw}` is not a non-negative amount")),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data", rename_all = "snake_case")]
pub enum VariantPayload {
    DownloadFile,
    ParseFile {
        file_name: String,
    },
    UpdateBatch {
        index: usize,
        rows: Vec<VariantRow>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<BatchResult>,
    },
    Finish,
}

impl StagePayload for VariantPayload {
    type Stage = VariantStage;

    fn stage(&self) -> VariantStage {
        match self {
            VariantPayload::DownloadFile => VariantStage::DownloadFile,
            VariantPayload::ParseFile { .. } => VariantStage::ParseFile,
            VariantPayload::UpdateBatch { .. } => VariantStage::UpdateBatch,
            VariantPayload::Finish => VariantStage::Finish,
        }
    }
}

impl Pipeline for VariantSync {
    const TYPE: PipelineType = PipelineType::VariantSync;

    type Stage = VariantStage;
    type Payload = VariantPayload;

    fn seed_payload() -> VariantPayload {
        VariantPayload::DownloadFile
    }
}

impl SheetPipeline for VariantSync {
    type Row = VariantRow;

    const BATCH_STAGE: VariantStage = VariantStage::UpdateBatch;
    const FINISH_STAGE: VariantStage = VariantStage::Finish;

    fn parse_file(file_name: String) -> VariantPayload {
        VariantPayload::ParseFile { file_name }
    }

    fn file_name(payload: &VariantPayload) -> Option<&str> {
        match payload {
            VariantPayload::ParseFile { file_name } => Some(file_name),
            _ => None,
        }
    }

    fn batch(index: usize, rows: Vec<VariantRow>) -> VariantPayload {
        VariantPayload::UpdateBatch {
            index,
            rows,
            result: None,
        }
    }

    fn batch_result(payload: &VariantPayload) -> Option<BatchResult> {
        match payload {
            VariantPayload::UpdateBatch { result, .. } => *result,
            _ => None,
        }
    }

    fn finish() -> VariantPayload {
        VariantPayload::Finish
    }

    fn map_row(row: &SheetRow) -> Result<VariantRow, String> {
        VariantRow::from_sheet(row)
    }
}

/// Push one batch of variant updates to the commerce platform.
pub struct UpdateVariants {
    commerce: Arc<dyn CommerceAdmin>,
}

impl UpdateVariants {
    pub fn new(commerce: Arc<dyn CommerceAdmin>) -> Self {
        Self { commerce }
    }
}

#[async_trait]
impl StageHandler<VariantSync> for UpdateVariants {
    async fn handle(&self, ctx: &StageContext<VariantSync>) -> Result<(), StageError> {
        let VariantPayload::UpdateBatch { index, rows, .. } = &ctx.payload else {
            return Err(StageError::Payload("expected an update_batch payload".to_string()));
        };

        let outcome = self.commerce.update_variants(&ctx.tenant, rows).await?;
        for item in &outcome.skipped {
            warn!(
                job_id = %ctx.job.id,
                batch = index,
                sku = %item.key,
                reason = %item.reason,
                "variant update skipped"
            );
        }

        let result = BatchResult {
            updated: outcome.updated,
            skipped: outcome.skipped.len(),
        };
        let completed = VariantPayload::UpdateBatch {
            index: *index,
            rows: rows.clone(),
            result: Some(result),
        };
        complete_batch(ctx, completed, result).await
    }
}

pub fn registry(collaborators: &Collaborators, settings: &SyncSettings) -> HandlerRegistry<VariantSync> {
    HandlerRegistry::new()
        .with(
            VariantStage::DownloadFile,
            DownloadFile::new(collaborators.files.clone()),
        )
        .with(
            VariantStage::ParseFile,
            ParseFile::new(collaborators.files.clone(), collaborators.decoder.clone(), settings),
        )
        .with(
            VariantStage::UpdateBatch,
            UpdateVariants::new(collaborators.commerce.clone()),
        )
        .with(VariantStage::Finish, Finish::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(cells: &[(&str, &str)]) -> SheetRow {
        cells
            .iter()
            .fold(SheetRow::new(1), |row, (h, v)| row.with_cell(h, *v))
    }

    #[test]
    fn rows_need_sku_and_one_value() {
        let ok = VariantRow::from_sheet(&sheet(&[("sku", "A-1"), ("price", "$1,299.50")])).unwrap();
        assert_eq!(ok.price.as_deref(), Some("1299.50"));
        assert_eq!(ok.inventory, None);

        assert!(VariantRow::from_sheet(&sheet(&[("price", "3")])).is_err());
        assert!(VariantRow::from_sheet(&sheet(&[("sku", "A-1")])).is_err());
        assert!(VariantRow::from_sheet(&sheet(&[("sku", "A-1"), ("price", "-2")])).is_err());
        assert!(VariantRow::from_sheet(&sheet(&[("sku", "A-1"), ("inventory", "2.5")])).is_err());
    }

    #[test]
    fn payload_tag_matches_stage() {
        let payload = VariantSync::batch(0, Vec::new()).to_value().unwrap();
        assert_eq!(payload["stage"], "update_batch");
        assert!(payload["data"].get("result").is_none());

        let seed = VariantSync::seed_payload().to_value().unwrap();
        assert_eq!(seed, serde_json::json!({ "stage": "download_file" }));
    }
}
