//! External services the stage handlers talk to.
//!
//! Only their interface lives here; the binary wires real implementations and the
//! tests use [`crate::fakes`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pipesync_core::{PipelineType, Tenant};
use pipesync_engine::StageError;

use crate::tracking_sync::TrackingRow;
use crate::variant_sync::VariantRow;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("rejected: {0}")]
    Rejected(String),
}

impl From<CollaboratorError> for StageError {
    fn from(err: CollaboratorError) -> Self {
        StageError::failed(err.to_string())
    }
}

/// A file waiting in a tenant's inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    pub modified_at: DateTime<Utc>,
}

/// Remote file transfer (SFTP drop, bucket, shared directory, ...).
#[async_trait]
pub trait FileSource: Send + Sync {
    /// Most recently modified file for the tenant's pipeline, if any.
    async fn latest(
        &self,
        tenant: &Tenant,
        pipeline: PipelineType,
    ) -> Result<Option<RemoteFile>, CollaboratorError>;

    async fn fetch(
        &self,
        tenant: &Tenant,
        pipeline: PipelineType,
        name: &str,
    ) -> Result<Vec<u8>, CollaboratorError>;
}

/// One decoded spreadsheet row: normalized header → cell text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRow {
    /// 1-based data line (header excluded)
    pub line: usize,
    cells: BTreeMap<String, String>,
}

impl SheetRow {
    pub fn new(line: usize) -> Self {
        Self {
            line,
            cells: BTreeMap::new(),
        }
    }

    /// Headers are matched trimmed and case-insensitively.
    pub fn with_cell(mut self, header: &str, value: impl Into<String>) -> Self {
        self.cells.insert(normalize_header(header), value.into());
        self
    }

    /// Trimmed, non-empty cell value.
    pub fn get(&self, header: &str) -> Option<&str> {
        self.cells
            .get(&normalize_header(header))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

pub fn normalize_header(header: &str) -> String {
    header.trim().to_ascii_lowercase().replace([' ', '-'], "_")
}

/// Spreadsheet / CSV decoding.
pub trait SheetDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<SheetRow>, CollaboratorError>;
}

/// CSV decoder: first record is the header row.
#[derive(Debug, Clone, Copy)]
pub struct CsvSheetDecoder {
    delimiter: u8,
}

impl Default for CsvSheetDecoder {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl CsvSheetDecoder {
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

impl SheetDecoder for CsvSheetDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<SheetRow>, CollaboratorError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| CollaboratorError::Decode(e.to_string()))?
            .iter()
            .map(normalize_header)
            .collect();

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record.map_err(|e| CollaboratorError::Decode(e.to_string()))?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            let mut row = SheetRow::new(index + 1);
            for (header, value) in headers.iter().zip(record.iter()) {
                row.cells.insert(header.clone(), value.to_string());
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

/// An item the commerce platform refused; the rest of the batch still applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub updated: usize,
    pub skipped: Vec<SkippedItem>,
}

/// Commerce platform admin API.
///
/// `Err` means the whole batch could not be applied; per-item refusals come back
/// as `skipped`.
#[async_trait]
pub trait CommerceAdmin: Send + Sync {
    async fn update_variants(
        &self,
        tenant: &Tenant,
        batch: &[VariantRow],
    ) -> Result<BatchOutcome, CollaboratorError>;

    async fn update_tracking(
        &self,
        tenant: &Tenant,
        batch: &[TrackingRow],
    ) -> Result<BatchOutcome, CollaboratorError>;
}

/// Everything the handlers need from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub files: Arc<dyn FileSource>,
    pub decoder: Arc<dyn SheetDecoder>,
    pub commerce: Arc<dyn CommerceAdmin>,
}

impl Collaborators {
    pub fn new(
        files: Arc<dyn FileSource>,
        decoder: Arc<dyn SheetDecoder>,
        commerce: Arc<dyn CommerceAdmin>,
    ) -> Self {
        Self {
            files,
            decoder,
            commerce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_rows_are_keyed_by_normalized_header() {
        let csv = b"SKU, Price ,Inventory\nA-1, 9.99 ,3\n,,\nB-2,12,\n";
        let rows = CsvSheetDecoder::default().decode(csv).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("sku"), Some("A-1"));
        assert_eq!(rows[0].get("price"), Some("9.99"));
        assert_eq!(rows[0].line, 1);
        assert_eq!(rows[1].get("inventory"), None);
        assert_eq!(rows[1].line, 3);
    }

    #[test]
    fn semicolon_delimited_files_decode() {
        let csv = b"order name;tracking-number;carrier\n#1001;1Z999;UPS\n";
        let rows = CsvSheetDecoder::default()
            .with_delimiter(b';')
            .decode(csv)
            .unwrap();
        assert_eq!(rows[0].get("order_name"), Some("#1001"));
        assert_eq!(rows[0].get("Tracking Number"), Some("1Z999"));
    }

    #[test]
    fn collaborator_errors_become_stage_failures() {
        let err: StageError = CollaboratorError::Transport("connection reset".into()).into();
        assert_eq!(err.to_string(), "transport error: connection reset");
    }
}
