//! Fixed-size batching for fan-out stages.

use serde::{Deserialize, Serialize};

pub const DEFAULT_BATCH_SIZE: usize = 250;

/// Split `rows` into consecutive batches of `size` (the last may be shorter).
///
/// A `size` of zero is treated as one.
pub fn partition<T>(rows: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut batches = Vec::with_capacity(rows.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(rows.len()));
    for row in rows {
        current.push(row);
        if current.len() == size {
            batches.push(std::mem::replace(&mut current, Vec::with_capacity(size)));
        }
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Result counters kept on a completed batch process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub updated: usize,
    pub skipped: usize,
}

/// Run summary kept in the job payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSummary {
    pub file_name: Option<String>,
    pub rows: usize,
    pub malformed: usize,
    pub batches: usize,
    pub updated: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload.clone())
    }

    pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn add(&mut self, result: BatchResult) {
        self.updated += result.updated;
        self.skipped += result.skipped;
    }

    pub fn message(&self) -> String {
        format!(
            "synced {} rows in {} batches: {} updated, {} skipped, {} malformed",
            self.rows, self.batches, self.updated, self.skipped, self.malformed
        )
    }
}
