//! In-memory collaborators for tests, benches and local runs.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use pipesync_core::{PipelineType, Tenant, TenantId};

use crate::collaborators::{
    BatchOutcome, CollaboratorError, CommerceAdmin, FileSource, RemoteFile, SkippedItem,
};
use crate::tracking_sync::TrackingRow;
use crate::variant_sync::VariantRow;

/// Inbox files per tenant and pipeline; the last one put is the latest.
#[derive(Debug, Default)]
pub struct InMemoryFileSource {
    files: Mutex<HashMap<(TenantId, PipelineType), Vec<(RemoteFile, Vec<u8>)>>>,
}

impl InMemoryFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, tenant_id: TenantId, pipeline: PipelineType, name: &str, bytes: impl Into<Vec<u8>>) {
        let file = RemoteFile {
            name: name.to_string(),
            modified_at: Utc::now(),
        };
        self.files
            .lock()
            .unwrap()
            .entry((tenant_id, pipeline))
            .or_default()
            .push((file, bytes.into()));
    }
}

#[async_trait]
impl FileSource for InMemoryFileSource {
    async fn latest(
        &self,
        tenant: &Tenant,
        pipeline: PipelineType,
    ) -> Result<Option<RemoteFile>, CollaboratorError> {
        let files = self.files.lock().unwrap();
        Ok(files
            .get(&(tenant.id, pipeline))
            .and_then(|files| files.last())
            .map(|(file, _)| file.clone()))
    }

    async fn fetch(
        &self,
        tenant: &Tenant,
        pipeline: PipelineType,
        name: &str,
    ) -> Result<Vec<u8>, CollaboratorError> {
        let files = self.files.lock().unwrap();
        files
            .get(&(tenant.id, pipeline))
            .and_then(|files| files.iter().rev().find(|(f, _)| f.name == name))
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| CollaboratorError::NotFound(name.to_string()))
    }
}

/// Records every batch it receives.
///
/// Keys listed with [`RecordingCommerceAdmin::reject`] come back as skipped items;
/// [`RecordingCommerceAdmin::fail_with`] makes every call fail outright.
#[derive(Debug, Default)]
pub struct RecordingCommerceAdmin {
    variant_batches: Mutex<Vec<Vec<VariantRow>>>,
    tracking_batches: Mutex<Vec<Vec<TrackingRow>>>,
    rejected: Mutex<HashSet<String>>,
    failure: Mutex<Option<String>>,
}

impl RecordingCommerceAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, key: impl Into<String>) {
        self.rejected.lock().unwrap().insert(key.into());
    }

    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().unwrap() = Some(message.into());
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn variant_batches(&self) -> Vec<Vec<VariantRow>> {
        self.variant_batches.lock().unwrap().clone()
    }

    pub fn tracking_batches(&self) -> Vec<Vec<TrackingRow>> {
        self.tracking_batches.lock().unwrap().clone()
    }

    fn outcome<'a>(&self, keys: impl Iterator<Item = &'a str>) -> Result<BatchOutcome, CollaboratorError> {
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(CollaboratorError::Transport(message));
        }
        let rejected = self.rejected.lock().unwrap();
        let mut outcome = BatchOutcome::default();
        for key in keys {
            if rejected.contains(key) {
                outcome.skipped.push(SkippedItem {
                    key: key.to_string(),
                    reason: "rejected by platform".to_string(),
                });
            } else {
                outcome.updated += 1;
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl CommerceAdmin for RecordingCommerceAdmin {
    async fn update_variants(
        &self,
        _tenant: &Tenant,
        batch: &[VariantRow],
    ) -> Result<BatchOutcome, CollaboratorError> {
        let outcome = self.outcome(batch.iter().map(|r| r.sku.as_str()))?;
        self.variant_batches.lock().unwrap().push(batch.to_vec());
        Ok(outcome)
    }

    async fn update_tracking(
        &self,
        _tenant: &Tenant,
        batch: &[TrackingRow],
    ) -> Result<BatchOutcome, CollaboratorError> {
        let outcome = self.outcome(batch.iter().map(|r| r.order_name.as_str()))?;
        self.tracking_batches.lock().unwrap().push(batch.to_vec());
        Ok(outcome)
    }
}
