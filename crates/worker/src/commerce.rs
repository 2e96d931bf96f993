//! HTTP client for the commerce admin gateway.
//!
//! Bulk endpoints take one batch per request and answer with the number of
//! applied items plus per-item errors:
//!
//! ```text
//! POST {base}/shops/{shop_domain}/variants/bulk    {"variants": [...]}
//! POST {base}/shops/{shop_domain}/tracking/bulk    {"fulfillments": [...]}
//! -> 200 {"updated": 12, "errors": [{"key": "SKU-1", "reason": "unknown sku"}]}
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use pipesync_core::Tenant;
use pipesync_pipelines::{
    BatchOutcome, CollaboratorError, CommerceAdmin, SkippedItem, TrackingRow, VariantRow,
};

use crate::config::CommerceConfig;

#[derive(Debug, Serialize)]
struct VariantsRequest<'a> {
    variants: &'a [VariantRow],
}

#[derive(Debug, Serialize)]
struct TrackingRequest<'a> {
    fulfillments: &'a [TrackingRow],
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    updated: usize,
    #[serde(default)]
    errors: Vec<ItemError>,
}

#[derive(Debug, Deserialize)]
struct ItemError {
    key: String,
    reason: String,
}

impl From<BulkResponse> for BatchOutcome {
    fn from(response: BulkResponse) -> Self {
        BatchOutcome {
            updated: response.updated,
            skipped: response
                .errors
                .into_iter()
                .map(|e| SkippedItem {
                    key: e.key,
                    reason: e.reason,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpCommerceAdmin {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCommerceAdmin {
    pub fn new(config: &CommerceConfig) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            token: config.token.clone(),
        })
    }

    fn url(&self, tenant: &Tenant, resource: &str) -> String {
        format!("{}/shops/{}/{}/bulk", self.base_url, tenant.shop_domain, resource)
    }

    async fn post<B: Serialize + Sync>(&self, url: String, body: &B) -> Result<BatchOutcome, CollaboratorError> {
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CollaboratorError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
            return Err(classify(status, message));
        }

        let parsed: BulkResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::Decode(e.to_string()))?;
        debug!(url = %url, updated = parsed.updated, errors = parsed.errors.len(), "bulk update applied");
        Ok(parsed.into())
    }
}

/// 4xx other than 429 means the batch itself was refused; everything else is
/// worth retrying with a new run.
fn classify(status: reqwest::StatusCode, message: String) -> CollaboratorError {
    if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
        CollaboratorError::Rejected(message)
    } else {
        CollaboratorError::Transport(message)
    }
}

#[async_trait]
impl CommerceAdmin for HttpCommerceAdmin {
    #[instrument(skip(self, tenant, batch), fields(shop = %tenant.shop_domain, rows = batch.len()), err)]
    async fn update_variants(
        &self,
        tenant: &Tenant,
        batch: &[VariantRow],
    ) -> Result<BatchOutcome, CollaboratorError> {
        self.post(self.url(tenant, "variants"), &VariantsRequest { variants: batch })
            .await
    }

    #[instrument(skip(self, tenant, batch), fields(shop = %tenant.shop_domain, rows = batch.len()), err)]
    async fn update_tracking(
        &self,
        tenant: &Tenant,
        batch: &[TrackingRow],
    ) -> Result<BatchOutcome, CollaboratorError> {
        self.post(self.url(tenant, "tracking"), &TrackingRequest { fulfillments: batch })
            .await
    }
}
