//! Tenant context resolved for every dispatch.

use serde::{Deserialize, Serialize};

use crate::id::TenantId;
use crate::pipeline::PipelineType;

/// The shop a pipeline runs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    /// Commerce platform domain, e.g. `acme.myshopify.com`
    pub shop_domain: String,
    /// Pipelines the scheduler should run for this tenant
    pub pipelines: Vec<PipelineType>,
}

impl Tenant {
    pub fn new(id: TenantId, shop_domain: impl Into<String>) -> Self {
        Self {
            id,
            shop_domain: shop_domain.into(),
            pipelines: Vec::new(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: PipelineType) -> Self {
        if !self.pipelines.contains(&pipeline) {
            self.pipelines.push(pipeline);
        }
        self
    }

    pub fn is_enabled(&self, pipeline: PipelineType) -> bool {
        self.pipelines.contains(&pipeline)
    }
}
