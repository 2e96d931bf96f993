//! Pipeline type tags.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Which pipeline a job belongs to.
///
/// Each pipeline type is served by exactly one worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    /// Product variant price & inventory sync
    VariantSync,
    /// Order fulfillment tracking-number sync
    TrackingSync,
}

impl PipelineType {
    pub const ALL: [PipelineType; 2] = [PipelineType::VariantSync, PipelineType::TrackingSync];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineType::VariantSync => "variant_sync",
            PipelineType::TrackingSync => "tracking_sync",
        }
    }
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PipelineType::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| DomainError::unknown_tag("pipeline type", s))
    }
}
