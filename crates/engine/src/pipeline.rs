//! Pipeline definitions and the stage handler contract.
//!
//! A pipeline is an ordered set of stages ([`StageKind`]) plus one typed payload
//! enum ([`StagePayload`]) whose variant names the stage it belongs to. The
//! payload is stored adjacently tagged in the process `payload` column:
//!
//! ```json
//! { "stage": "update_batch", "data": { "index": 0, "rows": [ ... ] } }
//! ```
//!
//! The `stage` column of the process row and the payload tag must agree.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use pipesync_core::{PipelineType, Process};

use crate::context::StageContext;
use crate::error::{EngineError, StageError};

/// Key of the stage tag inside a serialized payload.
pub const PAYLOAD_TAG: &str = "stage";

/// Ordered stage enum of one pipeline.
pub trait StageKind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Every stage, in pipeline order.
    const ALL: &'static [Self];

    /// Stable tag stored in the `stage` column.
    fn as_str(&self) -> &'static str;

    fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.as_str() == tag)
    }

    /// The stage that follows `self` in pipeline order.
    fn next(&self) -> Option<Self> {
        let position = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(position + 1).copied()
    }
}

/// Typed process payload of one pipeline.
pub trait StagePayload:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    type Stage: StageKind;

    /// Stage this payload is input for.
    fn stage(&self) -> Self::Stage;

    fn to_value(&self) -> Result<serde_json::Value, StageError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// A pipeline definition: the engine is instantiated once per implementor.
pub trait Pipeline: Send + Sync + 'static {
    const TYPE: PipelineType;

    type Stage: StageKind;
    type Payload: StagePayload<Stage = Self::Stage>;

    /// Payload of the seed process created together with every job.
    fn seed_payload() -> Self::Payload;
}

/// Stage handler.
///
/// Performs one unit of externally visible work and must be safe to invoke again
/// for the same process (at-least-once execution). On success the handler marks
/// its own process and creates successors through the context; returning an error
/// fails the process and, in the same cycle, its job.
#[async_trait]
pub trait StageHandler<P: Pipeline>: Send + Sync {
    async fn handle(&self, ctx: &StageContext<P>) -> Result<(), StageError>;
}

/// Stage tag found in a serialized payload.
pub fn payload_tag(payload: &serde_json::Value) -> Option<&str> {
    payload.get(PAYLOAD_TAG).and_then(serde_json::Value::as_str)
}

/// Map a process row back to its typed stage.
///
/// Unknown tags and a payload tagged for another stage are contract violations.
pub fn resolve_stage<P: Pipeline>(process: &Process) -> Result<P::Stage, EngineError> {
    let stage = P::Stage::from_tag(&process.stage).ok_or_else(|| EngineError::UnknownStage {
        pipeline: P::TYPE,
        stage: process.stage.clone(),
    })?;

    match payload_tag(&process.payload) {
        Some(tag) if tag == stage.as_str() => Ok(stage),
        other => Err(EngineError::PayloadStageMismatch {
            process_id: process.id,
            stage: process.stage.clone(),
            payload: other.unwrap_or("<none>").to_string(),
        }),
    }
}

/// Decode the typed payload of a process.
pub fn decode_payload<P: Pipeline>(process: &Process) -> Result<P::Payload, StageError> {
    Ok(serde_json::from_value(process.payload.clone())?)
}

/// Stage → handler map of one pipeline.
pub struct HandlerRegistry<P: Pipeline> {
    handlers: HashMap<P::Stage, Arc<dyn StageHandler<P>>>,
}

impl<P: Pipeline> Default for HandlerRegistry<P> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<P: Pipeline> fmt::Debug for HandlerRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut stages: Vec<_> = self.handlers.keys().map(|s| s.as_str()).collect();
        stages.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("pipeline", &P::TYPE)
            .field("stages", &stages)
            .finish()
    }
}

impl<P: Pipeline> HandlerRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler of a stage.
    pub fn register<H>(&mut self, stage: P::Stage, handler: H) -> &mut Self
    where
        H: StageHandler<P> + 'static,
    {
        self.handlers.insert(stage, Arc::new(handler));
        self
    }

    pub fn with<H>(mut self, stage: P::Stage, handler: H) -> Self
    where
        H: StageHandler<P> + 'static,
    {
        self.register(stage, handler);
        self
    }

    pub fn resolve(&self, stage: P::Stage) -> Result<Arc<dyn StageHandler<P>>, EngineError> {
        self.handlers
            .get(&stage)
            .cloned()
            .ok_or_else(|| EngineError::UnregisteredStage {
                pipeline: P::TYPE,
                stage: stage.as_str().to_string(),
            })
    }

    /// Every stage of the pipeline must have a handler.
    pub fn validate(&self) -> Result<(), EngineError> {
        for stage in P::Stage::ALL {
            self.resolve(*stage)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Demo, DemoPayload, DemoStage, Noop};
    use pipesync_core::{Job, TenantId};

    fn process_with(stage: &str, payload: serde_json::Value) -> Process {
        let job = Job::new(TenantId::new(), PipelineType::VariantSync, serde_json::json!({}));
        Process::new(&job, stage, payload)
    }

    #[test]
    fn stages_walk_in_order() {
        assert_eq!(DemoStage::Start.next(), Some(DemoStage::Work));
        assert_eq!(DemoStage::Work.next(), Some(DemoStage::Finish));
        assert_eq!(DemoStage::Finish.next(), None);
        assert_eq!(DemoStage::from_tag("work"), Some(DemoStage::Work));
        assert_eq!(DemoStage::from_tag("nope"), None);
    }

    #[test]
    fn resolve_stage_checks_tag_agreement() {
        let payload = DemoPayload::Work { n: 1 }.to_value().unwrap();
        assert_eq!(payload_tag(&payload), Some("work"));

        let ok = process_with("work", payload.clone());
        assert_eq!(resolve_stage::<Demo>(&ok).unwrap(), DemoStage::Work);

        let mismatch = process_with("finish", payload);
        assert!(matches!(
            resolve_stage::<Demo>(&mismatch),
            Err(EngineError::PayloadStageMismatch { .. })
        ));

        let unknown = process_with("publish", serde_json::json!({ "stage": "publish" }));
        assert!(matches!(
            resolve_stage::<Demo>(&unknown),
            Err(EngineError::UnknownStage { .. })
        ));
    }

    #[test]
    fn decode_rejects_malformed_payload() {
        let bad = process_with("work", serde_json::json!({ "stage": "work", "data": { "n": "x" } }));
        assert!(matches!(decode_payload::<Demo>(&bad), Err(StageError::Payload(_))));
    }

    #[test]
    fn validate_requires_every_stage() {
        let partial = HandlerRegistry::<Demo>::new()
            .with(DemoStage::Start, Noop)
            .with(DemoStage::Work, Noop);
        assert!(matches!(
            partial.validate(),
            Err(EngineError::UnregisteredStage { stage, .. }) if stage == "finish"
        ));

        let full = partial.with(DemoStage::Finish, Noop);
        assert!(full.validate().is_ok());
    }
}
