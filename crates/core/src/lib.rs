//! `pipesync-core`: entity model for sync pipelines.
//!
//! This crate contains the **pure** pieces of the orchestration engine: identifiers,
//! the status state machine, the `Job`/`Process` records and tenant context.
//! Storage and scheduling live in `pipesync-engine`.

pub mod entity;
pub mod error;
pub mod id;
pub mod job;
pub mod pipeline;
pub mod process;
pub mod status;
pub mod tenant;

pub use entity::{Entity, Tracked};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, ProcessId, TenantId};
pub use job::Job;
pub use pipeline::PipelineType;
pub use process::Process;
pub use status::Status;
pub use tenant::Tenant;
