//! `pipesync-pipelines`: the sync pipelines run by the engine.
//!
//! - [`variant_sync`]: product variant price & inventory
//! - [`tracking_sync`]: order tracking numbers
//!
//! Both read a spreadsheet from the tenant's inbox, fan out fixed-size batches to
//! the commerce admin API and fan back in through a `finish` stage
//! (see [`stages`]). External services sit behind [`collaborators`].

pub mod batch;
pub mod collaborators;
pub mod fakes;
pub mod stages;
pub mod tracking_sync;
pub mod variant_sync;

pub use batch::{BatchResult, DEFAULT_BATCH_SIZE, RunSummary, partition};
pub use collaborators::{
    BatchOutcome, CollaboratorError, Collaborators, CommerceAdmin, CsvSheetDecoder, FileSource,
    RemoteFile, SheetDecoder, SheetRow, SkippedItem,
};
pub use stages::{SheetPipeline, SyncSettings};
pub use tracking_sync::{TrackingPayload, TrackingRow, TrackingStage, TrackingSync};
pub use variant_sync::{VariantPayload, VariantRow, VariantStage, VariantSync};
