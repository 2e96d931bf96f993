//! `pipesync-worker`: the production process.
//!
//! Reads [`config::WorkerConfig`] from the environment, then runs one dispatch
//! loop per enabled pipeline plus the recurring scheduler against Postgres (see
//! [`app::run`]). Inbox files come from a local directory ([`inbox`]) and batches
//! go to the commerce admin gateway over HTTP ([`commerce`]).

pub mod app;
pub mod commerce;
pub mod config;
pub mod inbox;

pub use app::run;
pub use commerce::HttpCommerceAdmin;
pub use config::{CommerceConfig, WorkerConfig};
pub use inbox::DirectoryFileSource;
