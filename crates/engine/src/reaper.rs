//! Zombie recovery.
//!
//! A row stuck in `Processing` past the timeout belonged to a worker that died
//! mid-stage. The sweep fails it in place; nothing is resubmitted.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::store::{Affected, SharedStore, StoreError};

pub const ZOMBIE_MESSAGE: &str = "timed out (zombie)";

#[derive(Clone)]
pub struct ZombieReaper {
    store: SharedStore,
    timeout: chrono::Duration,
}

impl ZombieReaper {
    pub fn new(store: SharedStore, timeout: chrono::Duration) -> Self {
        Self { store, timeout }
    }

    pub fn timeout(&self) -> chrono::Duration {
        self.timeout
    }

    pub async fn sweep(&self) -> Result<Affected, StoreError> {
        self.sweep_at(Utc::now()).await
    }

    /// Fail every job and process that has been `Processing` since `now - timeout`
    /// or earlier.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<Affected, StoreError> {
        let cutoff = now - self.timeout;
        let reaped = self.store.reap_stale(cutoff, now, ZOMBIE_MESSAGE).await?;
        if !reaped.is_empty() {
            warn!(
                jobs = reaped.jobs,
                processes = reaped.processes,
                cutoff = %cutoff,
                "reaped zombie rows"
            );
        }
        Ok(reaped)
    }
}
