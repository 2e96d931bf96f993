//! Entity traits shared by `Job` and `Process`.

use chrono::{DateTime, Utc};

use crate::status::Status;

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> Self::Id;
}

/// Status bookkeeping common to every tracked row.
///
/// Both jobs and processes carry the same four-state status, an attempt counter,
/// an overwritten log message and an `updated_at` clock. The zombie sweep and the
/// stop action operate on this shape without caring which table a row lives in.
pub trait Tracked: Entity {
    fn status(&self) -> Status;
    fn updated_at(&self) -> DateTime<Utc>;

    /// Force the row to `Failed`, counting the forced transition as an attempt.
    fn force_fail(&mut self, message: &str, now: DateTime<Utc>);

    /// True when the row is `Processing` and has not been touched since `cutoff`.
    fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status() == Status::Processing && self.updated_at() <= cutoff
    }
}
