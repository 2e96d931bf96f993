//! The four-state status machine shared by jobs and processes.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Execution status of a job or process.
///
/// ```text
/// Pending ──► Processing ──► Completed
///    │            │  ▲
///    │            │  └── (requeue: back to Pending)
///    └────────────┴────► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Created, waiting to be dispatched
    Pending,
    /// Dispatched; a handler is (or was, if the worker crashed) running it
    Processing,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully (handler error, stop action or zombie timeout)
    Failed,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Pending,
        Status::Processing,
        Status::Completed,
        Status::Failed,
    ];

    /// Statuses the dispatch loop still has to drive forward.
    pub const ACTIVE: [Status; 2] = [Status::Pending, Status::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Processing => "processing",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Status::Pending | Status::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Statuses a row may be in right before moving to `self`.
    ///
    /// `Failed` accepts `Failed` so a later failure can overwrite the log message of
    /// an earlier one; `Completed` is never left.
    pub fn allowed_predecessors(&self) -> &'static [Status] {
        match self {
            Status::Pending => &[Status::Processing],
            Status::Processing => &[Status::Pending],
            Status::Completed => &[Status::Processing],
            Status::Failed => &[Status::Pending, Status::Processing, Status::Failed],
        }
    }

    pub fn can_transition_to(&self, next: Status) -> bool {
        next.allowed_predecessors().contains(self)
    }

    /// Validate a transition, returning a domain error when it is not allowed.
    pub fn check_transition(&self, next: Status) -> DomainResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::unknown_tag("status", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_allowed() {
        assert!(Status::Pending.can_transition_to(Status::Processing));
        assert!(Status::Processing.can_transition_to(Status::Completed));
        assert!(Status::Processing.can_transition_to(Status::Failed));
        assert!(Status::Pending.can_transition_to(Status::Failed));
        assert!(Status::Processing.can_transition_to(Status::Pending));
    }

    #[test]
    fn completed_is_final() {
        for next in Status::ALL {
            assert!(!Status::Completed.can_transition_to(next));
        }
    }

    #[test]
    fn failed_can_only_be_refailed() {
        assert!(Status::Failed.can_transition_to(Status::Failed));
        assert!(!Status::Failed.can_transition_to(Status::Pending));
        assert!(!Status::Failed.can_transition_to(Status::Processing));
        assert!(!Status::Failed.can_transition_to(Status::Completed));
    }

    #[test]
    fn pending_cannot_skip_to_completed() {
        let err = Status::Pending.check_transition(Status::Completed).unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                from: "pending".into(),
                to: "completed".into()
            }
        );
    }

    #[test]
    fn tags_parse_back() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("running".parse::<Status>().is_err());
    }
}
