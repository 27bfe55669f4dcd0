//! Error types shared by the scheduler and its collaborators.

use std::error::Error;
use std::sync::Arc;

use thiserror::Error;

/// Boxed error returned by mergers and runners.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// An error shared between every caller it affects.
pub type SharedError = Arc<dyn Error + Send + Sync>;

/// Errors a `load` call can settle with.
///
/// Cloning is cheap: the underlying merger/runner error is reference counted,
/// so every request in an affected group observes the same error object.
#[derive(Debug, Clone, Error)]
pub enum BatchError {
    /// The request merger failed while grouping the flushed batch.
    #[error("request merger failed: {0}")]
    Merge(SharedError),

    /// The runner failed for the group this request belonged to, or the
    /// merger marked that group as failed.
    #[error("request group failed: {0}")]
    Runner(SharedError),

    /// The merger produced no group containing this request.
    #[error("request was not assigned to any group")]
    Unassigned,

    /// The request was dropped before it could be settled.
    #[error("request dropped before settlement")]
    Dropped,
}

impl BatchError {
    /// The merger or runner error carried by this error, if any.
    ///
    /// Use this to downcast to the concrete error type the collaborator
    /// returned.
    pub fn cause(&self) -> Option<&(dyn Error + Send + Sync + 'static)> {
        match self {
            Self::Merge(e) | Self::Runner(e) => Some(e.as_ref()),
            Self::Unassigned | Self::Dropped => None,
        }
    }

    /// Returns `true` if the whole flush failed in the merger.
    pub fn is_merge(&self) -> bool {
        matches!(self, Self::Merge(_))
    }

    /// Returns `true` if only this request's group failed in the runner.
    pub fn is_runner(&self) -> bool {
        matches!(self, Self::Runner(_))
    }
}
