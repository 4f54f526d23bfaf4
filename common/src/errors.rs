// Error handling framework
// One enum per layer; per-site and per-repository errors are aggregated by the
// job runner, only filter/validation and compute errors abort a run.

use crate::models::JobState;
use thiserror::Error;

/// Site filter errors (fatal, raised before any side effect)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("Invalid filter value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown {field} reference: '{value}'")]
    UnknownReference { field: String, value: String },

    #[error("Site inventory unavailable: {0}")]
    InventoryUnavailable(String),

    #[error("Site inventory is malformed: {0}")]
    InventoryMalformed(String),
}

/// Version-control backend errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VcsError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Remote repository missing: {0}")]
    RepositoryMissing(String),

    #[error("Merge conflict: {0}")]
    MergeConflict(String),

    #[error("Git command failed: {0}")]
    CommandFailed(String),

    #[error("Filesystem error: {0}")]
    Io(String),
}

impl VcsError {
    /// Transport-level failures are worth one more attempt; everything else is not
    pub fn is_transient(&self) -> bool {
        matches!(self, VcsError::Transport(_) | VcsError::Timeout(_))
    }
}

impl From<std::io::Error> for VcsError {
    fn from(err: std::io::Error) -> Self {
        VcsError::Io(err.to_string())
    }
}

/// Per-site repository synchronization errors (recoverable)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("No repository configured with slug '{0}'")]
    NotConfigured(String),

    #[error("Repository '{slug}' unavailable: {reason}")]
    RepositoryUnavailable { slug: String, reason: String },

    #[error("Transient failure syncing '{slug}' after {attempts} attempt(s): {reason}")]
    Transient {
        slug: String,
        attempts: u32,
        reason: String,
    },

    #[error("Sync of '{0}' not dispatched: run cancelled")]
    Cancelled(String),

    #[error("Sync task for '{slug}' did not complete: {reason}")]
    TaskLost { slug: String, reason: String },
}

impl SyncError {
    /// Build the per-site error for a backend failure that survived retrying
    pub fn from_vcs(slug: &str, err: VcsError, attempts: u32) -> Self {
        if err.is_transient() {
            SyncError::Transient {
                slug: slug.to_string(),
                attempts,
                reason: err.to_string(),
            }
        } else {
            SyncError::RepositoryUnavailable {
                slug: slug.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

/// Compliance-diff / rendering service errors (fatal)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    #[error("Service request failed: {0}")]
    RequestFailed(String),

    #[error("Service returned status {status}: {body}")]
    ServiceFailed { status: u16, body: String },

    #[error("Invalid service response: {0}")]
    InvalidResponse(String),

    #[error("Failed to materialize artifact {path}: {reason}")]
    ArtifactWriteFailed { path: String, reason: String },

    #[error("Compute phase timed out after {0} seconds")]
    Timeout(u64),
}

/// Per-repository publish errors (recoverable, but fail the run)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Repository '{0}' is read-only and cannot be published")]
    ReadOnlyRepository(String),

    #[error("Commit to '{slug}' failed: {reason}")]
    CommitFailed { slug: String, reason: String },

    #[error("Push of '{slug}' failed: {reason}")]
    PushFailed { slug: String, reason: String },
}

/// Job run errors; any of these leaves the run in `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error(transparent)]
    InvalidFilter(#[from] FilterError),

    #[error("Invalid job request: {0}")]
    Validation(String),

    #[error("Compute phase failed: {0}")]
    Compute(#[from] ComputeError),

    #[error("{failed} of {attempted} repository publish(es) failed")]
    Publish { failed: usize, attempted: usize },

    #[error("Run cancelled during {0}")]
    Cancelled(JobState),

    #[error("Illegal state transition {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },
}
