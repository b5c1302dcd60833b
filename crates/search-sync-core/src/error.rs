use thiserror::Error;

use crate::store::Collection;

/// Errors that can occur while synchronizing the search index.
///
/// Collaborators pick the variant from their own contract (HTTP status,
/// service error code, connection failure), so callers can classify a
/// failure with [`SyncError::kind`] instead of inspecting message text.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Search index not available (status: {status})")]
    IndexUnavailable { status: String },

    #[error("Index not found: {0}")]
    IndexMissing(String),

    #[error("Search service unreachable: {0}")]
    ServiceUnavailable(String),

    #[error("Search task {task_uid} failed ({code}): {message}")]
    TaskFailed {
        task_uid: u64,
        code: String,
        message: String,
    },

    #[error("Flow {flow_id} is already running elsewhere")]
    LeaseContention { flow_id: String },

    #[error("Lease store error: {0}")]
    LeaseStore(String),

    #[error("Document store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Sync of {collection} failed: {source}")]
    Collection {
        collection: Collection,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure classes the entry point reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Another process holds the sync flow.
    LeaseContention,
    /// The search service has no index for a collection yet.
    IndexMissing,
    /// Search credentials are not configured.
    NotConfigured,
    /// The search service could not be reached.
    TransientNetwork,
    /// Anything else.
    Unclassified,
}

/// What the entry point does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing to do; the attempt counts as a no-op.
    Skip,
    /// Rebuild both indices after a short delay, outside the flow lease.
    RebuildIndices,
    /// Log and wait for the next trigger.
    LogOnly,
}

impl SyncError {
    /// The innermost error, looking through per-collection wrappers.
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Collection { source, .. } => source.root(),
            other => other,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> FailureKind {
        match self.root() {
            SyncError::LeaseContention { .. } => FailureKind::LeaseContention,
            SyncError::IndexMissing(_) => FailureKind::IndexMissing,
            SyncError::Configuration(_) => FailureKind::NotConfigured,
            SyncError::ServiceUnavailable(_) => FailureKind::TransientNetwork,
            _ => FailureKind::Unclassified,
        }
    }

    /// Recovery action for this error.
    pub fn recovery_action(&self) -> RecoveryAction {
        self.kind().recovery_action()
    }
}

impl FailureKind {
    pub fn recovery_action(self) -> RecoveryAction {
        match self {
            FailureKind::LeaseContention => RecoveryAction::Skip,
            FailureKind::IndexMissing => RecoveryAction::RebuildIndices,
            FailureKind::NotConfigured
            | FailureKind::TransientNetwork
            | FailureKind::Unclassified => RecoveryAction::LogOnly,
        }
    }
}
