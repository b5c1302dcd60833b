//! Core traits and orchestration for keeping a search index in step with a
//! document store.
//!
//! This crate defines the abstractions shared by concrete backends and the
//! sync logic built on them:
//! - `DocumentStore`: sync progress, live counts and bulk push into the index
//! - `SearchIndex` / `SearchIndexProvider`: search service client and its lazy accessor
//! - `LeaseStore` / `FlowManager`: run-once-across-processes flows with a TTL
//! - `SyncOrchestrator`: full vs. incremental reindex decisions
//! - `IndexSync`: the scheduler-facing entry point with failure classification

mod error;
mod lease;
mod orchestrator;
mod runner;
mod search;
mod store;

#[cfg(test)]
mod testing;

pub use error::{FailureKind, RecoveryAction, SyncError};
pub use lease::{
    FlowKey, FlowManager, LeaseAcquireResult, LeaseRecord, LeaseStore, LeaseStoreSource,
    MemoryLeaseStore, StaticLeaseSource, DEFAULT_FLOW_TTL, INDEX_SYNC_FLOW_ID,
    INDEX_SYNC_FLOW_TYPE,
};
pub use orchestrator::{
    plan_collection, SyncAction, SyncOrchestrator, SyncResult, SyncSettings,
    DEFAULT_SYNC_THRESHOLD,
};
pub use runner::{IndexSync, IndexSyncOptions, SyncOutcome, DEFAULT_RECOVERY_DELAY};
pub use search::{
    HealthStatus, IndexInfo, SearchIndex, SearchIndexProvider, TaskInfo, AVAILABLE_STATUS,
    TASK_SUCCEEDED,
};
pub use store::{Collection, DocumentStore, SyncProgress};
