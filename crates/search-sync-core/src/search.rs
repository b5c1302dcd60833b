use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Health status reported by a search service that is ready to serve.
pub const AVAILABLE_STATUS: &str = "available";

/// Response of the search service health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
}

impl HealthStatus {
    pub fn available() -> Self {
        Self {
            status: AVAILABLE_STATUS.to_string(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == AVAILABLE_STATUS
    }
}

/// Task status once the search service has applied a task.
pub const TASK_SUCCEEDED: &str = "succeeded";

/// Asynchronous task enqueued by the search service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub task_uid: u64,
    #[serde(default)]
    pub index_uid: Option<String>,
    pub status: String,
}

impl TaskInfo {
    pub fn is_succeeded(&self) -> bool {
        self.status == TASK_SUCCEEDED
    }
}

/// An index known to the search service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub uid: String,
    #[serde(default)]
    pub primary_key: Option<String>,
}

/// Full-text search service client.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Check whether the service is ready.
    async fn health(&self) -> Result<HealthStatus, SyncError>;

    /// Look up an index.
    ///
    /// Fails with [`SyncError::IndexMissing`] when the index does not exist.
    async fn get_index(&self, index_uid: &str) -> Result<IndexInfo, SyncError>;

    /// Add or replace documents in an index, creating the index if needed.
    ///
    /// The returned task is only enqueued; see [`SearchIndex::wait_for_task`].
    async fn add_documents(
        &self,
        index_uid: &str,
        primary_key: &str,
        documents: &[serde_json::Value],
    ) -> Result<TaskInfo, SyncError>;

    /// Wait until an enqueued task has been applied.
    ///
    /// Fails with a typed error when the task failed, so documents of a
    /// failed task are never treated as indexed.
    async fn wait_for_task(&self, task: &TaskInfo) -> Result<TaskInfo, SyncError>;
}

/// Lazy accessor for the process's search client.
///
/// Implementations build the client on first use and hand out the same
/// instance afterwards. A failed build caches nothing.
pub trait SearchIndexProvider: Send + Sync {
    fn instance(&self) -> Result<Arc<dyn SearchIndex>, SyncError>;
}
