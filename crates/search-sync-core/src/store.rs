use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Document collections mirrored into the search index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Messages,
    Conversations,
}

impl Collection {
    /// Collections in the order a sync visits them.
    pub const ALL: [Collection; 2] = [Collection::Messages, Collection::Conversations];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Messages => "messages",
            Collection::Conversations => "conversations",
        }
    }

    /// Uid of the search index holding this collection.
    pub fn index_uid(&self) -> &'static str {
        match self {
            Collection::Messages => "messages",
            Collection::Conversations => "convos",
        }
    }

    /// Primary key of documents in this collection's index.
    pub fn primary_key(&self) -> &'static str {
        match self {
            Collection::Messages => "messageId",
            Collection::Conversations => "conversationId",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far a collection's index has caught up with the store.
///
/// Recomputed on every sync attempt; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    total_processed: u64,
    total_documents: u64,
    is_complete: bool,
}

impl SyncProgress {
    pub fn new(total_processed: u64, total_documents: u64) -> Self {
        Self {
            total_processed,
            total_documents,
            is_complete: total_processed == total_documents,
        }
    }

    /// Documents already reflected in the index.
    pub fn total_processed(&self) -> u64 {
        self.total_processed
    }

    /// Documents in the store when progress was computed.
    pub fn total_documents(&self) -> u64 {
        self.total_documents
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }
}

/// Read side of the primary document store, plus the bulk push into the index.
///
/// `sync_with_index` serves both full and incremental reindexing: it uploads
/// every document not yet marked as indexed and marks it.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Returns the backend identifier (e.g., "sqlite").
    fn backend_name(&self) -> &'static str;

    /// Indexed vs. total documents for a collection.
    async fn sync_progress(&self, collection: Collection) -> Result<SyncProgress, SyncError>;

    /// Live document count for a collection.
    async fn count_documents(&self, collection: Collection) -> Result<u64, SyncError>;

    /// Push pending documents of a collection into its search index.
    ///
    /// # Returns
    /// Number of documents uploaded
    async fn sync_with_index(&self, collection: Collection) -> Result<u64, SyncError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_completeness() {
        assert!(SyncProgress::new(500, 500).is_complete());
        assert!(!SyncProgress::new(100, 1800).is_complete());
        assert!(SyncProgress::new(0, 0).is_complete());
    }

    #[test]
    fn test_progress_serializes_camel_case() {
        let json = serde_json::to_value(SyncProgress::new(3, 5)).unwrap();
        assert_eq!(json["totalProcessed"], 3);
        assert_eq!(json["totalDocuments"], 5);
        assert_eq!(json["isComplete"], false);
    }
}
