//! Recording doubles for the store, search and lease seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SyncError;
use crate::lease::{LeaseStore, LeaseStoreSource};
use crate::search::{
    HealthStatus, IndexInfo, SearchIndex, SearchIndexProvider, TaskInfo, TASK_SUCCEEDED,
};
use crate::store::{Collection, DocumentStore, SyncProgress};

#[derive(Clone)]
struct CollectionState {
    progress: SyncProgress,
    live_count: u64,
    sync_error: Option<fn() -> SyncError>,
}

impl Default for CollectionState {
    fn default() -> Self {
        Self {
            progress: SyncProgress::new(0, 0),
            live_count: 0,
            sync_error: None,
        }
    }
}

/// Document store that records every call.
#[derive(Default)]
pub struct MockStore {
    collections: Mutex<HashMap<Collection, CollectionState>>,
    sync_delay: Option<Duration>,
    progress_calls: AtomicUsize,
    count_calls: AtomicUsize,
    syncs: Mutex<Vec<Collection>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(
        self,
        collection: Collection,
        processed: u64,
        total: u64,
        live_count: u64,
    ) -> Self {
        self.collections.lock().unwrap().insert(
            collection,
            CollectionState {
                progress: SyncProgress::new(processed, total),
                live_count,
                sync_error: None,
            },
        );
        self
    }

    pub fn failing_sync(self, collection: Collection, error: fn() -> SyncError) -> Self {
        self.collections
            .lock()
            .unwrap()
            .entry(collection)
            .or_default()
            .sync_error = Some(error);
        self
    }

    pub fn with_sync_delay(mut self, delay: Duration) -> Self {
        self.sync_delay = Some(delay);
        self
    }

    pub fn sync_calls(&self, collection: Collection) -> usize {
        self.syncs
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == collection)
            .count()
    }

    pub fn synced(&self) -> Vec<Collection> {
        self.syncs.lock().unwrap().clone()
    }

    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.progress_calls.load(Ordering::SeqCst)
            + self.count_calls.load(Ordering::SeqCst)
            + self.syncs.lock().unwrap().len()
    }

    fn state(&self, collection: Collection) -> CollectionState {
        self.collections
            .lock()
            .unwrap()
            .get(&collection)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for MockStore {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    async fn sync_progress(&self, collection: Collection) -> Result<SyncProgress, SyncError> {
        self.progress_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state(collection).progress)
    }

    async fn count_documents(&self, collection: Collection) -> Result<u64, SyncError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state(collection).live_count)
    }

    async fn sync_with_index(&self, collection: Collection) -> Result<u64, SyncError> {
        self.syncs.lock().unwrap().push(collection);
        if let Some(delay) = self.sync_delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state(collection);
        match state.sync_error {
            Some(error) => Err(error()),
            None => Ok(state.live_count.saturating_sub(state.progress.total_processed())),
        }
    }
}

/// Search client with a fixed health answer.
pub struct MockIndex {
    status: String,
    health_calls: AtomicUsize,
}

impl MockIndex {
    pub fn with_status(status: &str) -> Self {
        Self {
            status: status.to_string(),
            health_calls: AtomicUsize::new(0),
        }
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchIndex for MockIndex {
    async fn health(&self) -> Result<HealthStatus, SyncError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        Ok(HealthStatus {
            status: self.status.clone(),
        })
    }

    async fn get_index(&self, index_uid: &str) -> Result<IndexInfo, SyncError> {
        Ok(IndexInfo {
            uid: index_uid.to_string(),
            primary_key: None,
        })
    }

    async fn add_documents(
        &self,
        index_uid: &str,
        _primary_key: &str,
        _documents: &[serde_json::Value],
    ) -> Result<TaskInfo, SyncError> {
        Ok(TaskInfo {
            task_uid: 0,
            index_uid: Some(index_uid.to_string()),
            status: "enqueued".to_string(),
        })
    }

    async fn wait_for_task(&self, task: &TaskInfo) -> Result<TaskInfo, SyncError> {
        Ok(TaskInfo {
            status: TASK_SUCCEEDED.to_string(),
            ..task.clone()
        })
    }
}

/// Provider handing out a [`MockIndex`], or failing as if unconfigured.
pub struct MockProvider {
    index: Option<Arc<MockIndex>>,
    instance_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(index: Arc<MockIndex>) -> Self {
        Self {
            index: Some(index),
            instance_calls: AtomicUsize::new(0),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            index: None,
            instance_calls: AtomicUsize::new(0),
        }
    }

    pub fn instance_calls(&self) -> usize {
        self.instance_calls.load(Ordering::SeqCst)
    }
}

impl SearchIndexProvider for MockProvider {
    fn instance(&self) -> Result<Arc<dyn SearchIndex>, SyncError> {
        self.instance_calls.fetch_add(1, Ordering::SeqCst);
        match &self.index {
            Some(index) => Ok(index.clone() as Arc<dyn SearchIndex>),
            None => Err(SyncError::Configuration(
                "search host or API key not set".to_string(),
            )),
        }
    }
}

/// Lease source that counts lookups.
pub struct CountingLeaseSource {
    store: Option<Arc<dyn LeaseStore>>,
    lookups: AtomicUsize,
}

impl CountingLeaseSource {
    pub fn new(store: Option<Arc<dyn LeaseStore>>) -> Self {
        Self {
            store,
            lookups: AtomicUsize::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl LeaseStoreSource for CountingLeaseSource {
    fn lease_store(&self) -> Option<Arc<dyn LeaseStore>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.store.clone()
    }
}
