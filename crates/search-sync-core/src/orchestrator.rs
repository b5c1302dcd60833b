use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::error::SyncError;
use crate::search::SearchIndexProvider;
use crate::store::{Collection, DocumentStore, SyncProgress};

/// Drift above which a collection gets a full reindex.
pub const DEFAULT_SYNC_THRESHOLD: u64 = 1000;

/// Which collections had their reindex invoked during one sync attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub messages_sync: bool,
    pub convos_sync: bool,
}

impl SyncResult {
    /// Whether any collection was reindexed.
    pub fn any(&self) -> bool {
        self.messages_sync || self.convos_sync
    }

    fn mark(&mut self, collection: Collection) {
        match collection {
            Collection::Messages => self.messages_sync = true,
            Collection::Conversations => self.convos_sync = true,
        }
    }
}

/// Tunables of the orchestrator.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Skip all document work and report nothing synced.
    pub indexing_disabled: bool,
    /// Drift above which a full reindex is performed.
    pub sync_threshold: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            indexing_disabled: false,
            sync_threshold: DEFAULT_SYNC_THRESHOLD,
        }
    }
}

/// Decision for one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Progress reports every document indexed.
    UpToDate,
    /// Drift exceeds the threshold.
    Full { drift: i64 },
    /// Live count differs from the processed count by at most the threshold,
    /// including negative drift after deletions.
    Incremental { drift: i64 },
    /// Progress says incomplete but the counts already match.
    StaleProgress,
}

impl SyncAction {
    /// Whether this action invokes a reindex.
    pub fn reindexes(&self) -> bool {
        matches!(self, SyncAction::Full { .. } | SyncAction::Incremental { .. })
    }
}

/// Decide how to bring one collection's index up to date.
///
/// `live_count` is the store's count at decision time, which may differ from
/// `progress.total_documents()`.
pub fn plan_collection(progress: &SyncProgress, live_count: u64, threshold: u64) -> SyncAction {
    if progress.is_complete() {
        return SyncAction::UpToDate;
    }

    let processed = progress.total_processed();
    let drift = i128::from(live_count) - i128::from(processed);

    if drift > i128::from(threshold) {
        SyncAction::Full {
            drift: saturating_drift(drift),
        }
    } else if live_count != processed {
        SyncAction::Incremental {
            drift: saturating_drift(drift),
        }
    } else {
        SyncAction::StaleProgress
    }
}

fn saturating_drift(drift: i128) -> i64 {
    i64::try_from(drift).unwrap_or(if drift > 0 { i64::MAX } else { i64::MIN })
}

/// Decides per collection whether to reindex and delegates the work to the
/// document store.
pub struct SyncOrchestrator {
    store: Arc<dyn DocumentStore>,
    search: Arc<dyn SearchIndexProvider>,
    settings: SyncSettings,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        search: Arc<dyn SearchIndexProvider>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            search,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Run one sync attempt over all collections.
    ///
    /// Fails with [`SyncError::IndexUnavailable`] before any store call when
    /// the search service is not ready. Collections are processed in order and
    /// independently; if one fails the others still run and the first failure
    /// is returned wrapped in [`SyncError::Collection`].
    #[instrument(skip(self), level = "debug")]
    pub async fn perform_sync(&self) -> Result<SyncResult, SyncError> {
        if self.settings.indexing_disabled {
            info!("Indexing is disabled, skipping");
            return Ok(SyncResult::default());
        }

        self.check_health().await?;

        let mut result = SyncResult::default();
        let mut first_failure = None;

        for collection in Collection::ALL {
            match self.sync_collection(collection).await {
                Ok(true) => result.mark(collection),
                Ok(false) => {}
                Err(e) => {
                    error!("Sync of {} failed: {}", collection, e);
                    if first_failure.is_none() {
                        first_failure = Some(SyncError::Collection {
                            collection,
                            source: Box::new(e),
                        });
                    }
                }
            }
        }

        match first_failure {
            Some(e) => {
                if result.any() {
                    warn!(
                        messages_sync = result.messages_sync,
                        convos_sync = result.convos_sync,
                        "Sync partially completed"
                    );
                }
                Err(e)
            }
            None => Ok(result),
        }
    }

    async fn check_health(&self) -> Result<(), SyncError> {
        let client = self.search.instance()?;
        let health = client.health().await?;
        debug!("Search health check result: {}", health.status);

        if !health.is_available() {
            error!("Search index not available, status: {}", health.status);
            return Err(SyncError::IndexUnavailable {
                status: health.status,
            });
        }
        Ok(())
    }

    /// Returns whether a reindex was invoked.
    async fn sync_collection(&self, collection: Collection) -> Result<bool, SyncError> {
        let progress = self.store.sync_progress(collection).await?;
        if progress.is_complete() {
            info!(
                "{} are fully synced: {}/{}",
                collection,
                progress.total_processed(),
                progress.total_documents()
            );
            return Ok(false);
        }

        info!(
            "{} need syncing: {}/{} indexed",
            collection,
            progress.total_processed(),
            progress.total_documents()
        );

        let live_count = self.store.count_documents(collection).await?;
        let action = plan_collection(&progress, live_count, self.settings.sync_threshold);

        match action {
            SyncAction::Full { drift } => {
                info!(drift, "Starting full {} sync due to large difference", collection);
            }
            SyncAction::Incremental { drift } => {
                warn!(drift, "{} out of sync, performing incremental sync", collection);
            }
            SyncAction::StaleProgress => {
                debug!(
                    "{} counts match ({}) despite incomplete progress, nothing to do",
                    collection, live_count
                );
            }
            SyncAction::UpToDate => {}
        }

        if !action.reindexes() {
            return Ok(false);
        }

        let uploaded = self.store.sync_with_index(collection).await?;
        debug!("Uploaded {} {} to the search index", uploaded, collection);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockIndex, MockProvider, MockStore};

    fn orchestrator(store: Arc<MockStore>, index: Arc<MockIndex>) -> SyncOrchestrator {
        SyncOrchestrator::new(
            store,
            Arc::new(MockProvider::new(index)),
            SyncSettings::default(),
        )
    }

    #[test]
    fn test_plan_complete_progress() {
        let progress = SyncProgress::new(500, 500);
        assert_eq!(plan_collection(&progress, 900, 1000), SyncAction::UpToDate);
    }

    #[test]
    fn test_plan_thresholds() {
        let progress = SyncProgress::new(100, 1800);
        assert_eq!(
            plan_collection(&progress, 1800, 1000),
            SyncAction::Full { drift: 1700 }
        );
        // Exactly at the threshold is still incremental
        assert_eq!(
            plan_collection(&progress, 1100, 1000),
            SyncAction::Incremental { drift: 1000 }
        );
        assert_eq!(
            plan_collection(&progress, 250, 1000),
            SyncAction::Incremental { drift: 150 }
        );
        assert_eq!(
            plan_collection(&progress, 40, 1000),
            SyncAction::Incremental { drift: -60 }
        );
        assert_eq!(
            plan_collection(&progress, 100, 1000),
            SyncAction::StaleProgress
        );
    }

    #[test]
    fn test_plan_drift_does_not_wrap() {
        let progress = SyncProgress::new(0, u64::MAX);
        assert_eq!(
            plan_collection(&progress, u64::MAX, 1000),
            SyncAction::Full { drift: i64::MAX }
        );

        let progress = SyncProgress::new(u64::MAX, 0);
        assert_eq!(
            plan_collection(&progress, 0, 1000),
            SyncAction::Incremental { drift: i64::MIN }
        );

        // Threshold above i64::MAX still compares correctly
        let progress = SyncProgress::new(0, 10);
        assert_eq!(
            plan_collection(&progress, 10, u64::MAX),
            SyncAction::Incremental { drift: 10 }
        );
    }

    #[tokio::test]
    async fn test_complete_collections_are_skipped() {
        let store = Arc::new(
            MockStore::new()
                .with_collection(Collection::Messages, 500, 500, 500)
                .with_collection(Collection::Conversations, 10, 10, 10),
        );
        let index = Arc::new(MockIndex::with_status("available"));

        let result = orchestrator(store.clone(), index).perform_sync().await.unwrap();

        assert_eq!(result, SyncResult::default());
        assert!(store.synced().is_empty());
        assert_eq!(store.count_calls(), 0);
    }

    #[tokio::test]
    async fn test_full_reindex_on_large_drift() {
        let store = Arc::new(
            MockStore::new()
                .with_collection(Collection::Messages, 500, 500, 500)
                .with_collection(Collection::Conversations, 100, 1800, 1800),
        );
        let index = Arc::new(MockIndex::with_status("available"));

        let result = orchestrator(store.clone(), index).perform_sync().await.unwrap();

        assert_eq!(
            result,
            SyncResult {
                messages_sync: false,
                convos_sync: true
            }
        );
        assert_eq!(store.sync_calls(Collection::Conversations), 1);
        assert_eq!(store.sync_calls(Collection::Messages), 0);
    }

    #[tokio::test]
    async fn test_incremental_reindex_after_deletions() {
        // Progress snapshot says 1800 but documents were deleted since
        let store = Arc::new(
            MockStore::new()
                .with_collection(Collection::Messages, 500, 500, 500)
                .with_collection(Collection::Conversations, 100, 1800, 250),
        );
        let index = Arc::new(MockIndex::with_status("available"));

        let result = orchestrator(store.clone(), index).perform_sync().await.unwrap();

        assert!(!result.messages_sync);
        assert!(result.convos_sync);
        assert_eq!(store.sync_calls(Collection::Conversations), 1);
    }

    #[tokio::test]
    async fn test_stale_progress_does_not_reindex() {
        let store = Arc::new(
            MockStore::new().with_collection(Collection::Messages, 300, 320, 300),
        );
        let index = Arc::new(MockIndex::with_status("available"));

        let result = orchestrator(store.clone(), index).perform_sync().await.unwrap();

        assert!(!result.any());
        assert_eq!(store.count_calls(), 1);
        assert!(store.synced().is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_index_aborts_before_store() {
        let store = Arc::new(
            MockStore::new().with_collection(Collection::Messages, 0, 50, 50),
        );
        let index = Arc::new(MockIndex::with_status("starting"));

        let err = orchestrator(store.clone(), index.clone())
            .perform_sync()
            .await
            .unwrap_err();

        match err {
            SyncError::IndexUnavailable { status } => assert_eq!(status, "starting"),
            other => panic!("expected IndexUnavailable, got {:?}", other),
        }
        assert_eq!(index.health_calls(), 1);
        assert_eq!(store.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_indexing_disabled_touches_nothing() {
        let store = Arc::new(
            MockStore::new().with_collection(Collection::Messages, 0, 50, 50),
        );
        let index = Arc::new(MockIndex::with_status("available"));
        let provider = Arc::new(MockProvider::new(index.clone()));
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            provider.clone(),
            SyncSettings {
                indexing_disabled: true,
                ..SyncSettings::default()
            },
        );

        let result = orchestrator.perform_sync().await.unwrap();

        assert_eq!(result, SyncResult::default());
        assert_eq!(provider.instance_calls(), 0);
        assert_eq!(index.health_calls(), 0);
        assert_eq!(store.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_in_one_collection_is_not_masked() {
        let store = Arc::new(
            MockStore::new()
                .with_collection(Collection::Messages, 0, 20, 20)
                .with_collection(Collection::Conversations, 0, 5, 5)
                .failing_sync(Collection::Messages, || {
                    SyncError::Store("disk I/O error".to_string())
                }),
        );
        let index = Arc::new(MockIndex::with_status("available"));

        let err = orchestrator(store.clone(), index)
            .perform_sync()
            .await
            .unwrap_err();

        match err {
            SyncError::Collection { collection, .. } => {
                assert_eq!(collection, Collection::Messages)
            }
            other => panic!("expected Collection error, got {:?}", other),
        }
        // Conversations were still synced
        assert_eq!(
            store.synced(),
            vec![Collection::Messages, Collection::Conversations]
        );
    }
}
