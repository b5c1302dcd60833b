use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{FailureKind, SyncError};
use crate::lease::{FlowKey, FlowManager, LeaseStoreSource, DEFAULT_FLOW_TTL};
use crate::orchestrator::{SyncOrchestrator, SyncResult};
use crate::store::{Collection, DocumentStore};

/// Delay before rebuilding missing indices.
pub const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_millis(750);

/// Outcome of one [`IndexSync::run`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Search is turned off; nothing was touched.
    Disabled,
    /// Another process holds the sync flow.
    AlreadyRunning,
    /// Sync ran under the flow lease.
    Completed(SyncResult),
    /// Sync ran without cross-process exclusion because no lease store was
    /// available.
    Degraded(SyncResult),
    /// Indices were missing; a rebuild is scheduled.
    RecoveryScheduled,
    /// Search credentials are missing.
    NotConfigured,
    /// The search service could not be reached.
    Unreachable,
    /// Any other failure, with its message.
    Failed(String),
}

impl SyncOutcome {
    /// The sync result, for outcomes where a sync ran to completion.
    pub fn sync_result(&self) -> Option<SyncResult> {
        match self {
            SyncOutcome::Completed(result) | SyncOutcome::Degraded(result) => Some(*result),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Disabled => "disabled",
            SyncOutcome::AlreadyRunning => "already_running",
            SyncOutcome::Completed(_) => "completed",
            SyncOutcome::Degraded(_) => "degraded",
            SyncOutcome::RecoveryScheduled => "recovery_scheduled",
            SyncOutcome::NotConfigured => "not_configured",
            SyncOutcome::Unreachable => "unreachable",
            SyncOutcome::Failed(_) => "failed",
        }
    }
}

/// Options of the entry point.
#[derive(Debug, Clone)]
pub struct IndexSyncOptions {
    /// Master switch of the search feature.
    pub search_enabled: bool,
    pub flow_key: FlowKey,
    pub flow_ttl: Duration,
    pub recovery_delay: Duration,
}

impl Default for IndexSyncOptions {
    fn default() -> Self {
        Self {
            search_enabled: true,
            flow_key: FlowKey::index_sync(),
            flow_ttl: DEFAULT_FLOW_TTL,
            recovery_delay: DEFAULT_RECOVERY_DELAY,
        }
    }
}

/// Entry point invoked by the scheduler.
///
/// Runs the orchestrator under the flow lease and turns every failure into a
/// [`SyncOutcome`]; it never returns an error. Owns the pending index
/// recovery task, which [`IndexSync::shutdown`] (or dropping the value)
/// cancels.
pub struct IndexSync {
    orchestrator: SyncOrchestrator,
    leases: Arc<dyn LeaseStoreSource>,
    options: IndexSyncOptions,
    recovery: Mutex<Option<JoinHandle<()>>>,
}

impl IndexSync {
    pub fn new(
        orchestrator: SyncOrchestrator,
        leases: Arc<dyn LeaseStoreSource>,
        options: IndexSyncOptions,
    ) -> Self {
        Self {
            orchestrator,
            leases,
            options,
            recovery: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &IndexSyncOptions {
        &self.options
    }

    /// Run one sync check.
    pub async fn run(&self) -> SyncOutcome {
        if !self.options.search_enabled {
            info!("Search is disabled, skipping index sync");
            return SyncOutcome::Disabled;
        }

        info!("Starting index synchronization check");

        let attempt = match self.leases.lease_store() {
            Some(store) => {
                debug!("Using {} lease store for flow {}", store.backend_name(), self.options.flow_key);
                let flows = FlowManager::new(store, self.options.flow_ttl);
                flows
                    .run_exclusive(&self.options.flow_key, || self.orchestrator.perform_sync())
                    .await
                    .map(SyncOutcome::Completed)
            }
            None => {
                warn!(
                    degraded = true,
                    "Lease store not available, running sync without cross-process exclusion"
                );
                self.orchestrator
                    .perform_sync()
                    .await
                    .map(SyncOutcome::Degraded)
            }
        };

        match attempt {
            Ok(outcome) => {
                match outcome.sync_result() {
                    Some(result) if result.any() => info!("Sync completed successfully"),
                    _ => debug!("No sync was needed"),
                }
                outcome
            }
            Err(e) => self.handle_failure(e),
        }
    }

    fn handle_failure(&self, err: SyncError) -> SyncOutcome {
        match err.kind() {
            FailureKind::LeaseContention => {
                info!("Sync already running on another instance");
                SyncOutcome::AlreadyRunning
            }
            FailureKind::IndexMissing => {
                debug!("Search index missing ({}), creating indices", err);
                self.schedule_recovery();
                SyncOutcome::RecoveryScheduled
            }
            FailureKind::NotConfigured => {
                info!("Search index not configured, search will be disabled: {}", err);
                SyncOutcome::NotConfigured
            }
            FailureKind::TransientNetwork => {
                error!("Network error reaching the search service: {}", err);
                error!("Check if the search service is reachable from this server");
                SyncOutcome::Unreachable
            }
            FailureKind::Unclassified => {
                error!("Unexpected error during index sync: {}", err);
                SyncOutcome::Failed(err.to_string())
            }
        }
    }

    /// Rebuild every collection's index after the recovery delay, bypassing
    /// the flow lease. Replaces any recovery still pending.
    fn schedule_recovery(&self) {
        let store = Arc::clone(self.orchestrator.store());
        let delay = self.options.recovery_delay;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            rebuild_indices(store.as_ref()).await;
        });

        let mut slot = self.recovery.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Whether a scheduled recovery has not finished yet.
    pub fn has_pending_recovery(&self) -> bool {
        self.recovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for a scheduled recovery, if any, to finish.
    pub async fn wait_for_recovery(&self) {
        let handle = self
            .recovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Index recovery task failed: {}", e);
                }
            }
        }
    }

    /// Cancel any pending recovery.
    pub fn shutdown(&self) {
        let handle = self
            .recovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            debug!("Clearing pending index recovery before exiting");
            handle.abort();
        }
    }
}

impl Drop for IndexSync {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn rebuild_indices(store: &dyn DocumentStore) {
    for collection in Collection::ALL {
        match store.sync_with_index(collection).await {
            Ok(uploaded) => debug!("Recreated {} index ({} documents)", collection, uploaded),
            Err(e) => {
                error!(
                    "Trouble creating {} index, try restarting the server: {}",
                    collection, e
                );
                return;
            }
        }
    }
    info!("Search indices recreated");
}
