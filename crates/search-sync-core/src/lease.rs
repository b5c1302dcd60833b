use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::SyncError;

/// Flow id of the index sync job.
pub const INDEX_SYNC_FLOW_ID: &str = "meili-index-sync";

/// Flow type of the index sync job.
pub const INDEX_SYNC_FLOW_TYPE: &str = "MEILI_SYNC";

/// Lease TTL for the index sync job.
pub const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(10 * 60);

/// Identifies a flow that must run at most once at a time across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub flow_id: String,
    pub flow_type: String,
}

impl FlowKey {
    pub fn new(flow_id: impl Into<String>, flow_type: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            flow_type: flow_type.into(),
        }
    }

    /// Key of the index sync flow.
    pub fn index_sync() -> Self {
        Self::new(INDEX_SYNC_FLOW_ID, INDEX_SYNC_FLOW_TYPE)
    }

    /// Key under which lease stores keep this flow's record.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.flow_type, self.flow_id)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flow_type, self.flow_id)
    }
}

/// Lease data kept by a lease store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder_id: String,
    /// Unix timestamp in milliseconds
    pub acquired_at: i64,
    /// Unix timestamp in milliseconds
    pub expires_at: i64,
}

impl LeaseRecord {
    pub fn new(holder_id: &str, now_ms: i64, ttl: Duration) -> Self {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            holder_id: holder_id.to_string(),
            acquired_at: now_ms,
            expires_at: now_ms.saturating_add(ttl_ms),
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }

    /// Whether `holder_id` may take this lease at `now_ms`.
    pub fn grants(&self, holder_id: &str, now_ms: i64) -> bool {
        self.is_expired(now_ms) || self.holder_id == holder_id
    }
}

/// Result of a lease acquisition attempt.
#[derive(Debug, Clone)]
pub struct LeaseAcquireResult {
    /// Whether the lease was acquired.
    pub acquired: bool,
}

impl LeaseAcquireResult {
    /// Create a successful acquisition result.
    pub fn acquired() -> Self {
        Self { acquired: true }
    }

    /// Create a failed acquisition result (lease held by another).
    pub fn not_acquired() -> Self {
        Self { acquired: false }
    }
}

/// Shared store of TTL-bound flow leases.
///
/// At most one unexpired lease per flow key exists at any time. Acquiring a
/// lease already held by the same holder refreshes it.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "file").
    fn backend_name(&self) -> &'static str;

    /// Attempt to acquire the lease on `key`.
    ///
    /// # Arguments
    /// * `key` - Flow to lease
    /// * `holder_id` - Unique identifier for this lease holder (UUID recommended)
    /// * `ttl` - Time-to-live so a crashed holder cannot block the flow forever
    async fn acquire(
        &self,
        key: &FlowKey,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LeaseAcquireResult, SyncError>;

    /// Release a lease.
    ///
    /// The lease is only released if `holder_id` matches the current holder.
    /// Silently succeeds if the lease doesn't exist or is held by someone else.
    async fn release(&self, key: &FlowKey, holder_id: &str) -> Result<(), SyncError>;
}

/// Looks up the shared lease store at run time.
///
/// Returns `None` when the backing store cannot be reached; callers then run
/// without cross-process exclusion.
pub trait LeaseStoreSource: Send + Sync {
    fn lease_store(&self) -> Option<Arc<dyn LeaseStore>>;
}

/// A lease store source with a fixed answer.
pub struct StaticLeaseSource(Option<Arc<dyn LeaseStore>>);

impl StaticLeaseSource {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self(Some(store))
    }

    /// A source that never has a store.
    pub fn unavailable() -> Self {
        Self(None)
    }
}

impl LeaseStoreSource for StaticLeaseSource {
    fn lease_store(&self) -> Option<Arc<dyn LeaseStore>> {
        self.0.clone()
    }
}

/// In-process lease store.
///
/// Only excludes holders sharing this value, so it suits a single host
/// running several sync instances (and tests).
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: DashMap<String, LeaseRecord>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of a flow, if the lease is unexpired.
    pub fn holder(&self, key: &FlowKey) -> Option<String> {
        let now = chrono::Utc::now().timestamp_millis();
        self.leases
            .get(&key.storage_key())
            .filter(|record| !record.is_expired(now))
            .map(|record| record.holder_id.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        key: &FlowKey,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LeaseAcquireResult, SyncError> {
        let now = chrono::Utc::now().timestamp_millis();

        match self.leases.entry(key.storage_key()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().grants(holder_id, now) {
                    debug!(
                        "Flow {} held by {} until {} (requested by {})",
                        key,
                        entry.get().holder_id,
                        entry.get().expires_at,
                        holder_id
                    );
                    return Ok(LeaseAcquireResult::not_acquired());
                }
                entry.insert(LeaseRecord::new(holder_id, now, ttl));
            }
            Entry::Vacant(entry) => {
                entry.insert(LeaseRecord::new(holder_id, now, ttl));
            }
        }

        debug!("Acquired flow {} for {}", key, holder_id);
        Ok(LeaseAcquireResult::acquired())
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(&self, key: &FlowKey, holder_id: &str) -> Result<(), SyncError> {
        let removed = self
            .leases
            .remove_if(&key.storage_key(), |_, record| record.holder_id == holder_id);
        if removed.is_some() {
            debug!("Released flow {} by {}", key, holder_id);
        } else {
            debug!("Flow {} not held by {} (no-op)", key, holder_id);
        }
        Ok(())
    }
}

/// Runs handlers under a flow lease.
///
/// Each manager has its own holder id, so two managers on one store behave
/// like two processes.
pub struct FlowManager {
    store: Arc<dyn LeaseStore>,
    ttl: Duration,
    holder_id: String,
}

impl FlowManager {
    pub fn new(store: Arc<dyn LeaseStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            holder_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Run `handler` only if no other holder has the lease on `key`.
    ///
    /// The lease is released once the handler finishes, whatever its result.
    /// Fails with [`SyncError::LeaseContention`] when the flow is held elsewhere.
    pub async fn run_exclusive<T, F, Fut>(&self, key: &FlowKey, handler: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let lease = self.store.acquire(key, &self.holder_id, self.ttl).await?;
        if !lease.acquired {
            return Err(SyncError::LeaseContention {
                flow_id: key.flow_id.clone(),
            });
        }

        let result = handler().await;

        if let Err(e) = self.store.release(key, &self.holder_id).await {
            // The TTL frees the flow eventually
            warn!("Failed to release flow {}: {}", key, e);
        }

        result
    }
}
