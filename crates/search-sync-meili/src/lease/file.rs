use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use search_sync_core::{FlowKey, LeaseAcquireResult, LeaseRecord, LeaseStore, LeaseStoreSource};
use tracing::{debug, instrument, warn};

use crate::error::{LeaseIoResultExt, SyncError};

/// File-based lease store shared by every process that sees the same directory.
///
/// Each flow has two files:
/// - `{dir}/{flow_type}-{flow_id}.lock`: OS-level exclusive lock (flock on
///   Unix, LockFile on Windows) held only while the lease record is read or
///   written
/// - `{dir}/{flow_type}-{flow_id}.json`: the lease record (holder, expiry)
///
/// The record outlives the process that wrote it, so a crashed holder keeps
/// the flow until the TTL runs out.
#[derive(Debug)]
pub struct FileLeaseStore {
    dir: PathBuf,
}

impl FileLeaseStore {
    /// Create a new FileLeaseStore with the given directory.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn file_stem(key: &FlowKey) -> String {
        format!("{}-{}", key.flow_type, key.flow_id)
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn lock_path(&self, key: &FlowKey) -> PathBuf {
        self.dir.join(format!("{}.lock", Self::file_stem(key)))
    }

    fn record_path(&self, key: &FlowKey) -> PathBuf {
        self.dir.join(format!("{}.json", Self::file_stem(key)))
    }

    /// Ensure the lease directory exists.
    fn ensure_dir(&self) -> Result<(), SyncError> {
        ensure_dir(&self.dir)
    }

    /// Run `f` on the blocking pool while holding the flow's guard file
    /// exclusively.
    async fn with_guard<T, F>(&self, key: &FlowKey, f: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, SyncError> + Send + 'static,
    {
        let dir = self.dir.clone();
        let lock_path = self.lock_path(key);
        let record_path = self.record_path(key);

        tokio::task::spawn_blocking(move || {
            ensure_dir(&dir)?;

            let guard = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .map_lease_err("Failed to open lease lock file")?;

            guard
                .lock_exclusive()
                .map_lease_err("Failed to lock lease file")?;

            let result = f(&record_path);

            if let Err(e) = FileExt::unlock(&guard) {
                // Closing the file below drops the lock anyway
                debug!("Failed to unlock {}: {}", lock_path.display(), e);
            }
            result
        })
        .await
        .map_err(|e| SyncError::Internal(format!("Lease file task failed: {}", e)))?
    }

    fn read_record(path: &Path) -> Result<Option<LeaseRecord>, SyncError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SyncError::LeaseStore(format!(
                    "Failed to read lease record {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        match serde_json::from_str::<LeaseRecord>(&contents) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // A torn or foreign file does not block the flow
                warn!("Ignoring unreadable lease record {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    fn write_record(path: &Path, record: &LeaseRecord) -> Result<(), SyncError> {
        let json = serde_json::to_string(record).map_err(|e| {
            SyncError::Serialization(format!("Failed to serialize lease record: {}", e))
        })?;

        // Write then rename so readers never see a partial record
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp).map_lease_err("Failed to create lease record")?;
        std::io::Write::write_all(&mut file, json.as_bytes())
            .map_lease_err("Failed to write lease record")?;
        file.sync_all().map_lease_err("Failed to flush lease record")?;
        fs::rename(&tmp, path).map_lease_err("Failed to publish lease record")?;
        Ok(())
    }
}

fn ensure_dir(dir: &Path) -> Result<(), SyncError> {
    fs::create_dir_all(dir)
        .map_lease_err(&format!("Failed to create lease dir {}", dir.display()))
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        key: &FlowKey,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LeaseAcquireResult, SyncError> {
        let owned_key = key.clone();
        let holder_id = holder_id.to_string();

        self.with_guard(key, move |path| {
            let key = &owned_key;
            let holder_id = holder_id.as_str();
            let now = chrono::Utc::now().timestamp_millis();

            if let Some(existing) = Self::read_record(path)? {
                if !existing.grants(holder_id, now) {
                    debug!(
                        "Flow {} held by {} until {} (requested by {})",
                        key, existing.holder_id, existing.expires_at, holder_id
                    );
                    return Ok(LeaseAcquireResult::not_acquired());
                }
                if existing.holder_id != holder_id {
                    debug!(
                        "Flow {} expired (was held by {}), acquiring for {}",
                        key, existing.holder_id, holder_id
                    );
                }
            }

            let record = LeaseRecord::new(holder_id, now, ttl);
            Self::write_record(path, &record)?;

            debug!(
                "Acquired flow {} for {} (expires at {})",
                key, holder_id, record.expires_at
            );
            Ok(LeaseAcquireResult::acquired())
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(&self, key: &FlowKey, holder_id: &str) -> Result<(), SyncError> {
        let owned_key = key.clone();
        let holder_id = holder_id.to_string();

        self.with_guard(key, move |path| {
            let key = &owned_key;
            match Self::read_record(path)? {
                Some(existing) if existing.holder_id == holder_id => {
                    fs::remove_file(path).map_lease_err("Failed to remove lease record")?;
                    debug!("Released flow {} by {}", key, holder_id);
                }
                Some(existing) => {
                    debug!(
                        "Flow {} held by {} not {} (no-op)",
                        key, existing.holder_id, holder_id
                    );
                }
                None => {
                    debug!("Flow {} not found for release by {}", key, holder_id);
                }
            }
            Ok(())
        })
        .await
    }
}

/// Hands out a [`FileLeaseStore`] as long as its directory is usable.
pub struct FileLeaseSource {
    store: Arc<FileLeaseStore>,
}

impl FileLeaseSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            store: Arc::new(FileLeaseStore::new(dir)),
        }
    }
}

impl LeaseStoreSource for FileLeaseSource {
    fn lease_store(&self) -> Option<Arc<dyn LeaseStore>> {
        match self.store.ensure_dir() {
            Ok(()) => Some(self.store.clone() as Arc<dyn LeaseStore>),
            Err(e) => {
                warn!("Lease directory unavailable: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn setup() -> (FileLeaseStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileLeaseStore::new(temp_dir.path());
        (store, temp_dir)
    }

    fn key() -> FlowKey {
        FlowKey::index_sync()
    }

    #[tokio::test]
    async fn test_acquire_release() {
        let (store, _temp) = setup();
        let ttl = Duration::from_secs(60);

        let result = store.acquire(&key(), "holder-1", ttl).await.unwrap();
        assert!(result.acquired);

        // Same holder can re-acquire (refresh)
        let result2 = store.acquire(&key(), "holder-1", ttl).await.unwrap();
        assert!(result2.acquired);

        // Different holder cannot acquire
        let result3 = store.acquire(&key(), "holder-2", ttl).await.unwrap();
        assert!(!result3.acquired);

        store.release(&key(), "holder-1").await.unwrap();
        assert!(!store.record_path(&key()).exists());

        let result4 = store.acquire(&key(), "holder-2", ttl).await.unwrap();
        assert!(result4.acquired);
    }

    #[tokio::test]
    async fn test_release_not_owner() {
        let (store, _temp) = setup();
        let ttl = Duration::from_secs(60);

        store.acquire(&key(), "holder-1", ttl).await.unwrap();

        // holder-2 tries to release (should be no-op)
        store.release(&key(), "holder-2").await.unwrap();

        let result = store.acquire(&key(), "holder-2", ttl).await.unwrap();
        assert!(!result.acquired);
    }

    #[tokio::test]
    async fn test_lease_shared_across_store_instances() {
        // Two stores on one directory stand in for two processes
        let temp_dir = TempDir::new().unwrap();
        let process_a = FileLeaseStore::new(temp_dir.path());
        let process_b = FileLeaseStore::new(temp_dir.path());
        let ttl = Duration::from_secs(60);

        assert!(process_a.acquire(&key(), "a", ttl).await.unwrap().acquired);
        assert!(!process_b.acquire(&key(), "b", ttl).await.unwrap().acquired);

        process_a.release(&key(), "a").await.unwrap();
        assert!(process_b.acquire(&key(), "b", ttl).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let (store, _temp) = setup();

        store
            .acquire(&key(), "crashed-holder", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = store
            .acquire(&key(), "holder-2", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(result.acquired);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_ignored() {
        let (store, _temp) = setup();
        store.ensure_dir().unwrap();
        fs::write(store.record_path(&key()), "{not json").unwrap();

        let result = store
            .acquire(&key(), "holder-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(result.acquired);
    }

    #[test]
    fn test_source_unavailable_when_dir_cannot_be_created() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();

        let source = FileLeaseSource::new(blocker.join("leases"));
        assert!(source.lease_store().is_none());

        let source = FileLeaseSource::new(temp_dir.path().join("leases"));
        let store = source.lease_store().unwrap();
        assert_eq!(store.backend_name(), "file");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_waiting_on_guard_does_not_block_runtime() {
        let (store, _temp) = setup();
        store.ensure_dir().unwrap();

        // Another process sits on the guard file for a while
        let lock_path = store.lock_path(&key());
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let other = std::thread::spawn(move || {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .unwrap();
            file.lock_exclusive().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(500));
            FileExt::unlock(&file).unwrap();
        });
        locked_rx.recv().unwrap();

        let store = Arc::new(store);
        let started = std::time::Instant::now();
        let acquire = tokio::spawn({
            let store = Arc::clone(&store);
            async move {
                store
                    .acquire(&key(), "holder-1", Duration::from_secs(60))
                    .await
            }
        });

        // The single runtime thread keeps running other tasks meanwhile
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(!acquire.is_finished());

        assert!(acquire.await.unwrap().unwrap().acquired);
        other.join().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire() {
        use tokio::sync::Barrier;

        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();
        let ttl = Duration::from_secs(30);

        const NUM_TASKS: usize = 10;
        let barrier = Arc::new(Barrier::new(NUM_TASKS));
        let inside = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for i in 0..NUM_TASKS {
            let store = FileLeaseStore::new(&dir);
            let barrier = Arc::clone(&barrier);
            let inside = Arc::clone(&inside);
            let completed = Arc::clone(&completed);
            let holder_id = format!("holder-{}", i);

            let handle = tokio::spawn(async move {
                barrier.wait().await;

                let mut acquired = false;
                for attempt in 0..200 {
                    if attempt > 0 {
                        tokio::time::sleep(Duration::from_millis(5 + (attempt % 10) as u64)).await;
                    }
                    let result = store
                        .acquire(&key(), &holder_id, ttl)
                        .await
                        .expect("acquire failed");
                    if result.acquired {
                        acquired = true;
                        break;
                    }
                }
                assert!(acquired, "Task {} failed to acquire lease", i);

                // Critical section: nobody else may be inside
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);

                store
                    .release(&key(), &holder_id)
                    .await
                    .expect("release failed");
            });

            handles.push(handle);
        }

        for handle in handles {
            handle.await.expect("task panicked");
        }

        assert_eq!(completed.load(Ordering::SeqCst), NUM_TASKS);
    }
}
