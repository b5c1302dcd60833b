// Re-export from search-sync-core
pub use search_sync_core::SyncError;

/// Convert a reqwest error to SyncError.
///
/// Connection failures and timeouts mean the search service is unreachable.
pub fn http_error_to_sync(context: &str, err: reqwest::Error) -> SyncError {
    if err.is_connect() || err.is_timeout() {
        SyncError::ServiceUnavailable(format!("{}: {}", context, err))
    } else if err.is_decode() {
        SyncError::Serialization(format!("{}: {}", context, err))
    } else {
        SyncError::Internal(format!("{}: {}", context, err))
    }
}

/// Extension trait for converting reqwest Results to SyncError Results
pub trait HttpResultExt<T> {
    fn map_http_err(self, context: &str) -> Result<T, SyncError>;
}

impl<T> HttpResultExt<T> for Result<T, reqwest::Error> {
    fn map_http_err(self, context: &str) -> Result<T, SyncError> {
        self.map_err(|e| http_error_to_sync(context, e))
    }
}

/// Extension trait for converting sqlx Results to SyncError Results
pub trait StoreResultExt<T> {
    fn map_store_err(self, context: &str) -> Result<T, SyncError>;
}

impl<T> StoreResultExt<T> for Result<T, sqlx::Error> {
    fn map_store_err(self, context: &str) -> Result<T, SyncError> {
        self.map_err(|e| SyncError::Store(format!("{}: {}", context, e)))
    }
}

/// Extension trait for converting I/O Results on lease files to SyncError Results
pub trait LeaseIoResultExt<T> {
    fn map_lease_err(self, context: &str) -> Result<T, SyncError>;
}

impl<T> LeaseIoResultExt<T> for std::io::Result<T> {
    fn map_lease_err(self, context: &str) -> Result<T, SyncError> {
        self.map_err(|e| SyncError::LeaseStore(format!("{}: {}", context, e)))
    }
}
