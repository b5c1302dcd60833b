use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode, Url};
use search_sync_core::{
    HealthStatus, IndexInfo, SearchIndex, SearchIndexProvider, TaskInfo, TASK_SUCCEEDED,
};
use serde::Deserialize;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{HttpResultExt, SyncError};

/// Error body returned by the Meilisearch API.
#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    code: String,
}

/// Task as returned by `GET /tasks/{uid}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskView {
    uid: u64,
    #[serde(default)]
    index_uid: Option<String>,
    status: String,
    #[serde(default)]
    error: Option<ApiError>,
}

/// How often an enqueued task is polled.
pub const DEFAULT_TASK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for an enqueued task before giving up.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// Meilisearch REST API client.
///
/// Uses the v1 HTTP API: `/health` for readiness, `/indexes/{uid}` for
/// lookups, `/indexes/{uid}/documents` for upserts and `/tasks/{uid}` to
/// follow enqueued work. Document additions create the index when it does
/// not exist yet.
pub struct MeiliClient {
    http_client: HttpClient,
    host: String,
    api_key: String,
    task_poll_interval: Duration,
    task_timeout: Duration,
}

impl std::fmt::Debug for MeiliClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeiliClient")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl MeiliClient {
    /// Create a new Meilisearch client.
    pub fn new(host: &str, api_key: &str) -> Result<Self, SyncError> {
        Url::parse(host).map_err(|e| {
            SyncError::Configuration(format!("Invalid Meilisearch host {}: {}", host, e))
        })?;

        let http_client = HttpClient::builder()
            .build()
            .map_http_err("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            host: host.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            task_poll_interval: DEFAULT_TASK_POLL_INTERVAL,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        })
    }

    /// Override task polling.
    pub fn with_task_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.task_poll_interval = interval;
        self.task_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }

    /// Map an API error code onto a SyncError variant, if it has a typed one.
    fn typed_api_error(api: ApiError) -> Result<SyncError, ApiError> {
        match api.code.as_str() {
            "index_not_found" => Ok(SyncError::IndexMissing(api.message)),
            "missing_authorization_header" | "invalid_api_key" => {
                Ok(SyncError::Configuration(api.message))
            }
            _ => Err(api),
        }
    }

    /// Map an unsuccessful response onto a SyncError variant.
    async fn error_from_response(context: &str, response: reqwest::Response) -> SyncError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();

        if let Ok(api) = serde_json::from_str::<ApiError>(&text) {
            if let Ok(typed) = Self::typed_api_error(api) {
                return typed;
            }
        }

        match status {
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
                SyncError::ServiceUnavailable(format!(
                    "{} failed with status {}",
                    context, status
                ))
            }
            _ => SyncError::Internal(format!(
                "{} failed with status {}: {}",
                context, status, text
            )),
        }
    }
}

#[async_trait]
impl SearchIndex for MeiliClient {
    #[instrument(skip(self), level = "debug")]
    async fn health(&self) -> Result<HealthStatus, SyncError> {
        let response = self
            .http_client
            .get(self.url("/health"))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_http_err("Meilisearch health request failed")?;

        if !response.status().is_success() {
            return Err(Self::error_from_response("Meilisearch health check", response).await);
        }

        let health: HealthStatus = response
            .json()
            .await
            .map_http_err("Failed to read Meilisearch health response")?;

        debug!("Meilisearch health: {}", health.status);
        Ok(health)
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_index(&self, index_uid: &str) -> Result<IndexInfo, SyncError> {
        let url = self.url(&format!("/indexes/{}", urlencoding::encode(index_uid)));

        let response = self
            .http_client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_http_err("Meilisearch index request failed")?;

        if !response.status().is_success() {
            return Err(Self::error_from_response("Meilisearch index lookup", response).await);
        }

        response
            .json()
            .await
            .map_http_err("Failed to read Meilisearch index")
    }

    #[instrument(skip(self, documents), level = "debug", fields(count = documents.len()))]
    async fn add_documents(
        &self,
        index_uid: &str,
        primary_key: &str,
        documents: &[serde_json::Value],
    ) -> Result<TaskInfo, SyncError> {
        let url = self.url(&format!(
            "/indexes/{}/documents",
            urlencoding::encode(index_uid)
        ));

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.api_key)
            .query(&[("primaryKey", primary_key)])
            .json(documents)
            .send()
            .await
            .map_http_err("Meilisearch document request failed")?;

        if !response.status().is_success() {
            return Err(Self::error_from_response("Meilisearch document upload", response).await);
        }

        let task: TaskInfo = response
            .json()
            .await
            .map_http_err("Failed to read Meilisearch task")?;

        debug!(
            "Enqueued task {} adding {} documents to {}",
            task.task_uid,
            documents.len(),
            index_uid
        );
        Ok(task)
    }

    #[instrument(skip(self), level = "debug", fields(task_uid = task.task_uid))]
    async fn wait_for_task(&self, task: &TaskInfo) -> Result<TaskInfo, SyncError> {
        let url = self.url(&format!("/tasks/{}", task.task_uid));
        let deadline = tokio::time::Instant::now() + self.task_timeout;

        loop {
            let response = self
                .http_client
                .get(&url)
                .bearer_auth(&self.api_key)
                .send()
                .await
                .map_http_err("Meilisearch task request failed")?;

            if !response.status().is_success() {
                return Err(Self::error_from_response("Meilisearch task lookup", response).await);
            }

            let view: TaskView = response
                .json()
                .await
                .map_http_err("Failed to read Meilisearch task")?;

            match view.status.as_str() {
                TASK_SUCCEEDED => {
                    debug!("Task {} succeeded", view.uid);
                    return Ok(TaskInfo {
                        task_uid: view.uid,
                        index_uid: view.index_uid,
                        status: view.status,
                    });
                }
                "failed" | "canceled" => {
                    let api = view.error.unwrap_or_else(|| ApiError {
                        message: format!("task {}", view.status),
                        code: format!("task_{}", view.status),
                    });
                    warn!("Task {} {}: {} ({})", view.uid, view.status, api.message, api.code);
                    return Err(match Self::typed_api_error(api) {
                        Ok(typed) => typed,
                        Err(api) => SyncError::TaskFailed {
                            task_uid: view.uid,
                            code: api.code,
                            message: api.message,
                        },
                    });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SyncError::ServiceUnavailable(format!(
                    "Task {} still {} after {:?}",
                    view.uid, view.status, self.task_timeout
                )));
            }
            tokio::time::sleep(self.task_poll_interval).await;
        }
    }
}

/// Lazily built, shared Meilisearch client.
///
/// The first `instance()` call builds the client from the configured host and
/// master key; later calls return the same client. Missing configuration or
/// a failed build leaves the handle empty so the next call tries again.
pub struct MeiliClientHandle {
    host: Option<String>,
    api_key: Option<String>,
    task_poll_interval: Duration,
    task_timeout: Duration,
    instance: Mutex<Option<Arc<MeiliClient>>>,
}

impl MeiliClientHandle {
    pub fn new(host: Option<String>, api_key: Option<String>) -> Self {
        Self {
            host: host.filter(|h| !h.is_empty()),
            api_key: api_key.filter(|k| !k.is_empty()),
            task_poll_interval: DEFAULT_TASK_POLL_INTERVAL,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            instance: Mutex::new(None),
        }
    }

    /// Task polling applied to the client once it is built.
    pub fn with_task_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.task_poll_interval = interval;
        self.task_timeout = timeout;
        self
    }
}

impl SearchIndexProvider for MeiliClientHandle {
    fn instance(&self) -> Result<Arc<dyn SearchIndex>, SyncError> {
        let mut slot = self.instance.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(client) = slot.as_ref() {
            debug!("Returning existing Meilisearch client");
            return Ok(client.clone() as Arc<dyn SearchIndex>);
        }

        debug!(
            host_set = self.host.is_some(),
            master_key_set = self.api_key.is_some(),
            "Creating Meilisearch client"
        );

        let (Some(host), Some(api_key)) = (self.host.as_deref(), self.api_key.as_deref()) else {
            error!("Missing configuration - MEILI_HOST or MEILI_MASTER_KEY not set");
            return Err(SyncError::Configuration(
                "Meilisearch configuration is missing".to_string(),
            ));
        };

        let client = Arc::new(
            MeiliClient::new(host, api_key)?
                .with_task_polling(self.task_poll_interval, self.task_timeout),
        );
        *slot = Some(client.clone());

        info!("Meilisearch client created for {}", client.host());
        Ok(client as Arc<dyn SearchIndex>)
    }
}
