use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use search_sync_core::{Collection, DocumentStore, SearchIndexProvider, SyncProgress};
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info, instrument, warn};

use crate::error::{StoreResultExt, SyncError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        message_id TEXT PRIMARY KEY,
        conversation_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        sender TEXT NOT NULL,
        text TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        indexed INTEGER NOT NULL DEFAULT 0 CHECK (indexed IN (0, 1))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS conversations (
        conversation_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        title TEXT NOT NULL DEFAULT 'New Chat',
        created_at TEXT NOT NULL,
        indexed INTEGER NOT NULL DEFAULT 0 CHECK (indexed IN (0, 1))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_messages_indexed ON messages (indexed)",
    "CREATE INDEX IF NOT EXISTS idx_conversations_indexed ON conversations (indexed)",
];

/// SQLite-backed message and conversation store.
///
/// Each row carries an `indexed` flag set once the document has been pushed
/// to the search index. Progress is the count of flagged rows against the
/// table size.
pub struct SqliteDocumentStore {
    pool: SqlitePool,
    search: Arc<dyn SearchIndexProvider>,
    batch_size: usize,
}

impl std::fmt::Debug for SqliteDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDocumentStore")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl SqliteDocumentStore {
    pub fn new(pool: SqlitePool, search: Arc<dyn SearchIndexProvider>, batch_size: usize) -> Self {
        Self {
            pool,
            search,
            batch_size: batch_size.max(1),
        }
    }

    /// Open (or create) the database at `database_url`.
    pub async fn connect(
        database_url: &str,
        search: Arc<dyn SearchIndexProvider>,
        batch_size: usize,
    ) -> Result<Self, SyncError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_store_err("Invalid database URL")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to an in-memory database sees its own copy
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_store_err("Failed to open database")?;

        Ok(Self::new(pool, search, batch_size))
    }

    /// Create tables and indexes if missing.
    pub async fn migrate(&self) -> Result<(), SyncError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .map_store_err("Failed to apply schema")?;
        }
        Ok(())
    }

    fn table(collection: Collection) -> &'static str {
        match collection {
            Collection::Messages => "messages",
            Collection::Conversations => "conversations",
        }
    }

    fn key_column(collection: Collection) -> &'static str {
        match collection {
            Collection::Messages => "message_id",
            Collection::Conversations => "conversation_id",
        }
    }

    /// Next batch of documents not yet in the index, as (row key, search document).
    async fn pending_batch(
        &self,
        collection: Collection,
    ) -> Result<Vec<(String, serde_json::Value)>, SyncError> {
        let limit = self.batch_size as i64;

        let batch = match collection {
            Collection::Messages => {
                let rows = sqlx::query(
                    "SELECT message_id, conversation_id, user_id, sender, text FROM messages WHERE indexed = 0 ORDER BY rowid LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_store_err("Failed to read pending messages")?;

                rows.iter()
                    .map(|row| {
                        let id: String = row.try_get("message_id")?;
                        let conversation_id: String = row.try_get("conversation_id")?;
                        let user: String = row.try_get("user_id")?;
                        let sender: String = row.try_get("sender")?;
                        let text: String = row.try_get("text")?;
                        let document = json!({
                            "messageId": &id,
                            "conversationId": conversation_id,
                            "user": user,
                            "sender": sender,
                            "text": text,
                        });
                        Ok((id, document))
                    })
                    .collect::<Result<Vec<_>, sqlx::Error>>()
            }
            Collection::Conversations => {
                let rows = sqlx::query(
                    "SELECT conversation_id, user_id, title FROM conversations WHERE indexed = 0 ORDER BY rowid LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_store_err("Failed to read pending conversations")?;

                rows.iter()
                    .map(|row| {
                        let id: String = row.try_get("conversation_id")?;
                        let user: String = row.try_get("user_id")?;
                        let title: String = row.try_get("title")?;
                        let document = json!({
                            "conversationId": &id,
                            "user": user,
                            "title": title,
                        });
                        Ok((id, document))
                    })
                    .collect::<Result<Vec<_>, sqlx::Error>>()
            }
        };

        batch.map_store_err("Failed to decode row")
    }

    /// Flag every row of a collection as not yet indexed.
    async fn reset_indexed(&self, collection: Collection) -> Result<u64, SyncError> {
        let sql = format!(
            "UPDATE {} SET indexed = 0 WHERE indexed = 1",
            Self::table(collection)
        );
        let result = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_store_err("Failed to reset indexed flags")?;
        Ok(result.rows_affected())
    }

    async fn mark_indexed(&self, collection: Collection, ids: &[String]) -> Result<(), SyncError> {
        let sql = format!(
            "UPDATE {} SET indexed = 1 WHERE {} = ?",
            Self::table(collection),
            Self::key_column(collection)
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_store_err("Failed to begin transaction")?;
        for id in ids {
            sqlx::query(&sql)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_store_err("Failed to mark document indexed")?;
        }
        tx.commit()
            .await
            .map_store_err("Failed to commit indexed flags")?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    #[instrument(skip(self), level = "debug")]
    async fn sync_progress(&self, collection: Collection) -> Result<SyncProgress, SyncError> {
        let sql = format!(
            "SELECT COALESCE(SUM(indexed), 0), COUNT(*) FROM {}",
            Self::table(collection)
        );
        let (processed, total): (i64, i64) = sqlx::query_as(&sql)
            .fetch_one(&self.pool)
            .await
            .map_store_err("Failed to read sync progress")?;

        // Flagged rows only count if their index still exists
        if processed > 0 {
            self.search
                .instance()?
                .get_index(collection.index_uid())
                .await?;
        }

        Ok(SyncProgress::new(processed as u64, total as u64))
    }

    #[instrument(skip(self), level = "debug")]
    async fn count_documents(&self, collection: Collection) -> Result<u64, SyncError> {
        let sql = format!("SELECT COUNT(*) FROM {}", Self::table(collection));
        let count: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_store_err("Failed to count documents")?;

        Ok(count as u64)
    }

    #[instrument(skip(self), level = "debug")]
    async fn sync_with_index(&self, collection: Collection) -> Result<u64, SyncError> {
        let client = self.search.instance()?;

        match client.get_index(collection.index_uid()).await {
            Ok(_) => {}
            Err(SyncError::IndexMissing(_)) => {
                let reset = self.reset_indexed(collection).await?;
                if reset > 0 {
                    warn!(
                        "Index {} is missing, re-pushing {} {}",
                        collection.index_uid(),
                        reset,
                        collection
                    );
                }
            }
            Err(e) => return Err(e),
        }

        let mut uploaded = 0u64;

        loop {
            let batch = self.pending_batch(collection).await?;
            if batch.is_empty() {
                break;
            }

            let (ids, documents): (Vec<String>, Vec<serde_json::Value>) =
                batch.into_iter().unzip();

            let task = client
                .add_documents(collection.index_uid(), collection.primary_key(), &documents)
                .await?;
            // Rows stay pending unless the task was applied
            client.wait_for_task(&task).await?;
            self.mark_indexed(collection, &ids).await?;

            uploaded += ids.len() as u64;
            debug!("Pushed {} {} ({} so far)", ids.len(), collection, uploaded);
        }

        info!("Synced {} {} to index {}", uploaded, collection, collection.index_uid());
        Ok(uploaded)
    }
}
