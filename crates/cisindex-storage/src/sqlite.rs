//! SQLite storage backend for CisIndex.
//!
//! Every collection lives in one `documents` table keyed by
//! `(collection, id)`, with the body stored as JSON text. Filters are
//! evaluated with SQLite's JSON functions.
//!
//! # Usage
//! ```rust,no_run
//! use cisindex_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./cisindex.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use cisindex_core::error::IndexerError;
use cisindex_core::store::{BulkWriteSummary, Collection, Document, DocumentStore, Filter};

fn storage_err(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

/// SQLite-backed document store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./cisindex.db"`) or a full
    /// SQLite URL (`"sqlite:./cisindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Limited to a single connection, since every new connection to
    /// `:memory:` would see its own empty database.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id         TEXT NOT NULL,
                body       TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        // Range scans by the auxiliary pipelines
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_documents_height
             ON documents (collection, json_extract(body, '$.block_height'));",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Result<Document, IndexerError> {
        let id: String = row.get("id");
        let body: String = row.get("body");
        Ok(Document::new(id, serde_json::from_str(&body)?))
    }
}

fn json_path(field: &str) -> String {
    format!("$.{field}")
}

/// Bound heights are stored as SQLite integers, which are signed.
fn clamp_height(h: u64) -> i64 {
    i64::try_from(h).unwrap_or(i64::MAX)
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn replace_one(&self, collection: Collection, doc: Document) -> Result<(), IndexerError> {
        let body = serde_json::to_string(&doc.body)?;
        sqlx::query(
            "INSERT INTO documents (collection, id, body) VALUES (?, ?, ?)
             ON CONFLICT (collection, id) DO UPDATE SET body = excluded.body",
        )
        .bind(collection.name())
        .bind(&doc.id)
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(%collection, id = %doc.id, "document replaced");
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        collection: Collection,
        docs: Vec<Document>,
    ) -> Result<BulkWriteSummary, IndexerError> {
        let mut summary = BulkWriteSummary::default();
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        for doc in &docs {
            let body = serde_json::to_string(&doc.body)?;
            let exists = sqlx::query("SELECT 1 FROM documents WHERE collection = ? AND id = ?")
                .bind(collection.name())
                .bind(&doc.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage_err)?
                .is_some();

            sqlx::query(
                "INSERT INTO documents (collection, id, body) VALUES (?, ?, ?)
                 ON CONFLICT (collection, id) DO UPDATE SET body = excluded.body",
            )
            .bind(collection.name())
            .bind(&doc.id)
            .bind(&body)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

            if exists {
                summary.replaced += 1;
            } else {
                summary.inserted += 1;
            }
        }

        tx.commit().await.map_err(storage_err)?;
        debug!(%collection, inserted = summary.inserted, replaced = summary.replaced, "bulk upsert");
        Ok(summary)
    }

    async fn find_one(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document>, IndexerError> {
        let row = sqlx::query("SELECT id, body FROM documents WHERE collection = ? AND id = ?")
            .bind(collection.name())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;

        row.as_ref().map(Self::row_to_document).transpose()
    }

    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>, IndexerError> {
        let rows = match filter {
            Filter::All => {
                sqlx::query("SELECT id, body FROM documents WHERE collection = ? ORDER BY id")
                    .bind(collection.name())
                    .fetch_all(&self.pool)
                    .await
            }
            Filter::FieldEquals { field, value } => {
                let value = serde_json::to_string(value)?;
                sqlx::query(
                    "SELECT id, body FROM documents
                     WHERE collection = ?
                       AND json_type(body, ?) = json_type(?, '$')
                       AND json_extract(body, ?) IS json_extract(?, '$')
                     ORDER BY id",
                )
                .bind(collection.name())
                .bind(json_path(field))
                .bind(&value)
                .bind(json_path(field))
                .bind(&value)
                .fetch_all(&self.pool)
                .await
            }
            Filter::HeightRange { field, from, to } => {
                sqlx::query(
                    "SELECT id, body FROM documents
                     WHERE collection = ?
                       AND json_type(body, ?) = 'integer'
                       AND json_extract(body, ?) BETWEEN ? AND ?
                     ORDER BY id",
                )
                .bind(collection.name())
                .bind(json_path(field))
                .bind(json_path(field))
                .bind(clamp_height(*from))
                .bind(clamp_height(*to))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_document).collect()
    }

    async fn delete_one(&self, collection: Collection, id: &str) -> Result<bool, IndexerError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection.name())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(result.rows_affected() > 0)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str, height: u64, token: &str) -> Document {
        Document::new(
            id,
            json!({ "_id": id, "block_height": height, "token_address": token, "redo": true }),
        )
    }

    #[tokio::test]
    async fn replace_one_overwrites() {
        let store = SqliteStore::in_memory().await.unwrap();
        let cp = |h: u64| Document::new("heartbeat_last_processed_block", json!({ "height": h }));

        store.replace_one(Collection::Helpers, cp(10)).await.unwrap();
        store.replace_one(Collection::Helpers, cp(11)).await.unwrap();

        let loaded = store
            .find_one(Collection::Helpers, "heartbeat_last_processed_block")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.u64_field("height"), Some(11));
        assert_eq!(store.find(Collection::Helpers, &Filter::All).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bulk_upsert_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        let batch = vec![event("1-a", 1, "<1,0>-01"), event("1-b", 1, "<1,0>-02")];

        let first = store.bulk_upsert(Collection::LoggedEvents, batch.clone()).await.unwrap();
        let second = store.bulk_upsert(Collection::LoggedEvents, batch).await.unwrap();
        assert_eq!((first.inserted, first.replaced), (2, 0));
        assert_eq!((second.inserted, second.replaced), (0, 2));
        assert_eq!(store.find(Collection::LoggedEvents, &Filter::All).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn filters_match_memory_semantics() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .bulk_upsert(
                Collection::LoggedEvents,
                vec![
                    event("5-a", 5, "<1,0>-01"),
                    event("7-a", 7, "<1,0>-02"),
                    event("9-a", 9, "<1,0>-01"),
                ],
            )
            .await
            .unwrap();

        let ranged = store
            .find(Collection::LoggedEvents, &Filter::height_range("block_height", 6, u64::MAX))
            .await
            .unwrap();
        let ids: Vec<_> = ranged.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["7-a", "9-a"]);

        let by_token = store
            .find(Collection::LoggedEvents, &Filter::field_equals("token_address", "<1,0>-01"))
            .await
            .unwrap();
        assert_eq!(by_token.len(), 2);

        let flagged = store
            .find(Collection::LoggedEvents, &Filter::field_equals("redo", true))
            .await
            .unwrap();
        assert_eq!(flagged.len(), 3);

        // Other collections are not visible
        assert!(store.find(Collection::Blocks, &Filter::All).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.replace_one(Collection::Blocks, event("b", 1, "")).await.unwrap();
        assert!(store.delete_one(Collection::Blocks, "b").await.unwrap());
        assert!(!store.delete_one(Collection::Blocks, "b").await.unwrap());
        assert!(store.find_one(Collection::Blocks, "b").await.unwrap().is_none());
    }
}
