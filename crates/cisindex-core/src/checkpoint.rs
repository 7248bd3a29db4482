//! Checkpoints: the single durable "resume from here" marker per stage.
//!
//! A checkpoint is a `helpers` document `{_id: <stage id>, height}`. It is
//! overwritten, never appended. Stages enqueue their checkpoint document behind
//! their data so the Sink persists it only once that data is stored.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::IndexerError;
use crate::queue::Keyed;
use crate::store::{Collection, Document, DocumentStore};
use crate::types::Height;

/// Pipeline stages that own a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Main block ingestion.
    Heartbeat,
    TokenAccounting,
    Memos,
}

impl Stage {
    /// Well-known checkpoint document id.
    pub fn checkpoint_id(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat_last_processed_block",
            Self::TokenAccounting => "token_accounting_last_processed_block_v2",
            Self::Memos => "heartbeat_memos_last_processed_block",
        }
    }
}

/// The persisted checkpoint record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "_id")]
    pub id: String,
    pub height: Height,
}

impl Keyed for Checkpoint {
    fn key(&self) -> String {
        self.id.clone()
    }
}

/// Diagnostic record written when a height keeps failing. Never read back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockFailure {
    #[serde(rename = "_id")]
    pub id: String,
    pub height: Height,
    #[serde(rename = "Exception")]
    pub exception: String,
    pub recorded_at: i64,
}

impl BlockFailure {
    pub fn new(height: Height, error: &IndexerError) -> Self {
        Self {
            id: format!("block_failure_{height}"),
            height,
            exception: error.to_string(),
            recorded_at: Utc::now().timestamp(),
        }
    }
}

impl Keyed for BlockFailure {
    fn key(&self) -> String {
        self.id.clone()
    }
}

/// Reads and builds checkpoint documents for one stage.
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn DocumentStore>,
    stage: Stage,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn DocumentStore>, stage: Stage) -> Self {
        Self { store, stage }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Load the last persisted height (`None` if the stage never committed).
    pub async fn load(&self) -> Result<Option<Height>, IndexerError> {
        Self::load_stage(self.store.as_ref(), self.stage).await
    }

    /// Load any stage's persisted height through a store reference.
    pub async fn load_stage(
        store: &dyn DocumentStore,
        stage: Stage,
    ) -> Result<Option<Height>, IndexerError> {
        let doc = store.find_one(Collection::Helpers, stage.checkpoint_id()).await?;
        Ok(doc.and_then(|d| d.u64_field("height")))
    }

    /// Build the checkpoint document for `height`, ready to enqueue.
    pub fn document(&self, height: Height) -> Document {
        Document::new(
            self.stage.checkpoint_id(),
            json!({ "_id": self.stage.checkpoint_id(), "height": height }),
        )
    }

    /// Write the checkpoint immediately, bypassing the queues.
    pub async fn force_save(&self, height: Height) -> Result<(), IndexerError> {
        self.store.replace_one(Collection::Helpers, self.document(height)).await
    }

    /// Best-effort diagnostic write of a failing height.
    pub async fn record_failure(&self, height: Height, error: &IndexerError) {
        let record = BlockFailure::new(height, error);
        match Document::from_record(&record) {
            Ok(doc) => {
                if let Err(e) = self.store.replace_one(Collection::Helpers, doc).await {
                    tracing::warn!(height, error = %e, "could not record block failure");
                }
            }
            Err(e) => tracing::warn!(height, error = %e, "could not encode block failure"),
        }
    }
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::store::{BulkWriteSummary, Filter};

/// In-memory document store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryDocumentStore {
    data: Mutex<HashMap<(Collection, String), Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn replace_one(&self, collection: Collection, doc: Document) -> Result<(), IndexerError> {
        self.data.lock().unwrap().insert((collection, doc.id.clone()), doc);
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        collection: Collection,
        docs: Vec<Document>,
    ) -> Result<BulkWriteSummary, IndexerError> {
        let mut data = self.data.lock().unwrap();
        let mut summary = BulkWriteSummary::default();
        for doc in docs {
            match data.insert((collection, doc.id.clone()), doc) {
                Some(_) => summary.replaced += 1,
                None => summary.inserted += 1,
            }
        }
        Ok(summary)
    }

    async fn find_one(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document>, IndexerError> {
        Ok(self.data.lock().unwrap().get(&(collection, id.to_string())).cloned())
    }

    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>, IndexerError> {
        let data = self.data.lock().unwrap();
        let mut docs: Vec<Document> = data
            .iter()
            .filter(|((c, _), d)| *c == collection && filter.matches(&d.body))
            .map(|(_, d)| d.clone())
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    async fn delete_one(&self, collection: Collection, id: &str) -> Result<bool, IndexerError> {
        Ok(self.data.lock().unwrap().remove(&(collection, id.to_string())).is_some())
    }
}
