//! In-memory storage backend.
//!
//! Keeps every collection in RAM. Besides ephemeral runs it doubles as the
//! test store: it counts writes and can be told to fail them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use cisindex_core::checkpoint::MemoryDocumentStore;
use cisindex_core::error::IndexerError;
use cisindex_core::store::{BulkWriteSummary, Collection, Document, DocumentStore, Filter};

/// In-memory document store with write accounting and failure injection.
///
/// All data is lost when the process exits.
#[derive(Default)]
pub struct InMemoryStore {
    inner: MemoryDocumentStore,
    /// Write calls per collection, successful or not.
    writes: Mutex<HashMap<Collection, usize>>,
    /// Collections whose writes currently fail.
    failing: Mutex<HashSet<Collection>>,
    /// Number of upcoming writes (any collection) that fail.
    failing_writes: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to `collection` fail until [`heal`](Self::heal).
    pub fn fail_collection(&self, collection: Collection) {
        self.failing.lock().unwrap().insert(collection);
    }

    pub fn heal(&self, collection: Collection) {
        self.failing.lock().unwrap().remove(&collection);
    }

    /// Make the next `n` writes fail, whatever their collection.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Number of write calls made against `collection`.
    pub fn write_calls(&self, collection: Collection) -> usize {
        self.writes.lock().unwrap().get(&collection).copied().unwrap_or(0)
    }

    /// Number of documents stored in `collection`.
    pub async fn count(&self, collection: Collection) -> usize {
        self.inner
            .find(collection, &Filter::All)
            .await
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    fn check_write(&self, collection: Collection) -> Result<(), IndexerError> {
        *self.writes.lock().unwrap().entry(collection).or_default() += 1;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.failing.lock().unwrap().contains(&collection) {
            return Err(IndexerError::Storage(format!("injected write failure on {collection}")));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn replace_one(&self, collection: Collection, doc: Document) -> Result<(), IndexerError> {
        self.check_write(collection)?;
        self.inner.replace_one(collection, doc).await
    }

    async fn bulk_upsert(
        &self,
        collection: Collection,
        docs: Vec<Document>,
    ) -> Result<BulkWriteSummary, IndexerError> {
        self.check_write(collection)?;
        self.inner.bulk_upsert(collection, docs).await
    }

    async fn find_one(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document>, IndexerError> {
        self.inner.find_one(collection, id).await
    }

    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>, IndexerError> {
        self.inner.find(collection, filter).await
    }

    async fn delete_one(&self, collection: Collection, id: &str) -> Result<bool, IndexerError> {
        self.check_write(collection)?;
        self.inner.delete_one(collection, id).await
    }
}
