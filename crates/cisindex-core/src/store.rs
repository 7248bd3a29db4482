//! Document store boundary: one keyed collection per destination.
//!
//! Backends live in `cisindex-storage` (memory, SQLite). The pipeline only
//! talks to the [`DocumentStore`] trait.

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IndexerError;
use crate::queue::Keyed;

/// Logical destination collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Blocks,
    Transactions,
    LoggedEvents,
    Instances,
    TokenAddressesToRedoAccounting,
    ProvenanceContractsToAdd,
    BlocksPerDay,
    TokenAddresses,
    TokenAccounts,
    MemoTransactionHashes,
    /// Checkpoints, failure records and request documents.
    Helpers,
}

impl Collection {
    /// Every collection except `Helpers`, in the order the Sink drains them.
    pub const DATA: [Collection; 10] = [
        Collection::Blocks,
        Collection::Transactions,
        Collection::Instances,
        Collection::LoggedEvents,
        Collection::TokenAddressesToRedoAccounting,
        Collection::ProvenanceContractsToAdd,
        Collection::BlocksPerDay,
        Collection::TokenAddresses,
        Collection::TokenAccounts,
        Collection::MemoTransactionHashes,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Blocks => "blocks",
            Self::Transactions => "transactions",
            Self::LoggedEvents => "logged_events",
            Self::Instances => "instances",
            Self::TokenAddressesToRedoAccounting => "token_addresses_to_redo_accounting",
            Self::ProvenanceContractsToAdd => "provenance_contracts_to_add",
            Self::BlocksPerDay => "blocks_per_day",
            Self::TokenAddresses => "token_addresses",
            Self::TokenAccounts => "token_accounts",
            Self::MemoTransactionHashes => "memo_transaction_hashes",
            Self::Helpers => "helpers",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ─── Document ────────────────────────────────────────────────────────────────

/// A stored document: stable id plus a JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self { id: id.into(), body }
    }

    /// Serialize a keyed record into a document, using its key as the id.
    pub fn from_record<T: Serialize + Keyed>(record: &T) -> Result<Self, IndexerError> {
        Ok(Self {
            id: record.key(),
            body: serde_json::to_value(record)?,
        })
    }

    /// Deserialize the body back into a typed record.
    pub fn into_record<T: DeserializeOwned>(self) -> Result<T, IndexerError> {
        Ok(serde_json::from_value(self.body)?)
    }

    /// Read an unsigned integer field of the body.
    pub fn u64_field(&self, field: &str) -> Option<u64> {
        self.body.get(field).and_then(Value::as_u64)
    }
}

impl Keyed for Document {
    fn key(&self) -> String {
        self.id.clone()
    }
}

// ─── Filter ──────────────────────────────────────────────────────────────────

/// Selection used by [`DocumentStore::find`].
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    /// Top-level field equals the given JSON value.
    FieldEquals { field: String, value: Value },
    /// Top-level unsigned field lies in `[from, to]`.
    HeightRange { field: String, from: u64, to: u64 },
}

impl Filter {
    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::FieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn height_range(field: impl Into<String>, from: u64, to: u64) -> Self {
        Self::HeightRange {
            field: field.into(),
            from,
            to,
        }
    }

    /// Evaluate the filter against a JSON body.
    pub fn matches(&self, body: &Value) -> bool {
        match self {
            Self::All => true,
            Self::FieldEquals { field, value } => body.get(field) == Some(value),
            Self::HeightRange { field, from, to } => body
                .get(field)
                .and_then(Value::as_u64)
                .is_some_and(|h| h >= *from && h <= *to),
        }
    }
}

/// Outcome of a bulk write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteSummary {
    pub inserted: u64,
    pub replaced: u64,
}

impl BulkWriteSummary {
    pub fn total(&self) -> u64 {
        self.inserted + self.replaced
    }
}

/// Document store used by every pipeline stage.
///
/// All writes are upserts keyed by id, so repeating a write is harmless.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Replace the document with the same id, inserting it if absent.
    async fn replace_one(&self, collection: Collection, doc: Document) -> Result<(), IndexerError>;

    /// Upsert many documents in one batch.
    async fn bulk_upsert(
        &self,
        collection: Collection,
        docs: Vec<Document>,
    ) -> Result<BulkWriteSummary, IndexerError>;

    async fn find_one(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Document>, IndexerError>;

    /// Return all documents matching `filter`, ordered by id.
    async fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>, IndexerError>;

    /// Delete a document; returns whether it existed.
    async fn delete_one(&self, collection: Collection, id: &str) -> Result<bool, IndexerError>;
}
