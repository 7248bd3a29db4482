//! Node RPC boundary.
//!
//! The wire format is the client's concern; the pipeline only needs these
//! four calls. [`MemoryNode`] serves tests and local replays.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::{BlockInfo, ContractAddress, Height, Transaction};

/// Token standards a contract may declare support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StandardIdentifier {
    #[serde(rename = "CIS-0")]
    Cis0,
    #[serde(rename = "CIS-1")]
    Cis1,
    #[serde(rename = "CIS-2")]
    Cis2,
}

impl StandardIdentifier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cis0 => "CIS-0",
            Self::Cis1 => "CIS-1",
            Self::Cis2 => "CIS-2",
        }
    }
}

impl fmt::Display for StandardIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of a blockchain node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Height of the last finalized block.
    async fn get_finalized_height(&self) -> Result<Height, IndexerError>;

    async fn get_block_info(&self, height: Height) -> Result<BlockInfo, IndexerError>;

    async fn get_block_transactions(&self, height: Height) -> Result<Vec<Transaction>, IndexerError>;

    /// Ask the contract's `supports` entrypoint whether it implements any of
    /// `standards`.
    async fn probe_standard_support(
        &self,
        address: ContractAddress,
        entrypoint: &str,
        standards: &[StandardIdentifier],
    ) -> Result<bool, IndexerError>;
}

// ─── In-memory node (for testing) ─────────────────────────────────────────────

/// Scripted node: blocks, standard support and failure injection.
#[derive(Default)]
pub struct MemoryNode {
    blocks: Mutex<BTreeMap<Height, (BlockInfo, Vec<Transaction>)>>,
    /// contract index → support answer
    support: Mutex<HashMap<u64, bool>>,
    finalized: AtomicU64,
    probe_calls: AtomicUsize,
    /// Number of upcoming block fetches that fail with a node error.
    failing_fetches: AtomicUsize,
}

impl MemoryNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a block and raise the finalized height to include it.
    pub fn add_block(&self, info: BlockInfo, transactions: Vec<Transaction>) {
        let height = info.height;
        self.blocks.lock().unwrap().insert(height, (info, transactions));
        self.finalized.fetch_max(height, Ordering::SeqCst);
    }

    pub fn set_finalized(&self, height: Height) {
        self.finalized.store(height, Ordering::SeqCst);
    }

    /// Script the answer the `supports` probe gives for a contract index.
    pub fn set_support(&self, contract_index: u64, supported: bool) {
        self.support.lock().unwrap().insert(contract_index, supported);
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    /// Make the next `n` block fetches fail.
    pub fn fail_next_fetches(&self, n: usize) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl NodeClient for MemoryNode {
    async fn get_finalized_height(&self) -> Result<Height, IndexerError> {
        Ok(self.finalized.load(Ordering::SeqCst))
    }

    async fn get_block_info(&self, height: Height) -> Result<BlockInfo, IndexerError> {
        if self.take_failure() {
            return Err(IndexerError::Node(format!("injected failure at {height}")));
        }
        self.blocks
            .lock()
            .unwrap()
            .get(&height)
            .map(|(info, _)| info.clone())
            .ok_or(IndexerError::BlockNotFound { height })
    }

    async fn get_block_transactions(&self, height: Height) -> Result<Vec<Transaction>, IndexerError> {
        self.blocks
            .lock()
            .unwrap()
            .get(&height)
            .map(|(_, txs)| txs.clone())
            .ok_or(IndexerError::BlockNotFound { height })
    }

    async fn probe_standard_support(
        &self,
        address: ContractAddress,
        _entrypoint: &str,
        _standards: &[StandardIdentifier],
    ) -> Result<bool, IndexerError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.support
            .lock()
            .unwrap()
            .get(&address.index)
            .copied()
            .ok_or_else(|| IndexerError::Node(format!("no such contract {address}")))
    }
}
