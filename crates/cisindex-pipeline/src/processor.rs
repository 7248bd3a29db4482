//! BlockProcessor: turns one finalized height into queued documents.
//!
//! Per height: fetch block and transactions, run the [`EventDecoder`] over
//! every transaction, route the results into the output queues and, last,
//! enqueue the heartbeat checkpoint for that height. A failing height is
//! retried in place; it is never skipped.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cisindex_cis::{CapabilityCache, EventDecoder, InstanceDocument};
use cisindex_core::checkpoint::{CheckpointManager, Stage};
use cisindex_core::error::IndexerError;
use cisindex_core::node::NodeClient;
use cisindex_core::notify::{Alert, Notifier};
use cisindex_core::queue::{Keyed, OutputQueues};
use cisindex_core::store::{Collection, Document, DocumentStore};
use cisindex_core::types::{AccountTransactionEffects, BlockInfo, Height};

use crate::records::{BlockRecord, BlocksPerDay, ProvenanceContract, RedoRequest, TransactionRecord};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    /// Main ingestion: aggregates per day and advances the heartbeat checkpoint.
    Heartbeat,
    /// Re-scan of requested heights: every examined token is queued for
    /// re-accounting; no checkpoint, no per-day aggregation.
    SpecialPurpose,
}

impl ProcessingMode {
    fn stage_name(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::SpecialPurpose => "special_purpose",
        }
    }
}

/// Documents produced for one height, grouped by destination.
#[derive(Debug, Default)]
pub struct BlockOutput {
    pub docs: BTreeMap<Collection, Vec<Document>>,
}

impl BlockOutput {
    pub fn push<T: Serialize + Keyed>(
        &mut self,
        collection: Collection,
        record: &T,
    ) -> Result<(), IndexerError> {
        let doc = Document::from_record(record)?;
        self.docs.entry(collection).or_default().push(doc);
        Ok(())
    }

    pub fn documents(&self, collection: Collection) -> &[Document] {
        self.docs.get(&collection).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.docs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Blocks per day ──────────────────────────────────────────────────────────

/// First and last block of every day seen this run.
pub struct DayAggregator {
    store: Arc<dyn DocumentStore>,
    days: HashMap<String, BlocksPerDay>,
}

impl DayAggregator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            days: HashMap::new(),
        }
    }

    /// Fold `block` into its day. A day is seeded from the store the first
    /// time this run sees it.
    pub async fn observe(&mut self, block: &BlockInfo) -> Result<BlocksPerDay, IndexerError> {
        let day = block.slot_time.format("%Y-%m-%d").to_string();
        if !self.days.contains_key(&day) {
            let stored = self
                .store
                .find_one(Collection::BlocksPerDay, &day)
                .await?
                .map(Document::into_record::<BlocksPerDay>)
                .transpose()?;
            let seed = stored.unwrap_or_else(|| BlocksPerDay {
                id: day.clone(),
                height_for_first_block: block.height,
                height_for_last_block: block.height,
                slot_time_for_first_block: block.slot_time,
                slot_time_for_last_block: block.slot_time,
            });
            self.days.insert(day.clone(), seed);
        }

        let entry = self
            .days
            .get_mut(&day)
            .ok_or_else(|| IndexerError::Other(format!("day {day} vanished")))?;
        if block.height < entry.height_for_first_block {
            entry.height_for_first_block = block.height;
            entry.slot_time_for_first_block = block.slot_time;
        }
        if block.height > entry.height_for_last_block {
            entry.height_for_last_block = block.height;
            entry.slot_time_for_last_block = block.slot_time;
        }
        Ok(entry.clone())
    }
}

// ─── BlockProcessor ──────────────────────────────────────────────────────────

pub struct BlockProcessor {
    node: Arc<dyn NodeClient>,
    decoder: EventDecoder,
    queues: Arc<OutputQueues>,
    checkpoint: CheckpointManager,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    mode: ProcessingMode,
    /// Capability memo for the lifetime of this processor.
    cache: CapabilityCache,
    days: DayAggregator,
}

impl BlockProcessor {
    pub fn new(
        node: Arc<dyn NodeClient>,
        store: Arc<dyn DocumentStore>,
        decoder: EventDecoder,
        queues: Arc<OutputQueues>,
        notifier: Arc<dyn Notifier>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            node,
            decoder,
            queues,
            checkpoint: CheckpointManager::new(store.clone(), Stage::Heartbeat),
            notifier,
            retry,
            mode: ProcessingMode::Heartbeat,
            cache: CapabilityCache::new(),
            days: DayAggregator::new(store),
        }
    }

    pub fn with_mode(mut self, mode: ProcessingMode) -> Self {
        self.mode = mode;
        self
    }

    /// Fetch and decode one height without touching the queues.
    pub async fn process(&mut self, height: Height) -> Result<BlockOutput, IndexerError> {
        let block = self.node.get_block_info(height).await?;
        let transactions = self.node.get_block_transactions(height).await?;
        if transactions.len() != block.transaction_count as usize {
            return Err(IndexerError::Decode(format!(
                "block {height} reports {} transactions, node returned {}",
                block.transaction_count,
                transactions.len()
            )));
        }

        let special_purpose = self.mode == ProcessingMode::SpecialPurpose;
        let mut output = BlockOutput::default();
        output.push(Collection::Blocks, &BlockRecord::from(&block))?;

        let mut logged_events = 0usize;
        for tx in &transactions {
            output.push(Collection::Transactions, &TransactionRecord::new(&block, tx))?;

            if let Some(account_tx) = tx.account_transaction() {
                if let AccountTransactionEffects::ContractInitialized(init) = &account_tx.effects {
                    output.push(Collection::Instances, &InstanceDocument::from_initialized(init))?;
                }
            }

            let decoded = self
                .decoder
                .decode(tx, &block, &mut self.cache, special_purpose)
                .await;
            logged_events += decoded.logged_events.len();
            for event in &decoded.logged_events {
                output.push(Collection::LoggedEvents, event)?;
            }
            for token_address in &decoded.token_addresses_to_redo_accounting {
                output.push(
                    Collection::TokenAddressesToRedoAccounting,
                    &RedoRequest::pending(token_address),
                )?;
            }
            for contract in decoded.provenance_contracts_to_add {
                let record = ProvenanceContract {
                    id: contract.to_string(),
                    contract,
                    block_height: height,
                };
                output.push(Collection::ProvenanceContractsToAdd, &record)?;
            }
        }

        if self.mode == ProcessingMode::Heartbeat {
            let day = self.days.observe(&block).await?;
            output.push(Collection::BlocksPerDay, &day)?;
        }

        tracing::debug!(
            height,
            transactions = transactions.len(),
            logged_events,
            mode = self.mode.stage_name(),
            "block processed"
        );
        Ok(output)
    }

    /// Queue the output, then the checkpoint behind it.
    pub fn commit(&self, height: Height, output: BlockOutput) {
        for (collection, docs) in output.docs {
            self.queues.extend(collection, docs);
        }
        if self.mode == ProcessingMode::Heartbeat {
            self.queues.push(Collection::Helpers, self.checkpoint.document(height));
        }
    }

    /// Process and commit one height, retrying until it succeeds.
    ///
    /// Once retries are exhausted the failure is recorded and reported once,
    /// and retrying continues at the maximum backoff. Only cancellation
    /// ends the loop early, with [`IndexerError::Shutdown`].
    pub async fn handle(&mut self, height: Height, shutdown: &CancellationToken) -> Result<(), IndexerError> {
        let mut attempt = 0u32;
        let mut reported = false;
        loop {
            match self.process(height).await {
                Ok(output) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(IndexerError::Shutdown),
                        _ = self.queues.wait_for_capacity() => {}
                    }
                    self.commit(height, output);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    let delay = match self.retry.next_delay(attempt) {
                        Some(delay) => {
                            tracing::warn!(
                                height,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "block processing failed; retrying"
                            );
                            delay
                        }
                        None => {
                            if !reported {
                                reported = true;
                                tracing::error!(height, attempt, error = %e, "block keeps failing");
                                self.checkpoint.record_failure(height, &e).await;
                                self.notifier
                                    .notify(Alert::fatal(
                                        self.mode.stage_name(),
                                        Some(height),
                                        format!("block {height} failed {attempt} times: {e}"),
                                    ))
                                    .await;
                            }
                            self.retry.max_delay()
                        }
                    };
                    tokio::select! {
                        _ = shutdown.cancelled() => return Err(IndexerError::Shutdown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Drain the work queue until it closes or shutdown is requested.
    pub async fn run(mut self, mut work: mpsc::Receiver<Height>, shutdown: CancellationToken) {
        tracing::info!(mode = self.mode.stage_name(), "block processor started");
        loop {
            let height = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = work.recv() => match next {
                    Some(height) => height,
                    None => break,
                },
            };
            match self.handle(height, &shutdown).await {
                Ok(()) => {}
                Err(IndexerError::Shutdown) => break,
                Err(e) => tracing::error!(height, error = %e, "unexpected processor error"),
            }
        }
        tracing::info!(
            cached_contracts = self.cache.len(),
            cache_hits = self.cache.hits(),
            "block processor stopped"
        );
    }
}
