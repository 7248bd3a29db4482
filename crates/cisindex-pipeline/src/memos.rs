//! Memo pipeline: decodes the memo of every persisted transfer into
//! `memo_transaction_hashes`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cisindex_cis::MemoDecoder;
use cisindex_core::checkpoint::{CheckpointManager, Stage};
use cisindex_core::error::IndexerError;
use cisindex_core::queue::OutputQueues;
use cisindex_core::store::{Collection, Document, DocumentStore, Filter};
use cisindex_core::types::Height;

use crate::cursor::StageCursor;
use crate::records::{MemoRecord, TransactionRecord};

pub struct MemoPipeline {
    store: Arc<dyn DocumentStore>,
    queues: Arc<OutputQueues>,
    checkpoint: CheckpointManager,
    cursor: StageCursor,
    batch_blocks: u64,
    decoder: MemoDecoder,
}

impl MemoPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        queues: Arc<OutputQueues>,
        start_height: Height,
        batch_blocks: u64,
    ) -> Self {
        Self {
            checkpoint: CheckpointManager::new(store.clone(), Stage::Memos),
            store,
            queues,
            cursor: StageCursor::new(start_height),
            batch_blocks: batch_blocks.max(1),
            decoder: MemoDecoder::default(),
        }
    }

    pub fn with_decoder(mut self, decoder: MemoDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    /// Decode memos of the next range behind the heartbeat checkpoint.
    /// Returns the number of memos queued, or `None` when caught up.
    pub async fn run_cycle(&mut self) -> Result<Option<usize>, IndexerError> {
        let persisted = self.checkpoint.load().await?;
        let Some(head) = CheckpointManager::load_stage(self.store.as_ref(), Stage::Heartbeat).await? else {
            return Ok(None);
        };
        let Some(range) = self.cursor.next_range(persisted, head, self.batch_blocks) else {
            return Ok(None);
        };
        let (from, to) = (*range.start(), *range.end());

        let transactions = self
            .store
            .find(Collection::Transactions, &Filter::height_range("block_height", from, to))
            .await?;
        let mut memos = Vec::new();
        let mut failures = 0usize;
        for doc in transactions {
            let record: TransactionRecord = doc.into_record()?;
            let Some(memo) = record.transaction.memo() else {
                continue;
            };
            let decoded = self.decoder.decode(memo);
            failures += usize::from(decoded.is_failure);
            memos.push(Document::from_record(&MemoRecord {
                id: record.id,
                memo: decoded.text,
                decode_failure: decoded.is_failure,
                block_height: record.block_height,
            })?);
        }

        let count = memos.len();
        self.queues.wait_for_capacity().await;
        self.queues.extend(Collection::MemoTransactionHashes, memos);
        self.queues.push(Collection::Helpers, self.checkpoint.document(to));
        self.cursor.advance(to);

        if count > 0 {
            tracing::debug!(from, to, memos = count, failures, "memos decoded");
        }
        Ok(Some(count))
    }

    pub async fn run(mut self, interval: Duration, shutdown: CancellationToken) {
        tracing::info!(start_height = self.cursor.start_height, "memo pipeline started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = async {
                    while self.run_cycle().await?.is_some() {}
                    Ok::<_, IndexerError>(())
                } => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "memo cycle failed");
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!(last_enqueued = ?self.cursor.last_enqueued, "memo pipeline stopped");
    }
}
