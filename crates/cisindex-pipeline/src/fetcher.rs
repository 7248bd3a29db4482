//! BlockFetcher: finds finalized heights not yet processed and hands them to
//! the BlockProcessor, oldest first.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cisindex_core::checkpoint::CheckpointManager;
use cisindex_core::error::IndexerError;
use cisindex_core::node::NodeClient;
use cisindex_core::types::Height;

use crate::cursor::StageCursor;

pub struct BlockFetcher {
    node: Arc<dyn NodeClient>,
    checkpoint: CheckpointManager,
    cursor: StageCursor,
    max_per_poll: u64,
}

impl BlockFetcher {
    pub fn new(
        node: Arc<dyn NodeClient>,
        checkpoint: CheckpointManager,
        start_height: Height,
        max_per_poll: u64,
    ) -> Self {
        Self {
            node,
            checkpoint,
            cursor: StageCursor::new(start_height),
            max_per_poll: max_per_poll.max(1),
        }
    }

    pub fn last_enqueued(&self) -> Option<Height> {
        self.cursor.last_enqueued
    }

    /// Heights to enqueue next, or `None` when caught up.
    ///
    /// Starts after both the persisted checkpoint and anything this run
    /// already enqueued, so in-flight heights are never handed out twice.
    pub async fn next_range(&self) -> Result<Option<RangeInclusive<Height>>, IndexerError> {
        let finalized = self.node.get_finalized_height().await?;
        let persisted = self.checkpoint.load().await?;
        Ok(self.cursor.next_range(persisted, finalized, self.max_per_poll))
    }

    /// One poll: enqueue the next range. Returns the number of heights sent.
    pub async fn poll(&mut self, work: &mpsc::Sender<Height>) -> Result<u64, IndexerError> {
        let Some(range) = self.next_range().await? else {
            return Ok(0);
        };
        let (from, to) = (*range.start(), *range.end());
        for height in range {
            // Awaits when the processor is behind
            work.send(height).await.map_err(|_| IndexerError::Shutdown)?;
            self.cursor.advance(height);
        }
        tracing::debug!(from, to, "heights enqueued");
        Ok(to - from + 1)
    }

    /// Poll every `interval` until cancelled.
    pub async fn run(
        mut self,
        work: mpsc::Sender<Height>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        tracing::info!(start_height = self.cursor.start_height, "block fetcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.poll(&work) => match result {
                    Ok(_) => {}
                    Err(IndexerError::Shutdown) => break,
                    Err(e) => tracing::warn!(error = %e, "finalized height poll failed"),
                },
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!(last_enqueued = ?self.cursor.last_enqueued, "block fetcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cisindex_core::checkpoint::{MemoryDocumentStore, Stage};
    use cisindex_core::node::MemoryNode;
    use cisindex_core::store::DocumentStore;

    fn setup(finalized: Height) -> (Arc<MemoryNode>, CheckpointManager) {
        let node = Arc::new(MemoryNode::new());
        node.set_finalized(finalized);
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryDocumentStore::new());
        (node, CheckpointManager::new(store, Stage::Heartbeat))
    }

    #[tokio::test]
    async fn enqueues_gap_after_checkpoint_oldest_first() {
        let (node, checkpoint) = setup(15);
        checkpoint.force_save(10).await.unwrap();
        let mut fetcher = BlockFetcher::new(node, checkpoint, 0, 100);

        let (tx, mut rx) = mpsc::channel(100);
        assert_eq!(fetcher.poll(&tx).await.unwrap(), 5);
        let mut got = vec![];
        while let Ok(h) = rx.try_recv() {
            got.push(h);
        }
        assert_eq!(got, [11, 12, 13, 14, 15]);
    }

    #[tokio::test]
    async fn in_flight_heights_are_not_reenqueued() {
        let (node, checkpoint) = setup(5);
        let mut fetcher = BlockFetcher::new(node.clone(), checkpoint, 0, 100);
        let (tx, mut rx) = mpsc::channel(100);

        assert_eq!(fetcher.poll(&tx).await.unwrap(), 6);
        // Checkpoint not persisted yet; a second poll must not repeat 0..=5
        assert_eq!(fetcher.poll(&tx).await.unwrap(), 0);

        node.set_finalized(7);
        assert_eq!(fetcher.poll(&tx).await.unwrap(), 2);
        let mut got = vec![];
        while let Ok(h) = rx.try_recv() {
            got.push(h);
        }
        assert_eq!(got, [0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn range_is_capped_and_respects_start_height() {
        let (node, checkpoint) = setup(1_000);
        let fetcher = BlockFetcher::new(node, checkpoint, 900, 10);
        assert_eq!(fetcher.next_range().await.unwrap(), Some(900..=909));
    }

    #[tokio::test]
    async fn caught_up_yields_nothing() {
        let (node, checkpoint) = setup(20);
        checkpoint.force_save(20).await.unwrap();
        let fetcher = BlockFetcher::new(node, checkpoint, 0, 10);
        assert_eq!(fetcher.next_range().await.unwrap(), None);
    }
}
