//! Special-purpose re-scan of operator-requested heights.
//!
//! Heights listed in the `special_purpose_blocks` helpers document are run
//! through a dedicated [`BlockProcessor`] in [`ProcessingMode::SpecialPurpose`],
//! which queues every examined token for re-accounting. The request document
//! is rewritten without the heights that succeeded.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cisindex_core::error::IndexerError;
use cisindex_core::queue::OutputQueues;
use cisindex_core::store::{Collection, Document, DocumentStore};
use cisindex_core::types::Height;

use crate::processor::{BlockProcessor, ProcessingMode};
use crate::records::SpecialPurposeRequest;

pub struct SpecialPurposeRescan {
    store: Arc<dyn DocumentStore>,
    queues: Arc<OutputQueues>,
    processor: BlockProcessor,
    /// Heights committed whose removal from the request may not be persisted yet.
    done: BTreeSet<Height>,
}

impl SpecialPurposeRescan {
    pub fn new(store: Arc<dyn DocumentStore>, queues: Arc<OutputQueues>, processor: BlockProcessor) -> Self {
        Self {
            store,
            queues,
            processor: processor.with_mode(ProcessingMode::SpecialPurpose),
            done: BTreeSet::new(),
        }
    }

    /// Re-process every requested height once. Failed heights stay in the
    /// request for the next cycle. Returns the number processed.
    pub async fn run_cycle(&mut self) -> Result<usize, IndexerError> {
        let Some(doc) = self
            .store
            .find_one(Collection::Helpers, SpecialPurposeRequest::ID)
            .await?
        else {
            self.done.clear();
            return Ok(0);
        };
        let request: SpecialPurposeRequest = doc.into_record()?;
        let requested: BTreeSet<Height> = request.heights.into_iter().collect();
        // Forget heights whose removal has been persisted
        self.done.retain(|h| requested.contains(h));

        let pending: Vec<Height> = requested.difference(&self.done).copied().collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let mut processed = 0;
        for height in pending {
            match self.processor.process(height).await {
                Ok(output) => {
                    self.queues.wait_for_capacity().await;
                    self.processor.commit(height, output);
                    self.done.insert(height);
                    processed += 1;
                }
                Err(e) => {
                    tracing::warn!(height, error = %e, "special-purpose height failed; kept for next cycle");
                }
            }
        }

        let remaining: Vec<Height> = requested.difference(&self.done).copied().collect();
        self.queues.push(
            Collection::Helpers,
            Document::from_record(&SpecialPurposeRequest::new(remaining.clone()))?,
        );
        tracing::info!(processed, remaining = remaining.len(), "special-purpose heights re-scanned");
        Ok(processed)
    }

    pub async fn run(mut self, interval: Duration, shutdown: CancellationToken) {
        tracing::info!("special-purpose re-scan started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.run_cycle() => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "special-purpose cycle failed");
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!(done = self.done.len(), "special-purpose re-scan stopped");
    }
}
