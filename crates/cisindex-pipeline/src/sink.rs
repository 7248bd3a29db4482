//! Sink: the only writer of record to the document store.
//!
//! A drain cycle first takes a snapshot of the `helpers` queue (checkpoints
//! and requests), then writes every data queue in batches, and writes the
//! snapshot last and only if every data batch succeeded. Stages enqueue a
//! checkpoint after its data, so a persisted checkpoint always implies its
//! data is persisted.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cisindex_core::queue::{dedup_latest, OutputQueues};
use cisindex_core::store::{Collection, DocumentStore};

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Data documents written (after collapsing duplicate ids).
    pub written: u64,
    pub failed_batches: usize,
    /// `helpers` documents written.
    pub helpers_written: usize,
    /// `helpers` documents held back for the next cycle.
    pub helpers_deferred: usize,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed_batches == 0 && self.helpers_deferred == 0
    }
}

pub struct Sink {
    store: Arc<dyn DocumentStore>,
    queues: Arc<OutputQueues>,
}

impl Sink {
    pub fn new(store: Arc<dyn DocumentStore>, queues: Arc<OutputQueues>) -> Self {
        Self { store, queues }
    }

    /// Run one drain cycle. Failed batches go back to the head of their queue.
    pub async fn drain_once(&self) -> DrainReport {
        let mut report = DrainReport::default();

        // Snapshot before measuring the data queues: data for every
        // checkpoint in the snapshot is then within the measured lengths.
        let helpers_queue = self.queues.queue(Collection::Helpers);
        let helpers = helpers_queue.drain(helpers_queue.len());
        let mut data_ok = true;

        for collection in Collection::DATA {
            let queue = self.queues.queue(collection);
            let mut remaining = queue.len();
            while remaining > 0 {
                let batch = queue.drain(remaining.min(self.queues.batch_size()));
                if batch.is_empty() {
                    break;
                }
                remaining -= batch.len();
                let docs = dedup_latest(batch.clone());
                let count = docs.len();
                match self.store.bulk_upsert(collection, docs).await {
                    Ok(summary) => {
                        report.written += count as u64;
                        tracing::debug!(
                            %collection,
                            inserted = summary.inserted,
                            replaced = summary.replaced,
                            "batch written"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(%collection, size = batch.len(), error = %e, "batch write failed; requeued");
                        queue.requeue_front(batch);
                        report.failed_batches += 1;
                        data_ok = false;
                        break;
                    }
                }
            }
        }

        if data_ok {
            let mut pending = dedup_latest(helpers).into_iter();
            while let Some(doc) = pending.next() {
                let id = doc.id.clone();
                if let Err(e) = self.store.replace_one(Collection::Helpers, doc.clone()).await {
                    tracing::warn!(id = %id, error = %e, "helpers write failed; requeued");
                    let mut unwritten = vec![doc];
                    unwritten.extend(pending);
                    report.helpers_deferred = unwritten.len();
                    helpers_queue.requeue_front(unwritten);
                    break;
                }
                report.helpers_written += 1;
            }
        } else {
            report.helpers_deferred = helpers.len();
            helpers_queue.requeue_front(helpers);
        }

        self.queues.notify_drained();
        if report.written > 0 || report.helpers_written > 0 || !report.is_clean() {
            tracing::info!(
                written = report.written,
                helpers = report.helpers_written,
                failed_batches = report.failed_batches,
                deferred = report.helpers_deferred,
                "sink drain complete"
            );
        }
        report
    }

    /// Drain on every tick or full batch; flush once more when cancelled.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        tracing::info!(interval_ms = interval.as_millis() as u64, "sink started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = self.queues.batch_ready() => {}
            }
            self.drain_once().await;
        }

        let report = self.drain_once().await;
        if self.queues.pending() > 0 {
            tracing::warn!(
                pending = self.queues.pending(),
                failed_batches = report.failed_batches,
                "final flush incomplete; pending documents dropped"
            );
        } else {
            tracing::info!(written = report.written, "sink flushed");
        }
    }
}
