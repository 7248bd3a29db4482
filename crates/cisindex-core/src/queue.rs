//! Outbound batch queues, one per destination collection.
//!
//! Producers push; the Sink drains batches and hands failed batches back to
//! the head of the queue so nothing is lost and order is kept. All queues are
//! safe to push and drain from different tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::store::{Collection, Document};

/// Records that carry their own idempotency key.
pub trait Keyed {
    fn key(&self) -> String;
}

// ─── BatchQueue ──────────────────────────────────────────────────────────────

/// An ordered buffer of keyed records bound for one destination.
pub struct BatchQueue<T> {
    destination: Collection,
    items: Mutex<VecDeque<T>>,
}

impl<T: Keyed> BatchQueue<T> {
    pub fn new(destination: Collection) -> Self {
        Self {
            destination,
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn destination(&self) -> Collection {
        self.destination
    }

    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
    }

    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        self.items.lock().unwrap().extend(items);
    }

    /// Remove up to `max` items from the head.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut items = self.items.lock().unwrap();
        let n = max.min(items.len());
        items.drain(..n).collect()
    }

    /// Put an unacknowledged batch back at the head, preserving its order.
    pub fn requeue_front(&self, batch: Vec<T>) {
        let mut items = self.items.lock().unwrap();
        for item in batch.into_iter().rev() {
            items.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

/// Collapse a batch so each key appears once, keeping the latest write
/// at the position of its last occurrence.
pub fn dedup_latest<T: Keyed>(batch: Vec<T>) -> Vec<T> {
    let mut last_index: HashMap<String, usize> = HashMap::new();
    for (i, item) in batch.iter().enumerate() {
        last_index.insert(item.key(), i);
    }
    batch
        .into_iter()
        .enumerate()
        .filter(|(i, item)| last_index.get(&item.key()) == Some(i))
        .map(|(_, item)| item)
        .collect()
}

// ─── OutputQueues ────────────────────────────────────────────────────────────

/// The full set of destination queues shared by producers and the Sink.
pub struct OutputQueues {
    queues: HashMap<Collection, BatchQueue<Document>>,
    /// A queue reached `batch_size`; the Sink should drain early.
    batch_ready: Notify,
    /// The Sink drained something; blocked producers may continue.
    drained: Notify,
    batch_size: usize,
    max_pending: usize,
}

impl OutputQueues {
    pub fn new(batch_size: usize, max_pending: usize) -> Self {
        let queues = Collection::DATA
            .iter()
            .chain(std::iter::once(&Collection::Helpers))
            .map(|c| (*c, BatchQueue::new(*c)))
            .collect();
        Self {
            queues,
            batch_ready: Notify::new(),
            drained: Notify::new(),
            batch_size: batch_size.max(1),
            max_pending: max_pending.max(1),
        }
    }

    pub fn queue(&self, collection: Collection) -> &BatchQueue<Document> {
        // Every collection gets a queue in `new`
        &self.queues[&collection]
    }

    pub fn push(&self, collection: Collection, doc: Document) {
        let queue = self.queue(collection);
        queue.push(doc);
        if queue.len() >= self.batch_size {
            self.batch_ready.notify_one();
        }
    }

    pub fn extend(&self, collection: Collection, docs: impl IntoIterator<Item = Document>) {
        let queue = self.queue(collection);
        queue.extend(docs);
        if queue.len() >= self.batch_size {
            self.batch_ready.notify_one();
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Total number of records waiting across every queue.
    pub fn pending(&self) -> usize {
        self.queues.values().map(BatchQueue::len).sum()
    }

    /// Resolves when some queue has a full batch waiting.
    pub async fn batch_ready(&self) {
        self.batch_ready.notified().await
    }

    /// Signal producers waiting in [`wait_for_capacity`](Self::wait_for_capacity).
    pub fn notify_drained(&self) {
        self.drained.notify_waiters();
    }

    /// Suspend the caller while more than `max_pending` records are queued.
    pub async fn wait_for_capacity(&self) {
        while self.pending() > self.max_pending {
            self.batch_ready.notify_one();
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.pending() <= self.max_pending {
                break;
            }
            drained.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn doc(id: &str, v: u64) -> Document {
        Document::new(id, json!({ "v": v }))
    }

    #[test]
    fn drain_and_requeue_preserve_order() {
        let q = BatchQueue::new(Collection::Blocks);
        for i in 0..5 {
            q.push(doc(&format!("b{i}"), i));
        }
        let batch = q.drain(3);
        assert_eq!(batch.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), ["b0", "b1", "b2"]);
        assert_eq!(q.len(), 2);

        q.requeue_front(batch);
        let all = q.drain(10);
        assert_eq!(
            all.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(),
            ["b0", "b1", "b2", "b3", "b4"]
        );
        assert!(q.is_empty());
    }

    #[test]
    fn dedup_keeps_latest_write() {
        let batch = vec![doc("cp", 1), doc("other", 9), doc("cp", 2), doc("cp", 3)];
        let out = dedup_latest(batch);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, "other");
        assert_eq!(out[1].body["v"], 3);
    }

    #[test]
    fn output_queues_cover_every_collection() {
        let queues = OutputQueues::new(10, 100);
        queues.push(Collection::Helpers, doc("x", 1));
        queues.push(Collection::LoggedEvents, doc("y", 1));
        assert_eq!(queues.pending(), 2);
        assert_eq!(queues.queue(Collection::Helpers).len(), 1);
    }

    #[tokio::test]
    async fn capacity_wait_releases_after_drain() {
        let queues = Arc::new(OutputQueues::new(2, 3));
        for i in 0..5 {
            queues.push(Collection::Blocks, doc(&format!("b{i}"), i));
        }

        let waiter = {
            let queues = queues.clone();
            tokio::spawn(async move { queues.wait_for_capacity().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queues.queue(Collection::Blocks).drain(4);
        queues.notify_drained();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("producer should be released")
            .unwrap();
    }
}
