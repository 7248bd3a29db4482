//! Fluent builder API for creating a [`Heartbeat`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cisindex_cis::Net;
//! use cisindex_core::checkpoint::MemoryDocumentStore;
//! use cisindex_core::node::MemoryNode;
//! use cisindex_pipeline::HeartbeatBuilder;
//!
//! let heartbeat = HeartbeatBuilder::new()
//!     .net(Net::Testnet)
//!     .start_height(1_000)
//!     .batch_size(250)
//!     .node(Arc::new(MemoryNode::new()))
//!     .store(Arc::new(MemoryDocumentStore::new()))
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

use cisindex_cis::Net;
use cisindex_core::error::IndexerError;
use cisindex_core::node::NodeClient;
use cisindex_core::notify::{LogNotifier, Notifier};
use cisindex_core::store::DocumentStore;
use cisindex_core::types::Height;

use crate::config::{HeartbeatConfig, StageToggles};
use crate::heartbeat::Heartbeat;
use crate::retry::RetryConfig;

/// Fluent builder for [`Heartbeat`].
#[derive(Default)]
pub struct HeartbeatBuilder {
    config: HeartbeatConfig,
    node: Option<Arc<dyn NodeClient>>,
    store: Option<Arc<dyn DocumentStore>>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl HeartbeatBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration (e.g. one loaded from a file).
    pub fn config(mut self, config: HeartbeatConfig) -> Self {
        self.config = config;
        self
    }

    pub fn net(mut self, net: Net) -> Self {
        self.config.net = net;
        self
    }

    /// First height to ingest when no checkpoint exists.
    pub fn start_height(mut self, height: Height) -> Self {
        self.config.start_height = height;
        self
    }

    /// Finalized-height poll interval in milliseconds.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn max_blocks_per_poll(mut self, n: u64) -> Self {
        self.config.max_blocks_per_poll = n;
        self
    }

    pub fn drain_interval_ms(mut self, ms: u64) -> Self {
        self.config.drain_interval_ms = ms;
        self
    }

    /// Documents per store write.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Pending documents above which producers pause.
    pub fn max_pending(mut self, n: usize) -> Self {
        self.config.max_pending = n;
        self
    }

    pub fn aux_interval_ms(mut self, ms: u64) -> Self {
        self.config.aux_interval_ms = ms;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn stages(mut self, stages: StageToggles) -> Self {
        self.config.stages = stages;
        self
    }

    pub fn node(mut self, node: Arc<dyn NodeClient>) -> Self {
        self.node = Some(node);
        self
    }

    pub fn store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Alert sink; defaults to [`LogNotifier`].
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// The configuration as set so far.
    pub fn build_config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Validate and assemble the [`Heartbeat`].
    pub fn build(self) -> Result<Heartbeat, IndexerError> {
        self.config.validate()?;
        let node = self
            .node
            .ok_or_else(|| IndexerError::Config("a node client is required".into()))?;
        let store = self
            .store
            .ok_or_else(|| IndexerError::Config("a document store is required".into()))?;
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
        Ok(Heartbeat::new(self.config, node, store, notifier))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cisindex_core::node::MemoryNode;
    use cisindex_storage::InMemoryStore;

    #[test]
    fn builder_defaults() {
        let builder = HeartbeatBuilder::new();
        let cfg = builder.build_config();
        assert_eq!(cfg.net, Net::Mainnet);
        assert_eq!(cfg.batch_size, 500);
        assert!(cfg.stages.token_accounting);
    }

    #[test]
    fn builder_custom() {
        let heartbeat = HeartbeatBuilder::new()
            .net(Net::Testnet)
            .start_height(5_000)
            .batch_size(50)
            .max_pending(1_000)
            .stages(StageToggles {
                memos: false,
                ..Default::default()
            })
            .node(Arc::new(MemoryNode::new()))
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .unwrap();

        let cfg = heartbeat.config();
        assert_eq!(cfg.net, Net::Testnet);
        assert_eq!(cfg.start_height, 5_000);
        assert_eq!(cfg.batch_size, 50);
        assert!(!cfg.stages.memos);
    }

    #[test]
    fn missing_parts_are_config_errors() {
        let err = HeartbeatBuilder::new()
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, IndexerError::Config(_)));

        let err = HeartbeatBuilder::new()
            .node(Arc::new(MemoryNode::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, IndexerError::Config(_)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = HeartbeatBuilder::new()
            .batch_size(0)
            .node(Arc::new(MemoryNode::new()))
            .store(Arc::new(InMemoryStore::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, IndexerError::Config(_)));
    }
}
