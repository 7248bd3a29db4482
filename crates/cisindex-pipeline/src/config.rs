//! Heartbeat configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use cisindex_cis::Net;
use cisindex_core::error::IndexerError;
use cisindex_core::types::Height;

use crate::retry::RetryConfig;

/// Which auxiliary pipelines run next to block ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageToggles {
    pub token_accounting: bool,
    /// Runs on the token accounting task; ignored when that is disabled.
    pub redo_accounting: bool,
    pub special_purpose: bool,
    pub memos: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            token_accounting: true,
            redo_accounting: true,
            special_purpose: true,
            memos: true,
        }
    }
}

/// Configuration for a [`Heartbeat`](crate::Heartbeat).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Network, selecting the provenance allow-list.
    pub net: Net,
    /// First height to ingest when no checkpoint exists.
    pub start_height: Height,
    /// Finalized-height poll interval (milliseconds).
    pub poll_interval_ms: u64,
    /// Most heights the fetcher enqueues per poll.
    pub max_blocks_per_poll: u64,
    /// Sink drain interval (milliseconds).
    pub drain_interval_ms: u64,
    /// Documents per store write; a queue this long wakes the Sink early.
    pub batch_size: usize,
    /// Producers pause while more documents than this are queued.
    pub max_pending: usize,
    /// Interval of the auxiliary pipelines (milliseconds).
    pub aux_interval_ms: u64,
    /// Heights token accounting covers per cycle.
    pub accounting_batch_blocks: u64,
    /// Heights the memo pipeline covers per cycle.
    pub memo_batch_blocks: u64,
    /// Retries of a block or cycle as a whole.
    pub retry: RetryConfig,
    /// Retries inside the node client for a single request.
    pub node_retry: RetryConfig,
    pub stages: StageToggles,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            net: Net::Mainnet,
            start_height: 0,
            poll_interval_ms: 1_000,
            max_blocks_per_poll: 100,
            drain_interval_ms: 1_000,
            batch_size: 500,
            max_pending: 20_000,
            aux_interval_ms: 5_000,
            accounting_batch_blocks: 1_000,
            memo_batch_blocks: 1_000,
            retry: RetryConfig::default(),
            node_retry: RetryConfig::node_requests(),
            stages: StageToggles::default(),
        }
    }
}

impl HeartbeatConfig {
    /// Parse a JSON config file body. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, IndexerError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| IndexerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.batch_size == 0 {
            return Err(IndexerError::Config("batch_size must be positive".into()));
        }
        if self.max_pending < self.batch_size {
            return Err(IndexerError::Config(
                "max_pending must be at least batch_size".into(),
            ));
        }
        if self.max_blocks_per_poll == 0
            || self.accounting_batch_blocks == 0
            || self.memo_batch_blocks == 0
        {
            return Err(IndexerError::Config("block batch sizes must be positive".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn aux_interval(&self) -> Duration {
        Duration::from_millis(self.aux_interval_ms)
    }
}
