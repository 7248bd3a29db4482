//! Heartbeat: wires every stage onto one runtime and owns shutdown.
//!
//! Producers (fetcher, processor, auxiliary pipelines) stop on the caller's
//! token. The Sink runs on its own token and is cancelled only after every
//! producer has returned, so its final flush sees everything they queued.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cisindex_cis::{ContractCapabilityResolver, EventDecoder};
use cisindex_core::checkpoint::{CheckpointManager, Stage};
use cisindex_core::error::IndexerError;
use cisindex_core::node::NodeClient;
use cisindex_core::notify::Notifier;
use cisindex_core::queue::OutputQueues;
use cisindex_core::store::DocumentStore;

use crate::accounting::TokenAccounting;
use crate::config::HeartbeatConfig;
use crate::fetcher::BlockFetcher;
use crate::memos::MemoPipeline;
use crate::processor::BlockProcessor;
use crate::retry::RetryPolicy;
use crate::sink::Sink;
use crate::special::SpecialPurposeRescan;

/// A configured indexer, ready to run. Build one with
/// [`HeartbeatBuilder`](crate::HeartbeatBuilder).
pub struct Heartbeat {
    config: HeartbeatConfig,
    node: Arc<dyn NodeClient>,
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
}

impl Heartbeat {
    pub(crate) fn new(
        config: HeartbeatConfig,
        node: Arc<dyn NodeClient>,
        store: Arc<dyn DocumentStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            node,
            store,
            notifier,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    fn processor(&self, queues: &Arc<OutputQueues>) -> BlockProcessor {
        let resolver = ContractCapabilityResolver::new(self.node.clone(), self.store.clone());
        BlockProcessor::new(
            self.node.clone(),
            self.store.clone(),
            EventDecoder::new(resolver, self.config.net),
            queues.clone(),
            self.notifier.clone(),
            RetryPolicy::new(self.config.retry.clone()),
        )
    }

    /// Run until `shutdown` is cancelled, then flush and return.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), IndexerError> {
        let cfg = &self.config;
        let queues = Arc::new(OutputQueues::new(cfg.batch_size, cfg.max_pending));
        tracing::info!(
            net = %cfg.net,
            start_height = cfg.start_height,
            batch_size = cfg.batch_size,
            max_pending = cfg.max_pending,
            "heartbeat starting"
        );

        let mut producers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let (work_tx, work_rx) = mpsc::channel(cfg.max_blocks_per_poll as usize);
        let fetcher = BlockFetcher::new(
            self.node.clone(),
            CheckpointManager::new(self.store.clone(), Stage::Heartbeat),
            cfg.start_height,
            cfg.max_blocks_per_poll,
        );
        producers.push((
            "fetcher",
            tokio::spawn(fetcher.run(work_tx, cfg.poll_interval(), shutdown.clone())),
        ));
        producers.push((
            "processor",
            tokio::spawn(self.processor(&queues).run(work_rx, shutdown.clone())),
        ));

        if cfg.stages.token_accounting {
            let accounting = TokenAccounting::new(
                self.store.clone(),
                queues.clone(),
                cfg.start_height,
                cfg.accounting_batch_blocks,
            )
            .with_redo(cfg.stages.redo_accounting);
            producers.push((
                "token_accounting",
                tokio::spawn(accounting.run(cfg.aux_interval(), shutdown.clone())),
            ));
        }
        if cfg.stages.special_purpose {
            let rescan = SpecialPurposeRescan::new(self.store.clone(), queues.clone(), self.processor(&queues));
            producers.push((
                "special_purpose",
                tokio::spawn(rescan.run(cfg.aux_interval(), shutdown.clone())),
            ));
        }
        if cfg.stages.memos {
            let memos = MemoPipeline::new(
                self.store.clone(),
                queues.clone(),
                cfg.start_height,
                cfg.memo_batch_blocks,
            );
            producers.push((
                "memos",
                tokio::spawn(memos.run(cfg.aux_interval(), shutdown.clone())),
            ));
        }

        let sink_shutdown = CancellationToken::new();
        let sink = tokio::spawn(
            Sink::new(self.store.clone(), queues.clone()).run(cfg.drain_interval(), sink_shutdown.clone()),
        );

        shutdown.cancelled().await;
        tracing::info!(producers = producers.len(), "shutdown requested; stopping producers");

        let (names, handles): (Vec<_>, Vec<_>) = producers.into_iter().unzip();
        for (name, result) in names.into_iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                tracing::error!(task = name, error = %e, "task ended abnormally");
            }
        }

        sink_shutdown.cancel();
        sink.await
            .map_err(|e| IndexerError::Other(format!("sink task failed: {e}")))?;
        tracing::info!(pending = queues.pending(), "heartbeat stopped");
        Ok(())
    }
}
