//! cisindex-pipeline: the ingestion pipeline.
//!
//! ```text
//! BlockFetcher ──heights──▶ BlockProcessor ──docs──▶ OutputQueues ──▶ Sink ──▶ store
//!                                                       ▲
//!            TokenAccounting · SpecialPurposeRescan · MemoPipeline
//! ```
//!
//! Every stage queues its checkpoint after its data; the [`Sink`] writes
//! checkpoints last, so a persisted checkpoint implies persisted data.
//! [`Heartbeat`] runs all of it; [`HeartbeatBuilder`] assembles one.

pub mod accounting;
pub mod builder;
pub mod config;
pub mod cursor;
pub mod fetcher;
pub mod heartbeat;
pub mod http;
pub mod memos;
pub mod notify;
pub mod processor;
pub mod records;
pub mod retry;
pub mod sink;
pub mod special;

pub use accounting::TokenAccounting;
pub use builder::HeartbeatBuilder;
pub use config::{HeartbeatConfig, StageToggles};
pub use cursor::StageCursor;
pub use fetcher::BlockFetcher;
pub use heartbeat::Heartbeat;
pub use http::{HttpNodeClient, HttpNodeConfig};
pub use memos::MemoPipeline;
pub use notify::WebhookNotifier;
pub use processor::{BlockOutput, BlockProcessor, ProcessingMode};
pub use retry::{RetryConfig, RetryPolicy};
pub use sink::{DrainReport, Sink};
pub use special::SpecialPurposeRescan;
