//! cisindex-core: foundation for the CIS-2 ingestion pipeline.
//!
//! # Architecture
//!
//! ```text
//! BlockFetcher → work queue → BlockProcessor → OutputQueues → Sink → DocumentStore
//!                                   │                                   ▲
//!                                   └── EventDecoder / MemoDecoder      │
//!                                              CheckpointManager ───────┘
//! ```
//!
//! This crate holds the shared vocabulary: the block and effect model, the
//! generic batch queue, checkpoints, and the node / store / notifier traits.

pub mod checkpoint;
pub mod error;
pub mod node;
pub mod notify;
pub mod queue;
pub mod store;
pub mod types;

pub use checkpoint::{CheckpointManager, MemoryDocumentStore, Stage};
pub use error::IndexerError;
pub use node::{MemoryNode, NodeClient, StandardIdentifier};
pub use notify::{Alert, LogNotifier, Notifier};
pub use queue::{BatchQueue, Keyed, OutputQueues};
pub use store::{Collection, Document, DocumentStore, Filter};
pub use types::{BlockInfo, ContractAddress, Height, TokenAddress, Transaction};
