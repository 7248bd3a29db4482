//! cisindex-cis: CIS-2 event extraction.
//!
//! - [`event`]: tag-level decoding of raw logged events into [`CisEvent`]
//! - [`resolver`]: "does this contract implement CIS-1/CIS-2?", memoized per run
//! - [`decoder`]: the [`EventDecoder`] that walks a transaction's effect tree
//! - [`memo`]: best-effort text decoding of transfer memos
//! - [`net`]: network selection and the provenance minter allow-lists

pub mod decoder;
pub mod event;
pub mod memo;
pub mod net;
pub mod resolver;

pub use decoder::{DecodeOutput, EventDecoder};
pub use event::{process_event, CisEvent, CisParseError, EffectKind, EventKey, LoggedEvent};
pub use memo::{ChardetDetector, CharsetDetector, DecodedMemo, MemoDecoder};
pub use net::Net;
pub use resolver::{CapabilityCache, ContractCapabilityResolver, InstanceDocument};
