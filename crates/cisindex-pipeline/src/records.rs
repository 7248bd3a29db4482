//! Documents the pipeline writes, one type per collection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cisindex_core::queue::Keyed;
use cisindex_core::types::{BlockInfo, ContractAddress, Height, TokenAddress, Transaction};

macro_rules! keyed_by_id {
    ($($ty:ty),* $(,)?) => {
        $(impl Keyed for $ty {
            fn key(&self) -> String {
                self.id.clone()
            }
        })*
    };
}

keyed_by_id!(
    BlockRecord,
    TransactionRecord,
    RedoRequest,
    ProvenanceContract,
    BlocksPerDay,
    TokenAddressState,
    TokenAccountState,
    MemoRecord,
    SpecialPurposeRequest,
);

/// `blocks`, keyed by block hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub height: Height,
    pub parent_hash: String,
    pub slot_time: DateTime<Utc>,
    pub transaction_count: u32,
}

impl From<&BlockInfo> for BlockRecord {
    fn from(info: &BlockInfo) -> Self {
        Self {
            id: info.hash.clone(),
            height: info.height,
            parent_hash: info.parent_hash.clone(),
            slot_time: info.slot_time,
            transaction_count: info.transaction_count,
        }
    }
}

/// `transactions`, keyed by transaction hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub block_height: Height,
    pub block_hash: String,
    pub slot_time: DateTime<Utc>,
    pub transaction: Transaction,
}

impl TransactionRecord {
    pub fn new(block: &BlockInfo, tx: &Transaction) -> Self {
        Self {
            id: tx.hash.clone(),
            block_height: block.height,
            block_hash: block.hash.clone(),
            slot_time: block.slot_time,
            transaction: tx.clone(),
        }
    }
}

/// `token_addresses_to_redo_accounting`, keyed by token address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedoRequest {
    #[serde(rename = "_id")]
    pub id: String,
    pub redo: bool,
}

impl RedoRequest {
    pub fn pending(token_address: &TokenAddress) -> Self {
        Self {
            id: token_address.to_string(),
            redo: true,
        }
    }
}

/// `provenance_contracts_to_add`, keyed by contract address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceContract {
    #[serde(rename = "_id")]
    pub id: String,
    pub contract: ContractAddress,
    pub block_height: Height,
}

/// `blocks_per_day`, keyed by `YYYY-MM-DD`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocksPerDay {
    #[serde(rename = "_id")]
    pub id: String,
    pub height_for_first_block: Height,
    pub height_for_last_block: Height,
    pub slot_time_for_first_block: DateTime<Utc>,
    pub slot_time_for_last_block: DateTime<Utc>,
}

/// Position of a logged event in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventPosition {
    pub block_height: Height,
    pub tx_index: u64,
    pub ordering: u32,
}

/// `token_addresses`: supply and metadata of one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAddressState {
    #[serde(rename = "_id")]
    pub id: String,
    pub contract: String,
    pub token_id: String,
    /// Decimal total supply.
    pub token_amount: String,
    pub metadata_url: Option<String>,
    pub last_applied: Option<EventPosition>,
}

impl TokenAddressState {
    pub fn empty(token_address: &TokenAddress) -> Self {
        Self {
            id: token_address.to_string(),
            contract: token_address.contract.to_string(),
            token_id: token_address.token_id.clone(),
            token_amount: "0".into(),
            metadata_url: None,
            last_applied: None,
        }
    }
}

/// `token_accounts`: one holder's balance of one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAccountState {
    /// `{token_address}:{owner}`
    #[serde(rename = "_id")]
    pub id: String,
    pub token_address: String,
    pub owner: String,
    /// Decimal balance.
    pub balance: String,
    pub last_applied: Option<EventPosition>,
}

impl TokenAccountState {
    pub fn id_for(token_address: &str, owner: &str) -> String {
        format!("{token_address}:{owner}")
    }

    pub fn empty(token_address: &str, owner: &str) -> Self {
        Self {
            id: Self::id_for(token_address, owner),
            token_address: token_address.to_string(),
            owner: owner.to_string(),
            balance: "0".into(),
            last_applied: None,
        }
    }
}

/// `memo_transaction_hashes`, keyed by transaction hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub memo: String,
    pub decode_failure: bool,
    pub block_height: Height,
}

/// The `special_purpose_blocks` request in `helpers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialPurposeRequest {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub heights: Vec<Height>,
}

impl SpecialPurposeRequest {
    pub const ID: &'static str = "special_purpose_blocks";

    pub fn new(heights: Vec<Height>) -> Self {
        Self {
            id: Self::ID.to_string(),
            heights,
        }
    }
}
