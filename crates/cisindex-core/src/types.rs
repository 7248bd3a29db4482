//! Shared types: blocks, addresses and the transaction effect tree.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Height of a finalized block. The sole ordering key for ingestion progress.
pub type Height = u64;

// ─── BlockInfo ───────────────────────────────────────────────────────────────

/// Summary of a finalized block, immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub height: Height,
    pub hash: String,
    pub parent_hash: String,
    pub slot_time: DateTime<Utc>,
    pub transaction_count: u32,
}

// ─── Addresses ───────────────────────────────────────────────────────────────

/// A smart contract instance address, rendered as `<index,subindex>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractAddress {
    pub index: u64,
    pub subindex: u64,
}

impl ContractAddress {
    pub fn new(index: u64, subindex: u64) -> Self {
        Self { index, subindex }
    }
}

impl fmt::Display for ContractAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{},{}>", self.index, self.subindex)
    }
}

impl FromStr for ContractAddress {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .ok_or_else(|| IndexerError::Decode(format!("malformed contract address: {s}")))?;
        let (index, subindex) = inner
            .split_once(',')
            .ok_or_else(|| IndexerError::Decode(format!("malformed contract address: {s}")))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|_| IndexerError::Decode(format!("malformed contract address: {s}")))
        };
        Ok(Self::new(parse(index)?, parse(subindex)?))
    }
}

/// Composite key `<index,subindex>-<token-id>` identifying one token of a contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenAddress {
    pub contract: ContractAddress,
    /// Hex-encoded token id (may be empty for single-token contracts).
    pub token_id: String,
}

impl TokenAddress {
    pub fn new(contract: ContractAddress, token_id: impl Into<String>) -> Self {
        Self {
            contract,
            token_id: token_id.into(),
        }
    }
}

impl fmt::Display for TokenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.contract, self.token_id)
    }
}

impl FromStr for TokenAddress {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (contract, token_id) = s
            .split_once('-')
            .ok_or_else(|| IndexerError::Decode(format!("malformed token address: {s}")))?;
        Ok(Self::new(contract.parse()?, token_id))
    }
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// One block item, belonging to exactly one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    /// Position of the transaction within its block.
    pub index: u64,
    pub kind: TransactionKind,
}

impl Transaction {
    /// The account transaction payload, if this is one.
    pub fn account_transaction(&self) -> Option<&AccountTransaction> {
        match &self.kind {
            TransactionKind::AccountTransaction(at) => Some(at),
            _ => None,
        }
    }

    /// Hex memo attached to a transfer, if any.
    pub fn memo(&self) -> Option<&str> {
        match &self.account_transaction()?.effects {
            AccountTransactionEffects::AccountTransfer { memo, .. }
            | AccountTransactionEffects::TransferredWithSchedule { memo, .. } => memo.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionKind {
    AccountCreation { address: String },
    AccountTransaction(AccountTransaction),
    ChainUpdate { payload: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTransaction {
    /// Base58 address of the sending account.
    pub sender: String,
    pub cost: u64,
    pub effects: AccountTransactionEffects,
}

/// The effects of a successful account transaction.
///
/// Only the contract variants feed the event decoder; transfers carry memos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum AccountTransactionEffects {
    ContractInitialized(ContractInitialized),
    ContractUpdateIssued { effects: Vec<ContractTraceElement> },
    AccountTransfer {
        amount: u64,
        receiver: String,
        memo: Option<String>,
    },
    TransferredWithSchedule {
        receiver: String,
        releases: Vec<Release>,
        memo: Option<String>,
    },
    DataRegistered { data: String },
    Other { kind: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub timestamp: DateTime<Utc>,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractInitialized {
    pub address: ContractAddress,
    pub origin_ref: String,
    /// Full init function name, e.g. `init_cis2_nft`.
    pub init_name: String,
    pub amount: u64,
    /// Hex-encoded logged events.
    pub events: Vec<String>,
}

/// One element of a contract update's execution trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "element", rename_all = "snake_case")]
pub enum ContractTraceElement {
    Interrupted {
        address: ContractAddress,
        events: Vec<String>,
    },
    Updated(InstanceUpdated),
    Transferred {
        sender: ContractAddress,
        amount: u64,
        receiver: String,
    },
    Resumed {
        address: ContractAddress,
        success: bool,
    },
    Upgraded {
        address: ContractAddress,
        from: String,
        to: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceUpdated {
    pub address: ContractAddress,
    pub instigator: String,
    pub amount: u64,
    /// `contract_name.entrypoint`.
    pub receive_name: String,
    pub events: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_address_display_and_parse() {
        let addr = ContractAddress::new(9390, 0);
        assert_eq!(addr.to_string(), "<9390,0>");
        assert_eq!("<9390,0>".parse::<ContractAddress>().unwrap(), addr);
        assert!("9390,0".parse::<ContractAddress>().is_err());
        assert!("<a,0>".parse::<ContractAddress>().is_err());
    }

    #[test]
    fn token_address_roundtrips_through_text() {
        let ta = TokenAddress::new(ContractAddress::new(10, 1), "0a");
        assert_eq!(ta.to_string(), "<10,1>-0a");
        assert_eq!("<10,1>-0a".parse::<TokenAddress>().unwrap(), ta);

        let empty: TokenAddress = "<3,0>-".parse().unwrap();
        assert_eq!(empty.token_id, "");
    }

    #[test]
    fn memo_only_on_transfers() {
        let tx = Transaction {
            hash: "aa".into(),
            index: 0,
            kind: TransactionKind::AccountTransaction(AccountTransaction {
                sender: "sender".into(),
                cost: 1,
                effects: AccountTransactionEffects::AccountTransfer {
                    amount: 5,
                    receiver: "r".into(),
                    memo: Some("6b68656c6c6f".into()),
                },
            }),
        };
        assert_eq!(tx.memo(), Some("6b68656c6c6f"));

        let creation = Transaction {
            hash: "bb".into(),
            index: 1,
            kind: TransactionKind::AccountCreation { address: "x".into() },
        };
        assert!(creation.memo().is_none());
        assert!(creation.account_transaction().is_none());
    }

    #[test]
    fn effect_tree_serde_is_tagged() {
        let effects = AccountTransactionEffects::ContractUpdateIssued {
            effects: vec![ContractTraceElement::Resumed {
                address: ContractAddress::new(1, 0),
                success: true,
            }],
        };
        let json = serde_json::to_value(&effects).unwrap();
        assert_eq!(json["effect"], "contract_update_issued");
        assert_eq!(json["effects"][0]["element"], "resumed");
        let back: AccountTransactionEffects = serde_json::from_value(json).unwrap();
        assert_eq!(back, effects);
    }
}
