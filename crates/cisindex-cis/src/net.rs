//! Network selection and the provenance mint allow-lists.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use cisindex_core::error::IndexerError;

/// Accounts allowed to mint provenance tokens on mainnet.
const MAINNET_PROVENANCE_MINTERS: &[&str] = &["3suZfxcME62akyyss72hjNhkzXeZuyhoyQz1tvNSXY2yxvwo53"];

/// Accounts allowed to mint provenance tokens on testnet.
const TESTNET_PROVENANCE_MINTERS: &[&str] = &[
    "4AuT5RRmBwcdkLMA6iVjxTDb1FQmxwAh3wHBS22mggWL8xH6s3",
    "4s3QS7Vdp7b6yrLngKQwCQcexKVQLKifcGKgmVXoH6wffZMQhM",
];

/// The network the indexer runs against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Net {
    #[default]
    Mainnet,
    Testnet,
}

impl Net {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
        }
    }

    /// Sender accounts whose mint events register a provenance contract.
    pub fn provenance_minters(&self) -> &'static [&'static str] {
        match self {
            Self::Mainnet => MAINNET_PROVENANCE_MINTERS,
            Self::Testnet => TESTNET_PROVENANCE_MINTERS,
        }
    }

    pub fn is_provenance_minter(&self, sender: &str) -> bool {
        self.provenance_minters().contains(&sender)
    }
}

impl fmt::Display for Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Net {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            other => Err(IndexerError::Config(format!("unknown net: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_lists_are_disjoint() {
        for sender in Net::Testnet.provenance_minters() {
            assert!(!Net::Mainnet.is_provenance_minter(sender));
        }
        for sender in Net::Mainnet.provenance_minters() {
            assert!(!Net::Testnet.is_provenance_minter(sender));
        }
    }

    #[test]
    fn parse_net() {
        assert_eq!("MAINNET".parse::<Net>().unwrap(), Net::Mainnet);
        assert_eq!("testnet".parse::<Net>().unwrap(), Net::Testnet);
        assert!("devnet".parse::<Net>().is_err());
    }
}
