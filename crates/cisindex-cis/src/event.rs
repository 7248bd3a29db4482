//! CIS-2 logged event decoding.
//!
//! A logged event is the raw byte payload a contract emits. The first byte is
//! the tag; CIS-2 reserves 251..=255. All integers are little-endian, token
//! amounts are unsigned LEB128 up to 256 bits.

use std::fmt;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use cisindex_core::queue::Keyed;
use cisindex_core::types::{BlockInfo, ContractAddress, Height, TokenAddress, Transaction};

pub const TRANSFER_TAG: u8 = 255;
pub const MINT_TAG: u8 = 254;
pub const BURN_TAG: u8 = 253;
pub const UPDATE_OPERATOR_TAG: u8 = 252;
pub const TOKEN_METADATA_TAG: u8 = 251;

/// Maximum encoded length of a CIS-2 token amount.
const MAX_AMOUNT_BYTES: usize = 37;

/// Errors while parsing a single event payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CisParseError {
    #[error("Event payload is not valid hex")]
    InvalidHex,

    #[error("Event payload is empty")]
    Empty,

    #[error("Unexpected end of payload reading {field}")]
    Truncated { field: &'static str },

    #[error("Unknown address tag {0}")]
    AddressTag(u8),

    #[error("Token amount exceeds 256 bits")]
    AmountOverflow,

    #[error("Metadata URL is not UTF-8")]
    InvalidUrl,

    #[error("Invalid {field} byte {value}")]
    InvalidFlag { field: &'static str, value: u8 },
}

// ─── CisEvent ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorUpdate {
    Remove,
    Add,
}

/// A decoded CIS-2 event. Addresses are rendered as text: accounts in
/// base58check, contracts as `<index,subindex>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum CisEvent {
    Transfer {
        token_id: String,
        /// Decimal token amount.
        amount: String,
        from: String,
        to: String,
    },
    Mint {
        token_id: String,
        amount: String,
        owner: String,
    },
    Burn {
        token_id: String,
        amount: String,
        owner: String,
    },
    UpdateOperator {
        update: OperatorUpdate,
        owner: String,
        operator: String,
    },
    TokenMetadata {
        token_id: String,
        metadata_url: String,
        metadata_hash: Option<String>,
    },
}

impl CisEvent {
    /// Parse a raw payload. Returns `Ok(None)` for tags outside CIS-2.
    pub fn parse(bytes: &[u8]) -> Result<Option<Self>, CisParseError> {
        let mut r = Reader::new(bytes);
        let tag = r.u8("tag").map_err(|_| CisParseError::Empty)?;
        let event = match tag {
            TRANSFER_TAG => Self::Transfer {
                token_id: r.token_id()?,
                amount: r.amount()?.to_string(),
                from: r.address()?,
                to: r.address()?,
            },
            MINT_TAG => Self::Mint {
                token_id: r.token_id()?,
                amount: r.amount()?.to_string(),
                owner: r.address()?,
            },
            BURN_TAG => Self::Burn {
                token_id: r.token_id()?,
                amount: r.amount()?.to_string(),
                owner: r.address()?,
            },
            UPDATE_OPERATOR_TAG => {
                let update = match r.u8("operator update")? {
                    0 => OperatorUpdate::Remove,
                    1 => OperatorUpdate::Add,
                    value => return Err(CisParseError::InvalidFlag { field: "operator update", value }),
                };
                Self::UpdateOperator {
                    update,
                    owner: r.address()?,
                    operator: r.address()?,
                }
            }
            TOKEN_METADATA_TAG => {
                let token_id = r.token_id()?;
                let url_len = r.u16_le("metadata url length")? as usize;
                let url = r.take(url_len, "metadata url")?;
                let metadata_url =
                    String::from_utf8(url.to_vec()).map_err(|_| CisParseError::InvalidUrl)?;
                let metadata_hash = match r.u8("metadata hash flag")? {
                    0 => None,
                    1 => Some(hex::encode(r.take(32, "metadata hash")?)),
                    value => return Err(CisParseError::InvalidFlag { field: "metadata hash flag", value }),
                };
                Self::TokenMetadata {
                    token_id,
                    metadata_url,
                    metadata_hash,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn tag(&self) -> u8 {
        match self {
            Self::Transfer { .. } => TRANSFER_TAG,
            Self::Mint { .. } => MINT_TAG,
            Self::Burn { .. } => BURN_TAG,
            Self::UpdateOperator { .. } => UPDATE_OPERATOR_TAG,
            Self::TokenMetadata { .. } => TOKEN_METADATA_TAG,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Transfer { .. } => "transfer_event",
            Self::Mint { .. } => "mint_event",
            Self::Burn { .. } => "burn_event",
            Self::UpdateOperator { .. } => "operator_event",
            Self::TokenMetadata { .. } => "metadata_event",
        }
    }

    /// The token the event concerns; operator updates concern none.
    pub fn token_id(&self) -> Option<&str> {
        match self {
            Self::Transfer { token_id, .. }
            | Self::Mint { token_id, .. }
            | Self::Burn { token_id, .. }
            | Self::TokenMetadata { token_id, .. } => Some(token_id),
            Self::UpdateOperator { .. } => None,
        }
    }
}

/// Parse a decimal token amount as stored in records.
pub fn parse_amount(amount: &str) -> Option<U256> {
    U256::from_str_radix(amount, 10).ok()
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], CisParseError> {
        let end = self.pos.checked_add(n).ok_or(CisParseError::Truncated { field })?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(CisParseError::Truncated { field })?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, CisParseError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16_le(&mut self, field: &'static str) -> Result<u16, CisParseError> {
        let b = self.take(2, field)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u64_le(&mut self, field: &'static str) -> Result<u64, CisParseError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8, field)?);
        Ok(u64::from_le_bytes(buf))
    }

    /// One length byte followed by the id bytes; rendered as hex.
    fn token_id(&mut self) -> Result<String, CisParseError> {
        let len = self.u8("token id length")? as usize;
        Ok(hex::encode(self.take(len, "token id")?))
    }

    fn amount(&mut self) -> Result<U256, CisParseError> {
        let mut value = U256::ZERO;
        for i in 0..MAX_AMOUNT_BYTES {
            let byte = self.u8("token amount")?;
            let bits = (byte & 0x7f) as u64;
            let shift = i * 7;
            // Anything shifted past bit 255 would be silently lost
            if shift >= 256 || (shift > 249 && bits >> (256 - shift) != 0) {
                return Err(CisParseError::AmountOverflow);
            }
            value |= U256::from(bits) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CisParseError::AmountOverflow)
    }

    fn address(&mut self) -> Result<String, CisParseError> {
        match self.u8("address tag")? {
            0 => {
                let account = self.take(32, "account address")?;
                Ok(bs58::encode(account).with_check_version(1).into_string())
            }
            1 => {
                let index = self.u64_le("contract index")?;
                let subindex = self.u64_le("contract subindex")?;
                Ok(ContractAddress::new(index, subindex).to_string())
            }
            tag => Err(CisParseError::AddressTag(tag)),
        }
    }
}

// ─── LoggedEvent ─────────────────────────────────────────────────────────────

/// Which part of the effect tree an event was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    Initialized,
    Interrupted,
    Updated,
}

impl EffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Interrupted => "interrupted",
            Self::Updated => "updated",
        }
    }
}

/// Position of an event in its transaction. Identical on every reprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub tx_index: u64,
    pub kind: EffectKind,
    /// Index in the update-issued trace; `None` for contract initialization.
    pub effect_index: Option<usize>,
    pub event_index: usize,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.effect_index {
            None => write!(f, "{}-{}-{}", self.kind.as_str(), self.tx_index, self.event_index),
            Some(effect) => write!(
                f,
                "{}-{}-{}-{}",
                self.kind.as_str(),
                self.tx_index,
                effect,
                self.event_index
            ),
        }
    }
}

/// A decoded token event with its block/transaction context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedEvent {
    /// `{block_height}-{effect_key}`.
    #[serde(rename = "_id")]
    pub id: String,
    /// Raw hex payload.
    pub logged_event: String,
    pub result: CisEvent,
    pub tag: u8,
    pub event_type: String,
    pub contract: String,
    pub token_address: Option<String>,
    pub block_height: Height,
    pub tx_hash: String,
    pub tx_index: u64,
    /// Position among examined events in the transaction, starting at 1.
    pub ordering: u32,
    pub effect_key: String,
    pub date: String,
}

impl Keyed for LoggedEvent {
    fn key(&self) -> String {
        self.id.clone()
    }
}

/// What examining one raw event yields.
#[derive(Debug, Clone, Default)]
pub struct ProcessedEvent {
    /// First byte of the payload, if there was one.
    pub tag: Option<u8>,
    pub logged_event: Option<LoggedEvent>,
    pub token_address: Option<TokenAddress>,
}

/// Decode one raw hex event emitted by `instance`.
///
/// Undecodable payloads and unknown tags yield no [`LoggedEvent`].
pub fn process_event(
    instance: ContractAddress,
    raw: &str,
    block: &BlockInfo,
    tx: &Transaction,
    ordering: u32,
    key: EventKey,
) -> ProcessedEvent {
    let bytes = match hex::decode(raw) {
        Ok(b) => b,
        Err(_) => {
            tracing::debug!(%instance, tx = %tx.hash, "{}", CisParseError::InvalidHex);
            return ProcessedEvent::default();
        }
    };
    let tag = bytes.first().copied();

    let event = match CisEvent::parse(&bytes) {
        Ok(Some(event)) => event,
        Ok(None) => {
            return ProcessedEvent {
                tag,
                ..Default::default()
            }
        }
        Err(e) => {
            tracing::debug!(%instance, tx = %tx.hash, ?tag, error = %e, "undecodable CIS-2 event");
            return ProcessedEvent {
                tag,
                ..Default::default()
            };
        }
    };

    let token_address = event.token_id().map(|id| TokenAddress::new(instance, id));
    let logged_event = LoggedEvent {
        id: format!("{}-{}", block.height, key),
        logged_event: raw.to_string(),
        tag: event.tag(),
        event_type: event.type_name().to_string(),
        contract: instance.to_string(),
        token_address: token_address.as_ref().map(ToString::to_string),
        block_height: block.height,
        tx_hash: tx.hash.clone(),
        tx_index: tx.index,
        ordering,
        effect_key: key.to_string(),
        date: block.slot_time.format("%Y-%m-%d").to_string(),
        result: event,
    };

    ProcessedEvent {
        tag,
        logged_event: Some(logged_event),
        token_address,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Byte builders for CIS-2 payloads.

    pub fn account(seed: u8) -> Vec<u8> {
        let mut out = vec![0u8];
        out.extend([seed; 32]);
        out
    }

    pub fn contract(index: u64, subindex: u64) -> Vec<u8> {
        let mut out = vec![1u8];
        out.extend(index.to_le_bytes());
        out.extend(subindex.to_le_bytes());
        out
    }

    pub fn leb128(mut v: u128) -> Vec<u8> {
        let mut out = vec![];
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                return out;
            }
            out.push(byte | 0x80);
        }
    }

    pub fn mint(token_id: &[u8], amount: u128, owner: &[u8]) -> String {
        let mut out = vec![254u8, token_id.len() as u8];
        out.extend(token_id);
        out.extend(leb128(amount));
        out.extend(owner);
        hex::encode(out)
    }

    pub fn burn(token_id: &[u8], amount: u128, owner: &[u8]) -> String {
        let mut out = vec![253u8, token_id.len() as u8];
        out.extend(token_id);
        out.extend(leb128(amount));
        out.extend(owner);
        hex::encode(out)
    }

    pub fn transfer(token_id: &[u8], amount: u128, from: &[u8], to: &[u8]) -> String {
        let mut out = vec![255u8, token_id.len() as u8];
        out.extend(token_id);
        out.extend(leb128(amount));
        out.extend(from);
        out.extend(to);
        hex::encode(out)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use chrono::{TimeZone, Utc};
    use cisindex_core::types::TransactionKind;

    fn block() -> BlockInfo {
        BlockInfo {
            height: 42,
            hash: "bh".into(),
            parent_hash: "ph".into(),
            slot_time: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            transaction_count: 1,
        }
    }

    fn tx() -> Transaction {
        Transaction {
            hash: "th".into(),
            index: 3,
            kind: TransactionKind::ChainUpdate { payload: String::new() },
        }
    }

    #[test]
    fn parse_mint() {
        let raw = hex::decode(mint(&[0x01], 1_000, &account(7))).unwrap();
        let event = CisEvent::parse(&raw).unwrap().unwrap();
        match &event {
            CisEvent::Mint { token_id, amount, owner } => {
                assert_eq!(token_id, "01");
                assert_eq!(amount, "1000");
                assert_eq!(owner, &bs58::encode([7u8; 32]).with_check_version(1).into_string());
            }
            other => panic!("expected mint, got {other:?}"),
        }
        assert_eq!(event.tag(), MINT_TAG);
    }

    #[test]
    fn parse_transfer_between_contract_and_account() {
        let raw = hex::decode(transfer(&[], 5, &contract(12, 0), &account(1))).unwrap();
        let event = CisEvent::parse(&raw).unwrap().unwrap();
        match event {
            CisEvent::Transfer { token_id, amount, from, .. } => {
                assert_eq!(token_id, "");
                assert_eq!(amount, "5");
                assert_eq!(from, "<12,0>");
            }
            other => panic!("expected transfer, got {other:?}"),
        }
    }

    #[test]
    fn parse_operator_and_metadata() {
        let mut op = vec![252u8, 1];
        op.extend(account(2));
        op.extend(contract(99, 0));
        let event = CisEvent::parse(&op).unwrap().unwrap();
        assert!(matches!(event, CisEvent::UpdateOperator { update: OperatorUpdate::Add, .. }));
        assert!(event.token_id().is_none());

        op[1] = 7;
        assert_eq!(
            CisEvent::parse(&op).unwrap_err(),
            CisParseError::InvalidFlag { field: "operator update", value: 7 }
        );

        let url = b"https://example.com/1.json";
        let mut meta = vec![251u8, 1, 0xaa];
        meta.extend((url.len() as u16).to_le_bytes());
        meta.extend(url);
        meta.push(0);
        match CisEvent::parse(&meta).unwrap().unwrap() {
            CisEvent::TokenMetadata { token_id, metadata_url, metadata_hash } => {
                assert_eq!(token_id, "aa");
                assert_eq!(metadata_url, "https://example.com/1.json");
                assert!(metadata_hash.is_none());
            }
            other => panic!("expected metadata, got {other:?}"),
        }
    }

    #[test]
    fn large_amount_decodes() {
        let amount = u128::MAX;
        let raw = hex::decode(burn(&[1], amount, &account(3))).unwrap();
        match CisEvent::parse(&raw).unwrap().unwrap() {
            CisEvent::Burn { amount: a, .. } => assert_eq!(a, u128::MAX.to_string()),
            other => panic!("expected burn, got {other:?}"),
        }
    }

    #[test]
    fn overlong_amount_is_rejected() {
        let mut raw = vec![254u8, 0];
        raw.extend([0xff; 40]);
        assert_eq!(CisEvent::parse(&raw), Err(CisParseError::AmountOverflow));
    }

    #[test]
    fn unknown_tag_and_truncation() {
        assert_eq!(CisEvent::parse(&[7, 1, 2]), Ok(None));
        assert_eq!(CisEvent::parse(&[]), Err(CisParseError::Empty));
        assert!(matches!(
            CisEvent::parse(&[254, 4, 1]),
            Err(CisParseError::Truncated { field: "token id" })
        ));
    }

    #[test]
    fn event_key_formats() {
        let init = EventKey {
            tx_index: 3,
            kind: EffectKind::Initialized,
            effect_index: None,
            event_index: 1,
        };
        assert_eq!(init.to_string(), "initialized-3-1");
        let upd = EventKey {
            tx_index: 3,
            kind: EffectKind::Updated,
            effect_index: Some(2),
            event_index: 0,
        };
        assert_eq!(upd.to_string(), "updated-3-2-0");
    }

    #[test]
    fn process_event_builds_record() {
        let instance = ContractAddress::new(10, 0);
        let raw = mint(&[0x01], 1, &account(9));
        let key = EventKey {
            tx_index: 3,
            kind: EffectKind::Initialized,
            effect_index: None,
            event_index: 0,
        };
        let out = process_event(instance, &raw, &block(), &tx(), 1, key);
        assert_eq!(out.tag, Some(MINT_TAG));
        let le = out.logged_event.unwrap();
        assert_eq!(le.id, "42-initialized-3-0");
        assert_eq!(le.token_address.as_deref(), Some("<10,0>-01"));
        assert_eq!(le.ordering, 1);
        assert_eq!(le.date, "2024-03-01");
        assert_eq!(out.token_address.unwrap().to_string(), "<10,0>-01");
    }

    #[test]
    fn process_event_tolerates_garbage() {
        let key = EventKey {
            tx_index: 0,
            kind: EffectKind::Updated,
            effect_index: Some(0),
            event_index: 0,
        };
        let out = process_event(ContractAddress::new(1, 0), "zz", &block(), &tx(), 1, key);
        assert!(out.tag.is_none() && out.logged_event.is_none());

        let out = process_event(ContractAddress::new(1, 0), "07ff", &block(), &tx(), 2, key);
        assert_eq!(out.tag, Some(7));
        assert!(out.logged_event.is_none());
    }
}
