//! Walks a transaction's effect tree and extracts CIS-2 logged events.

use tracing::{debug, warn};

use cisindex_core::types::{
    AccountTransactionEffects, BlockInfo, ContractAddress, ContractTraceElement, TokenAddress,
    Transaction,
};

use crate::event::{process_event, EffectKind, EventKey, LoggedEvent, MINT_TAG};
use crate::net::Net;
use crate::resolver::{
    entrypoint_from_init_name, entrypoint_from_receive_name, CapabilityCache,
    ContractCapabilityResolver,
};

/// Everything one transaction contributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOutput {
    pub logged_events: Vec<LoggedEvent>,
    pub token_addresses_to_redo_accounting: Vec<TokenAddress>,
    /// Contract part of minted token addresses from allow-listed senders.
    pub provenance_contracts_to_add: Vec<ContractAddress>,
}

impl DecodeOutput {
    pub fn is_empty(&self) -> bool {
        self.logged_events.is_empty()
            && self.token_addresses_to_redo_accounting.is_empty()
            && self.provenance_contracts_to_add.is_empty()
    }
}

#[derive(Clone)]
pub struct EventDecoder {
    resolver: ContractCapabilityResolver,
    net: Net,
}

/// Per-transaction traversal state. `ordering` is shared by every effect.
struct Walk<'a> {
    block: &'a BlockInfo,
    tx: &'a Transaction,
    sender: &'a str,
    special_purpose: bool,
    ordering: u32,
    out: DecodeOutput,
}

impl EventDecoder {
    pub fn new(resolver: ContractCapabilityResolver, net: Net) -> Self {
        Self { resolver, net }
    }

    /// Decode one transaction.
    ///
    /// Never fails: an effect whose capability cannot be established
    /// contributes nothing and the walk continues with the next effect.
    /// With `special_purpose` set, the token address of every examined event
    /// is queued for re-accounting.
    pub async fn decode(
        &self,
        tx: &Transaction,
        block: &BlockInfo,
        cache: &mut CapabilityCache,
        special_purpose: bool,
    ) -> DecodeOutput {
        let Some(account_tx) = tx.account_transaction() else {
            return DecodeOutput::default();
        };
        let mut walk = Walk {
            block,
            tx,
            sender: &account_tx.sender,
            special_purpose,
            ordering: 0,
            out: DecodeOutput::default(),
        };

        match &account_tx.effects {
            AccountTransactionEffects::ContractInitialized(init) => {
                let entrypoint = entrypoint_from_init_name(&init.init_name);
                if self.is_supported(init.address, &entrypoint, cache).await {
                    self.examine(&mut walk, init.address, &init.events, EffectKind::Initialized, None);
                }
            }
            AccountTransactionEffects::ContractUpdateIssued { effects } => {
                for (effect_index, element) in effects.iter().enumerate() {
                    match element {
                        ContractTraceElement::Interrupted { address, events } => {
                            let entrypoint = match self.resolver.instance_entrypoint(*address).await {
                                Ok(Some(entrypoint)) => entrypoint,
                                Ok(None) => {
                                    debug!(contract = %address, "no v1 instance record; skipping interrupted effect");
                                    continue;
                                }
                                Err(e) => {
                                    warn!(contract = %address, error = %e, "instance lookup failed");
                                    continue;
                                }
                            };
                            if self.is_supported(*address, &entrypoint, cache).await {
                                self.examine(
                                    &mut walk,
                                    *address,
                                    events,
                                    EffectKind::Interrupted,
                                    Some(effect_index),
                                );
                            }
                        }
                        ContractTraceElement::Updated(update) => {
                            let entrypoint = entrypoint_from_receive_name(&update.receive_name);
                            if self.is_supported(update.address, &entrypoint, cache).await {
                                self.examine(
                                    &mut walk,
                                    update.address,
                                    &update.events,
                                    EffectKind::Updated,
                                    Some(effect_index),
                                );
                            }
                        }
                        ContractTraceElement::Transferred { .. }
                        | ContractTraceElement::Resumed { .. }
                        | ContractTraceElement::Upgraded { .. } => {}
                    }
                }
            }
            AccountTransactionEffects::AccountTransfer { .. }
            | AccountTransactionEffects::TransferredWithSchedule { .. }
            | AccountTransactionEffects::DataRegistered { .. }
            | AccountTransactionEffects::Other { .. } => {}
        }

        walk.out
    }

    async fn is_supported(
        &self,
        address: ContractAddress,
        entrypoint: &str,
        cache: &mut CapabilityCache,
    ) -> bool {
        match self.resolver.supports(address, entrypoint, cache).await {
            Ok(supported) => supported,
            Err(e) => {
                warn!(contract = %address, entrypoint, error = %e, "capability probe failed; treating as unsupported");
                false
            }
        }
    }

    fn examine(
        &self,
        walk: &mut Walk<'_>,
        instance: ContractAddress,
        events: &[String],
        kind: EffectKind,
        effect_index: Option<usize>,
    ) {
        for (event_index, raw) in events.iter().enumerate() {
            walk.ordering += 1;
            let key = EventKey {
                tx_index: walk.tx.index,
                kind,
                effect_index,
                event_index,
            };
            let processed = process_event(instance, raw, walk.block, walk.tx, walk.ordering, key);

            if let Some(logged_event) = processed.logged_event {
                walk.out.logged_events.push(logged_event);
            }
            if walk.special_purpose {
                if let Some(token_address) = &processed.token_address {
                    walk.out.token_addresses_to_redo_accounting.push(token_address.clone());
                }
            }
            if processed.tag == Some(MINT_TAG) && self.net.is_provenance_minter(walk.sender) {
                if let Some(token_address) = processed.token_address {
                    walk.out.provenance_contracts_to_add.push(token_address.contract);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::fixtures::{account, mint, transfer};
    use crate::resolver::InstanceDocument;
    use chrono::{TimeZone, Utc};
    use cisindex_core::checkpoint::MemoryDocumentStore;
    use cisindex_core::node::MemoryNode;
    use cisindex_core::store::{Collection, Document, DocumentStore};
    use cisindex_core::types::{
        AccountTransaction, ContractInitialized, InstanceUpdated, TransactionKind,
    };
    use std::sync::Arc;

    const MAINNET_MINTER: &str = "3suZfxcME62akyyss72hjNhkzXeZuyhoyQz1tvNSXY2yxvwo53";
    const TESTNET_MINTER: &str = "4AuT5RRmBwcdkLMA6iVjxTDb1FQmxwAh3wHBS22mggWL8xH6s3";

    struct Fixture {
        node: Arc<MemoryNode>,
        store: Arc<MemoryDocumentStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                node: Arc::new(MemoryNode::new()),
                store: Arc::new(MemoryDocumentStore::new()),
            }
        }

        fn decoder(&self, net: Net) -> EventDecoder {
            let resolver = ContractCapabilityResolver::new(self.node.clone(), self.store.clone());
            EventDecoder::new(resolver, net)
        }
    }

    fn block() -> BlockInfo {
        BlockInfo {
            height: 100,
            hash: "bh".into(),
            parent_hash: "ph".into(),
            slot_time: Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
            transaction_count: 1,
        }
    }

    fn account_tx(sender: &str, effects: AccountTransactionEffects) -> Transaction {
        Transaction {
            hash: "txhash".into(),
            index: 4,
            kind: TransactionKind::AccountTransaction(AccountTransaction {
                sender: sender.into(),
                cost: 10,
                effects,
            }),
        }
    }

    fn initialized(index: u64, events: Vec<String>) -> AccountTransactionEffects {
        AccountTransactionEffects::ContractInitialized(ContractInitialized {
            address: ContractAddress::new(index, 0),
            origin_ref: "module".into(),
            init_name: "init_nft".into(),
            amount: 0,
            events,
        })
    }

    fn updated(index: u64, events: Vec<String>) -> ContractTraceElement {
        ContractTraceElement::Updated(InstanceUpdated {
            address: ContractAddress::new(index, 0),
            instigator: "someone".into(),
            amount: 0,
            receive_name: "nft.mint".into(),
            events,
        })
    }

    fn mint_event(token: u8) -> String {
        mint(&[token], 1, &account(1))
    }

    #[tokio::test]
    async fn non_contract_transactions_decode_to_nothing() {
        let fx = Fixture::new();
        let mut cache = CapabilityCache::new();
        let tx = Transaction {
            hash: "h".into(),
            index: 0,
            kind: TransactionKind::AccountCreation { address: "a".into() },
        };
        let out = fx.decoder(Net::Mainnet).decode(&tx, &block(), &mut cache, false).await;
        assert!(out.is_empty());
        assert_eq!(fx.node.probe_calls(), 0);
    }

    #[tokio::test]
    async fn ordering_spans_interrupted_then_updated_effects() {
        let fx = Fixture::new();
        fx.node.set_support(1, true);
        fx.node.set_support(2, true);
        let instance = InstanceDocument::from_initialized(&ContractInitialized {
            address: ContractAddress::new(1, 0),
            origin_ref: "m".into(),
            init_name: "init_nft".into(),
            amount: 0,
            events: vec![],
        });
        fx.store
            .replace_one(Collection::Instances, Document::from_record(&instance).unwrap())
            .await
            .unwrap();

        let effects = AccountTransactionEffects::ContractUpdateIssued {
            effects: vec![
                ContractTraceElement::Interrupted {
                    address: ContractAddress::new(1, 0),
                    events: vec![mint_event(1), "00ee".into()],
                },
                ContractTraceElement::Resumed {
                    address: ContractAddress::new(1, 0),
                    success: true,
                },
                updated(2, vec![transfer(&[2], 1, &account(1), &account(2))]),
            ],
        };
        let tx = account_tx("nobody", effects);
        let mut cache = CapabilityCache::new();
        let out = fx.decoder(Net::Mainnet).decode(&tx, &block(), &mut cache, false).await;

        // The unknown-tag event still consumes ordering 2
        let summary: Vec<_> = out
            .logged_events
            .iter()
            .map(|e| (e.ordering, e.effect_key.as_str()))
            .collect();
        assert_eq!(summary, [(1, "interrupted-4-0-0"), (3, "updated-4-2-0")]);
        assert_eq!(out.logged_events[0].id, "100-interrupted-4-0-0");
    }

    #[tokio::test]
    async fn unsupported_contract_does_not_start_ordering() {
        let fx = Fixture::new();
        fx.node.set_support(1, false);
        fx.node.set_support(2, true);
        let effects = AccountTransactionEffects::ContractUpdateIssued {
            effects: vec![updated(1, vec![mint_event(1)]), updated(2, vec![mint_event(2)])],
        };
        let mut cache = CapabilityCache::new();
        let out = fx
            .decoder(Net::Mainnet)
            .decode(&account_tx("x", effects), &block(), &mut cache, false)
            .await;
        assert_eq!(out.logged_events.len(), 1);
        assert_eq!(out.logged_events[0].ordering, 1);
        assert_eq!(out.logged_events[0].contract, "<2,0>");
    }

    #[tokio::test]
    async fn missing_instance_and_probe_errors_degrade_per_effect() {
        let fx = Fixture::new();
        // Contract 7 has no scripted answer, so probing it errors
        fx.node.set_support(2, true);
        let effects = AccountTransactionEffects::ContractUpdateIssued {
            effects: vec![
                ContractTraceElement::Interrupted {
                    address: ContractAddress::new(9, 0),
                    events: vec![mint_event(9)],
                },
                updated(7, vec![mint_event(7)]),
                updated(2, vec![mint_event(2)]),
            ],
        };
        let mut cache = CapabilityCache::new();
        let out = fx
            .decoder(Net::Mainnet)
            .decode(&account_tx("x", effects), &block(), &mut cache, false)
            .await;
        assert_eq!(out.logged_events.len(), 1);
        assert_eq!(out.logged_events[0].effect_key, "updated-4-2-0");
        assert_eq!(cache.get(7), None);
    }

    #[tokio::test]
    async fn provenance_follows_active_network() {
        let fx = Fixture::new();
        fx.node.set_support(11, true);
        let mut cache = CapabilityCache::new();

        let tx = account_tx(MAINNET_MINTER, initialized(11, vec![mint_event(1)]));
        let out = fx.decoder(Net::Mainnet).decode(&tx, &block(), &mut cache, false).await;
        assert_eq!(out.provenance_contracts_to_add, [ContractAddress::new(11, 0)]);

        let tx = account_tx(TESTNET_MINTER, initialized(11, vec![mint_event(1)]));
        let out = fx.decoder(Net::Mainnet).decode(&tx, &block(), &mut cache, false).await;
        assert!(out.provenance_contracts_to_add.is_empty());

        let out = fx.decoder(Net::Testnet).decode(&tx, &block(), &mut cache, false).await;
        assert_eq!(out.provenance_contracts_to_add.len(), 1);

        // Transfers never flag provenance
        let tx = account_tx(
            MAINNET_MINTER,
            initialized(11, vec![transfer(&[1], 1, &account(1), &account(2))]),
        );
        let out = fx.decoder(Net::Mainnet).decode(&tx, &block(), &mut cache, false).await;
        assert!(out.provenance_contracts_to_add.is_empty());
    }

    #[tokio::test]
    async fn special_purpose_queues_every_token_address() {
        let fx = Fixture::new();
        fx.node.set_support(3, true);
        let tx = account_tx("x", initialized(3, vec![mint_event(1), mint_event(2)]));
        let mut cache = CapabilityCache::new();
        let decoder = fx.decoder(Net::Mainnet);

        let normal = decoder.decode(&tx, &block(), &mut cache, false).await;
        assert!(normal.token_addresses_to_redo_accounting.is_empty());

        let special = decoder.decode(&tx, &block(), &mut cache, true).await;
        let redo: Vec<String> = special
            .token_addresses_to_redo_accounting
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(redo, ["<3,0>-01", "<3,0>-02"]);
    }

    #[tokio::test]
    async fn reprocessing_yields_identical_records() {
        let fx = Fixture::new();
        fx.node.set_support(3, true);
        let tx = account_tx("x", initialized(3, vec![mint_event(1), mint_event(2)]));
        let decoder = fx.decoder(Net::Mainnet);

        let first = decoder.decode(&tx, &block(), &mut CapabilityCache::new(), false).await;
        let second = decoder.decode(&tx, &block(), &mut CapabilityCache::new(), false).await;
        assert_eq!(first, second);
        let ids: Vec<_> = first.logged_events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["100-initialized-4-0", "100-initialized-4-1"]);
    }

    #[tokio::test]
    async fn cached_answer_wins_over_flipped_probe() {
        let fx = Fixture::new();
        fx.node.set_support(3, true);
        let tx = account_tx("x", initialized(3, vec![mint_event(1)]));
        let decoder = fx.decoder(Net::Mainnet);
        let mut cache = CapabilityCache::new();

        assert_eq!(decoder.decode(&tx, &block(), &mut cache, false).await.logged_events.len(), 1);
        fx.node.set_support(3, false);
        assert_eq!(decoder.decode(&tx, &block(), &mut cache, false).await.logged_events.len(), 1);
        assert_eq!(fx.node.probe_calls(), 1);
    }
}
