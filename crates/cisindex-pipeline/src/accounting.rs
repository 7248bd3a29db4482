//! Token accounting: folds persisted mint, burn, transfer and metadata
//! events into per-token supply and per-holder balances.
//!
//! Runs behind the heartbeat checkpoint: only heights whose events are
//! already persisted are read. State changed by a cycle is held in memory
//! until the stage checkpoint covering it is persisted, so consecutive
//! cycles never read a stale balance from the store.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use tokio_util::sync::CancellationToken;

use cisindex_cis::event::parse_amount;
use cisindex_cis::{CisEvent, LoggedEvent};
use cisindex_core::checkpoint::{CheckpointManager, Stage};
use cisindex_core::error::IndexerError;
use cisindex_core::queue::OutputQueues;
use cisindex_core::store::{Collection, Document, DocumentStore, Filter};
use cisindex_core::types::{Height, TokenAddress};

use crate::cursor::StageCursor;
use crate::records::{EventPosition, RedoRequest, TokenAccountState, TokenAddressState};

/// Token and account states keyed by document id.
#[derive(Debug, Default)]
struct Ledger {
    tokens: HashMap<String, TokenAddressState>,
    accounts: HashMap<String, TokenAccountState>,
}

impl Ledger {
    fn merge(&mut self, other: Ledger) {
        self.tokens.extend(other.tokens);
        self.accounts.extend(other.accounts);
    }

    fn clear(&mut self) {
        self.tokens.clear();
        self.accounts.clear();
    }

    fn documents(&self) -> Result<(Vec<Document>, Vec<Document>), IndexerError> {
        let tokens = self.tokens.values().map(Document::from_record).collect::<Result<_, _>>()?;
        let accounts = self
            .accounts
            .values()
            .map(Document::from_record)
            .collect::<Result<_, _>>()?;
        Ok((tokens, accounts))
    }
}

fn position(event: &LoggedEvent) -> EventPosition {
    EventPosition {
        block_height: event.block_height,
        tx_index: event.tx_index,
        ordering: event.ordering,
    }
}

fn is_new(last_applied: Option<EventPosition>, at: EventPosition) -> bool {
    last_applied.map_or(true, |last| at > last)
}

fn credit(value: &str, amount: U256) -> String {
    parse_amount(value).unwrap_or_default().saturating_add(amount).to_string()
}

fn debit(value: &str, amount: U256) -> String {
    parse_amount(value).unwrap_or_default().saturating_sub(amount).to_string()
}

/// Counts from one accounting cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub range: RangeInclusive<Height>,
    pub events: usize,
    pub tokens: usize,
    pub accounts: usize,
}

pub struct TokenAccounting {
    store: Arc<dyn DocumentStore>,
    queues: Arc<OutputQueues>,
    checkpoint: CheckpointManager,
    cursor: StageCursor,
    batch_blocks: u64,
    redo_enabled: bool,
    /// States enqueued but possibly not yet persisted.
    cache: Ledger,
    /// Height accounting stood at when redo state was last enqueued. Redo
    /// output carries no checkpoint, so only a later persisted checkpoint
    /// proves it written.
    redo_fence: Option<Height>,
}

impl TokenAccounting {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        queues: Arc<OutputQueues>,
        start_height: Height,
        batch_blocks: u64,
    ) -> Self {
        Self {
            checkpoint: CheckpointManager::new(store.clone(), Stage::TokenAccounting),
            store,
            queues,
            cursor: StageCursor::new(start_height),
            batch_blocks: batch_blocks.max(1),
            redo_enabled: true,
            cache: Ledger::default(),
            redo_fence: None,
        }
    }

    /// Also serve `token_addresses_to_redo_accounting` requests.
    pub fn with_redo(mut self, enabled: bool) -> Self {
        self.redo_enabled = enabled;
        self
    }

    pub fn last_enqueued(&self) -> Option<Height> {
        self.cursor.last_enqueued
    }

    /// Account the next range of heights behind the heartbeat checkpoint.
    ///
    /// Returns `None` when caught up.
    pub async fn run_cycle(&mut self) -> Result<Option<CycleReport>, IndexerError> {
        let persisted = self.checkpoint.load().await?;
        let fence_passed = self
            .redo_fence
            .map_or(true, |fence| persisted.is_some_and(|p| p > fence));
        if self.cursor.is_settled(persisted) && fence_passed {
            self.cache.clear();
            self.redo_fence = None;
        }

        let Some(head) = CheckpointManager::load_stage(self.store.as_ref(), Stage::Heartbeat).await? else {
            return Ok(None);
        };
        let Some(range) = self.cursor.next_range(persisted, head, self.batch_blocks) else {
            return Ok(None);
        };
        let (from, to) = (*range.start(), *range.end());

        let events = self
            .events(&Filter::height_range("block_height", from, to))
            .await?;
        let mut staged = Ledger::default();
        for event in &events {
            self.apply(&mut staged, event).await?;
        }

        let (tokens, accounts) = staged.documents()?;
        let report = CycleReport {
            range,
            events: events.len(),
            tokens: tokens.len(),
            accounts: accounts.len(),
        };
        self.queues.wait_for_capacity().await;
        self.queues.extend(Collection::TokenAddresses, tokens);
        self.queues.extend(Collection::TokenAccounts, accounts);
        self.queues.push(Collection::Helpers, self.checkpoint.document(to));
        self.cursor.advance(to);
        self.cache.merge(staged);

        tracing::debug!(
            from,
            to,
            events = report.events,
            tokens = report.tokens,
            accounts = report.accounts,
            "token accounting cycle"
        );
        Ok(Some(report))
    }

    /// Recompute every pending redo token from its full event history, up to
    /// the height accounting has reached. Returns the number of tokens redone.
    pub async fn redo_cycle(&mut self) -> Result<usize, IndexerError> {
        let requests = self
            .store
            .find(
                Collection::TokenAddressesToRedoAccounting,
                &Filter::field_equals("redo", true),
            )
            .await?;
        if requests.is_empty() {
            return Ok(0);
        }
        let persisted = self.checkpoint.load().await?;
        // The regular pass has not started; it will see the full history anyway
        let Some(limit) = [persisted, self.cursor.last_enqueued].into_iter().flatten().max() else {
            return Ok(0);
        };

        let mut redone = 0;
        for request in requests {
            let token_address = match request.id.parse::<TokenAddress>() {
                Ok(ta) => ta,
                Err(e) => {
                    tracing::warn!(id = %request.id, error = %e, "dropping malformed redo request");
                    self.queues.push(
                        Collection::TokenAddressesToRedoAccounting,
                        Document::from_record(&RedoRequest {
                            id: request.id,
                            redo: false,
                        })?,
                    );
                    continue;
                }
            };
            self.redo(&token_address, limit).await?;
            redone += 1;
        }
        Ok(redone)
    }

    async fn redo(&mut self, token_address: &TokenAddress, limit: Height) -> Result<(), IndexerError> {
        let id = token_address.to_string();
        let mut staged = Ledger::default();
        staged.tokens.insert(id.clone(), TokenAddressState::empty(token_address));

        // Every known holder starts from zero
        let holders = self
            .store
            .find(Collection::TokenAccounts, &Filter::field_equals("token_address", id.as_str()))
            .await?;
        for doc in holders {
            let account: TokenAccountState = doc.into_record()?;
            staged.accounts.insert(account.id.clone(), TokenAccountState::empty(&id, &account.owner));
        }
        for account in self.cache.accounts.values().filter(|a| a.token_address == id) {
            staged.accounts.insert(account.id.clone(), TokenAccountState::empty(&id, &account.owner));
        }

        let events = self
            .events(&Filter::field_equals("token_address", id.as_str()))
            .await?;
        let mut replayed = 0usize;
        for event in events.iter().filter(|e| e.block_height <= limit) {
            self.apply(&mut staged, event).await?;
            replayed += 1;
        }

        let (tokens, accounts) = staged.documents()?;
        let done = Document::from_record(&RedoRequest {
            id: id.clone(),
            redo: false,
        })?;
        self.queues.wait_for_capacity().await;
        self.queues.extend(Collection::TokenAddresses, tokens);
        self.queues.extend(Collection::TokenAccounts, accounts);
        self.queues.push(Collection::TokenAddressesToRedoAccounting, done);
        self.cache.merge(staged);
        self.redo_fence = Some(limit);

        tracing::info!(token_address = %id, replayed, limit, "token accounting redone");
        Ok(())
    }

    /// Persisted logged events matching `filter`, in chain order.
    async fn events(&self, filter: &Filter) -> Result<Vec<LoggedEvent>, IndexerError> {
        let mut events = self
            .store
            .find(Collection::LoggedEvents, filter)
            .await?
            .into_iter()
            .map(Document::into_record::<LoggedEvent>)
            .collect::<Result<Vec<_>, _>>()?;
        events.sort_by_key(position);
        Ok(events)
    }

    /// Apply one event to `staged`. Returns whether any state changed.
    async fn apply(&self, staged: &mut Ledger, event: &LoggedEvent) -> Result<bool, IndexerError> {
        let Some(token_address) = event.token_address.as_deref() else {
            return Ok(false);
        };
        let at = position(event);

        match &event.result {
            CisEvent::Mint { amount, owner, .. } => {
                let Some(amount) = self.amount(event, amount) else {
                    return Ok(false);
                };
                let token = self.token(staged, token_address).await?;
                if is_new(token.last_applied, at) {
                    token.token_amount = credit(&token.token_amount, amount);
                    token.last_applied = Some(at);
                }
                let account = self.account(staged, token_address, owner).await?;
                if is_new(account.last_applied, at) {
                    account.balance = credit(&account.balance, amount);
                    account.last_applied = Some(at);
                }
            }
            CisEvent::Burn { amount, owner, .. } => {
                let Some(amount) = self.amount(event, amount) else {
                    return Ok(false);
                };
                let token = self.token(staged, token_address).await?;
                if is_new(token.last_applied, at) {
                    token.token_amount = debit(&token.token_amount, amount);
                    token.last_applied = Some(at);
                }
                let account = self.account(staged, token_address, owner).await?;
                if is_new(account.last_applied, at) {
                    account.balance = debit(&account.balance, amount);
                    account.last_applied = Some(at);
                }
            }
            CisEvent::Transfer { amount, from, to, .. } => {
                if from == to {
                    return Ok(false);
                }
                let Some(amount) = self.amount(event, amount) else {
                    return Ok(false);
                };
                let sender = self.account(staged, token_address, from).await?;
                if is_new(sender.last_applied, at) {
                    sender.balance = debit(&sender.balance, amount);
                    sender.last_applied = Some(at);
                }
                let receiver = self.account(staged, token_address, to).await?;
                if is_new(receiver.last_applied, at) {
                    receiver.balance = credit(&receiver.balance, amount);
                    receiver.last_applied = Some(at);
                }
            }
            CisEvent::TokenMetadata { metadata_url, .. } => {
                let token = self.token(staged, token_address).await?;
                if is_new(token.last_applied, at) {
                    token.metadata_url = Some(metadata_url.clone());
                    token.last_applied = Some(at);
                }
            }
            CisEvent::UpdateOperator { .. } => return Ok(false),
        }
        Ok(true)
    }

    fn amount(&self, event: &LoggedEvent, amount: &str) -> Option<U256> {
        let parsed = parse_amount(amount);
        if parsed.is_none() {
            tracing::warn!(id = %event.id, amount, "unparseable token amount; event skipped");
        }
        parsed
    }

    /// The staged token state, loaded from the cache or store on first use.
    async fn token<'a>(
        &self,
        staged: &'a mut Ledger,
        token_address: &str,
    ) -> Result<&'a mut TokenAddressState, IndexerError> {
        if !staged.tokens.contains_key(token_address) {
            let state = match self.cache.tokens.get(token_address) {
                Some(state) => state.clone(),
                None => match self.store.find_one(Collection::TokenAddresses, token_address).await? {
                    Some(doc) => doc.into_record()?,
                    None => TokenAddressState::empty(&token_address.parse()?),
                },
            };
            staged.tokens.insert(token_address.to_string(), state);
        }
        staged
            .tokens
            .get_mut(token_address)
            .ok_or_else(|| IndexerError::Other(format!("token state missing for {token_address}")))
    }

    /// The staged holder state, loaded from the cache or store on first use.
    async fn account<'a>(
        &self,
        staged: &'a mut Ledger,
        token_address: &str,
        owner: &str,
    ) -> Result<&'a mut TokenAccountState, IndexerError> {
        let id = TokenAccountState::id_for(token_address, owner);
        if !staged.accounts.contains_key(&id) {
            let state = match self.cache.accounts.get(&id) {
                Some(state) => state.clone(),
                None => match self.store.find_one(Collection::TokenAccounts, &id).await? {
                    Some(doc) => doc.into_record()?,
                    None => TokenAccountState::empty(token_address, owner),
                },
            };
            staged.accounts.insert(id.clone(), state);
        }
        staged
            .accounts
            .get_mut(&id)
            .ok_or_else(|| IndexerError::Other(format!("account state missing for {id}")))
    }

    async fn tick(&mut self) -> Result<(), IndexerError> {
        while self.run_cycle().await?.is_some() {}
        if self.redo_enabled {
            self.redo_cycle().await?;
        }
        Ok(())
    }

    /// Account every `interval` until cancelled.
    pub async fn run(mut self, interval: Duration, shutdown: CancellationToken) {
        tracing::info!(
            start_height = self.cursor.start_height,
            redo = self.redo_enabled,
            "token accounting started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.tick() => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "token accounting cycle failed");
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        tracing::info!(last_enqueued = ?self.cursor.last_enqueued, "token accounting stopped");
    }
}
