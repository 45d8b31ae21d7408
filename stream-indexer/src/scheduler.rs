//! Dirty-account scheduler
//!
//! Turns ingested flow events into recompute tasks:
//! - every flow change marks `from` and `to` dirty
//! - every flow extension marks its operator dirty
//! - one task per distinct `(blockchain, account)` per batch, all sharing the
//!   batch's enqueue timestamp
//!
//! Bootstrap enqueues every account of a blockchain's flow log once, when the
//! chain's stream contract is first indexed. Reconciliation re-enqueues
//! accounts whose last successful recompute is behind their newest event.

use crate::{
    queue::{Task, WorkQueue},
    Result,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use stream_ledger::{AccountId, Blockchain, FlowEvent, Metrics, Storage};
use tracing::{debug, info};

/// Outcome of a first-indexed notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Account is not the chain's stream contract
    NotStreamContract,
    /// Chain was bootstrapped before
    AlreadyBootstrapped,
    /// Full flow log scanned; this many accounts enqueued
    Enqueued(usize),
}

/// Dirty-account scheduler
pub struct DirtyAccountScheduler {
    storage: Arc<Storage>,
    queue: Arc<dyn WorkQueue>,
    metrics: Metrics,

    /// Stream contract address per blockchain
    stream_contracts: BTreeMap<String, String>,

    /// Last enqueue timestamp handed out (unix millis)
    last_enqueued_at: Mutex<i64>,
}

impl std::fmt::Debug for DirtyAccountScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirtyAccountScheduler")
            .field("stream_contracts", &self.stream_contracts)
            .finish()
    }
}

impl DirtyAccountScheduler {
    /// Create scheduler
    pub fn new(
        storage: Arc<Storage>,
        queue: Arc<dyn WorkQueue>,
        metrics: Metrics,
        stream_contracts: BTreeMap<String, String>,
    ) -> Self {
        Self {
            storage,
            queue,
            metrics,
            stream_contracts,
            last_enqueued_at: Mutex::new(0),
        }
    }

    /// Enqueue one task per distinct account touched by the batch
    pub async fn on_flow_events_ingested(&self, events: &[FlowEvent]) -> Result<usize> {
        let dirty: BTreeSet<(Blockchain, AccountId)> = events
            .iter()
            .flat_map(|event| {
                let blockchain = event.blockchain().clone();
                event
                    .affected_accounts()
                    .into_iter()
                    .map(move |account| (blockchain.clone(), account.clone()))
            })
            .collect();

        let count = self.enqueue_accounts(dirty).await?;
        debug!(events = events.len(), accounts = count, "Dirty accounts enqueued");
        Ok(count)
    }

    /// Bootstrap a chain when its stream contract is first indexed
    pub async fn on_account_first_indexed(
        &self,
        blockchain: &Blockchain,
        account: &AccountId,
    ) -> Result<BootstrapOutcome> {
        let is_contract = self
            .stream_contracts
            .get(blockchain.as_str())
            .map_or(false, |contract| contract.eq_ignore_ascii_case(account.as_str()));
        if !is_contract {
            return Ok(BootstrapOutcome::NotStreamContract);
        }

        let marker = bootstrap_marker(blockchain);
        if self.storage.get_meta(&marker)?.is_some() {
            debug!(blockchain = %blockchain, "Bootstrap already done");
            return Ok(BootstrapOutcome::AlreadyBootstrapped);
        }

        let accounts = self.storage.chain_flow_accounts(blockchain)?;
        let count = self
            .enqueue_accounts(accounts.into_iter().map(|a| (blockchain.clone(), a)))
            .await?;

        // Marker after enqueue: a crash in between only repeats the bootstrap
        let at = Utc::now().to_rfc3339();
        self.storage.put_meta(&marker, at.as_bytes())?;

        info!(blockchain = %blockchain, accounts = count, "Stream contract bootstrap enqueued");
        Ok(BootstrapOutcome::Enqueued(count))
    }

    /// Re-enqueue accounts whose watermark is missing or behind their history
    pub async fn reconcile(&self, blockchain: &Blockchain) -> Result<Vec<AccountId>> {
        let mut stale = Vec::new();

        for account in self.storage.chain_flow_accounts(blockchain)? {
            let latest = self.storage.latest_account_position(blockchain, &account)?;
            let watermark = self.storage.get_watermark(blockchain, &account)?;

            let behind = match (latest, watermark) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(latest), Some(mark)) => mark.position < latest,
            };
            if behind {
                stale.push(account);
            }
        }

        if !stale.is_empty() {
            self.enqueue_accounts(stale.iter().map(|a| (blockchain.clone(), a.clone())))
                .await?;
            info!(blockchain = %blockchain, stale = stale.len(), "Stale accounts re-enqueued");
        }

        Ok(stale)
    }

    /// Chains to reconcile: every configured chain plus any chain with
    /// indexed flow history
    pub fn known_chains(&self) -> Result<BTreeSet<Blockchain>> {
        let mut chains: BTreeSet<Blockchain> =
            self.stream_contracts.keys().map(Blockchain::new).collect();
        chains.extend(self.storage.flow_chains()?);
        Ok(chains)
    }

    async fn enqueue_accounts<I>(&self, accounts: I) -> Result<usize>
    where
        I: IntoIterator<Item = (Blockchain, AccountId)>,
    {
        let enqueued_at = self.next_timestamp();
        let tasks: Vec<Task> = accounts
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|(blockchain, account)| Task::new(blockchain, account, enqueued_at))
            .collect();

        if tasks.is_empty() {
            return Ok(0);
        }

        self.queue.enqueue(&tasks).await?;
        self.metrics.record_enqueued(tasks.len());
        Ok(tasks.len())
    }

    /// Wall-clock millis, strictly increasing across batches
    fn next_timestamp(&self) -> i64 {
        let mut last = self.last_enqueued_at.lock();
        let now = Utc::now().timestamp_millis().max(*last + 1);
        *last = now;
        now
    }
}

fn bootstrap_marker(blockchain: &Blockchain) -> String {
    format!("bootstrap/{}", blockchain)
}
