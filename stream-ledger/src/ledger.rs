//! Main ledger orchestration layer
//!
//! Ties storage, replay, projection and aggregation together into a
//! high-level API for streaming balances.
//!
//! # Example
//!
//! ```no_run
//! use stream_ledger::{AccountId, Blockchain, Config, StreamLedger};
//!
//! fn main() -> stream_ledger::Result<()> {
//!     let ledger = StreamLedger::open(Config::default())?;
//!
//!     let chain = Blockchain::new("polygon");
//!     let account = AccountId::new("0xabc");
//!     ledger.recompute_account(&chain, &account)?;
//!
//!     let balances = ledger.balances_at(&chain, Some(&account), false, 1_700_000_000)?;
//!     println!("{:?}", balances);
//!     Ok(())
//! }
//! ```

use crate::{
    balances::combine_balances,
    metrics::Metrics,
    projection::{project_nonzero, project_rows},
    replay::{attribute_deposits, fold_flow_history, EdgeMap},
    types::{
        AccountId, Blockchain, DiscreteBalance, EdgeState, EventPosition, FlowChangeEvent, FlowEvent,
        FlowExtensionEvent, ProjectedEdge, RecomputeWatermark, ReportedBalance, TransferEvent,
    },
    Config, Result, Storage,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

/// Result of one account recompute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecomputeOutcome {
    /// Flow change events folded
    pub events: usize,
    /// Edge rows written
    pub edges: usize,
    /// Position of the newest folded event
    pub watermark: Option<EventPosition>,
}

/// Main ledger interface
#[derive(Debug)]
pub struct StreamLedger {
    /// Storage backend
    storage: Arc<Storage>,

    /// Metrics collector
    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl StreamLedger {
    /// Open ledger with configuration
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let metrics = Metrics::new()
            .map_err(|e| crate::Error::Other(format!("Failed to create metrics: {}", e)))?;

        Ok(Self {
            storage,
            metrics,
            config,
        })
    }

    /// Storage handle
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Store ingested flow events (changes and extensions)
    pub fn record_flow_events(&self, events: &[FlowEvent]) -> Result<()> {
        let mut changes: Vec<FlowChangeEvent> = Vec::new();
        let mut extensions: Vec<FlowExtensionEvent> = Vec::new();

        for event in events {
            match event {
                FlowEvent::Change(change) => changes.push(change.clone()),
                FlowEvent::Extension(extension) => extensions.push(extension.clone()),
            }
        }

        self.storage.put_flow_events(&changes)?;
        self.storage.put_extension_events(&extensions)?;
        Ok(())
    }

    /// Apply a discrete transfer, mint or burn
    pub fn apply_transfer(&self, transfer: &TransferEvent) -> Result<bool> {
        self.storage.apply_transfer(transfer)
    }

    /// Derive an account's edge state from its full history without storing it
    pub fn rebuild_account_edges(
        &self,
        blockchain: &Blockchain,
        account: &AccountId,
    ) -> Result<EdgeMap> {
        let events = self.storage.account_flow_events(blockchain, account)?;
        self.derive_edges(account, &events)
    }

    fn derive_edges(&self, account: &AccountId, events: &[FlowChangeEvent]) -> Result<EdgeMap> {
        let mut edges = fold_flow_history(account, events)?;
        attribute_deposits(account, &mut edges, |parent| {
            self.storage.find_extension(parent, account)
        })?;
        Ok(edges)
    }

    /// Recompute and replace every edge row of an account from scratch
    ///
    /// Nothing is written until the whole fold succeeds; the rows and the
    /// watermark land in one atomic batch.
    pub fn recompute_account(
        &self,
        blockchain: &Blockchain,
        account: &AccountId,
    ) -> Result<RecomputeOutcome> {
        let started = Instant::now();

        let events = self.storage.account_flow_events(blockchain, account)?;
        let edges = self.derive_edges(account, &events)?;
        let states: Vec<EdgeState> = edges.into_values().collect();

        let watermark = events.last().map(|event| RecomputeWatermark {
            position: event.position(),
            recomputed_at: Utc::now(),
        });

        self.storage
            .replace_edge_states(blockchain, account, &states, watermark.as_ref())?;

        let elapsed = started.elapsed().as_secs_f64();
        self.metrics.record_recompute(states.len(), elapsed);

        tracing::debug!(
            blockchain = %blockchain,
            account = %account,
            events = events.len(),
            edges = states.len(),
            elapsed_ms = elapsed * 1000.0,
            "Account recomputed"
        );

        Ok(RecomputeOutcome {
            events: events.len(),
            edges: states.len(),
            watermark: watermark.map(|w| w.position),
        })
    }

    /// Stored edges projected to `at`, ordered by account then edge
    ///
    /// Rows that cannot be projected are logged and left out.
    pub fn stream_balances_at(
        &self,
        blockchain: &Blockchain,
        account: Option<&AccountId>,
        at: i64,
    ) -> Result<Vec<ProjectedEdge>> {
        let rows = self.edge_rows(blockchain, account)?;
        Ok(project_rows(rows.iter().map(|(owner, state)| (owner, state)), at))
    }

    /// Discrete plus streaming balance per account at `at`
    pub fn balances_at(
        &self,
        blockchain: &Blockchain,
        account: Option<&AccountId>,
        reverse: bool,
        at: i64,
    ) -> Result<Vec<ReportedBalance>> {
        let discrete = match account {
            Some(account) => vec![DiscreteBalance {
                account: account.clone(),
                balance: self.storage.get_discrete_balance(blockchain, account)?,
            }],
            None => self.storage.chain_discrete_balances(blockchain)?,
        };

        let rows = self.edge_rows(blockchain, account)?;
        let streams = project_nonzero(rows.iter().map(|(owner, state)| (owner, state)), at);

        Ok(combine_balances(&discrete, &streams, reverse))
    }

    fn edge_rows(
        &self,
        blockchain: &Blockchain,
        account: Option<&AccountId>,
    ) -> Result<Vec<(AccountId, EdgeState)>> {
        match account {
            Some(account) => Ok(self
                .storage
                .account_edge_states(blockchain, account)?
                .into_iter()
                .map(|state| (account.clone(), state))
                .collect()),
            None => self.storage.chain_edge_states(blockchain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Amount, EdgeId};
    use num_traits::Zero;

    fn create_test_ledger() -> (StreamLedger, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (StreamLedger::open(config).unwrap(), temp_dir)
    }

    fn chain() -> Blockchain {
        Blockchain::new("polygon")
    }

    fn flow(from: &str, to: &str, rate: i64, timestamp: i64, height: u64, log_index: u32) -> FlowEvent {
        FlowEvent::Change(FlowChangeEvent {
            blockchain: chain(),
            from: AccountId::new(from),
            to: AccountId::new(to),
            flow_rate: Amount::from(rate),
            timestamp,
            height,
            log_index,
            transaction: format!("0xtx{}", height),
        })
    }

    fn deposit(operator: &str, amount: i64, height: u64, log_index: u32) -> FlowEvent {
        FlowEvent::Extension(FlowExtensionEvent {
            blockchain: chain(),
            flow_operator: AccountId::new(operator),
            deposit: Amount::from(amount),
            height,
            log_index,
            transaction: format!("0xtx{}", height),
            parent: None,
        })
    }

    #[test]
    fn test_recompute_open_and_close() {
        let (ledger, _temp) = create_test_ledger();
        ledger
            .record_flow_events(&[flow("A", "B", 10, 0, 1, 0), flow("A", "B", 0, 100, 2, 0)])
            .unwrap();

        let a = AccountId::new("A");
        let b = AccountId::new("B");
        let outcome = ledger.recompute_account(&chain(), &a).unwrap();
        assert_eq!(outcome.events, 2);
        assert_eq!(outcome.edges, 1);
        assert_eq!(outcome.watermark, Some(EventPosition::new(2, 0)));
        ledger.recompute_account(&chain(), &b).unwrap();

        let a_edges = ledger.stream_balances_at(&chain(), Some(&a), 500).unwrap();
        let b_edges = ledger.stream_balances_at(&chain(), Some(&b), 500).unwrap();
        assert_eq!(a_edges[0].balance, Amount::from(-1000));
        assert_eq!(b_edges[0].balance, Amount::from(1000));
        assert_eq!(a_edges[0].state.edge_id, EdgeId::new(&a, &b));
        assert_eq!(ledger.metrics().recomputes_total.get(), 2);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let (ledger, _temp) = create_test_ledger();
        ledger
            .record_flow_events(&[
                flow("A", "B", 10, 0, 1, 0),
                deposit("A", 50, 1, 1),
                flow("C", "A", 3, 40, 2, 0),
            ])
            .unwrap();
        let a = AccountId::new("A");

        ledger.recompute_account(&chain(), &a).unwrap();
        let first = ledger.storage().account_edge_states(&chain(), &a).unwrap();
        ledger.recompute_account(&chain(), &a).unwrap();
        let second = ledger.storage().account_edge_states(&chain(), &a).unwrap();

        assert_eq!(
            bincode::serialize(&first).unwrap(),
            bincode::serialize(&second).unwrap()
        );
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_deposit_attribution_end_to_end() {
        let (ledger, _temp) = create_test_ledger();
        ledger
            .record_flow_events(&[flow("A", "B", 10, 0, 9, 5), deposit("A", 250, 9, 6)])
            .unwrap();

        let a = AccountId::new("A");
        let b = AccountId::new("B");
        ledger.recompute_account(&chain(), &a).unwrap();
        ledger.recompute_account(&chain(), &b).unwrap();

        let a_rows = ledger.storage().account_edge_states(&chain(), &a).unwrap();
        let b_rows = ledger.storage().account_edge_states(&chain(), &b).unwrap();
        assert_eq!(a_rows[0].deposit, Amount::from(250));
        assert!(b_rows[0].deposit.is_zero());
    }

    #[test]
    fn test_combined_balance() {
        let (ledger, _temp) = create_test_ledger();
        let t0 = 1_000;
        ledger
            .record_flow_events(&[flow("D", "C", 2, t0, 1, 0)])
            .unwrap();
        ledger
            .apply_transfer(&TransferEvent {
                blockchain: chain(),
                from: None,
                to: Some(AccountId::new("C")),
                amount: Amount::from(500),
                height: 1,
                log_index: 3,
                transaction: "0xmint".to_string(),
            })
            .unwrap();

        let c = AccountId::new("C");
        let d = AccountId::new("D");
        ledger.recompute_account(&chain(), &c).unwrap();
        ledger.recompute_account(&chain(), &d).unwrap();

        let single = ledger.balances_at(&chain(), Some(&c), false, t0 + 50).unwrap();
        assert_eq!(single[0].balance, Amount::from(600));

        let all = ledger.balances_at(&chain(), None, true, t0 + 50).unwrap();
        let summary: Vec<(String, Amount)> = all
            .iter()
            .map(|b| (b.account.to_string(), b.balance.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("C".to_string(), Amount::from(600)),
                ("D".to_string(), Amount::from(-100)),
            ]
        );
    }

    #[test]
    fn test_rebuild_does_not_persist() {
        let (ledger, _temp) = create_test_ledger();
        ledger
            .record_flow_events(&[flow("A", "B", 10, 0, 1, 0)])
            .unwrap();
        let a = AccountId::new("A");

        let edges = ledger.rebuild_account_edges(&chain(), &a).unwrap();
        assert_eq!(edges.len(), 1);
        assert!(ledger
            .storage()
            .account_edge_states(&chain(), &a)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_account_without_history() {
        let (ledger, _temp) = create_test_ledger();
        let outcome = ledger
            .recompute_account(&chain(), &AccountId::new("nobody"))
            .unwrap();
        assert_eq!(outcome.edges, 0);
        assert_eq!(outcome.watermark, None);
        assert!(ledger
            .storage()
            .get_watermark(&chain(), &AccountId::new("nobody"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_restored_event_leaves_old_payer_clean() {
        let (ledger, _temp) = create_test_ledger();
        let a = AccountId::new("A");
        ledger.record_flow_events(&[flow("A", "B", 10, 0, 1, 0)]).unwrap();
        ledger.recompute_account(&chain(), &a).unwrap();

        // Same position re-ingested with a different payer
        ledger.record_flow_events(&[flow("X", "B", 10, 0, 1, 0)]).unwrap();
        let outcome = ledger.recompute_account(&chain(), &a).unwrap();
        assert_eq!(outcome.edges, 0);
        assert!(ledger
            .stream_balances_at(&chain(), Some(&a), 50)
            .unwrap()
            .is_empty());
        assert_eq!(ledger.recompute_account(&chain(), &AccountId::new("X")).unwrap().edges, 1);
    }

    fn mint(to: &str, amount: i64, height: u64) -> TransferEvent {
        TransferEvent {
            blockchain: chain(),
            from: None,
            to: Some(AccountId::new(to)),
            amount: Amount::from(amount),
            height,
            log_index: 0,
            transaction: format!("0xmint{}", height),
        }
    }

    #[test]
    fn test_bad_edge_does_not_hide_other_balances() {
        let (ledger, _temp) = create_test_ledger();
        let mut fast = flow("A", "B", 0, 0, 1, 0);
        if let FlowEvent::Change(change) = &mut fast {
            change.flow_rate = "1000000000000000000000".parse().unwrap();
        }
        ledger
            .record_flow_events(&[fast, flow("P", "Q", 1, i64::MIN, 2, 0)])
            .unwrap();
        ledger.apply_transfer(&mint("C", 500, 3)).unwrap();
        for id in ["A", "B", "P", "Q"] {
            ledger.recompute_account(&chain(), &AccountId::new(id)).unwrap();
        }

        // P and Q settled at i64::MIN; projecting them to any later time overflows
        let now = 100_000_000;
        let streams = ledger.stream_balances_at(&chain(), None, now).unwrap();
        let owners: Vec<&str> = streams.iter().map(|e| e.account.as_str()).collect();
        assert_eq!(owners, vec!["A", "B"]);

        let all = ledger.balances_at(&chain(), None, true, now).unwrap();
        let expected: Amount = "100000000000000000000000000000".parse().unwrap();
        let summary: Vec<(String, Amount)> = all
            .iter()
            .map(|b| (b.account.to_string(), b.balance.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("B".to_string(), expected.clone()),
                ("C".to_string(), Amount::from(500)),
                ("A".to_string(), -expected),
            ]
        );

        let single = ledger
            .balances_at(&chain(), Some(&AccountId::new("P")), false, now)
            .unwrap();
        assert!(single.is_empty());
    }
}
