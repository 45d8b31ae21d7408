//! Single-writer replay worker
//!
//! One Tokio task owns the queue drain and every recompute, so at most one
//! account is being replayed at any time and the edge-state store has a
//! single writer.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │               WorkerHandle (Clone)                    │
//! │    drain_now / reconcile_now / wake / shutdown       │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              ReplayWorker (Single Task)               │
//! │  poll timer      → drain batch → recompute accounts  │
//! │  reconcile timer → re-enqueue stale accounts         │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ spawn_blocking
//!                       ▼
//!            StreamLedger::recompute_account()
//! ```
//!
//! A task is acknowledged after one attempt whether or not its recompute
//! succeeded. Failures are logged, counted and left to reconciliation.

use crate::{
    config::WorkerConfig,
    queue::{DrainedTask, WorkQueue},
    scheduler::DirtyAccountScheduler,
    Error, Result,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use stream_ledger::{AccountId, Blockchain, StreamLedger};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// Summary of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Tasks taken from the queue
    pub tasks: usize,
    /// Distinct accounts after dedup
    pub accounts: usize,
    /// Successful recomputes
    pub recomputed: usize,
    /// Failed recomputes
    pub failed: usize,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.tasks += other.tasks;
        self.accounts += other.accounts;
        self.recomputed += other.recomputed;
        self.failed += other.failed;
    }
}

/// Running totals, readable without a round trip to the worker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStatus {
    /// Drain passes that found work
    pub batches: u64,
    /// Tasks acknowledged
    pub tasks_acked: u64,
    /// Successful recomputes
    pub recomputed: u64,
    /// Failed recomputes
    pub failed: u64,
    /// Last account that failed to recompute
    pub last_failure: Option<(Blockchain, AccountId)>,
    /// Time of the last drain that found work
    pub last_drain_at: Option<DateTime<Utc>>,
}

/// Message sent to the replay worker
#[derive(Debug)]
pub enum WorkerMessage {
    /// Drain until the queue is empty
    DrainNow {
        response: oneshot::Sender<Result<DrainReport>>,
    },

    /// Reconcile every known blockchain
    Reconcile {
        response: oneshot::Sender<Result<usize>>,
    },

    /// Drain soon; no reply
    Wake,

    /// Stop after the current pass
    Shutdown { response: oneshot::Sender<()> },
}

/// Actor that drains the queue and replays accounts
pub struct ReplayWorker {
    ledger: Arc<StreamLedger>,
    queue: Arc<dyn WorkQueue>,
    scheduler: Arc<DirtyAccountScheduler>,
    mailbox: mpsc::Receiver<WorkerMessage>,
    config: WorkerConfig,
    status: Arc<RwLock<WorkerStatus>>,
}

impl std::fmt::Debug for ReplayWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayWorker")
            .field("config", &self.config)
            .field("status", &*self.status.read())
            .finish()
    }
}

impl ReplayWorker {
    /// Create worker
    pub fn new(
        ledger: Arc<StreamLedger>,
        queue: Arc<dyn WorkQueue>,
        scheduler: Arc<DirtyAccountScheduler>,
        mailbox: mpsc::Receiver<WorkerMessage>,
        config: WorkerConfig,
        status: Arc<RwLock<WorkerStatus>>,
    ) -> Self {
        Self {
            ledger,
            queue,
            scheduler,
            mailbox,
            config,
            status,
        }
    }

    /// Run the worker event loop
    pub async fn run(mut self) {
        // Both timers first fire one full period after start
        let poll_period = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let mut poll_timer = interval_at(Instant::now() + poll_period, poll_period);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reconcile_enabled = self.config.reconcile_interval_secs > 0;
        let reconcile_period = Duration::from_secs(self.config.reconcile_interval_secs.max(1));
        let mut reconcile_timer = interval_at(Instant::now() + reconcile_period, reconcile_period);
        reconcile_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            reconcile_interval_secs = self.config.reconcile_interval_secs,
            "Replay worker started"
        );

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => {
                    match msg {
                        Some(WorkerMessage::DrainNow { response }) => {
                            let _ = response.send(self.drain_until_empty().await);
                        }
                        Some(WorkerMessage::Reconcile { response }) => {
                            let _ = response.send(self.reconcile_all().await);
                        }
                        Some(WorkerMessage::Wake) => {
                            self.drain_logged().await;
                        }
                        Some(WorkerMessage::Shutdown { response }) => {
                            let _ = response.send(());
                            break;
                        }
                        // Every handle dropped
                        None => break,
                    }
                }

                _ = poll_timer.tick() => {
                    self.drain_logged().await;
                }

                _ = reconcile_timer.tick(), if reconcile_enabled => {
                    if let Err(e) = self.reconcile_all().await {
                        tracing::error!(error = %e, "Reconciliation failed");
                    }
                }
            }
        }

        tracing::info!("Replay worker stopped");
    }

    async fn drain_logged(&self) {
        if let Err(e) = self.drain_until_empty().await {
            tracing::error!(error = %e, "Queue drain failed");
        }
    }

    /// Drain batches until one comes back short
    async fn drain_until_empty(&self) -> Result<DrainReport> {
        let mut total = DrainReport::default();
        loop {
            let report = self.drain_batch().await?;
            total.absorb(report);
            if report.tasks < self.config.batch_size {
                return Ok(total);
            }
        }
    }

    /// Drain one batch, recompute each distinct account, acknowledge all
    async fn drain_batch(&self) -> Result<DrainReport> {
        let tasks = self.queue.drain(self.config.batch_size).await?;
        if tasks.is_empty() {
            return Ok(DrainReport::default());
        }

        let accounts = distinct_accounts(&tasks);
        let mut report = DrainReport {
            tasks: tasks.len(),
            accounts: accounts.len(),
            ..DrainReport::default()
        };
        let mut last_failure = None;

        for (blockchain, account) in accounts {
            match self.recompute(&blockchain, &account).await {
                Ok(()) => report.recomputed += 1,
                Err(e) => {
                    tracing::error!(
                        blockchain = %blockchain,
                        account = %account,
                        error = %e,
                        "Account recompute failed"
                    );
                    self.ledger.metrics().record_recompute_failure();
                    report.failed += 1;
                    last_failure = Some((blockchain, account));
                }
            }
        }

        self.queue.ack(&tasks).await?;
        self.ledger.metrics().record_drained(tasks.len());

        {
            let mut status = self.status.write();
            status.batches += 1;
            status.tasks_acked += tasks.len() as u64;
            status.recomputed += report.recomputed as u64;
            status.failed += report.failed as u64;
            status.last_drain_at = Some(Utc::now());
            if last_failure.is_some() {
                status.last_failure = last_failure;
            }
        }

        tracing::debug!(
            tasks = report.tasks,
            accounts = report.accounts,
            failed = report.failed,
            "Drained queue batch"
        );

        Ok(report)
    }

    async fn recompute(&self, blockchain: &Blockchain, account: &AccountId) -> Result<()> {
        let ledger = self.ledger.clone();
        let blockchain = blockchain.clone();
        let account = account.clone();

        tokio::task::spawn_blocking(move || ledger.recompute_account(&blockchain, &account))
            .await??;
        Ok(())
    }

    async fn reconcile_all(&self) -> Result<usize> {
        let mut stale = 0;
        for blockchain in self.scheduler.known_chains()? {
            stale += self.scheduler.reconcile(&blockchain).await?.len();
        }
        Ok(stale)
    }
}

/// Distinct `(blockchain, account)` pairs, account taken from the task id
fn distinct_accounts(tasks: &[DrainedTask]) -> BTreeSet<(Blockchain, AccountId)> {
    tasks
        .iter()
        .map(|t| (t.task.payload.blockchain.clone(), t.task.id.account.clone()))
        .collect()
}

/// Handle for sending messages to the worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    sender: mpsc::Sender<WorkerMessage>,
    status: Arc<RwLock<WorkerStatus>>,
}

impl WorkerHandle {
    /// Drain the queue now and wait for the report
    pub async fn drain_now(&self) -> Result<DrainReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WorkerMessage::DrainNow { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Worker mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Reconcile every known blockchain; returns stale accounts enqueued
    pub async fn reconcile_now(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WorkerMessage::Reconcile { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Worker mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Ask for a drain without waiting; dropped if the mailbox is full
    pub fn wake(&self) {
        let _ = self.sender.try_send(WorkerMessage::Wake);
    }

    /// Snapshot of running totals
    pub fn status(&self) -> WorkerStatus {
        self.status.read().clone()
    }

    /// Stop the worker and wait for it to acknowledge
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WorkerMessage::Shutdown { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Worker mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }
}

/// Spawn the replay worker
pub fn spawn_worker(
    ledger: Arc<StreamLedger>,
    queue: Arc<dyn WorkQueue>,
    scheduler: Arc<DirtyAccountScheduler>,
    config: WorkerConfig,
) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let status = Arc::new(RwLock::new(WorkerStatus::default()));
    let worker = ReplayWorker::new(ledger, queue, scheduler, rx, config, status.clone());

    tokio::spawn(async move {
        worker.run().await;
    });

    WorkerHandle { sender: tx, status }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskQueue;
    use std::collections::BTreeMap;
    use stream_ledger::{Amount, Config, EdgeId, FlowChangeEvent, FlowEvent};
    use tempfile::TempDir;

    struct Fixture {
        ledger: Arc<StreamLedger>,
        queue: Arc<TaskQueue>,
        scheduler: Arc<DirtyAccountScheduler>,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        let ledger = Arc::new(StreamLedger::open(config).unwrap());
        let queue = Arc::new(TaskQueue::new(ledger.storage().clone()));

        let mut contracts = BTreeMap::new();
        contracts.insert("polygon".to_string(), "0xCFA".to_string());
        let scheduler = Arc::new(DirtyAccountScheduler::new(
            ledger.storage().clone(),
            queue.clone(),
            ledger.metrics().clone(),
            contracts,
        ));

        Fixture {
            ledger,
            queue,
            scheduler,
            _temp: temp,
        }
    }

    fn worker_config(batch_size: usize) -> WorkerConfig {
        WorkerConfig {
            batch_size,
            // Long enough that tests drive draining explicitly
            poll_interval_ms: 3_600_000,
            reconcile_interval_secs: 0,
            mailbox_capacity: 8,
        }
    }

    fn spawn(f: &Fixture, batch_size: usize) -> WorkerHandle {
        spawn_worker(
            f.ledger.clone(),
            f.queue.clone(),
            f.scheduler.clone(),
            worker_config(batch_size),
        )
    }

    fn change_on(
        chain: &str,
        from: &str,
        to: &str,
        rate: i64,
        timestamp: i64,
        height: u64,
    ) -> FlowEvent {
        FlowEvent::Change(FlowChangeEvent {
            blockchain: Blockchain::new(chain),
            from: AccountId::new(from),
            to: AccountId::new(to),
            flow_rate: Amount::from(rate),
            timestamp,
            height,
            log_index: 0,
            transaction: format!("0x{}", height),
        })
    }

    fn change(from: &str, to: &str, rate: i64, timestamp: i64, height: u64) -> FlowEvent {
        change_on("polygon", from, to, rate, timestamp, height)
    }

    #[tokio::test]
    async fn test_drain_recomputes_both_sides() {
        let f = fixture();
        let events = vec![change("0xA", "0xB", 10, 0, 1), change("0xA", "0xB", 0, 100, 2)];
        f.ledger.record_flow_events(&events).unwrap();
        f.scheduler.on_flow_events_ingested(&events).await.unwrap();

        let handle = spawn(&f, 10);
        let report = handle.drain_now().await.unwrap();
        assert_eq!(report.tasks, 2);
        assert_eq!(report.recomputed, 2);
        assert_eq!(report.failed, 0);
        assert!(f.queue.is_empty().await.unwrap());

        let chain = Blockchain::new("polygon");
        let a_rows = f
            .ledger
            .storage()
            .account_edge_states(&chain, &AccountId::new("0xA"))
            .unwrap();
        let b_rows = f
            .ledger
            .storage()
            .account_edge_states(&chain, &AccountId::new("0xB"))
            .unwrap();
        assert_eq!(a_rows[0].edge_id, EdgeId::new(&AccountId::new("0xA"), &AccountId::new("0xB")));
        assert_eq!(a_rows[0].static_balance, Amount::from(-1000));
        assert_eq!(b_rows[0].static_balance, Amount::from(1000));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_tasks_recompute_once() {
        let f = fixture();
        let events = vec![change("0xA", "0xB", 10, 0, 1)];
        f.ledger.record_flow_events(&events).unwrap();
        f.scheduler.on_flow_events_ingested(&events).await.unwrap();
        f.scheduler.on_flow_events_ingested(&events).await.unwrap();
        assert_eq!(f.queue.len().await.unwrap(), 4);

        let handle = spawn(&f, 10);
        let report = handle.drain_now().await.unwrap();
        assert_eq!(report.tasks, 4);
        assert_eq!(report.accounts, 2);
        assert_eq!(f.ledger.metrics().recomputes_total.get(), 2);

        let status = handle.status();
        assert_eq!(status.tasks_acked, 4);
        assert_eq!(status.recomputed, 2);
        assert!(status.last_drain_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_acked() {
        let f = fixture();
        // 0xX -> 0xY cannot replay: the gap between its timestamps overflows
        let events = vec![
            change("0xA", "0xB", 10, 0, 1),
            change("0xX", "0xY", 1, i64::MIN, 10),
            change("0xX", "0xY", 0, i64::MAX, 11),
        ];
        f.ledger.record_flow_events(&events).unwrap();
        f.scheduler.on_flow_events_ingested(&events).await.unwrap();

        let handle = spawn(&f, 10);
        let report = handle.drain_now().await.unwrap();
        assert_eq!(report.accounts, 4);
        assert_eq!(report.recomputed, 2);
        assert_eq!(report.failed, 2);
        assert!(f.queue.is_empty().await.unwrap());
        assert_eq!(f.ledger.metrics().recompute_failures_total.get(), 2);

        let chain = Blockchain::new("polygon");
        assert_eq!(
            handle.status().last_failure,
            Some((chain.clone(), AccountId::new("0xY")))
        );

        // The healthy accounts were still written; the failed ones left no rows
        assert_eq!(
            f.ledger
                .storage()
                .account_edge_states(&chain, &AccountId::new("0xA"))
                .unwrap()
                .len(),
            1
        );
        assert!(f
            .ledger
            .storage()
            .account_edge_states(&chain, &AccountId::new("0xX"))
            .unwrap()
            .is_empty());

        // Reconciliation picks the failed accounts back up
        assert_eq!(handle.reconcile_now().await.unwrap(), 2);
        assert_eq!(f.queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reconcile_covers_chains_without_contract() {
        let f = fixture();
        let events = vec![change_on("base", "0xA", "0xB", 1, 0, 1)];
        f.ledger.record_flow_events(&events).unwrap();

        let handle = spawn(&f, 10);
        assert_eq!(handle.reconcile_now().await.unwrap(), 2);
        let report = handle.drain_now().await.unwrap();
        assert_eq!(report.recomputed, 2);
        assert_eq!(handle.reconcile_now().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drains_across_multiple_batches() {
        let f = fixture();
        let events: Vec<FlowEvent> = (0..5)
            .map(|i| change("0xA", &format!("0xB{}", i), 1, 0, i + 1))
            .collect();
        f.ledger.record_flow_events(&events).unwrap();
        f.scheduler.on_flow_events_ingested(&events).await.unwrap();

        let handle = spawn(&f, 2);
        let report = handle.drain_now().await.unwrap();
        assert_eq!(report.tasks, 6);
        assert!(f.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_poll_timer_drains() {
        let f = fixture();
        let events = vec![change("0xA", "0xB", 10, 0, 1)];
        f.ledger.record_flow_events(&events).unwrap();
        f.scheduler.on_flow_events_ingested(&events).await.unwrap();

        let mut config = worker_config(10);
        config.poll_interval_ms = 20;
        let handle = spawn_worker(f.ledger.clone(), f.queue.clone(), f.scheduler.clone(), config);

        for _ in 0..250 {
            if handle.status().recomputed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.status().recomputed, 2);
        assert!(f.queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_handle_errors_after_shutdown() {
        let f = fixture();
        let handle = spawn(&f, 10);
        handle.shutdown().await.unwrap();
        tokio::task::yield_now().await;

        assert!(matches!(
            handle.drain_now().await,
            Err(Error::Concurrency(_))
        ));
    }
}
