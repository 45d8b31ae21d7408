//! Indexer facade
//!
//! Wires the ledger, queue, scheduler and replay worker together and exposes
//! the read API plus the ingestion hooks.
//!
//! # Example
//!
//! ```no_run
//! use stream_indexer::{IndexerConfig, StreamIndexer};
//! use stream_ledger::{Blockchain, Pagination};
//!
//! #[tokio::main]
//! async fn main() -> stream_indexer::Result<()> {
//!     let indexer = StreamIndexer::open(IndexerConfig::default())?;
//!     let worker = indexer.start_worker();
//!
//!     let chain = Blockchain::new("polygon");
//!     let top = indexer.get_balances(&chain, None, Pagination::default(), true)?;
//!     println!("{:?}", top);
//!
//!     worker.shutdown().await?;
//!     Ok(())
//! }
//! ```

use crate::{
    config::IndexerConfig,
    queue::{TaskQueue, WorkQueue},
    scheduler::{BootstrapOutcome, DirtyAccountScheduler},
    worker::{spawn_worker, WorkerHandle},
    Result,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use stream_ledger::{
    AccountId, Blockchain, FlowEvent, Pagination, ProjectedEdge, ReportedBalance, StreamLedger,
    TransferEvent,
};

/// Streaming balance indexer
pub struct StreamIndexer {
    ledger: Arc<StreamLedger>,
    queue: Arc<dyn WorkQueue>,
    scheduler: Arc<DirtyAccountScheduler>,
    config: IndexerConfig,

    /// Running worker, if started
    worker: Mutex<Option<WorkerHandle>>,
}

impl std::fmt::Debug for StreamIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIndexer")
            .field("ledger", &self.ledger)
            .field("config", &self.config)
            .finish()
    }
}

impl StreamIndexer {
    /// Open ledger storage and build the pipeline (worker not started)
    pub fn open(config: IndexerConfig) -> Result<Self> {
        config.validate()?;

        let ledger = Arc::new(StreamLedger::open(config.ledger.clone())?);
        let queue: Arc<dyn WorkQueue> = Arc::new(TaskQueue::new(ledger.storage().clone()));
        let scheduler = Arc::new(DirtyAccountScheduler::new(
            ledger.storage().clone(),
            queue.clone(),
            ledger.metrics().clone(),
            config.stream_contracts.clone(),
        ));

        tracing::info!(
            data_dir = %config.ledger.data_dir.display(),
            chains = config.stream_contracts.len(),
            "Stream indexer opened"
        );

        Ok(Self {
            ledger,
            queue,
            scheduler,
            config,
            worker: Mutex::new(None),
        })
    }

    /// Spawn the replay worker, or return the one already running
    pub fn start_worker(&self) -> WorkerHandle {
        let mut worker = self.worker.lock();
        worker
            .get_or_insert_with(|| {
                spawn_worker(
                    self.ledger.clone(),
                    self.queue.clone(),
                    self.scheduler.clone(),
                    self.config.worker.clone(),
                )
            })
            .clone()
    }

    /// Underlying ledger
    pub fn ledger(&self) -> &Arc<StreamLedger> {
        &self.ledger
    }

    /// Work queue
    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    /// Configuration
    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    // Ingestion hooks

    /// Schedule recomputes for events already stored upstream
    pub async fn on_flow_events_ingested(&self, events: &[FlowEvent]) -> Result<()> {
        self.scheduler.on_flow_events_ingested(events).await?;
        Ok(())
    }

    /// Store flow events, then schedule their accounts
    pub async fn ingest_flow_events(&self, events: &[FlowEvent]) -> Result<usize> {
        self.ledger.record_flow_events(events)?;
        self.scheduler.on_flow_events_ingested(events).await
    }

    /// Bootstrap the chain when `account` is its stream contract
    pub async fn on_account_first_indexed(
        &self,
        blockchain: &Blockchain,
        account: &AccountId,
    ) -> Result<BootstrapOutcome> {
        let outcome = self
            .scheduler
            .on_account_first_indexed(blockchain, account)
            .await?;

        if let BootstrapOutcome::Enqueued(_) = outcome {
            match self.worker.lock().as_ref() {
                Some(worker) => worker.wake(),
                None => tracing::debug!(blockchain = %blockchain, "Bootstrap queued before worker start"),
            }
        }

        Ok(outcome)
    }

    /// Apply a discrete transfer; `false` when it was already applied
    pub fn apply_transfer(&self, transfer: &TransferEvent) -> Result<bool> {
        Ok(self.ledger.apply_transfer(transfer)?)
    }

    /// Re-enqueue accounts with a missing or stale watermark
    pub async fn reconcile(&self, blockchain: &Blockchain) -> Result<Vec<AccountId>> {
        self.scheduler.reconcile(blockchain).await
    }

    // Read API

    /// Stored edge states projected to now
    pub fn get_stream_balances(
        &self,
        blockchain: &Blockchain,
        account: Option<&AccountId>,
        pagination: Pagination,
    ) -> Result<Vec<ProjectedEdge>> {
        self.get_stream_balances_at(blockchain, account, pagination, Utc::now().timestamp())
    }

    /// Stored edge states projected to `now`
    pub fn get_stream_balances_at(
        &self,
        blockchain: &Blockchain,
        account: Option<&AccountId>,
        pagination: Pagination,
        now: i64,
    ) -> Result<Vec<ProjectedEdge>> {
        let edges = self.ledger.stream_balances_at(blockchain, account, now)?;
        Ok(self.page(pagination, edges))
    }

    /// Combined discrete plus streaming balances at now
    pub fn get_balances(
        &self,
        blockchain: &Blockchain,
        account: Option<&AccountId>,
        pagination: Pagination,
        reverse: bool,
    ) -> Result<Vec<ReportedBalance>> {
        self.get_balances_at(blockchain, account, pagination, reverse, Utc::now().timestamp())
    }

    /// Combined discrete plus streaming balances at `now`
    ///
    /// Zero balances are omitted. Ascending by balance unless `reverse`.
    pub fn get_balances_at(
        &self,
        blockchain: &Blockchain,
        account: Option<&AccountId>,
        pagination: Pagination,
        reverse: bool,
        now: i64,
    ) -> Result<Vec<ReportedBalance>> {
        let balances = self.ledger.balances_at(blockchain, account, reverse, now)?;
        Ok(self.page(pagination, balances))
    }

    fn page<T>(&self, pagination: Pagination, items: Vec<T>) -> Vec<T> {
        pagination.apply(
            items,
            self.config.api.default_page_size,
            self.config.api.max_page_size,
        )
    }
}
