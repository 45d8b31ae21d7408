//! Stream Indexer
//!
//! Keeps streaming balances current as flow events arrive.
//!
//! # Architecture
//!
//! 1. **Scheduling**: ingested flow events mark their accounts dirty
//! 2. **Queueing**: one durable task per dirty account per batch
//! 3. **Replay**: a single worker drains the queue and recomputes each
//!    distinct account from its full history
//! 4. **Serving**: reads project the stored state to "now"
//!
//! Bootstrap enqueues a chain's whole flow log the first time its stream
//! contract is indexed. Reconciliation re-enqueues accounts whose last
//! successful recompute is behind their newest event.
//!
//! # Example
//!
//! ```no_run
//! use stream_indexer::{IndexerConfig, StreamIndexer};
//!
//! #[tokio::main]
//! async fn main() -> stream_indexer::Result<()> {
//!     let indexer = StreamIndexer::open(IndexerConfig::from_env()?)?;
//!     let worker = indexer.start_worker();
//!
//!     tokio::signal::ctrl_c().await?;
//!     worker.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod indexer;
pub mod queue;
pub mod scheduler;
pub mod worker;

// Re-exports
pub use config::IndexerConfig;
pub use error::{Error, Result};
pub use indexer::StreamIndexer;
pub use queue::{Task, TaskId, TaskQueue, WorkQueue};
pub use scheduler::{BootstrapOutcome, DirtyAccountScheduler};
pub use worker::{spawn_worker, DrainReport, WorkerHandle, WorkerStatus};
