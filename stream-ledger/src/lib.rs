//! Stream Ledger Core
//!
//! Point-in-time balances for accounts that hold both discrete token balances
//! and continuous payment streams.
//!
//! # Architecture
//!
//! - **Event Log**: Flow change and deposit events stored in chain order
//! - **Replay**: Per-account edge state is re-derived from full history
//! - **Projection**: Settled state extrapolated to "now" on read
//! - **Aggregation**: Discrete + streaming balances, netted and ranked
//!
//! # Invariants
//!
//! - Deterministic replay: same ordered history → byte-identical edge rows
//! - Order sensitivity: the fold only accepts `(height, log_index)` order
//! - Perspective: the payer's rate is negative, the payee's positive
//! - Replace-in-full: a recompute never patches prior rows

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod replay;
pub mod projection;
pub mod balances;
pub mod ledger;
pub mod error;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, Result};
pub use types::{
    AccountId, Amount, Blockchain, DiscreteBalance, EdgeId, EdgeState, EventPosition,
    FlowChangeEvent, FlowEvent, FlowExtensionEvent, Pagination, ProjectedEdge,
    RecomputeWatermark, ReportedBalance, TransferEvent,
};
pub use ledger::{RecomputeOutcome, StreamLedger};
pub use metrics::Metrics;
pub use storage::Storage;
pub use config::Config;
