//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring replay and the
//! dirty-account queue.
//!
//! # Metrics
//!
//! - `stream_recomputes_total` - Successful account recomputes
//! - `stream_recompute_failures_total` - Failed account recomputes
//! - `stream_recompute_duration_seconds` - Histogram of recompute latencies
//! - `stream_edges_written_total` - Edge rows written by recomputes
//! - `stream_tasks_enqueued_total` - Dirty-account tasks enqueued
//! - `stream_tasks_drained_total` - Dirty-account tasks drained

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Successful recomputes
    pub recomputes_total: IntCounter,

    /// Failed recomputes
    pub recompute_failures_total: IntCounter,

    /// Recompute duration histogram
    pub recompute_duration: Histogram,

    /// Edge rows written
    pub edges_written_total: IntCounter,

    /// Tasks enqueued
    pub tasks_enqueued_total: IntCounter,

    /// Tasks drained
    pub tasks_drained_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let recomputes_total =
            IntCounter::new("stream_recomputes_total", "Successful account recomputes")?;
        registry.register(Box::new(recomputes_total.clone()))?;

        let recompute_failures_total = IntCounter::new(
            "stream_recompute_failures_total",
            "Failed account recomputes",
        )?;
        registry.register(Box::new(recompute_failures_total.clone()))?;

        let recompute_duration = Histogram::with_opts(
            HistogramOpts::new(
                "stream_recompute_duration_seconds",
                "Histogram of recompute latencies",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(recompute_duration.clone()))?;

        let edges_written_total =
            IntCounter::new("stream_edges_written_total", "Edge rows written by recomputes")?;
        registry.register(Box::new(edges_written_total.clone()))?;

        let tasks_enqueued_total =
            IntCounter::new("stream_tasks_enqueued_total", "Dirty-account tasks enqueued")?;
        registry.register(Box::new(tasks_enqueued_total.clone()))?;

        let tasks_drained_total =
            IntCounter::new("stream_tasks_drained_total", "Dirty-account tasks drained")?;
        registry.register(Box::new(tasks_drained_total.clone()))?;

        Ok(Self {
            recomputes_total,
            recompute_failures_total,
            recompute_duration,
            edges_written_total,
            tasks_enqueued_total,
            tasks_drained_total,
            registry,
        })
    }

    /// Record a successful recompute
    pub fn record_recompute(&self, edges: usize, duration_seconds: f64) {
        self.recomputes_total.inc();
        self.edges_written_total.inc_by(edges as u64);
        self.recompute_duration.observe(duration_seconds);
    }

    /// Record a failed recompute
    pub fn record_recompute_failure(&self) {
        self.recompute_failures_total.inc();
    }

    /// Record tasks enqueued
    pub fn record_enqueued(&self, count: usize) {
        self.tasks_enqueued_total.inc_by(count as u64);
    }

    /// Record tasks drained
    pub fn record_drained(&self, count: usize) {
        self.tasks_drained_total.inc_by(count as u64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
