//! Global atomic counters for refactor-bot observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at daemon shutdown).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters, no allocations, no locking.
pub struct Metrics {
    cycles_run: AtomicU64,
    prs_opened: AtomicU64,
    retries: AtomicU64,
    conflicts: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cycles_run: AtomicU64::new(0),
            prs_opened: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        }
    }

    pub fn inc_cycles(&self) {
        self.cycles_run.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cycles_run", "counter incremented");
    }

    pub fn inc_prs_opened(&self) {
        self.prs_opened.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "prs_opened", "counter incremented");
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries", "counter incremented");
    }

    /// Compare-and-set lost against a concurrent writer.
    pub fn inc_conflicts(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "conflicts", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            cycles_run = self.cycles_run(),
            prs_opened = self.prs_opened(),
            retries = self.retries(),
            conflicts = self.conflicts(),
        );
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycles_run.load(Ordering::Relaxed)
    }

    pub fn prs_opened(&self) -> u64 {
        self.prs_opened.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.cycles_run.store(0, Ordering::Relaxed);
        self.prs_opened.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.conflicts.store(0, Ordering::Relaxed);
    }
}
