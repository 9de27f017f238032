//! Global atomic counters for the evolution loop.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the orchestrator does so when a run ends).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    iterations_completed: AtomicU64,
    candidates_evaluated: AtomicU64,
    candidates_promoted: AtomicU64,
    candidates_archived: AtomicU64,
    backend_failures: AtomicU64,
    persistence_failures: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            iterations_completed: AtomicU64::new(0),
            candidates_evaluated: AtomicU64::new(0),
            candidates_promoted: AtomicU64::new(0),
            candidates_archived: AtomicU64::new(0),
            backend_failures: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
        }
    }

    pub fn inc_iterations(&self) {
        self.iterations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_evaluated(&self, n: u64) {
        self.candidates_evaluated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_promoted(&self, n: u64) {
        self.candidates_promoted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_archived(&self, n: u64) {
        self.candidates_archived.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_backend_failures(&self) {
        self.backend_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "backend_failures", "counter incremented");
    }

    pub fn inc_persistence_failures(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "persistence_failures", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            iterations_completed = self.iterations_completed(),
            candidates_evaluated = self.candidates_evaluated(),
            candidates_promoted = self.candidates_promoted(),
            candidates_archived = self.candidates_archived(),
            backend_failures = self.backend_failures(),
            persistence_failures = self.persistence_failures(),
        );
    }

    pub fn iterations_completed(&self) -> u64 {
        self.iterations_completed.load(Ordering::Relaxed)
    }

    pub fn candidates_evaluated(&self) -> u64 {
        self.candidates_evaluated.load(Ordering::Relaxed)
    }

    pub fn candidates_promoted(&self) -> u64 {
        self.candidates_promoted.load(Ordering::Relaxed)
    }

    pub fn candidates_archived(&self) -> u64 {
        self.candidates_archived.load(Ordering::Relaxed)
    }

    pub fn backend_failures(&self) -> u64 {
        self.backend_failures.load(Ordering::Relaxed)
    }

    pub fn persistence_failures(&self) -> u64 {
        self.persistence_failures.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.iterations_completed.store(0, Ordering::Relaxed);
        self.candidates_evaluated.store(0, Ordering::Relaxed);
        self.candidates_promoted.store(0, Ordering::Relaxed);
        self.candidates_archived.store(0, Ordering::Relaxed);
        self.backend_failures.store(0, Ordering::Relaxed);
        self.persistence_failures.store(0, Ordering::Relaxed);
    }
}
