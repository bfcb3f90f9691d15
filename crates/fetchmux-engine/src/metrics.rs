//! Lock-free engine counters.
//!
//! One instance per connection.  Cheap enough to leave always-on; tests use
//! them to assert single-flight behavior and stale-completion handling.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct FetchMetrics {
    /// Query advances actually submitted to the worker.
    pub queries_dispatched: AtomicU64,
    /// `fetch_more` calls that joined an already in-flight advance.
    pub queries_joined: AtomicU64,
    /// Chunks received from the store (including empty exhaustion chunks).
    pub chunks_received: AtomicU64,
    /// Items delivered to parents via `add_item`.
    pub items_delivered: AtomicU64,
    /// Probes resolved with `will_have_children = true`.
    pub probes_resolved_true: AtomicU64,
    /// Probes resolved with `will_have_children = false`.
    pub probes_resolved_false: AtomicU64,
    /// Completions that arrived with no registered waiters (epoch bumped or
    /// waiters cleared while the advance was in flight).
    pub stale_completions: AtomicU64,
    /// Store-level errors routed to the error channel.
    pub store_errors: AtomicU64,
}

/// Point-in-time copy of [`FetchMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchMetricsSnapshot {
    pub queries_dispatched: u64,
    pub queries_joined: u64,
    pub chunks_received: u64,
    pub items_delivered: u64,
    pub probes_resolved_true: u64,
    pub probes_resolved_false: u64,
    pub stale_completions: u64,
    pub store_errors: u64,
}

impl FetchMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> FetchMetricsSnapshot {
        FetchMetricsSnapshot {
            queries_dispatched: self.queries_dispatched.load(Ordering::Relaxed),
            queries_joined: self.queries_joined.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            items_delivered: self.items_delivered.load(Ordering::Relaxed),
            probes_resolved_true: self.probes_resolved_true.load(Ordering::Relaxed),
            probes_resolved_false: self.probes_resolved_false.load(Ordering::Relaxed),
            stale_completions: self.stale_completions.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}
