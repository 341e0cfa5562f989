//! Dispatch Metrics
//!
//! In-process counters for the dispatcher:
//! - Dispatch volume and terminal errors
//! - Cache hit/miss ratio
//! - Retries and fallback hops
//! - Credential quarantines
//!
//! Counters are relaxed atomics; a [`MetricsSnapshot`] is a point-in-time copy.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

use crate::error::ErrorKind;

// ============================================================================
// Counter
// ============================================================================

/// A monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Dispatch Metrics
// ============================================================================

/// Counters shared by the dispatcher and retry controller
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Caller-level dispatch calls
    pub dispatches: Counter,
    /// Responses served from cache
    pub cache_hits: Counter,
    /// Cache lookups that missed
    pub cache_misses: Counter,
    /// Backend invocations (every attempt)
    pub invocations: Counter,
    /// Retries after a transient failure
    pub retries: Counter,
    /// Fallback hops taken
    pub fallbacks: Counter,
    /// Credentials quarantined
    pub quarantines: Counter,
    /// Terminal errors returned to callers
    pub errors: Counter,
    errors_by_kind: DashMap<ErrorKind, u64>,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal error
    pub fn record_error(&self, kind: ErrorKind) {
        self.errors.inc();
        *self.errors_by_kind.entry(kind).or_insert(0) += 1;
    }

    /// Terminal errors of one kind
    #[must_use]
    pub fn errors_of(&self, kind: ErrorKind) -> u64 {
        self.errors_by_kind.get(&kind).map_or(0, |v| *v)
    }

    /// Cache hit ratio in [0, 1]
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.get();
        let total = hits + self.cache_misses.get();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut errors_by_kind: Vec<(String, u64)> = self
            .errors_by_kind
            .iter()
            .map(|entry| (entry.key().as_str().to_string(), *entry.value()))
            .collect();
        errors_by_kind.sort();

        MetricsSnapshot {
            dispatches: self.dispatches.get(),
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            cache_hit_rate: self.cache_hit_rate(),
            invocations: self.invocations.get(),
            retries: self.retries.get(),
            fallbacks: self.fallbacks.get(),
            quarantines: self.quarantines.get(),
            errors: self.errors.get(),
            errors_by_kind,
        }
    }
}

/// Snapshot of dispatch metrics
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub dispatches: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub invocations: u64,
    pub retries: u64,
    pub fallbacks: u64,
    pub quarantines: u64,
    pub errors: u64,
    pub errors_by_kind: Vec<(String, u64)>,
}
