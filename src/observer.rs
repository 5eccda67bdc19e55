// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store observer hooks.
//!
//! Tiers and the backend report what they did through a [`StoreObserver`]
//! passed in at construction. [`MetricsObserver`] (the default) forwards to
//! the `metrics` facade; [`NoopObserver`] drops everything.

use std::time::Duration;

use crate::metrics;

/// Callbacks for store activity. Every method defaults to a no-op.
pub trait StoreObserver: Send + Sync {
    /// An operation finished on `tier` with `status`.
    fn on_operation(&self, _tier: &str, _operation: &str, _status: &str, _elapsed: Duration) {}

    /// One tier of a dual-tier operation failed.
    fn on_tier_failure(&self, _tier: &str, _operation: &str) {}

    /// Occupancy of a bounded tier changed.
    fn on_occupancy(&self, _tier: &str, _used_bytes: u64, _pressure: f64) {}

    /// An eviction pass finished.
    fn on_evicted(
        &self,
        _tier: &str,
        _count: usize,
        _bytes: u64,
        _elapsed: Duration,
        _exhausted: bool,
    ) {}

    /// A save waited for space.
    fn on_backpressure(&self, _tier: &str, _level: u8, _waited: Duration) {}

    /// A reconciliation tick finished.
    fn on_reconciled(
        &self,
        _fetched: usize,
        _backfilled: usize,
        _high_water: i64,
        _elapsed: Duration,
    ) {}

    /// A garbage collection run finished.
    fn on_gc(&self, _tier: &str, _purged: usize, _success: bool) {}

    /// The backend changed lifecycle state.
    fn on_state(&self, _state: &str) {}
}

/// Forwards everything to [`crate::metrics`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsObserver;

impl StoreObserver for MetricsObserver {
    fn on_operation(&self, tier: &str, operation: &str, status: &str, elapsed: Duration) {
        metrics::record_operation(tier, operation, status);
        metrics::record_latency(tier, operation, elapsed);
    }

    fn on_tier_failure(&self, tier: &str, operation: &str) {
        metrics::record_tier_failure(tier, operation);
    }

    fn on_occupancy(&self, tier: &str, used_bytes: u64, pressure: f64) {
        metrics::set_occupancy(tier, used_bytes, pressure);
    }

    fn on_evicted(&self, tier: &str, count: usize, bytes: u64, elapsed: Duration, exhausted: bool) {
        metrics::record_eviction(tier, count, bytes);
        metrics::record_eviction_pass(tier, elapsed, exhausted);
    }

    fn on_backpressure(&self, tier: &str, level: u8, waited: Duration) {
        metrics::set_backpressure_level(tier, level);
        metrics::record_backpressure_wait(tier, waited);
    }

    fn on_reconciled(&self, fetched: usize, backfilled: usize, high_water: i64, elapsed: Duration) {
        metrics::record_reconcile(fetched, backfilled, elapsed);
        metrics::set_reconcile_high_water(high_water);
    }

    fn on_gc(&self, tier: &str, purged: usize, success: bool) {
        metrics::record_gc(tier, purged, success);
    }

    fn on_state(&self, state: &str) {
        metrics::set_backend_state(state);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl StoreObserver for NoopObserver {}
