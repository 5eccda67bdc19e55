//! Public types for the two-tier backend.

use std::sync::Arc;
use std::time::Duration;

use crate::config::RelayStoreConfig;
use crate::eviction::EvictionState;
use crate::observer::{MetricsObserver, StoreObserver};

/// Backend lifecycle state.
///
/// Use [`super::TwoTierBackend::state()`] to check the current state or
/// [`super::TwoTierBackend::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    /// Just created, not yet initialized
    Created,
    /// Opening L1 then L2
    Initializing,
    /// Serving requests
    Ready,
    /// Serving requests; a reconciliation tick is running
    Reconciling,
    /// Shutdown in progress
    Closing,
    /// Both tiers closed
    Closed,
}

impl BackendState {
    /// Whether requests are being served.
    #[must_use]
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Ready | Self::Reconciling)
    }
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Ready => write!(f, "Ready"),
            Self::Reconciling => write!(f, "Reconciling"),
            Self::Closing => write!(f, "Closing"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Outcome of one reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Window start (unix seconds, inclusive)
    pub since: i64,
    /// Window end (unix seconds, inclusive)
    pub until: i64,
    /// Records L2 returned for the window
    pub fetched: usize,
    /// Records written into L1
    pub backfilled: usize,
    /// Records L1 already had
    pub already_present: usize,
    /// Records L1 refused with a non-benign error
    pub failed: usize,
    /// L2 queries issued to cover the window
    pub pages: usize,
    /// The tick was cancelled before the window was covered
    pub truncated: bool,
}

/// Health snapshot of a backend with a bounded L1.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendStats {
    pub state: BackendState,
    pub l1_occupancy: u64,
    pub l1_capacity: u64,
    pub l1_pressure: f64,
    pub eviction_state: EvictionState,
    /// Reconciliation high-water mark (unix seconds)
    pub high_water: i64,
    pub last_reconcile: Option<ReconcileStats>,
}

/// Construction options for a [`super::TwoTierBackend`].
#[derive(Clone)]
pub struct BackendOptions {
    /// Reconciliation tick; `None` disables reconciliation
    pub poll_frequency: Option<Duration>,
    /// Overlap = poll frequency × this (below 2 means 4)
    pub overlap_multiplier: u32,
    /// Page size for reading the reconciliation window from L2 (0 = unbounded)
    pub reconcile_batch_limit: usize,
    /// Drop L2 results whose ID L1 already returned
    pub dedup_queries: bool,
    pub observer: Arc<dyn StoreObserver>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            poll_frequency: Some(Duration::from_secs(5)),
            overlap_multiplier: 4,
            reconcile_batch_limit: 5_000,
            dedup_queries: false,
            observer: Arc::new(MetricsObserver),
        }
    }
}

impl BackendOptions {
    #[must_use]
    pub fn from_config(config: &RelayStoreConfig) -> Self {
        Self {
            poll_frequency: config.poll_frequency(),
            overlap_multiplier: config.overlap_multiplier,
            reconcile_batch_limit: config.reconcile_batch_limit,
            dedup_queries: config.dedup_queries,
            ..Self::default()
        }
    }

    /// Overlap applied to the reconciliation window.
    #[must_use]
    pub fn overlap(&self) -> Duration {
        let poll = self.poll_frequency.unwrap_or(Duration::ZERO);
        if self.overlap_multiplier < 2 {
            poll * 4
        } else {
            poll * self.overlap_multiplier
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_state_display() {
        assert_eq!(format!("{}", BackendState::Created), "Created");
        assert_eq!(format!("{}", BackendState::Reconciling), "Reconciling");
        assert_eq!(format!("{}", BackendState::Closed), "Closed");
    }

    #[test]
    fn test_serving_states() {
        assert!(BackendState::Ready.is_serving());
        assert!(BackendState::Reconciling.is_serving());
        assert!(!BackendState::Closing.is_serving());
        assert!(!BackendState::Created.is_serving());
    }

    #[test]
    fn test_overlap_uses_multiplier() {
        let options = BackendOptions {
            poll_frequency: Some(Duration::from_secs(5)),
            overlap_multiplier: 3,
            ..Default::default()
        };
        assert_eq!(options.overlap(), Duration::from_secs(15));
    }

    #[test]
    fn test_overlap_below_two_becomes_four() {
        let options = BackendOptions {
            poll_frequency: Some(Duration::from_secs(5)),
            overlap_multiplier: 1,
            ..Default::default()
        };
        assert_eq!(options.overlap(), Duration::from_secs(20));
    }

    #[test]
    fn test_options_from_config() {
        let config = RelayStoreConfig {
            poll_frequency_ms: 0,
            dedup_queries: true,
            ..Default::default()
        };
        let options = BackendOptions::from_config(&config);
        assert!(options.poll_frequency.is_none());
        assert!(options.dedup_queries);
    }
}
