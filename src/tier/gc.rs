//! Tombstone garbage collection.
//!
//! Deleting an event leaves a tombstone so the event cannot be re-saved.
//! Tombstones older than the TTL are purged on an interval. The bounded
//! tier collects by default; the authoritative tier keeps its tombstones
//! unless GC is enabled for it explicitly.
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_store::tier::GcConfig;
//! use std::time::Duration;
//!
//! let config = GcConfig {
//!     interval: Duration::from_secs(60),
//!     tombstone_ttl: Duration::from_secs(24 * 3600),
//!     ..Default::default()
//! };
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayStoreConfig;
use crate::context::Context;
use crate::error::StorageError;
use crate::event::unix_now;
use crate::observer::StoreObserver;
use crate::storage::traits::EventStore;

/// Garbage collection configuration.
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub enabled: bool,

    /// Time between runs
    pub interval: Duration,

    /// Tombstones older than this are purged
    pub tombstone_ttl: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(300), // 5 minutes
            tombstone_ttl: Duration::from_secs(7 * 24 * 3600), // 7 days
        }
    }
}

impl GcConfig {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn from_config(config: &RelayStoreConfig) -> Self {
        Self {
            enabled: config.gc_enabled,
            interval: config.gc_interval(),
            tombstone_ttl: config.tombstone_ttl(),
        }
    }
}

/// Result of a collection run.
#[derive(Debug, Clone, Default)]
pub struct GcResult {
    /// Tombstones purged
    pub purged: usize,
    /// Tombstones written before this (unix seconds) were eligible
    pub cutoff: i64,
    pub duration: Duration,
}

impl GcResult {
    /// Check if any work was done.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.purged == 0
    }
}

/// Run one collection against `store`.
pub async fn collect_once(
    tier: &str,
    store: &dyn EventStore,
    tombstone_ttl: Duration,
    observer: &dyn StoreObserver,
) -> Result<GcResult, StorageError> {
    let start = Instant::now();
    let ttl_secs = i64::try_from(tombstone_ttl.as_secs()).unwrap_or(i64::MAX);
    let cutoff = unix_now().saturating_sub(ttl_secs);

    match store.collect_garbage(&Context::background(), cutoff).await {
        Ok(purged) => {
            observer.on_gc(tier, purged, true);
            let result = GcResult {
                purged,
                cutoff,
                duration: start.elapsed(),
            };
            if result.is_empty() {
                debug!(tier, cutoff, "Garbage collection found nothing to purge");
            } else {
                info!(tier, purged, cutoff, "Purged expired tombstones");
            }
            Ok(result)
        }
        Err(e) => {
            observer.on_gc(tier, 0, false);
            Err(e)
        }
    }
}

/// Spawn the periodic collector. Returns `None` when GC is disabled.
///
/// The loop exits when `cancel` fires.
pub fn spawn_gc_loop(
    tier: &'static str,
    store: Arc<dyn EventStore>,
    config: GcConfig,
    observer: Arc<dyn StoreObserver>,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !config.enabled || config.interval.is_zero() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick is immediate; nothing can be expired yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let result = collect_once(
                        tier,
                        store.as_ref(),
                        config.tombstone_ttl,
                        observer.as_ref(),
                    )
                    .await;
                    if let Err(e) = result {
                        warn!(tier, error = %e, "Garbage collection failed");
                    }
                }
            }
        }
        debug!(tier, "Garbage collector stopped");
    }))
}
