//! Backend lifecycle: construction from config, init, close.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{error, info, warn};

use super::reconcile::run_reconciler;
use super::{BackendOptions, BackendState, DefaultBackend, Inner, TwoTierBackend};
use crate::config::{ConfigError, RelayStoreConfig};
use crate::error::{MultiError, StorageError};
use crate::event::unix_now;
use crate::storage::memory::MemoryStore;
use crate::storage::sql::SqlStore;
use crate::storage::traits::EventStore;
use crate::task_group::{TaskGroup, TaskOutcome};
use crate::tier::{AuthoritativeTier, BoundedTier, BoundedTierOptions, TierKind};

impl DefaultBackend {
    /// Build the default composition: an in-memory bounded L1 over a SQL L2.
    ///
    /// L2 keeps its tombstones; `gc_enabled` applies to L1.
    pub fn from_config(config: &RelayStoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let l1 = BoundedTier::new(MemoryStore::new(), BoundedTierOptions::from_config(config));
        let sql = match &config.authoritative_url {
            Some(url) => SqlStore::with_url(url.clone()),
            None => SqlStore::new(),
        };
        let l2 = AuthoritativeTier::new(sql);

        Ok(Self::new(l1, l2, BackendOptions::from_config(config)))
    }
}

impl<L1, L2> TwoTierBackend<L1, L2>
where
    L1: EventStore + 'static,
    L2: EventStore + 'static,
{
    /// Open L1 then L2, stopping at the first failure, then start the
    /// reconciler if a poll frequency is set.
    #[tracing::instrument(skip(self), fields(reconcile))]
    pub(super) async fn start(&self, path: &Path) -> Result<(), StorageError> {
        let started = Instant::now();
        let inner = &self.inner;
        inner.set_state(BackendState::Initializing);

        if let Err(e) = inner.l1.init(path).await {
            error!(tier = %TierKind::Bounded, error = %e, "L1 init failed");
            inner.set_state(BackendState::Created);
            return Err(e);
        }
        if let Err(e) = inner.l2.init(path).await {
            error!(tier = %TierKind::Authoritative, error = %e, "L2 init failed");
            // L1 is already open; don't leak it
            if let Err(close_err) = inner.l1.close().await {
                warn!(error = %close_err, "L1 close after failed L2 init also failed");
            }
            inner.set_state(BackendState::Created);
            return Err(e);
        }

        inner.high_water.store(unix_now(), Ordering::Release);
        let lifetime = {
            let mut lifetime = inner.lifetime.lock();
            *lifetime = inner.parent.child_token();
            lifetime.clone()
        };

        match inner.options.poll_frequency {
            Some(poll) => {
                tracing::Span::current().record("reconcile", true);
                let handle = tokio::spawn(run_reconciler(inner.clone(), poll, lifetime));
                if let Some(old) = inner.reconciler.lock().replace(handle) {
                    old.abort();
                }
            }
            None => {
                tracing::Span::current().record("reconcile", false);
            }
        }

        inner.set_state(BackendState::Ready);
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Two-tier backend ready");
        Ok(())
    }

    /// Cancel the lifetime, join the reconciler and close both tiers.
    #[tracing::instrument(skip(self))]
    pub(super) async fn shutdown(&self) -> Result<(), StorageError> {
        let inner = &self.inner;
        inner.set_state(BackendState::Closing);
        inner.lifetime.lock().cancel();

        let reconciler = inner.reconciler.lock().take();
        let result = match reconciler {
            // the reconciler closes the tiers on its way out
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Reconciler task failed; closing tiers directly");
                    inner.close_tiers().await
                }
            },
            None => inner.close_tiers().await,
        };

        inner.set_state(BackendState::Closed);
        match &result {
            Ok(()) => info!("Two-tier backend closed"),
            Err(e) => warn!(error = %e, "Two-tier backend closed with errors"),
        }
        result
    }
}

impl<L1, L2> Inner<L1, L2>
where
    L1: EventStore + 'static,
    L2: EventStore + 'static,
{
    /// Close both tiers unconditionally and aggregate their errors.
    pub(super) async fn close_tiers(&self) -> Result<(), StorageError> {
        let mut group = TaskGroup::new();
        let l1 = self.l1.clone();
        group.spawn(TierKind::Bounded, async move { l1.close().await });
        let l2 = self.l2.clone();
        group.spawn(TierKind::Authoritative, async move { l2.close().await });

        let mut failures = MultiError::new();
        for (tier, outcome) in group.join_all().await {
            let error = match outcome {
                TaskOutcome::Finished(Ok(())) => continue,
                TaskOutcome::Finished(Err(e)) => e,
                TaskOutcome::Panicked(msg) => {
                    StorageError::Backend(format!("close panicked: {msg}"))
                }
                TaskOutcome::Abandoned => StorageError::Cancelled,
            };
            self.options.observer.on_tier_failure(tier.label(), "close");
            failures.push(tier, "close", error);
        }
        failures.into_result(())
    }
}
