// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Two-tier backend.
//!
//! [`TwoTierBackend`] composes a fast bounded tier (L1) with an
//! authoritative tier (L2) and presents them as one [`EventStore`].
//!
//! ```text
//!                  save / delete / query / count / nuke / sync
//!                                  │
//!                     ┌────────────┴────────────┐
//!                     ▼      (TaskGroup)        ▼
//!         ┌──────────────────────┐   ┌──────────────────────┐
//!         │  L1: BoundedTier     │   │  L2: Authoritative   │
//!         │  watermark eviction  │◄──│  source of truth     │
//!         └──────────────────────┘   └──────────────────────┘
//!                     ▲     backfill every poll tick
//!                     └──── reconciler ([last_high − overlap, now])
//! ```
//!
//! Writes go to both tiers concurrently and failures are aggregated into a
//! [`MultiError`](crate::error::MultiError) with per-tier provenance. Reads
//! concatenate L1 then L2. Counts take the larger of the two.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Initializing → Ready ⇄ Reconciling → Closing → Closed
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_store::{Context, DefaultBackend, Event, EventStore, FilterSet, RelayStoreConfig};
//! use std::path::Path;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RelayStoreConfig::default();
//! let backend = DefaultBackend::from_config(&config)?;
//! backend.init(Path::new(&config.data_path)).await?;
//!
//! let ctx = Context::background();
//! let event = Event::new("alice".into(), 1_700_000_000, 1, vec![], "hello".into(), String::new());
//! backend.save_event(&ctx, &event).await?;
//!
//! let found = backend.query_events(&ctx, &FilterSet::everything()).await?;
//! assert!(!found.is_empty());
//! backend.close().await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod reconcile;
mod types;

pub use types::{BackendOptions, BackendState, BackendStats, ReconcileStats};

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{result_status, StorageError};
use crate::storage::traits::EventStore;
use crate::storage::memory::MemoryStore;
use crate::storage::sql::SqlStore;
use crate::tier::{AuthoritativeTier, BoundedTier};

/// In-memory bounded L1 over a SQL L2; see `DefaultBackend::from_config`.
pub type DefaultBackend = TwoTierBackend<BoundedTier<MemoryStore>, AuthoritativeTier<SqlStore>>;

/// L1 + L2 behind a single [`EventStore`].
///
/// Cheap to clone; clones share tiers, state and the reconciler.
pub struct TwoTierBackend<L1, L2> {
    pub(super) inner: Arc<Inner<L1, L2>>,
}

impl<L1, L2> Clone for TwoTierBackend<L1, L2> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(super) struct Inner<L1, L2> {
    pub(super) l1: Arc<L1>,
    pub(super) l2: Arc<L2>,
    pub(super) options: BackendOptions,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<BackendState>,

    /// Parent of every lifetime this backend hands out
    pub(super) parent: CancellationToken,

    /// Cancelled on close; the reconciler exits when it fires
    pub(super) lifetime: Mutex<CancellationToken>,

    /// Reconciler task; yields the result of closing both tiers
    pub(super) reconciler: Mutex<Option<JoinHandle<Result<(), StorageError>>>>,

    /// Created-at (unix seconds) covered by the last reconciliation tick
    pub(super) high_water: AtomicI64,

    pub(super) last_reconcile: Mutex<Option<ReconcileStats>>,
}

impl<L1, L2> TwoTierBackend<L1, L2>
where
    L1: EventStore + 'static,
    L2: EventStore + 'static,
{
    #[must_use]
    pub fn new(l1: L1, l2: L2, options: BackendOptions) -> Self {
        Self::from_arcs(Arc::new(l1), Arc::new(l2), options)
    }

    /// Build over tiers the caller keeps handles to.
    #[must_use]
    pub fn from_arcs(l1: Arc<L1>, l2: Arc<L2>, options: BackendOptions) -> Self {
        let (state, _) = watch::channel(BackendState::Created);
        Self {
            inner: Arc::new(Inner {
                l1,
                l2,
                options,
                state,
                parent: CancellationToken::new(),
                lifetime: Mutex::new(CancellationToken::new()),
                reconciler: Mutex::new(None),
                high_water: AtomicI64::new(0),
                last_reconcile: Mutex::new(None),
            }),
        }
    }

    /// Tie the backend's lifetime to `parent`: cancelling it stops the
    /// reconciler, which then closes both tiers.
    #[must_use]
    pub fn with_lifetime(self, parent: CancellationToken) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.parent = parent;
                inner
            }
            // already shared; keep the existing lifetime
            Err(inner) => return Self { inner },
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    #[must_use]
    pub fn l1(&self) -> &Arc<L1> {
        &self.inner.l1
    }

    #[must_use]
    pub fn l2(&self) -> &Arc<L2> {
        &self.inner.l2
    }

    #[must_use]
    pub fn options(&self) -> &BackendOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn state(&self) -> BackendState {
        *self.inner.state.borrow()
    }

    /// Receiver for state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<BackendState> {
        self.inner.state.subscribe()
    }

    /// Reconciliation high-water mark (unix seconds).
    #[must_use]
    pub fn high_water(&self) -> i64 {
        self.inner.high_water.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_reconcile(&self) -> Option<ReconcileStats> {
        self.inner.last_reconcile.lock().clone()
    }

    /// Whether the background reconciler is running.
    #[must_use]
    pub fn is_reconciling(&self) -> bool {
        self.inner
            .reconciler
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl<S, L2> TwoTierBackend<BoundedTier<S>, L2>
where
    S: EventStore + 'static,
    L2: EventStore + 'static,
{
    /// Health snapshot for status endpoints.
    #[must_use]
    pub fn stats(&self) -> BackendStats {
        let l1 = &self.inner.l1;
        BackendStats {
            state: self.state(),
            l1_occupancy: l1.occupancy(),
            l1_capacity: l1.capacity(),
            l1_pressure: l1.pressure(),
            eviction_state: l1.eviction_state(),
            high_water: self.high_water(),
            last_reconcile: self.last_reconcile(),
        }
    }
}

impl<L1, L2> Inner<L1, L2> {
    pub(super) fn set_state(&self, state: BackendState) {
        self.state.send_replace(state);
        self.options.observer.on_state(&state.to_string());
    }

    /// Move between `Ready` and `Reconciling` without clobbering a
    /// concurrent shutdown.
    pub(super) fn toggle_reconciling(&self, reconciling: bool) {
        let (from, to) = if reconciling {
            (BackendState::Ready, BackendState::Reconciling)
        } else {
            (BackendState::Reconciling, BackendState::Ready)
        };
        let changed = self.state.send_if_modified(|current| {
            if *current == from {
                *current = to;
                true
            } else {
                false
            }
        });
        if changed {
            self.options.observer.on_state(&to.to_string());
        }
    }

    pub(super) fn observe<T>(&self, op: &str, started: Instant, result: &Result<T, StorageError>) {
        self.options
            .observer
            .on_operation("backend", op, result_status(result), started.elapsed());
    }
}
