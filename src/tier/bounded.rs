// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! L1: a capacity-bounded tier with watermark eviction.
//!
//! Wraps any [`EventStore`] engine. Every stored event is charged against
//! the capacity by a [`SizeEstimator`]; once occupancy reaches the high
//! watermark a background pass deletes the oldest events (without
//! tombstones) until occupancy is at or below the low watermark.
//!
//! ```text
//!   save ──▶ [backpressure gate] ──▶ engine.save ──▶ occupancy += size
//!                                                          │
//!                                         occupancy >= high?
//!                                                          ▼
//!                                           spawn eviction pass (one at a time)
//!                                                          │
//!                                 oldest batch ─▶ delete ─▶ occupancy -= size
//!                                         ▲                 │
//!                                         └── until <= low ─┘
//! ```
//!
//! Queries and saves keep running while a pass is in flight; only
//! candidate selection takes the index lock.
//!
//! The engine write and the accounting update are not atomic together, so
//! two async locks keep them consistent: saves and deletes of one ID
//! serialize on a striped lock, and `nuke` takes the write side of a gate
//! that every save, delete and eviction holds for reading.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::gc::{spawn_gc_loop, GcConfig};
use super::{serialized_size, SizeEstimator, TierKind};
use crate::backpressure::{BackpressureLevel, BackpressureMode};
use crate::config::RelayStoreConfig;
use crate::context::Context;
use crate::error::{result_status, StorageError};
use crate::event::{Event, EventId};
use crate::eviction::{
    EvictionController, EvictionState, EvictionTarget, Occupancy, Victim, Watermarks,
};
use crate::filter::FilterSet;
use crate::observer::{MetricsObserver, StoreObserver};
use crate::storage::traits::{import_jsonl, CountResult, EventStore, ImportReport, SaveHooks};

/// Construction options for a [`BoundedTier`].
#[derive(Clone)]
pub struct BoundedTierOptions {
    pub capacity_bytes: u64,
    pub watermarks: Watermarks,
    pub eviction_batch_size: usize,
    pub backpressure: BackpressureMode,
    pub gc: GcConfig,
    pub size_estimator: SizeEstimator,
    pub observer: Arc<dyn StoreObserver>,
}

impl BoundedTierOptions {
    /// Defaults: 80/90 watermarks, batches of 256, accept on overflow,
    /// serialized-size accounting, metrics observer.
    #[must_use]
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            watermarks: Watermarks::new(80, 90),
            eviction_batch_size: 256,
            backpressure: BackpressureMode::Accept,
            gc: GcConfig::default(),
            size_estimator: serialized_size(),
            observer: Arc::new(MetricsObserver),
        }
    }

    #[must_use]
    pub fn from_config(config: &RelayStoreConfig) -> Self {
        Self {
            capacity_bytes: config.l1_capacity_bytes,
            watermarks: Watermarks::new(config.l1_low_watermark_pct, config.l1_high_watermark_pct),
            eviction_batch_size: config.eviction_batch_size,
            backpressure: config.l1_backpressure,
            gc: GcConfig::from_config(config),
            ..Self::new(config.l1_capacity_bytes)
        }
    }

    #[must_use]
    pub fn watermarks(mut self, low_pct: u8, high_pct: u8) -> Self {
        self.watermarks = Watermarks::new(low_pct, high_pct);
        self
    }

    #[must_use]
    pub fn eviction_batch_size(mut self, size: usize) -> Self {
        self.eviction_batch_size = size;
        self
    }

    #[must_use]
    pub fn backpressure(mut self, mode: BackpressureMode) -> Self {
        self.backpressure = mode;
        self
    }

    #[must_use]
    pub fn gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    /// Charge events by a custom size instead of their serialized length.
    #[must_use]
    pub fn size_estimator<F>(mut self, f: F) -> Self
    where
        F: Fn(&Event) -> u64 + Send + Sync + 'static,
    {
        self.size_estimator = Arc::new(f);
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn StoreObserver>) -> Self {
        self.observer = observer;
        self
    }
}

/// Per-event accounting, ordered by age for victim selection.
#[derive(Default)]
struct AgeIndex {
    by_age: BTreeSet<(i64, EventId)>,
    entries: HashMap<EventId, (i64, u64)>,
}

impl AgeIndex {
    /// False if `id` was already tracked.
    fn insert(&mut self, id: EventId, created_at: i64, size: u64) -> bool {
        if self.entries.contains_key(&id) {
            return false;
        }
        self.entries.insert(id, (created_at, size));
        self.by_age.insert((created_at, id));
        true
    }

    fn remove(&mut self, id: &EventId) -> Option<u64> {
        let (created_at, size) = self.entries.remove(id)?;
        self.by_age.remove(&(created_at, *id));
        Some(size)
    }

    fn oldest(&self, limit: usize) -> Vec<Victim> {
        self.by_age
            .iter()
            .take(limit)
            .filter_map(|(created_at, id)| {
                self.entries.get(id).map(|&(_, size)| Victim {
                    id: *id,
                    created_at: *created_at,
                    size,
                })
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.by_age.clear();
        self.entries.clear();
    }
}

/// Striped per-ID locks for save/delete ordering.
const ID_STRIPES: usize = 64;

struct Shared<S> {
    label: &'static str,
    store: Arc<S>,
    occupancy: Occupancy,
    eviction: EvictionController,
    index: Mutex<AgeIndex>,
    /// Read: engine write plus accounting. Write: nuke.
    gate: AsyncRwLock<()>,
    stripes: Vec<AsyncMutex<()>>,
    backpressure: BackpressureMode,
    gc: GcConfig,
    sizer: SizeEstimator,
    observer: Arc<dyn StoreObserver>,
    lifetime: Mutex<CancellationToken>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: EventStore + 'static> Shared<S> {
    fn lifetime(&self) -> CancellationToken {
        self.lifetime.lock().clone()
    }

    fn stripe(&self, id: &EventId) -> &AsyncMutex<()> {
        &self.stripes[usize::from(id.as_bytes()[0]) % self.stripes.len()]
    }

    fn level(&self) -> BackpressureLevel {
        BackpressureLevel::classify(self.occupancy.pressure(), &self.eviction.watermarks())
    }

    fn report_occupancy(&self) {
        self.observer
            .on_occupancy(self.label, self.occupancy.used(), self.occupancy.pressure());
    }

    fn track(&self, event: &Event) {
        let size = (self.sizer)(event);
        if self.index.lock().insert(event.id(), event.created_at(), size) {
            self.occupancy.add(size);
        }
    }

    fn untrack(&self, id: &EventId) -> u64 {
        match self.index.lock().remove(id) {
            Some(size) => {
                self.occupancy.sub(size);
                size
            }
            None => 0,
        }
    }

    /// Start a background pass if occupancy is at or above the high
    /// watermark and none is running.
    fn maybe_evict(self: &Arc<Self>) {
        if !self.eviction.should_start(&self.occupancy) || !self.eviction.try_begin() {
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let started = Instant::now();
                let cancel = shared.lifetime();
                let report = shared
                    .eviction
                    .run_pass(shared.label, &*shared, &shared.occupancy, &cancel)
                    .await;
                shared.observer.on_evicted(
                    shared.label,
                    report.evicted,
                    report.bytes_freed,
                    started.elapsed(),
                    report.exhausted,
                );
                shared.report_occupancy();
                shared.eviction.finish();

                // Saves that landed during the pass may have crossed high again
                if report.cancelled
                    || report.exhausted
                    || !shared.eviction.should_start(&shared.occupancy)
                    || !shared.eviction.try_begin()
                {
                    break;
                }
            }
        });
    }

    /// Apply the backpressure mode to a save arriving at or above capacity.
    ///
    /// `Block` waits for an eviction batch; if no pass can free space the
    /// wait ends only with `ctx` or with `close`.
    async fn admit(self: &Arc<Self>, ctx: &Context) -> Result<(), StorageError> {
        if self.occupancy.used() < self.occupancy.capacity() {
            return Ok(());
        }
        match self.backpressure {
            BackpressureMode::Accept => Ok(()),
            BackpressureMode::Reject => {
                self.maybe_evict();
                Err(StorageError::CapacityExceeded {
                    occupancy: self.occupancy.used(),
                    capacity: self.occupancy.capacity(),
                })
            }
            BackpressureMode::Block => {
                let started = Instant::now();
                debug!(
                    tier = self.label,
                    level = self.level().description(),
                    "Save blocked on capacity"
                );
                let lifetime = self.lifetime();
                self.maybe_evict();
                loop {
                    let notified = self.eviction.space_freed().notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if self.occupancy.used() < self.occupancy.capacity() {
                        break;
                    }

                    tokio::select! {
                        _ = &mut notified => {}
                        _ = ctx.done() => return Err(StorageError::Cancelled),
                        _ = lifetime.cancelled() => return Err(StorageError::Closed),
                    }
                }
                self.observer
                    .on_backpressure(self.label, self.level() as u8, started.elapsed());
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<S: EventStore + 'static> EvictionTarget for Shared<S> {
    fn oldest(&self, limit: usize) -> Vec<Victim> {
        self.index.lock().oldest(limit)
    }

    async fn evict(&self, victim: &Victim) -> Result<u64, StorageError> {
        let _gate = self.gate.read().await;
        // Claim the accounting first so a concurrent delete cannot double-release
        let Some(size) = self.index.lock().remove(&victim.id) else {
            return Ok(0);
        };
        match self.store.delete_event(&Context::background(), &victim.id, true).await {
            Ok(()) => {
                self.occupancy.sub(size);
                Ok(size)
            }
            Err(e) => {
                self.index.lock().insert(victim.id, victim.created_at, size);
                Err(e)
            }
        }
    }
}

/// Capacity-bounded tier. Cheap to clone.
pub struct BoundedTier<S> {
    shared: Arc<Shared<S>>,
}

impl<S> Clone for BoundedTier<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: EventStore + 'static> BoundedTier<S> {
    #[must_use]
    pub fn new(store: S, options: BoundedTierOptions) -> Self {
        Self::from_arc(Arc::new(store), options)
    }

    #[must_use]
    pub fn from_arc(store: Arc<S>, options: BoundedTierOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                label: TierKind::Bounded.label(),
                store,
                occupancy: Occupancy::new(options.capacity_bytes),
                eviction: EvictionController::new(options.watermarks, options.eviction_batch_size),
                index: Mutex::new(AgeIndex::default()),
                gate: AsyncRwLock::new(()),
                stripes: (0..ID_STRIPES).map(|_| AsyncMutex::new(())).collect(),
                backpressure: options.backpressure,
                gc: options.gc,
                sizer: options.size_estimator,
                observer: options.observer,
                lifetime: Mutex::new(CancellationToken::new()),
                gc_task: Mutex::new(None),
            }),
        }
    }

    /// The wrapped engine.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    /// Bytes currently charged against capacity.
    #[must_use]
    pub fn occupancy(&self) -> u64 {
        self.shared.occupancy.used()
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.shared.occupancy.capacity()
    }

    #[must_use]
    pub fn pressure(&self) -> f64 {
        self.shared.occupancy.pressure()
    }

    /// Number of events tracked for eviction.
    #[must_use]
    pub fn tracked_events(&self) -> usize {
        self.shared.index.lock().len()
    }

    #[must_use]
    pub fn watermarks(&self) -> Watermarks {
        self.shared.eviction.watermarks()
    }

    #[must_use]
    pub fn eviction_state(&self) -> EvictionState {
        self.shared.eviction.state()
    }

    #[must_use]
    pub fn subscribe_eviction(&self) -> watch::Receiver<EvictionState> {
        self.shared.eviction.subscribe()
    }

    #[must_use]
    pub fn backpressure_level(&self) -> BackpressureLevel {
        self.shared.level()
    }

    /// Resolves once no eviction pass is running.
    pub async fn wait_for_eviction(&self) {
        self.shared.eviction.wait_idle().await;
    }

    /// Rebuild accounting from whatever the engine already holds.
    async fn rebuild_index(&self) -> Result<usize, StorageError> {
        let events = self
            .shared
            .store
            .query_events(&Context::background(), &FilterSet::everything())
            .await?;
        self.shared.index.lock().clear();
        self.shared.occupancy.reset();
        for event in &events {
            self.shared.track(event);
        }
        Ok(events.len())
    }
}

#[async_trait]
impl<S: EventStore + 'static> EventStore for BoundedTier<S> {
    #[instrument(skip(self), fields(tier = "L1"))]
    async fn init(&self, path: &Path) -> Result<(), StorageError> {
        {
            let mut lifetime = self.shared.lifetime.lock();
            if lifetime.is_cancelled() {
                *lifetime = CancellationToken::new();
            }
        }
        self.shared.store.init(path).await?;

        let restored = self.rebuild_index().await?;
        self.shared.report_occupancy();
        info!(
            restored,
            occupancy = self.occupancy(),
            capacity = self.capacity(),
            "Bounded tier ready"
        );

        let gc = spawn_gc_loop(
            self.shared.label,
            self.shared.store.clone(),
            self.shared.gc.clone(),
            self.shared.observer.clone(),
            self.shared.lifetime(),
        );
        if let Some(old) = std::mem::replace(&mut *self.shared.gc_task.lock(), gc) {
            old.abort();
        }

        self.shared.maybe_evict();
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.shared.lifetime().cancel();
        let gc = self.shared.gc_task.lock().take();
        if let Some(handle) = gc {
            let _ = handle.await;
        }
        self.shared.eviction.wait_idle().await;
        debug!(tier = self.shared.label, "Bounded tier background tasks stopped");
        self.shared.store.close().await
    }

    async fn save_event(&self, ctx: &Context, event: &Event) -> Result<(), StorageError> {
        let started = Instant::now();
        let result = async {
            if self.shared.lifetime().is_cancelled() {
                return Err(StorageError::Closed);
            }
            self.shared.admit(ctx).await?;
            let _gate = self.shared.gate.read().await;
            let _id = self.shared.stripe(&event.id()).lock().await;
            self.shared.store.save_event(ctx, event).await?;
            self.shared.track(event);
            Ok(())
        }
        .await;

        self.shared
            .observer
            .on_operation(self.shared.label, "save", result_status(&result), started.elapsed());
        if result.is_ok() {
            self.shared.report_occupancy();
            self.shared.maybe_evict();
        }
        result
    }

    async fn query_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<Vec<Event>, StorageError> {
        let started = Instant::now();
        let result = self.shared.store.query_events(ctx, filters).await;
        self.shared
            .observer
            .on_operation(self.shared.label, "query", result_status(&result), started.elapsed());
        result
    }

    async fn count_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<CountResult, StorageError> {
        let started = Instant::now();
        let result = self.shared.store.count_events(ctx, filters).await;
        self.shared
            .observer
            .on_operation(self.shared.label, "count", result_status(&result), started.elapsed());
        result
    }

    async fn delete_event(
        &self,
        ctx: &Context,
        id: &EventId,
        no_tombstone: bool,
    ) -> Result<(), StorageError> {
        let started = Instant::now();
        let freed = {
            let _gate = self.shared.gate.read().await;
            let _id = self.shared.stripe(id).lock().await;
            self.shared
                .store
                .delete_event(ctx, id, no_tombstone)
                .await
                .map(|()| self.shared.untrack(id))
        };
        if matches!(freed, Ok(size) if size > 0) {
            self.shared.eviction.space_freed().notify_waiters();
            self.shared.report_occupancy();
        }
        let result = freed.map(|_| ());
        self.shared
            .observer
            .on_operation(self.shared.label, "delete", result_status(&result), started.elapsed());
        result
    }

    async fn sync(&self) -> Result<(), StorageError> {
        let started = Instant::now();
        let result = self.shared.store.sync().await;
        self.shared
            .observer
            .on_operation(self.shared.label, "sync", result_status(&result), started.elapsed());
        result
    }

    async fn import(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncBufRead + Unpin + Send),
    ) -> Result<ImportReport, StorageError> {
        // Through save_event so every record is charged
        import_jsonl(self, ctx, reader).await
    }

    async fn export(
        &self,
        ctx: &Context,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        authors: &[String],
    ) -> Result<usize, StorageError> {
        self.shared.store.export(ctx, writer, authors).await
    }

    async fn nuke(&self) -> Result<(), StorageError> {
        {
            let _gate = self.shared.gate.write().await;
            self.shared.store.nuke().await?;
            self.shared.index.lock().clear();
            self.shared.occupancy.reset();
        }
        self.shared.eviction.space_freed().notify_waiters();
        self.shared.report_occupancy();
        Ok(())
    }

    async fn collect_garbage(
        &self,
        ctx: &Context,
        deleted_before: i64,
    ) -> Result<usize, StorageError> {
        let started = Instant::now();
        let result = self.shared.store.collect_garbage(ctx, deleted_before).await;
        self.shared
            .observer
            .on_operation(self.shared.label, "gc", result_status(&result), started.elapsed());
        result
    }

    fn save_hooks(&self) -> Option<&dyn SaveHooks> {
        self.shared.store.save_hooks()
    }
}
