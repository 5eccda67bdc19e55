// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! L2: the unbounded source of truth.
//!
//! A pass-through over an engine that adds instrumentation and, only when
//! asked for, tombstone GC. Nothing is ever evicted from this tier.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::gc::{spawn_gc_loop, GcConfig};
use super::TierKind;
use crate::context::Context;
use crate::error::{result_status, StorageError};
use crate::event::{Event, EventId};
use crate::filter::FilterSet;
use crate::observer::{MetricsObserver, StoreObserver};
use crate::storage::traits::{CountResult, EventStore, ImportReport, SaveHooks};

pub struct AuthoritativeTier<S> {
    store: Arc<S>,
    gc: GcConfig,
    observer: Arc<dyn StoreObserver>,
    lifetime: Mutex<CancellationToken>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: EventStore + 'static> AuthoritativeTier<S> {
    /// GC is off; the authoritative copy keeps its tombstones.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    #[must_use]
    pub fn from_arc(store: Arc<S>) -> Self {
        Self {
            store,
            gc: GcConfig::disabled(),
            observer: Arc::new(MetricsObserver),
            lifetime: Mutex::new(CancellationToken::new()),
            gc_task: Mutex::new(None),
        }
    }

    /// Opt in to tombstone GC on this tier.
    #[must_use]
    pub fn with_gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn StoreObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn label(&self) -> &'static str {
        TierKind::Authoritative.label()
    }

    fn observe<T>(&self, op: &str, started: Instant, result: &Result<T, StorageError>) {
        self.observer
            .on_operation(self.label(), op, result_status(result), started.elapsed());
    }
}

#[async_trait]
impl<S: EventStore + 'static> EventStore for AuthoritativeTier<S> {
    #[instrument(skip(self), fields(tier = "L2"))]
    async fn init(&self, path: &Path) -> Result<(), StorageError> {
        let lifetime = {
            let mut lifetime = self.lifetime.lock();
            if lifetime.is_cancelled() {
                *lifetime = CancellationToken::new();
            }
            lifetime.clone()
        };
        self.store.init(path).await?;

        let gc = spawn_gc_loop(
            self.label(),
            self.store.clone(),
            self.gc.clone(),
            self.observer.clone(),
            lifetime,
        );
        if let Some(old) = std::mem::replace(&mut *self.gc_task.lock(), gc) {
            old.abort();
        }
        info!(gc = self.gc.enabled, "Authoritative tier ready");
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.lifetime.lock().cancel();
        let gc = self.gc_task.lock().take();
        if let Some(handle) = gc {
            let _ = handle.await;
        }
        self.store.close().await
    }

    async fn save_event(&self, ctx: &Context, event: &Event) -> Result<(), StorageError> {
        let started = Instant::now();
        let result = self.store.save_event(ctx, event).await;
        self.observe("save", started, &result);
        result
    }

    async fn query_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<Vec<Event>, StorageError> {
        let started = Instant::now();
        let result = self.store.query_events(ctx, filters).await;
        self.observe("query", started, &result);
        result
    }

    async fn count_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<CountResult, StorageError> {
        let started = Instant::now();
        let result = self.store.count_events(ctx, filters).await;
        self.observe("count", started, &result);
        result
    }

    async fn delete_event(
        &self,
        ctx: &Context,
        id: &EventId,
        no_tombstone: bool,
    ) -> Result<(), StorageError> {
        let started = Instant::now();
        let result = self.store.delete_event(ctx, id, no_tombstone).await;
        self.observe("delete", started, &result);
        result
    }

    async fn sync(&self) -> Result<(), StorageError> {
        let started = Instant::now();
        let result = self.store.sync().await;
        self.observe("sync", started, &result);
        result
    }

    async fn import(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncBufRead + Unpin + Send),
    ) -> Result<ImportReport, StorageError> {
        let started = Instant::now();
        let result = self.store.import(ctx, reader).await;
        self.observe("import", started, &result);
        result
    }

    async fn export(
        &self,
        ctx: &Context,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        authors: &[String],
    ) -> Result<usize, StorageError> {
        let started = Instant::now();
        let result = self.store.export(ctx, writer, authors).await;
        self.observe("export", started, &result);
        result
    }

    async fn nuke(&self) -> Result<(), StorageError> {
        let started = Instant::now();
        let result = self.store.nuke().await;
        self.observe("nuke", started, &result);
        result
    }

    async fn collect_garbage(
        &self,
        ctx: &Context,
        deleted_before: i64,
    ) -> Result<usize, StorageError> {
        let started = Instant::now();
        let result = self.store.collect_garbage(ctx, deleted_before).await;
        self.observe("gc", started, &result);
        result
    }

    fn save_hooks(&self) -> Option<&dyn SaveHooks> {
        self.store.save_hooks()
    }
}
