//! The [`EventStore`] surface of the backend: fan-out and merging.

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, instrument, warn};

use super::{Inner, TwoTierBackend};
use crate::context::Context;
use crate::error::{MultiError, StorageError};
use crate::event::{Event, EventId};
use crate::filter::{Filter, FilterSet};
use crate::storage::traits::{write_jsonl, CountResult, EventStore, ImportReport, SaveHooks};
use crate::task_group::{TaskGroup, TaskOutcome};
use crate::tier::TierKind;

/// Per-tier results of one fan-out, split into values and failures.
struct Settled<T> {
    values: Vec<(TierKind, T)>,
    failures: MultiError,
    /// A branch was abandoned or cancelled and its result is missing
    partial: bool,
}

impl<L1, L2> Inner<L1, L2>
where
    L1: EventStore + 'static,
    L2: EventStore + 'static,
{
    fn tiers(&self) -> [(TierKind, Arc<dyn EventStore>); 2] {
        [
            (TierKind::Bounded, self.l1.clone() as Arc<dyn EventStore>),
            (TierKind::Authoritative, self.l2.clone() as Arc<dyn EventStore>),
        ]
    }

    /// Spawn `op` once per tier, L1 first.
    fn fan_out<T, F, Fut>(&self, mut op: F) -> TaskGroup<Result<T, StorageError>>
    where
        T: Send + 'static,
        F: FnMut(Arc<dyn EventStore>) -> Fut,
        Fut: Future<Output = Result<T, StorageError>> + Send + 'static,
    {
        let mut group = TaskGroup::new();
        for (kind, tier) in self.tiers() {
            group.spawn(kind, op(tier));
        }
        group
    }

    /// Sort joined outcomes into values and attributed failures.
    ///
    /// With `partial_ok`, cancelled or abandoned branches are dropped instead
    /// of being reported as failures.
    fn settle<T>(
        &self,
        op: &'static str,
        results: Vec<(TierKind, TaskOutcome<Result<T, StorageError>>)>,
        partial_ok: bool,
    ) -> Settled<T> {
        let mut settled = Settled {
            values: Vec::with_capacity(results.len()),
            failures: MultiError::new(),
            partial: false,
        };
        for (tier, outcome) in results {
            let error = match outcome {
                TaskOutcome::Finished(Ok(value)) => {
                    settled.values.push((tier, value));
                    continue;
                }
                TaskOutcome::Finished(Err(StorageError::Cancelled)) | TaskOutcome::Abandoned
                    if partial_ok =>
                {
                    settled.partial = true;
                    continue;
                }
                TaskOutcome::Finished(Err(e)) => e,
                TaskOutcome::Panicked(msg) => {
                    StorageError::Backend(format!("{op} task panicked: {msg}"))
                }
                TaskOutcome::Abandoned => StorageError::Cancelled,
            };
            debug!(%tier, op, error = %error, "Tier operation failed");
            self.options.observer.on_tier_failure(tier.label(), op);
            settled.failures.push(tier, op, error);
        }
        settled
    }

    fn dedup(&self, events: &mut Vec<Event>) {
        if self.options.dedup_queries {
            let mut seen = HashSet::with_capacity(events.len());
            events.retain(|e| seen.insert(e.id()));
        }
    }
}

#[async_trait]
impl<L1, L2> EventStore for TwoTierBackend<L1, L2>
where
    L1: EventStore + 'static,
    L2: EventStore + 'static,
{
    async fn init(&self, path: &Path) -> Result<(), StorageError> {
        self.start(path).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.shutdown().await
    }

    /// Save to both tiers.
    ///
    /// Succeeds if at least one tier stored the record and no tier failed.
    /// When neither stored it, the first benign outcome in tier order
    /// (`Duplicate` or `Deleted`) is returned.
    #[instrument(skip(self, ctx, event), fields(id = %event.id()))]
    async fn save_event(&self, ctx: &Context, event: &Event) -> Result<(), StorageError> {
        let started = Instant::now();
        let inner = &self.inner;

        let group = inner.fan_out(|tier| {
            let ctx = ctx.clone();
            let event = event.clone();
            async move {
                match tier.save_event(&ctx, &event).await {
                    Ok(()) => Ok(None),
                    Err(e) if e.is_benign() => Ok(Some(e)),
                    Err(e) => Err(e),
                }
            }
        });
        let settled = inner.settle("save", group.join_until(ctx).await, false);

        let result = if !settled.failures.is_empty() {
            Err(StorageError::Tiers(settled.failures))
        } else {
            let mut benign = None;
            let mut stored = false;
            for (_, outcome) in settled.values {
                match outcome {
                    None => stored = true,
                    Some(e) => {
                        benign.get_or_insert(e);
                    }
                }
            }
            match benign {
                Some(e) if !stored => Err(e),
                _ => Ok(()),
            }
        };
        inner.observe("save", started, &result);
        result
    }

    /// L1 results followed by L2 results.
    ///
    /// A record held by both tiers appears twice unless `dedup_queries` is
    /// set. If `ctx` ends first, whatever the finished tiers returned is
    /// given back.
    #[instrument(skip(self, ctx, filters), fields(filters = filters.len()))]
    async fn query_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<Vec<Event>, StorageError> {
        let started = Instant::now();
        let inner = &self.inner;

        let group = inner.fan_out(|tier| {
            let ctx = ctx.clone();
            let filters = filters.clone();
            async move { tier.query_events(&ctx, &filters).await }
        });
        let settled = inner.settle("query", group.join_until(ctx).await, true);

        let result = if settled.failures.is_empty() {
            let mut events = Vec::new();
            for (_, batch) in settled.values {
                events.extend(batch);
            }
            inner.dedup(&mut events);
            Ok(events)
        } else {
            Err(StorageError::Tiers(settled.failures))
        };
        inner.observe("query", started, &result);
        result
    }

    /// `max(L1, L2)`. Approximate if either tier's count is, or if a tier
    /// did not answer before `ctx` ended.
    async fn count_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<CountResult, StorageError> {
        let started = Instant::now();
        let inner = &self.inner;

        let group = inner.fan_out(|tier| {
            let ctx = ctx.clone();
            let filters = filters.clone();
            async move { tier.count_events(&ctx, &filters).await }
        });
        let settled = inner.settle("count", group.join_until(ctx).await, true);

        let result = if !settled.failures.is_empty() {
            Err(StorageError::Tiers(settled.failures))
        } else if settled.values.is_empty() {
            Err(StorageError::Cancelled)
        } else {
            let merged = settled.values.iter().fold(
                CountResult {
                    count: 0,
                    approximate: settled.partial,
                },
                |acc, (_, c)| CountResult {
                    count: acc.count.max(c.count),
                    approximate: acc.approximate || c.approximate,
                },
            );
            Ok(merged)
        };
        inner.observe("count", started, &result);
        result
    }

    async fn delete_event(
        &self,
        ctx: &Context,
        id: &EventId,
        no_tombstone: bool,
    ) -> Result<(), StorageError> {
        let started = Instant::now();
        let inner = &self.inner;

        let id = *id;
        let group = inner.fan_out(|tier| {
            let ctx = ctx.clone();
            async move { tier.delete_event(&ctx, &id, no_tombstone).await }
        });
        let result = inner
            .settle("delete", group.join_until(ctx).await, false)
            .failures
            .into_result(());
        inner.observe("delete", started, &result);
        result
    }

    async fn sync(&self) -> Result<(), StorageError> {
        let group = self.inner.fan_out(|tier| async move { tier.sync().await });
        self.inner
            .settle("sync", group.join_all().await, false)
            .failures
            .into_result(())
    }

    /// Imports go to L1 only; L2 is fed by its own writers.
    async fn import(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncBufRead + Unpin + Send),
    ) -> Result<ImportReport, StorageError> {
        let started = Instant::now();
        let result = self.inner.l1.import(ctx, reader).await;
        self.inner.observe("import", started, &result);
        result
    }

    /// L1's records, then L2's. Both tiers are attempted even if L1 fails.
    async fn export(
        &self,
        ctx: &Context,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        authors: &[String],
    ) -> Result<usize, StorageError> {
        let started = Instant::now();
        let inner = &self.inner;
        let mut failures = MultiError::new();
        let mut written = 0usize;

        if inner.options.dedup_queries {
            let filters = FilterSet::from(Filter::all().authors(authors.iter().cloned()));
            let mut seen = HashSet::new();
            for (kind, tier) in inner.tiers() {
                match tier.query_events(ctx, &filters).await {
                    Ok(mut events) => {
                        events.retain(|e| seen.insert(e.id()));
                        events.sort_by_key(|e| e.created_at());
                        match write_jsonl(ctx, writer, events).await {
                            Ok(n) => written += n,
                            Err(e) => failures.push(kind, "export", e),
                        }
                    }
                    Err(e) => failures.push(kind, "export", e),
                }
            }
        } else {
            for (kind, tier) in inner.tiers() {
                match tier.export(ctx, writer, authors).await {
                    Ok(n) => written += n,
                    Err(e) => {
                        warn!(tier = %kind, error = %e, "Export failed");
                        failures.push(kind, "export", e);
                    }
                }
            }
        }

        let result = failures.into_result(written);
        inner.observe("export", started, &result);
        result
    }

    async fn nuke(&self) -> Result<(), StorageError> {
        let started = Instant::now();
        let group = self.inner.fan_out(|tier| async move { tier.nuke().await });
        let result = self
            .inner
            .settle("nuke", group.join_all().await, false)
            .failures
            .into_result(());
        self.inner.observe("nuke", started, &result);
        result
    }

    /// Tombstones purged across both tiers.
    async fn collect_garbage(
        &self,
        ctx: &Context,
        deleted_before: i64,
    ) -> Result<usize, StorageError> {
        let group = self.inner.fan_out(|tier| {
            let ctx = ctx.clone();
            async move { tier.collect_garbage(&ctx, deleted_before).await }
        });
        let settled = self.inner.settle("gc", group.join_until(ctx).await, false);
        let purged = settled.values.iter().map(|(_, n)| n).sum();
        settled.failures.into_result(purged)
    }

    fn save_hooks(&self) -> Option<&dyn SaveHooks> {
        let inner = &self.inner;
        if inner.l1.save_hooks().is_some() || inner.l2.save_hooks().is_some() {
            Some(self)
        } else {
            None
        }
    }
}

/// Runs L1's hooks, then L2's.
#[async_trait]
impl<L1, L2> SaveHooks for TwoTierBackend<L1, L2>
where
    L1: EventStore + 'static,
    L2: EventStore + 'static,
{
    async fn before_save(&self, ctx: &Context, event: &Event) -> Result<(), StorageError> {
        if let Some(hooks) = self.inner.l1.save_hooks() {
            hooks.before_save(ctx, event).await?;
        }
        if let Some(hooks) = self.inner.l2.save_hooks() {
            hooks.before_save(ctx, event).await?;
        }
        Ok(())
    }

    async fn after_save(&self, event: &Event) {
        if let Some(hooks) = self.inner.l1.save_hooks() {
            hooks.after_save(event).await;
        }
        if let Some(hooks) = self.inner.l2.save_hooks() {
            hooks.after_save(event).await;
        }
    }
}
