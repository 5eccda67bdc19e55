//! Reconciliation: backfill L1 from L2.
//!
//! Every poll tick the reconciler asks L2 for records created in
//! `[high_water − overlap, now]` and saves them into L1. Records L1 already
//! holds come back as benign duplicates and are only counted. The overlap
//! covers writes that landed in L2 with a `created_at` older than the
//! previous tick's high-water mark.
//!
//! L2 is read in pages of `reconcile_batch_limit`. The high-water mark only
//! moves once the whole window was read and backfilled.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BackendState, Inner, ReconcileStats, TwoTierBackend};
use crate::context::Context;
use crate::error::StorageError;
use crate::event::{unix_now, Event};
use crate::filter::Filter;
use crate::storage::traits::EventStore;

/// Whole seconds of overlap, rounded up, never zero.
fn overlap_secs(overlap: Duration) -> i64 {
    let secs = overlap.as_millis().div_ceil(1000).max(1);
    i64::try_from(secs).unwrap_or(i64::MAX)
}

impl<L1, L2> TwoTierBackend<L1, L2>
where
    L1: EventStore + 'static,
    L2: EventStore + 'static,
{
    /// Run one reconciliation tick now.
    pub async fn reconcile_once(&self, ctx: &Context) -> Result<ReconcileStats, StorageError> {
        self.inner.reconcile_once(ctx).await
    }
}

impl<L1, L2> Inner<L1, L2>
where
    L1: EventStore + 'static,
    L2: EventStore + 'static,
{
    #[tracing::instrument(skip(self, ctx), fields(fetched, backfilled, pages))]
    pub(super) async fn reconcile_once(
        &self,
        ctx: &Context,
    ) -> Result<ReconcileStats, StorageError> {
        let started = Instant::now();
        let now = unix_now();
        let last_high = self.high_water.load(Ordering::Acquire);
        let since = last_high.saturating_sub(overlap_secs(self.options.overlap()));

        let mut stats = ReconcileStats {
            since,
            until: now,
            ..Default::default()
        };
        let mut events = self.fetch_window(ctx, since, now, &mut stats).await?;
        stats.fetched = events.len();

        // oldest first, so L1 ages them in creation order
        events.sort_by_key(|e| e.created_at());
        for event in &events {
            if ctx.is_done() {
                break;
            }
            match self.l1.save_event(ctx, event).await {
                Ok(()) => stats.backfilled += 1,
                Err(e) if e.is_benign() => stats.already_present += 1,
                Err(StorageError::Cancelled) => break,
                Err(e) => {
                    debug!(id = %event.id(), error = %e, "Backfill into L1 failed");
                    stats.failed += 1;
                }
            }
        }

        if ctx.is_done() {
            stats.truncated = true;
        }
        if stats.truncated {
            warn!(
                since,
                until = now,
                pages = stats.pages,
                "Reconciliation window not covered, high-water kept"
            );
        } else {
            self.high_water.fetch_max(now, Ordering::AcqRel);
        }

        let span = tracing::Span::current();
        span.record("fetched", stats.fetched);
        span.record("backfilled", stats.backfilled);
        span.record("pages", stats.pages);
        self.options.observer.on_reconciled(
            stats.fetched,
            stats.backfilled,
            self.high_water.load(Ordering::Acquire),
            started.elapsed(),
        );
        *self.last_reconcile.lock() = Some(stats.clone());
        Ok(stats)
    }

    /// Page newest-first through `[since, until]` on L2, `reconcile_batch_limit`
    /// records at a time (0 means one unbounded fetch).
    ///
    /// Each page ends at the oldest second the previous one reached. The page
    /// is widened by the records already seen in that second, so a second
    /// holding more records than one page still makes progress.
    async fn fetch_window(
        &self,
        ctx: &Context,
        since: i64,
        until: i64,
        stats: &mut ReconcileStats,
    ) -> Result<Vec<Event>, StorageError> {
        let page = self.options.reconcile_batch_limit;
        let mut seen = HashSet::new();
        let mut events: Vec<Event> = Vec::new();
        let mut upper = until;

        loop {
            let boundary = events.iter().filter(|e| e.created_at() == upper).count();
            let mut filter = Filter::all().since(since).until(upper);
            if page > 0 {
                filter = filter.limit(page + boundary);
            }
            let batch = self.l2.query_events(ctx, &filter.into()).await?;
            stats.pages += 1;

            let full = page > 0 && batch.len() >= page + boundary;
            let oldest = batch.iter().map(Event::created_at).min();
            events.extend(batch.into_iter().filter(|e| seen.insert(e.id())));

            if ctx.is_done() {
                stats.truncated = true;
                break;
            }
            match oldest {
                Some(oldest) if full => upper = oldest,
                _ => break,
            }
        }
        Ok(events)
    }
}

/// Reconciler task body. Ticks until `lifetime` is cancelled, then closes
/// both tiers and returns the aggregated close result.
pub(super) async fn run_reconciler<L1, L2>(
    inner: Arc<Inner<L1, L2>>,
    poll: Duration,
    lifetime: CancellationToken,
) -> Result<(), StorageError>
where
    L1: EventStore + 'static,
    L2: EventStore + 'static,
{
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick is immediate; init just set the high-water mark
    ticker.tick().await;

    info!(
        poll_ms = poll.as_millis() as u64,
        overlap_ms = inner.options.overlap().as_millis() as u64,
        "Reconciler started"
    );

    loop {
        tokio::select! {
            biased;
            _ = lifetime.cancelled() => break,
            _ = ticker.tick() => {
                inner.toggle_reconciling(true);
                let ctx = Context::from_token(lifetime.child_token());
                match inner.reconcile_once(&ctx).await {
                    Ok(stats) if stats.backfilled > 0 => {
                        debug!(
                            backfilled = stats.backfilled,
                            fetched = stats.fetched,
                            "Backfilled L1"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Reconciliation tick failed"),
                }
                inner.toggle_reconciling(false);
            }
        }
    }

    info!("Reconciler stopping, closing tiers");
    let result = inner.close_tiers().await;
    inner.set_state(BackendState::Closed);
    result
}
