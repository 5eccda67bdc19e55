//! Chaos Testing for Relay Store
//!
//! This module tests failure scenarios using:
//! 1. **FailingStore wrappers** - error injection per operation, or from a call count onwards
//! 2. **SlowStore wrappers** - a tier that stalls, to check cancellation responsiveness
//! 3. **Panicking tiers** - a branch that dies mid fan-out
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncWrite};

use relay_store::{
    BackendOptions, BackendState, Context, CountResult, Event, EventId, EventStore, FilterSet,
    ImportReport, MemoryStore, StorageError, StoreObserver, TierKind, TwoTierBackend,
};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Which operations a [`FailingStore`] sabotages.
#[derive(Default, Clone, Copy)]
struct FailOn {
    init: bool,
    save: bool,
    query: bool,
    count: bool,
    delete: bool,
    close: bool,
    panic_on_save: bool,
}

/// Wraps an engine and injects failures into the selected operations.
pub struct FailingStore<S: EventStore> {
    inner: S,
    fail_on: FailOn,
    /// Fail every call from this call number onwards (1-indexed); 0 = never
    fail_after: u64,
    call_count: AtomicU64,
    init_called: AtomicBool,
    error_msg: String,
}

impl<S: EventStore> FailingStore<S> {
    fn new(inner: S, fail_on: FailOn, error_msg: &str) -> Self {
        Self {
            inner,
            fail_on,
            fail_after: 0,
            call_count: AtomicU64::new(0),
            init_called: AtomicBool::new(false),
            error_msg: error_msg.to_string(),
        }
    }

    /// A store whose every operation fails after `n` successful calls.
    fn fail_after(inner: S, n: u64, error_msg: &str) -> Self {
        let mut store = Self::new(inner, FailOn::default(), error_msg);
        store.fail_after = n + 1;
        store
    }

    fn maybe_fail(&self, selected: bool) -> Result<(), StorageError> {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if selected || (self.fail_after > 0 && count >= self.fail_after) {
            Err(StorageError::Backend(self.error_msg.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: EventStore> EventStore for FailingStore<S> {
    async fn init(&self, path: &Path) -> Result<(), StorageError> {
        self.init_called.store(true, Ordering::SeqCst);
        if self.fail_on.init {
            return Err(StorageError::Unavailable {
                path: path.display().to_string(),
                reason: self.error_msg.clone(),
            });
        }
        self.inner.init(path).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        // still close the engine, then report
        let closed = self.inner.close().await;
        if self.fail_on.close {
            return Err(StorageError::Unavailable {
                path: "engine".into(),
                reason: self.error_msg.clone(),
            });
        }
        closed
    }

    async fn save_event(&self, ctx: &Context, event: &Event) -> Result<(), StorageError> {
        if self.fail_on.panic_on_save {
            panic!("{}", self.error_msg);
        }
        self.maybe_fail(self.fail_on.save)?;
        self.inner.save_event(ctx, event).await
    }

    async fn query_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<Vec<Event>, StorageError> {
        self.maybe_fail(self.fail_on.query)?;
        self.inner.query_events(ctx, filters).await
    }

    async fn count_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<CountResult, StorageError> {
        self.maybe_fail(self.fail_on.count)?;
        self.inner.count_events(ctx, filters).await
    }

    async fn delete_event(
        &self,
        ctx: &Context,
        id: &EventId,
        no_tombstone: bool,
    ) -> Result<(), StorageError> {
        self.maybe_fail(self.fail_on.delete)?;
        self.inner.delete_event(ctx, id, no_tombstone).await
    }

    async fn sync(&self) -> Result<(), StorageError> {
        self.inner.sync().await
    }

    async fn import(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncBufRead + Unpin + Send),
    ) -> Result<ImportReport, StorageError> {
        self.inner.import(ctx, reader).await
    }

    async fn export(
        &self,
        ctx: &Context,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        authors: &[String],
    ) -> Result<usize, StorageError> {
        self.inner.export(ctx, writer, authors).await
    }

    async fn nuke(&self) -> Result<(), StorageError> {
        self.inner.nuke().await
    }
}

// =============================================================================
// Slow Store Wrapper - a tier that stalls
// =============================================================================

/// Sleeps before every read, ignoring the caller's context.
pub struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait]
impl EventStore for SlowStore {
    async fn init(&self, path: &Path) -> Result<(), StorageError> {
        self.inner.init(path).await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.close().await
    }

    async fn save_event(&self, ctx: &Context, event: &Event) -> Result<(), StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.save_event(ctx, event).await
    }

    async fn query_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<Vec<Event>, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.query_events(ctx, filters).await
    }

    async fn count_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<CountResult, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.count_events(ctx, filters).await
    }

    async fn delete_event(
        &self,
        ctx: &Context,
        id: &EventId,
        no_tombstone: bool,
    ) -> Result<(), StorageError> {
        self.inner.delete_event(ctx, id, no_tombstone).await
    }

    async fn sync(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn import(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncBufRead + Unpin + Send),
    ) -> Result<ImportReport, StorageError> {
        self.inner.import(ctx, reader).await
    }

    async fn export(
        &self,
        ctx: &Context,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        authors: &[String],
    ) -> Result<usize, StorageError> {
        self.inner.export(ctx, writer, authors).await
    }

    async fn nuke(&self) -> Result<(), StorageError> {
        self.inner.nuke().await
    }
}

// =============================================================================
// Recording observer
// =============================================================================

#[derive(Default)]
struct FailureLog {
    failures: Mutex<Vec<(String, String)>>,
}

impl StoreObserver for FailureLog {
    fn on_tier_failure(&self, tier: &str, operation: &str) {
        self.failures.lock().push((tier.to_string(), operation.to_string()));
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn note(created_at: i64, content: &str) -> Event {
    Event::new("chaos".into(), created_at, 1, vec![], content.into(), String::new())
}

fn quiet() -> BackendOptions {
    BackendOptions {
        poll_frequency: None,
        observer: Arc::new(relay_store::NoopObserver),
        ..Default::default()
    }
}

async fn ready<L1, L2>(l1: Arc<L1>, l2: Arc<L2>, options: BackendOptions) -> TwoTierBackend<L1, L2>
where
    L1: EventStore + 'static,
    L2: EventStore + 'static,
{
    let backend = TwoTierBackend::from_arcs(l1, l2, options);
    backend.init(Path::new("unused")).await.expect("init");
    backend
}

// =============================================================================
// Error aggregation
// =============================================================================

#[tokio::test]
async fn chaos_l2_save_failure_names_only_l2() {
    let l1 = Arc::new(MemoryStore::new());
    let l2 = Arc::new(FailingStore::new(
        MemoryStore::new(),
        FailOn { save: true, ..Default::default() },
        "disk full",
    ));
    let backend = ready(l1.clone(), l2, quiet()).await;
    let ctx = Context::background();
    let e = note(1, "half written");

    let err = backend.save_event(&ctx, &e).await.unwrap_err();
    let multi = err.as_multi().expect("aggregated error");
    assert_eq!(multi.failed_tiers(), vec![TierKind::Authoritative]);
    assert!(multi.failure_for(TierKind::Bounded).is_none());
    assert!(err.to_string().contains("disk full"));

    // the healthy tier still took the write
    assert!(l1.contains(&e.id()));
}

#[tokio::test]
async fn chaos_both_tiers_failing_keeps_order() {
    let fail = FailOn { save: true, ..Default::default() };
    let l1 = Arc::new(FailingStore::new(MemoryStore::new(), fail, "l1 broke"));
    let l2 = Arc::new(FailingStore::new(MemoryStore::new(), fail, "l2 broke"));
    let backend = ready(l1, l2, quiet()).await;

    let err = backend.save_event(&Context::background(), &note(1, "x")).await.unwrap_err();
    let multi = err.as_multi().unwrap();
    assert_eq!(multi.failed_tiers(), vec![TierKind::Bounded, TierKind::Authoritative]);
    assert_eq!(multi.len(), 2);
}

#[tokio::test]
async fn chaos_duplicate_plus_failure_is_still_an_error() {
    let l1 = Arc::new(MemoryStore::new());
    let l2 = Arc::new(FailingStore::new(
        MemoryStore::new(),
        FailOn { save: true, ..Default::default() },
        "l2 down",
    ));
    let backend = ready(l1.clone(), l2, quiet()).await;
    let ctx = Context::background();
    let e = note(1, "dup");
    l1.save_event(&ctx, &e).await.unwrap();

    let err = backend.save_event(&ctx, &e).await.unwrap_err();
    assert_eq!(err.as_multi().unwrap().failed_tiers(), vec![TierKind::Authoritative]);
}

#[tokio::test]
async fn chaos_query_failure_in_one_tier_is_reported() {
    let l2 = Arc::new(FailingStore::new(
        MemoryStore::new(),
        FailOn { query: true, count: true, ..Default::default() },
        "index corrupt",
    ));
    let backend = ready(Arc::new(MemoryStore::new()), l2, quiet()).await;
    let ctx = Context::background();

    let err = backend.query_events(&ctx, &FilterSet::everything()).await.unwrap_err();
    assert_eq!(err.as_multi().unwrap().failed_tiers(), vec![TierKind::Authoritative]);

    let err = backend.count_events(&ctx, &FilterSet::everything()).await.unwrap_err();
    assert_eq!(err.as_multi().unwrap().failed_tiers(), vec![TierKind::Authoritative]);
}

#[tokio::test]
async fn chaos_delete_failure_still_deletes_from_healthy_tier() {
    let l1 = Arc::new(MemoryStore::new());
    let l2 = Arc::new(FailingStore::new(
        MemoryStore::new(),
        FailOn { delete: true, ..Default::default() },
        "locked",
    ));
    let backend = ready(l1.clone(), l2, quiet()).await;
    let ctx = Context::background();
    let e = note(1, "delete me");
    backend.save_event(&ctx, &e).await.unwrap();

    let err = backend.delete_event(&ctx, &e.id(), false).await.unwrap_err();
    assert_eq!(err.as_multi().unwrap().failed_tiers(), vec![TierKind::Authoritative]);
    assert!(!l1.contains(&e.id()));
}

#[tokio::test]
async fn chaos_fail_after_n_calls() {
    let l2 = Arc::new(FailingStore::fail_after(MemoryStore::new(), 2, "connection reset"));
    let backend = ready(Arc::new(MemoryStore::new()), l2, quiet()).await;
    let ctx = Context::background();

    backend.save_event(&ctx, &note(1, "a")).await.unwrap();
    backend.save_event(&ctx, &note(2, "b")).await.unwrap();
    let err = backend.save_event(&ctx, &note(3, "c")).await.unwrap_err();
    assert_eq!(err.as_multi().unwrap().failed_tiers(), vec![TierKind::Authoritative]);
}

#[tokio::test]
async fn chaos_panicking_tier_is_attributed() {
    let l2 = Arc::new(FailingStore::new(
        MemoryStore::new(),
        FailOn { panic_on_save: true, ..Default::default() },
        "tier exploded",
    ));
    let l1 = Arc::new(MemoryStore::new());
    let backend = ready(l1.clone(), l2, quiet()).await;
    let e = note(1, "boom");

    let err = backend.save_event(&Context::background(), &e).await.unwrap_err();
    let multi = err.as_multi().unwrap();
    assert_eq!(multi.failed_tiers(), vec![TierKind::Authoritative]);
    assert!(matches!(
        multi.failure_for(TierKind::Authoritative),
        Some(StorageError::Backend(msg)) if msg.contains("panicked")
    ));
    assert!(l1.contains(&e.id()));
}

#[tokio::test]
async fn chaos_observer_sees_tier_failures() {
    let log = Arc::new(FailureLog::default());
    let options = BackendOptions {
        observer: log.clone(),
        ..quiet()
    };
    let l2 = Arc::new(FailingStore::new(
        MemoryStore::new(),
        FailOn { save: true, ..Default::default() },
        "nope",
    ));
    let backend = ready(Arc::new(MemoryStore::new()), l2, options).await;

    let _ = backend.save_event(&Context::background(), &note(1, "x")).await;
    assert_eq!(*log.failures.lock(), vec![("L2".to_string(), "save".to_string())]);
}

// =============================================================================
// Lifecycle failures
// =============================================================================

#[tokio::test]
async fn chaos_init_is_fail_fast() {
    let l1 = Arc::new(FailingStore::new(
        MemoryStore::new(),
        FailOn { init: true, ..Default::default() },
        "cannot open",
    ));
    let l2 = Arc::new(FailingStore::new(MemoryStore::new(), FailOn::default(), ""));
    let backend = TwoTierBackend::from_arcs(l1, l2.clone(), quiet());

    let err = backend.init(Path::new("unused")).await.unwrap_err();
    assert!(matches!(err, StorageError::Unavailable { .. }));
    assert!(!l2.init_called.load(Ordering::SeqCst));
    assert_eq!(backend.state(), BackendState::Created);
}

#[tokio::test]
async fn chaos_close_attempts_both_tiers() {
    let l1 = Arc::new(FailingStore::new(
        MemoryStore::new(),
        FailOn { close: true, ..Default::default() },
        "flush failed",
    ));
    let l2 = Arc::new(MemoryStore::new());
    let backend = ready(l1, l2.clone(), quiet()).await;

    let err = backend.close().await.unwrap_err();
    assert_eq!(err.as_multi().unwrap().failed_tiers(), vec![TierKind::Bounded]);
    assert_eq!(backend.state(), BackendState::Closed);

    // L2 was closed despite L1's failure
    let ctx = Context::background();
    assert!(matches!(
        l2.count_events(&ctx, &FilterSet::everything()).await,
        Err(StorageError::Closed)
    ));
}

#[tokio::test]
async fn chaos_reconcile_with_broken_l2_keeps_high_water() {
    let l2 = Arc::new(FailingStore::new(
        MemoryStore::new(),
        FailOn { query: true, ..Default::default() },
        "l2 unreachable",
    ));
    let backend = ready(Arc::new(MemoryStore::new()), l2, quiet()).await;
    let before = backend.high_water();

    let err = backend.reconcile_once(&Context::background()).await.unwrap_err();
    assert!(matches!(err, StorageError::Backend(_)));
    assert_eq!(backend.high_water(), before);
    assert!(backend.last_reconcile().is_none());
}

// =============================================================================
// Cancellation responsiveness
// =============================================================================

#[tokio::test]
async fn chaos_cancelled_query_returns_before_slow_tier() {
    let l1 = Arc::new(MemoryStore::new());
    let l2 = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::from_secs(30),
    });
    let backend = ready(l1.clone(), l2, quiet()).await;
    let e = note(1, "fast copy");
    l1.save_event(&Context::background(), &e).await.unwrap();

    let ctx = Context::background().with_timeout(Duration::from_millis(100));
    let started = Instant::now();
    let found = backend.query_events(&ctx, &FilterSet::everything()).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    // only the fast tier answered
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), e.id());
}

#[tokio::test]
async fn chaos_cancelled_count_is_approximate() {
    let l1 = Arc::new(MemoryStore::new());
    let l2 = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::from_secs(30),
    });
    let backend = ready(l1.clone(), l2, quiet()).await;
    l1.save_event(&Context::background(), &note(1, "a")).await.unwrap();

    let ctx = Context::background();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let count = backend.count_events(&ctx, &FilterSet::everything()).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(count.count, 1);
    assert!(count.approximate);
}

#[tokio::test]
async fn chaos_cancelled_save_reports_unfinished_tier() {
    let l1 = Arc::new(MemoryStore::new());
    let l2 = Arc::new(SlowStore {
        inner: MemoryStore::new(),
        delay: Duration::from_secs(30),
    });
    let backend = ready(l1.clone(), l2, quiet()).await;
    let e = note(1, "in flight");

    let ctx = Context::background().with_timeout(Duration::from_millis(100));
    let err = backend.save_event(&ctx, &e).await.unwrap_err();
    assert!(matches!(
        err.as_multi().unwrap().failure_for(TierKind::Authoritative),
        Some(StorageError::Cancelled)
    ));
    assert!(l1.contains(&e.id()));
}
