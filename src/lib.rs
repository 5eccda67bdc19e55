//! # Relay Store
//!
//! A tiered, capacity-bounded event store for a relay.
//!
//! ## Architecture
//!
//! Two tiers behind one [`EventStore`] contract:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TwoTierBackend                         │
//! │  • Concurrent fan-out of every write to both tiers          │
//! │  • Per-tier error aggregation (MultiError)                  │
//! │  • Reads concatenate L1 then L2, counts take the max        │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                               │
//!                 ▼                               ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────┐
//! │      L1: BoundedTier          │ │    L2: AuthoritativeTier  │
//! │  • Byte budget (occupancy)    │ │  • Unbounded, never evicts│
//! │  • High/low watermark evict   │ │  • Source of truth        │
//! │  • Optional backpressure      │ │  • SQLite / MySQL (sqlx)  │
//! └───────────────────────────────┘ └───────────────────────────┘
//!                 ▲                               │
//!                 └──── reconciler (backfill) ────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relay_store::{Context, DefaultBackend, Event, EventStore, Filter, RelayStoreConfig};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayStoreConfig {
//!         l1_capacity_bytes: 64 * 1024 * 1024,
//!         ..Default::default()
//!     };
//!     let store = DefaultBackend::from_config(&config)?;
//!     store.init(Path::new(&config.data_path)).await?;
//!
//!     let ctx = Context::background();
//!     let event = Event::new("alice".into(), 1_700_000_000, 1, vec![], "gm".into(), String::new());
//!     store.save_event(&ctx, &event).await?;
//!
//!     let recent = store
//!         .query_events(&ctx, &Filter::all().kinds([1]).limit(10).into())
//!         .await?;
//!     println!("{} events", recent.len());
//!
//!     store.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Bounded L1**: occupancy-tracked byte budget with watermark eviction, oldest first
//! - **Backpressure**: accept, block or reject saves while L1 is over capacity
//! - **Tombstones**: deletions block re-saves; periodic GC purges expired tombstones
//! - **Reconciliation**: L1 is backfilled from L2 on a poll interval
//! - **Retry Logic**: SQL connections and statements retry transient failures
//!
//! ## Configuration
//!
//! See [`RelayStoreConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`backend`]: The [`TwoTierBackend`] composing both tiers
//! - [`tier`]: Bounded and authoritative tiers, tombstone GC
//! - [`storage`]: The [`EventStore`] contract and its engines (memory, SQL)
//! - [`eviction`]: Watermark eviction controller
//! - [`backpressure`]: Write admission under capacity pressure
//! - [`resilience`]: Retry logic

pub mod backend;
pub mod backpressure;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod eviction;
pub mod filter;
pub mod metrics;
pub mod observer;
pub mod resilience;
pub mod storage;
pub mod task_group;
pub mod tier;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use backend::{
    BackendOptions, BackendState, BackendStats, DefaultBackend, ReconcileStats, TwoTierBackend,
};
pub use backpressure::{BackpressureLevel, BackpressureMode};
pub use config::{ConfigError, RelayStoreConfig};
pub use context::Context;
pub use error::{MultiError, StorageError, TierFailure};
pub use event::{Event, EventId, SizedItem};
pub use eviction::{EvictionState, Watermarks};
pub use filter::{Filter, FilterSet};
pub use observer::{MetricsObserver, NoopObserver, StoreObserver};
pub use resilience::retry::RetryConfig;
pub use storage::traits::{save_with_hooks, CountResult, EventStore, ImportReport, SaveHooks};
pub use storage::{MemoryStore, SqlStore};
pub use task_group::{TaskGroup, TaskOutcome};
pub use tier::{AuthoritativeTier, BoundedTier, BoundedTierOptions, GcConfig, TierKind};
