//! Storage tiers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  bounded.rs        - L1: capacity-bounded, watermark eviction│
//! │  authoritative.rs  - L2: unbounded source of truth           │
//! │  gc.rs             - Periodic tombstone garbage collection   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both tiers wrap any [`EventStore`](crate::storage::traits::EventStore)
//! engine and implement the same contract themselves.

pub mod authoritative;
pub mod bounded;
pub mod gc;

use std::fmt;
use std::sync::Arc;

use crate::event::{Event, SizedItem};

pub use authoritative::AuthoritativeTier;
pub use bounded::{BoundedTier, BoundedTierOptions};
pub use gc::{GcConfig, GcResult};

/// Which tier an operation or failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TierKind {
    /// L1
    Bounded,
    /// L2
    Authoritative,
}

impl TierKind {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Bounded => "L1",
            Self::Authoritative => "L2",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Bytes an event is charged against a bounded tier's capacity.
pub type SizeEstimator = Arc<dyn Fn(&Event) -> u64 + Send + Sync>;

/// Charges the event's serialized size.
#[must_use]
pub fn serialized_size() -> SizeEstimator {
    Arc::new(|event: &Event| event.size_bytes() as u64)
}
