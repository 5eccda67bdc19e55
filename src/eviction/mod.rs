//! Watermark eviction for the bounded tier.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Eviction Module                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  watermark.rs   - Occupancy tracking and pass control        │
//! │  └─ Watermarks: low/high percentages of capacity             │
//! │  └─ Occupancy: lock-free running byte total                  │
//! │  └─ EvictionController: one pass at a time, oldest first     │
//! │  └─ EvictionTarget: what a pass selects from and deletes     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # State machine
//!
//! ```text
//! Normal ──(occupancy >= high)──▶ Evicting ──(occupancy <= low
//!    ▲                                          or no candidates)──┐
//!    └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Throughput
//!
//! Saves are not rejected by default. Sustainable write rate is roughly
//! `(high - low) * capacity` bytes per pass; if writes outpace that, enable
//! [`BackpressureMode::Block`](crate::BackpressureMode) or `Reject`.

pub mod watermark;

pub use watermark::{
    EvictionController, EvictionState, EvictionTarget, Occupancy, PassReport, Victim, Watermarks,
};
