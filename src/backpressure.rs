// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backpressure for the bounded tier.
//!
//! Eviction normally keeps occupancy between the watermarks. When writes
//! outpace it, [`BackpressureMode`] decides whether saves above capacity are
//! accepted anyway, made to wait for an eviction batch, or rejected.
//!
//! # Example
//!
//! ```
//! use relay_store::{BackpressureLevel, Watermarks};
//!
//! let marks = Watermarks::new(25, 50);
//!
//! assert_eq!(BackpressureLevel::classify(0.10, &marks), BackpressureLevel::Normal);
//! assert_eq!(BackpressureLevel::classify(0.50, &marks), BackpressureLevel::Evicting);
//! assert_eq!(BackpressureLevel::classify(1.00, &marks), BackpressureLevel::Saturated);
//! assert!(!BackpressureLevel::Saturated.should_accept_writes());
//! ```

use serde::Deserialize;

use crate::eviction::Watermarks;

/// How the bounded tier treats a save while occupancy is at or above capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Accept and rely on eviction catching up
    #[default]
    Accept,
    /// Wait for eviction to free space (bounded by the caller's context)
    Block,
    /// Fail with `CapacityExceeded`
    Reject,
}

/// Occupancy level relative to the watermarks.
///
/// - **Normal** (< high): accept everything
/// - **Evicting** (high .. 100%): accept, eviction pass running
/// - **Saturated** (>= 100%): eviction is behind; mode decides
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackpressureLevel {
    Normal = 0,
    Evicting = 1,
    Saturated = 2,
}

impl BackpressureLevel {
    /// Classify a pressure ratio (occupancy / capacity).
    #[must_use]
    pub fn classify(pressure: f64, marks: &Watermarks) -> Self {
        if pressure >= 1.0 {
            Self::Saturated
        } else if pressure >= marks.high_fraction() {
            Self::Evicting
        } else {
            Self::Normal
        }
    }

    /// Whether a save should go through without waiting.
    #[must_use]
    pub fn should_accept_writes(&self) -> bool {
        !matches!(self, Self::Saturated)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Evicting => "Above high watermark - eviction running",
            Self::Saturated => "At capacity - eviction behind writes",
        }
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
