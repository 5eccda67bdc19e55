// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage error taxonomy and the per-tier multi-error.
//!
//! Dual-tier operations never short-circuit: every branch runs and each
//! failure is recorded in a [`MultiError`] with the tier it came from.

use std::fmt;

use thiserror::Error;

use crate::tier::TierKind;

#[derive(Error, Debug)]
pub enum StorageError {
    /// The storage medium could not be opened or closed. Fatal at init.
    #[error("storage unavailable at '{path}': {reason}")]
    Unavailable { path: String, reason: String },

    /// An event with this ID is already stored. Benign.
    #[error("duplicate event")]
    Duplicate,

    /// The event was deleted and a tombstone blocks re-saving it. Benign.
    #[error("event was deleted")]
    Deleted,

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Saves are being rejected until eviction frees space.
    #[error("capacity exceeded: {occupancy} of {capacity} bytes in use")]
    CapacityExceeded { occupancy: u64, capacity: u64 },

    /// The context ended before the tier answered.
    #[error("operation cancelled")]
    Cancelled,

    #[error("store is closed")]
    Closed,

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// One or more tiers failed.
    #[error(transparent)]
    Tiers(#[from] MultiError),
}

impl StorageError {
    /// Outcomes callers may treat as success ("already have it").
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Duplicate | Self::Deleted)
    }

    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }

    /// Short label used as the `status` metric dimension.
    #[must_use]
    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Deleted => "deleted",
            Self::CapacityExceeded { .. } => "rejected",
            Self::Cancelled => "cancelled",
            _ => "error",
        }
    }

    /// The per-tier failures, if this is an aggregated error.
    #[must_use]
    pub fn as_multi(&self) -> Option<&MultiError> {
        match self {
            Self::Tiers(multi) => Some(multi),
            _ => None,
        }
    }
}

/// `status` label for an operation result.
pub(crate) fn result_status<T>(result: &Result<T, StorageError>) -> &'static str {
    match result {
        Ok(_) => "success",
        Err(e) => e.status_label(),
    }
}

/// One tier's failure inside a [`MultiError`].
#[derive(Error, Debug)]
#[error("{tier} {op}: {error}")]
pub struct TierFailure {
    pub tier: TierKind,
    pub op: &'static str,
    #[source]
    pub error: StorageError,
}

/// Ordered list of per-tier failures.
#[derive(Debug, Default)]
pub struct MultiError {
    failures: Vec<TierFailure>,
}

impl MultiError {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, tier: TierKind, op: &'static str, error: StorageError) {
        self.failures.push(TierFailure { tier, op, error });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    #[must_use]
    pub fn failures(&self) -> &[TierFailure] {
        &self.failures
    }

    /// Tiers that failed, in the order they were recorded.
    #[must_use]
    pub fn failed_tiers(&self) -> Vec<TierKind> {
        self.failures.iter().map(|f| f.tier).collect()
    }

    #[must_use]
    pub fn failure_for(&self, tier: TierKind) -> Option<&StorageError> {
        self.failures.iter().find(|f| f.tier == tier).map(|f| &f.error)
    }

    /// `Ok(value)` if nothing failed, otherwise `Err(StorageError::Tiers)`.
    pub fn into_result<T>(self, value: T) -> Result<T, StorageError> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(StorageError::Tiers(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} tier operation(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures.first().map(|f| f as &(dyn std::error::Error + 'static))
    }
}
