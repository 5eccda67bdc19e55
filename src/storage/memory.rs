//! In-memory engine: `DashMap` for records plus a time-ordered index.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::io::{AsyncBufRead, AsyncWrite};

use super::traits::{import_jsonl, write_jsonl, CountResult, EventStore, ImportReport};
use crate::context::Context;
use crate::error::StorageError;
use crate::event::{unix_now, Event, EventId};
use crate::filter::{Filter, FilterSet};

/// Check cancellation every this many scanned records.
const CANCEL_CHECK_EVERY: usize = 64;

pub struct MemoryStore {
    events: DashMap<EventId, Event>,
    /// (created_at, id), ascending
    by_time: RwLock<BTreeSet<(i64, EventId)>>,
    /// id -> deletion time (unix seconds)
    tombstones: DashMap<EventId, i64>,
    closed: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
            by_time: RwLock::new(BTreeSet::new()),
            tombstones: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Get current event count
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    #[must_use]
    pub fn contains(&self, id: &EventId) -> bool {
        self.events.contains_key(id)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    /// Matches for one filter, newest first, up to its limit.
    fn scan_filter(
        &self,
        ctx: &Context,
        filter: &Filter,
        seen: &mut HashSet<EventId>,
        out: &mut Vec<Event>,
    ) {
        if filter.is_exhausted() {
            return;
        }
        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut found = 0usize;

        if !filter.ids.is_empty() {
            let mut hits: Vec<Event> = filter
                .ids
                .iter()
                .filter_map(|id| self.events.get(id).map(|e| e.value().clone()))
                .filter(|e| filter.matches(e))
                .collect();
            hits.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
            for event in hits.into_iter().take(limit) {
                if seen.insert(event.id()) {
                    out.push(event);
                }
            }
            return;
        }

        let lower = (filter.since.unwrap_or(i64::MIN), EventId::from_bytes([0; 32]));
        let upper = (filter.until.unwrap_or(i64::MAX), EventId::from_bytes([0xff; 32]));
        // BTreeSet::range panics on an inverted range
        if lower > upper {
            return;
        }
        let index = self.by_time.read();
        for (scanned, (_, id)) in index.range(lower..=upper).rev().enumerate() {
            if scanned % CANCEL_CHECK_EVERY == 0 && ctx.is_done() {
                break;
            }
            let Some(event) = self.events.get(id) else { continue };
            if !filter.matches(event.value()) {
                continue;
            }
            if seen.insert(*id) {
                out.push(event.value().clone());
            }
            found += 1;
            if found >= limit {
                break;
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn init(&self, _path: &Path) -> Result<(), StorageError> {
        self.closed.store(false, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn save_event(&self, _ctx: &Context, event: &Event) -> Result<(), StorageError> {
        self.ensure_open()?;
        let id = event.id();
        if self.tombstones.contains_key(&id) {
            return Err(StorageError::Deleted);
        }

        // Shard guard is released before the index lock is taken
        let inserted = match self.events.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(event.clone());
                true
            }
        };
        if !inserted {
            return Err(StorageError::Duplicate);
        }

        self.by_time.write().insert((event.created_at(), id));
        Ok(())
    }

    async fn query_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<Vec<Event>, StorageError> {
        self.ensure_open()?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for filter in filters.filters() {
            if ctx.is_done() {
                break;
            }
            self.scan_filter(ctx, filter, &mut seen, &mut out);
        }
        Ok(out)
    }

    async fn count_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<CountResult, StorageError> {
        self.ensure_open()?;
        if filters.is_empty() {
            return Ok(CountResult::exact(0));
        }
        let mut count = 0u64;
        for (scanned, entry) in self.events.iter().enumerate() {
            if scanned % CANCEL_CHECK_EVERY == 0 && ctx.is_done() {
                return Err(StorageError::Cancelled);
            }
            if filters.matches(entry.value()) {
                count += 1;
            }
        }
        Ok(CountResult::exact(count))
    }

    async fn delete_event(
        &self,
        _ctx: &Context,
        id: &EventId,
        no_tombstone: bool,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        if let Some((_, event)) = self.events.remove(id) {
            self.by_time.write().remove(&(event.created_at(), *id));
        }
        if !no_tombstone {
            self.tombstones.insert(*id, unix_now());
        }
        Ok(())
    }

    async fn sync(&self) -> Result<(), StorageError> {
        self.ensure_open()
    }

    async fn import(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncBufRead + Unpin + Send),
    ) -> Result<ImportReport, StorageError> {
        self.ensure_open()?;
        import_jsonl(self, ctx, reader).await
    }

    async fn export(
        &self,
        ctx: &Context,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        authors: &[String],
    ) -> Result<usize, StorageError> {
        self.ensure_open()?;
        // Snapshot oldest-first; no lock is held across the writes
        let snapshot: Vec<Event> = {
            let index = self.by_time.read();
            index
                .iter()
                .filter_map(|(_, id)| self.events.get(id).map(|e| e.value().clone()))
                .filter(|e| authors.is_empty() || authors.iter().any(|a| a == e.pubkey()))
                .collect()
        };
        write_jsonl(ctx, writer, snapshot).await
    }

    async fn nuke(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut index = self.by_time.write();
        self.events.clear();
        self.tombstones.clear();
        index.clear();
        Ok(())
    }

    async fn collect_garbage(
        &self,
        _ctx: &Context,
        deleted_before: i64,
    ) -> Result<usize, StorageError> {
        self.ensure_open()?;
        let before = self.tombstones.len();
        self.tombstones.retain(|_, deleted_at| *deleted_at >= deleted_before);
        Ok(before - self.tombstones.len())
    }
}
