use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use crate::context::Context;
use crate::error::StorageError;
use crate::event::{Event, EventId};
use crate::filter::FilterSet;

/// Result of a count: `approximate` is set when a tier estimated instead of
/// scanning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountResult {
    pub count: u64,
    pub approximate: bool,
}

impl CountResult {
    #[must_use]
    pub fn exact(count: u64) -> Self {
        Self { count, approximate: false }
    }
}

/// Outcome of a bulk import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    /// Already stored (or tombstoned)
    pub duplicates: usize,
    /// Lines that were not valid events
    pub skipped: usize,
}

/// Optional capability: work to run around a save.
///
/// Check with [`EventStore::save_hooks`].
#[async_trait]
pub trait SaveHooks: Send + Sync {
    /// Runs before the save; an error aborts it.
    async fn before_save(&self, ctx: &Context, event: &Event) -> Result<(), StorageError>;
    /// Runs after a successful save.
    async fn after_save(&self, event: &Event);
}

/// The storage contract every tier (and the two-tier backend) implements.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Open or create state at `path`. `StorageError::Unavailable` is fatal.
    async fn init(&self, path: &Path) -> Result<(), StorageError>;

    /// Release resources. Idempotent.
    async fn close(&self) -> Result<(), StorageError>;

    /// Persist `event`. `StorageError::Duplicate` if the ID is already stored.
    async fn save_event(&self, ctx: &Context, event: &Event) -> Result<(), StorageError>;

    /// Events matching any filter, newest first per filter, honouring
    /// `since`/`until`/`limit`. A cancelled `ctx` returns what was found so far.
    async fn query_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<Vec<Event>, StorageError>;

    async fn count_events(
        &self,
        ctx: &Context,
        filters: &FilterSet,
    ) -> Result<CountResult, StorageError>;

    /// Remove by ID, leaving a tombstone unless `no_tombstone`.
    /// Unknown IDs are not an error.
    async fn delete_event(
        &self,
        ctx: &Context,
        id: &EventId,
        no_tombstone: bool,
    ) -> Result<(), StorageError>;

    /// Flush anything buffered to durable storage.
    async fn sync(&self) -> Result<(), StorageError>;

    /// Load JSON-lines events.
    async fn import(
        &self,
        ctx: &Context,
        reader: &mut (dyn AsyncBufRead + Unpin + Send),
    ) -> Result<ImportReport, StorageError>;

    /// Write stored events as JSON lines, restricted to `authors` if non-empty.
    /// Returns the number of events written.
    async fn export(
        &self,
        ctx: &Context,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        authors: &[String],
    ) -> Result<usize, StorageError>;

    /// Remove everything, tombstones included.
    async fn nuke(&self) -> Result<(), StorageError>;

    /// Purge tombstones written before `deleted_before` (unix seconds).
    async fn collect_garbage(
        &self,
        _ctx: &Context,
        _deleted_before: i64,
    ) -> Result<usize, StorageError> {
        Ok(0)
    }

    /// Optional before/after save hooks.
    fn save_hooks(&self) -> Option<&dyn SaveHooks> {
        None
    }
}

/// Save through a store, running its [`SaveHooks`] if it has any.
pub async fn save_with_hooks(
    store: &dyn EventStore,
    ctx: &Context,
    event: &Event,
) -> Result<(), StorageError> {
    let hooks = store.save_hooks();
    if let Some(hooks) = hooks {
        hooks.before_save(ctx, event).await?;
    }
    store.save_event(ctx, event).await?;
    if let Some(hooks) = hooks {
        hooks.after_save(event).await;
    }
    Ok(())
}

/// Read JSON lines from `reader` and save each through `store`.
///
/// Invalid lines are skipped and counted; benign save outcomes count as
/// duplicates; any other save error aborts the import.
pub(crate) async fn import_jsonl<S>(
    store: &S,
    ctx: &Context,
    reader: &mut (dyn AsyncBufRead + Unpin + Send),
) -> Result<ImportReport, StorageError>
where
    S: EventStore + ?Sized,
{
    let mut report = ImportReport::default();
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        if ctx.is_done() {
            break;
        }
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        line_no += 1;
        let Ok(line) = std::str::from_utf8(&buf) else {
            warn!(line = line_no, "Skipping import line that is not UTF-8");
            report.skipped += 1;
            continue;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let event = match Event::from_json(trimmed) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping invalid import line");
                report.skipped += 1;
                continue;
            }
        };

        match store.save_event(ctx, &event).await {
            Ok(()) => report.imported += 1,
            Err(e) if e.is_benign() => report.duplicates += 1,
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}

/// Write `events` as JSON lines, stopping early if `ctx` ends.
pub(crate) async fn write_jsonl(
    ctx: &Context,
    writer: &mut (dyn AsyncWrite + Unpin + Send),
    events: impl IntoIterator<Item = Event>,
) -> Result<usize, StorageError> {
    let mut written = 0usize;
    for event in events {
        if ctx.is_done() {
            break;
        }
        let mut line = event.to_json()?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        written += 1;
    }
    writer.flush().await?;
    Ok(written)
}
