// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic relay-store usage example.
//!
//! Demonstrates:
//! 1. Building the default two-tier backend (memory L1 over SQLite L2)
//! 2. Saving a handful of events, including a duplicate
//! 3. Querying and counting across both tiers
//! 4. Watching L1 evict under a tiny byte budget
//! 5. Deleting with a tombstone
//! 6. Displaying captured metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use relay_store::{
    Context, DefaultBackend, Event, EventStore, Filter, FilterSet, RelayStoreConfig, StorageError,
};
use std::path::Path;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║            relay-store: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and open the backend
    // ─────────────────────────────────────────────────────────────────────────
    let data_dir = tempfile::tempdir()?;
    let config = RelayStoreConfig {
        data_path: data_dir.path().display().to_string(),
        // Small enough that a few events push L1 over its high watermark
        l1_capacity_bytes: 2_048,
        l1_low_watermark_pct: 40,
        l1_high_watermark_pct: 70,
        poll_frequency_ms: 1_000,
        ..Default::default()
    };
    println!("📦 Opening relay-store at {}", config.data_path);

    let backend = DefaultBackend::from_config(&config)?;
    backend.init(Path::new(&config.data_path)).await?;
    println!("   ✅ State: {}", backend.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Save events
    // ─────────────────────────────────────────────────────────────────────────
    let ctx = Context::background();
    let base = relay_store::event::unix_now() - 60;
    let mut events = Vec::new();
    for i in 0..12 {
        let tags = vec![vec!["t".to_string(), if i % 2 == 0 { "even" } else { "odd" }.to_string()]];
        let event = Event::new(
            "alice".into(),
            base + i,
            1,
            tags,
            format!("note #{i}: the quick brown fox jumps over the lazy dog"),
            String::new(),
        );
        backend.save_event(&ctx, &event).await?;
        events.push(event);
    }
    println!("\n✍️  Saved {} events", events.len());

    // the newest event is still in both tiers
    match backend.save_event(&ctx, &events[11]).await {
        Err(e) if e.is_duplicate() => println!("   └─ Re-saving #11 → duplicate (benign)"),
        other => println!("   └─ Re-saving #11 → unexpected: {other:?}"),
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Query and count
    // ─────────────────────────────────────────────────────────────────────────
    let evens = backend
        .query_events(&ctx, &Filter::all().tag('t', ["even".to_string()]).limit(3).into())
        .await?;
    println!("\n🔍 Newest 'even' notes (L1 results, then L2 results):");
    for e in &evens {
        println!("   └─ {} @ {}", &e.id().to_hex()[..12], e.created_at());
    }

    let count = backend.count_events(&ctx, &FilterSet::everything()).await?;
    println!("\n🔢 Count: {} (approximate: {})", count.count, count.approximate);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Eviction
    // ─────────────────────────────────────────────────────────────────────────
    backend.l1().wait_for_eviction().await;
    let stats = backend.stats();
    println!("\n🧹 L1 after eviction:");
    println!("   └─ Occupancy: {} / {} bytes ({:.0}%)",
        stats.l1_occupancy, stats.l1_capacity, stats.l1_pressure * 100.0);
    println!("   └─ Tracked events: {}", backend.l1().tracked_events());
    println!("   └─ Eviction state: {}", stats.eviction_state);

    let reconciled = backend.reconcile_once(&ctx).await?;
    println!("\n🔄 Reconcile tick: fetched={} backfilled={} already_present={}",
        reconciled.fetched, reconciled.backfilled, reconciled.already_present);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Delete with tombstone
    // ─────────────────────────────────────────────────────────────────────────
    let doomed = &events[11];
    backend.delete_event(&ctx, &doomed.id(), false).await?;
    match backend.save_event(&ctx, doomed).await {
        Err(StorageError::Deleted) => println!("\n🪦 Deleted #11; re-save blocked by tombstone"),
        other => println!("\n🪦 Deleted #11; re-save → unexpected: {other:?}"),
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    backend.close().await?;
    println!("   ✅ Shutdown complete! State: {}", backend.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Print every captured metric, grouped by kind and sorted by name.
fn dump_metrics(snapshotter: &Snapshotter) {
    let mut counters = Vec::new();
    let mut gauges = Vec::new();
    let mut histograms = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let name = if labels.is_empty() {
            key.name().to_string()
        } else {
            format!("{}{{{}}}", key.name(), labels.join(","))
        };

        match value {
            DebugValue::Counter(v) => counters.push((name, v)),
            DebugValue::Gauge(v) => gauges.push((name, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, count, sum));
            }
        }
    }

    counters.sort();
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters");
        for (name, value) in &counters {
            println!("   │  └─ {} = {}", name, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges");
        for (name, value) in &gauges {
            println!("   │  └─ {} = {:.2}", name, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms");
        for (name, count, sum) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("      └─ {} count={} avg={:.6}", name, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
