// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::event::EventId;

/// Low/high occupancy thresholds as percentages of capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    low_pct: u8,
    high_pct: u8,
}

impl Watermarks {
    /// Callers validate `0 < low < high <= 100` (see `RelayStoreConfig::validate`).
    #[must_use]
    pub fn new(low_pct: u8, high_pct: u8) -> Self {
        debug_assert!(low_pct < high_pct && high_pct <= 100);
        Self { low_pct, high_pct }
    }

    #[must_use]
    pub fn low_pct(&self) -> u8 {
        self.low_pct
    }

    #[must_use]
    pub fn high_pct(&self) -> u8 {
        self.high_pct
    }

    #[must_use]
    pub fn low_fraction(&self) -> f64 {
        f64::from(self.low_pct) / 100.0
    }

    #[must_use]
    pub fn high_fraction(&self) -> f64 {
        f64::from(self.high_pct) / 100.0
    }
}

/// Approximate byte usage of a bounded tier.
///
/// Lock-free; increments, decrements and reads never block each other.
#[derive(Debug)]
pub struct Occupancy {
    used: AtomicU64,
    capacity: u64,
}

impl Occupancy {
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            used: AtomicU64::new(0),
            capacity,
        }
    }

    pub fn add(&self, bytes: u64) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Saturating subtract (sizes are estimates).
    pub fn sub(&self, bytes: u64) {
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }

    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// occupancy / capacity (0.0 → 1.0+)
    #[must_use]
    pub fn pressure(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.used() as f64 / self.capacity as f64
        }
    }
}

/// Eviction state of a bounded tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionState {
    /// Below the high watermark, or a pass just finished
    Normal,
    /// A pass is running
    Evicting,
}

impl std::fmt::Display for EvictionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "Normal"),
            Self::Evicting => write!(f, "Evicting"),
        }
    }
}

/// An eviction candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Victim {
    pub id: EventId,
    pub created_at: i64,
    pub size: u64,
}

/// What an eviction pass operates on.
#[async_trait]
pub trait EvictionTarget: Send + Sync {
    /// Up to `limit` candidates, oldest `created_at` first.
    fn oldest(&self, limit: usize) -> Vec<Victim>;

    /// Remove `victim` and release its bytes from occupancy.
    /// Returns the bytes freed (0 if it was already gone).
    async fn evict(&self, victim: &Victim) -> Result<u64, StorageError>;
}

/// Summary of one eviction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    pub evicted: usize,
    pub bytes_freed: u64,
    pub failures: usize,
    /// Ran out of candidates (or made no progress) before the low watermark
    pub exhausted: bool,
    pub cancelled: bool,
}

/// Drives watermark eviction for one bounded tier.
///
/// At most one pass runs at a time; [`try_begin`](Self::try_begin) is the
/// gate and [`finish`](Self::finish) releases it.
pub struct EvictionController {
    marks: Watermarks,
    batch_size: usize,
    running: AtomicBool,
    state: watch::Sender<EvictionState>,
    freed: Notify,
}

impl EvictionController {
    #[must_use]
    pub fn new(marks: Watermarks, batch_size: usize) -> Self {
        let (state, _) = watch::channel(EvictionState::Normal);
        Self {
            marks,
            batch_size: batch_size.max(1),
            running: AtomicBool::new(false),
            state,
            freed: Notify::new(),
        }
    }

    #[must_use]
    pub fn watermarks(&self) -> Watermarks {
        self.marks
    }

    #[must_use]
    pub fn state(&self) -> EvictionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EvictionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Occupancy is at or above the high watermark.
    #[must_use]
    pub fn should_start(&self, occupancy: &Occupancy) -> bool {
        occupancy.pressure() >= self.marks.high_fraction()
    }

    /// Claim the pass slot. False if a pass is already running.
    pub fn try_begin(&self) -> bool {
        let claimed = self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if claimed {
            self.state.send_replace(EvictionState::Evicting);
        }
        claimed
    }

    /// Release the pass slot and wake anyone waiting for space.
    pub fn finish(&self) {
        self.running.store(false, Ordering::Release);
        self.state.send_replace(EvictionState::Normal);
        self.freed.notify_waiters();
    }

    /// Resolves once no pass is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        while *rx.borrow_and_update() == EvictionState::Evicting {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Notified after every batch and when a pass ends.
    #[must_use]
    pub fn space_freed(&self) -> &Notify {
        &self.freed
    }

    /// Evict oldest-first in batches until occupancy is at or below the low
    /// watermark, candidates run out, or `cancel` fires.
    ///
    /// Candidate selection is the only critical section; deletes run
    /// outside it so concurrent saves and queries keep flowing.
    pub async fn run_pass<T>(
        &self,
        tier: &str,
        target: &T,
        occupancy: &Occupancy,
        cancel: &CancellationToken,
    ) -> PassReport
    where
        T: EvictionTarget + ?Sized,
    {
        let low = self.marks.low_fraction();
        let start_pressure = occupancy.pressure();
        let mut report = PassReport::default();

        'pass: loop {
            if occupancy.pressure() <= low {
                break;
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let batch = target.oldest(self.batch_size);
            if batch.is_empty() {
                report.exhausted = true;
                break;
            }

            let mut progressed = false;
            for victim in &batch {
                if occupancy.pressure() <= low {
                    self.freed.notify_waiters();
                    break 'pass;
                }
                match target.evict(victim).await {
                    Ok(0) => {}
                    Ok(freed) => {
                        report.evicted += 1;
                        report.bytes_freed += freed;
                        progressed = true;
                    }
                    Err(e) => {
                        warn!(tier, id = %victim.id, error = %e, "Failed to evict event");
                        report.failures += 1;
                    }
                }
            }

            self.freed.notify_waiters();
            debug!(
                tier,
                batch = batch.len(),
                pressure = occupancy.pressure(),
                "Eviction batch complete"
            );

            if !progressed {
                report.exhausted = true;
                break;
            }
            tokio::task::yield_now().await;
        }

        info!(
            tier,
            evicted = report.evicted,
            evicted_bytes = report.bytes_freed,
            start_pressure,
            end_pressure = occupancy.pressure(),
            exhausted = report.exhausted,
            "Eviction pass complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Victims kept sorted oldest-first; evict releases occupancy.
    struct FakeTarget {
        victims: Mutex<Vec<Victim>>,
        occupancy: Arc<Occupancy>,
        fail_ids: Vec<EventId>,
    }

    impl FakeTarget {
        fn new(occupancy: Arc<Occupancy>, sizes: &[u64]) -> Self {
            let victims: Vec<Victim> = sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| {
                    occupancy.add(size);
                    Victim {
                        id: EventId::from_bytes([i as u8; 32]),
                        created_at: i as i64,
                        size,
                    }
                })
                .collect();
            Self {
                victims: Mutex::new(victims),
                occupancy,
                fail_ids: Vec::new(),
            }
        }

        fn remaining(&self) -> Vec<i64> {
            self.victims.lock().iter().map(|v| v.created_at).collect()
        }
    }

    #[async_trait]
    impl EvictionTarget for FakeTarget {
        fn oldest(&self, limit: usize) -> Vec<Victim> {
            self.victims.lock().iter().take(limit).cloned().collect()
        }

        async fn evict(&self, victim: &Victim) -> Result<u64, StorageError> {
            if self.fail_ids.contains(&victim.id) {
                return Err(StorageError::Backend("injected".into()));
            }
            let mut victims = self.victims.lock();
            match victims.iter().position(|v| v.id == victim.id) {
                Some(pos) => {
                    victims.remove(pos);
                    self.occupancy.sub(victim.size);
                    Ok(victim.size)
                }
                None => Ok(0),
            }
        }
    }

    #[test]
    fn test_occupancy_sub_saturates() {
        let occ = Occupancy::new(100);
        occ.add(10);
        occ.sub(25);
        assert_eq!(occ.used(), 0);
    }

    #[test]
    fn test_should_start_at_high_watermark() {
        let ctl = EvictionController::new(Watermarks::new(25, 50), 2);
        let occ = Occupancy::new(1000);
        occ.add(499);
        assert!(!ctl.should_start(&occ));
        occ.add(1);
        assert!(ctl.should_start(&occ));
    }

    #[test]
    fn test_only_one_pass_at_a_time() {
        let ctl = EvictionController::new(Watermarks::new(25, 50), 2);
        assert!(ctl.try_begin());
        assert_eq!(ctl.state(), EvictionState::Evicting);
        assert!(!ctl.try_begin());
        ctl.finish();
        assert_eq!(ctl.state(), EvictionState::Normal);
        assert!(ctl.try_begin());
    }

    #[tokio::test]
    async fn test_pass_evicts_oldest_until_low_watermark() {
        let occ = Arc::new(Occupancy::new(1000));
        let target = FakeTarget::new(occ.clone(), &[100, 100, 100, 100, 100]);
        let ctl = EvictionController::new(Watermarks::new(25, 50), 2);

        assert!(ctl.should_start(&occ));
        let report = ctl.run_pass("L1", &target, &occ, &CancellationToken::new()).await;

        assert_eq!(report.evicted, 3);
        assert_eq!(report.bytes_freed, 300);
        assert_eq!(occ.used(), 200);
        assert_eq!(target.remaining(), vec![3, 4]);
        assert!(!report.exhausted);
    }

    #[tokio::test]
    async fn test_pass_stops_when_candidates_exhausted() {
        let occ = Arc::new(Occupancy::new(1000));
        let target = FakeTarget::new(occ.clone(), &[300, 300]);
        // bytes not tracked by the target keep occupancy above low
        occ.add(400);
        let ctl = EvictionController::new(Watermarks::new(10, 50), 8);

        let report = ctl.run_pass("L1", &target, &occ, &CancellationToken::new()).await;

        assert_eq!(report.evicted, 2);
        assert!(report.exhausted);
        assert_eq!(occ.used(), 400);
    }

    #[tokio::test]
    async fn test_pass_does_not_spin_on_failures() {
        let occ = Arc::new(Occupancy::new(1000));
        let mut target = FakeTarget::new(occ.clone(), &[600]);
        target.fail_ids = vec![EventId::from_bytes([0; 32])];
        let ctl = EvictionController::new(Watermarks::new(25, 50), 4);

        let report = ctl.run_pass("L1", &target, &occ, &CancellationToken::new()).await;

        assert_eq!(report.failures, 1);
        assert!(report.exhausted);
        assert_eq!(occ.used(), 600);
    }

    #[tokio::test]
    async fn test_cancelled_pass_stops_immediately() {
        let occ = Arc::new(Occupancy::new(1000));
        let target = FakeTarget::new(occ.clone(), &[300, 300]);
        let ctl = EvictionController::new(Watermarks::new(25, 50), 1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = ctl.run_pass("L1", &target, &occ, &cancel).await;

        assert!(report.cancelled);
        assert_eq!(report.evicted, 0);
    }

    #[tokio::test]
    async fn test_wait_idle_resolves_after_finish() {
        let ctl = Arc::new(EvictionController::new(Watermarks::new(25, 50), 1));
        assert!(ctl.try_begin());

        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        ctl.finish();
        waiter.await.unwrap();
    }
}
