//! Labelled fan-out over `tokio::task::JoinSet`.
//!
//! Spawn one task per tier, then either wait for all of them or wait until
//! the caller's context ends. Results come back in spawn order with their
//! tier label, so callers can attribute failures.

use std::collections::HashMap;
use std::future::Future;

use tokio::task::{Id, JoinSet};

use crate::context::Context;
use crate::tier::TierKind;

/// How a spawned task ended.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Finished(T),
    /// The task panicked or was aborted
    Panicked(String),
    /// The context ended first; the task was detached and may still complete
    Abandoned,
}

impl<T> TaskOutcome<T> {
    #[must_use]
    pub fn finished(self) -> Option<T> {
        match self {
            Self::Finished(v) => Some(v),
            _ => None,
        }
    }
}

/// A group of labelled tasks joined together.
///
/// Dropping an unjoined group aborts its tasks.
pub struct TaskGroup<T> {
    set: JoinSet<T>,
    labels: HashMap<Id, (usize, TierKind)>,
}

impl<T: Send + 'static> TaskGroup<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            set: JoinSet::new(),
            labels: HashMap::new(),
        }
    }

    pub fn spawn<F>(&mut self, tier: TierKind, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let index = self.labels.len();
        let handle = self.set.spawn(task);
        self.labels.insert(handle.id(), (index, tier));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Wait for every task.
    pub async fn join_all(mut self) -> Vec<(TierKind, TaskOutcome<T>)> {
        let mut done = Vec::with_capacity(self.labels.len());
        while let Some(result) = self.set.join_next_with_id().await {
            done.push(Self::outcome(result));
        }
        self.collect(done)
    }

    /// Wait for every task or until `ctx` ends, whichever is first.
    ///
    /// Tasks still running when `ctx` ends are detached, not aborted: their
    /// side effects may land after this returns.
    pub async fn join_until(mut self, ctx: &Context) -> Vec<(TierKind, TaskOutcome<T>)> {
        let mut done = Vec::with_capacity(self.labels.len());
        loop {
            tokio::select! {
                biased;
                next = self.set.join_next_with_id() => match next {
                    Some(result) => done.push(Self::outcome(result)),
                    None => break,
                },
                _ = ctx.done() => {
                    self.set.detach_all();
                    break;
                }
            }
        }
        self.collect(done)
    }

    fn outcome(result: Result<(Id, T), tokio::task::JoinError>) -> (Id, TaskOutcome<T>) {
        match result {
            Ok((id, value)) => (id, TaskOutcome::Finished(value)),
            Err(e) => (e.id(), TaskOutcome::Panicked(e.to_string())),
        }
    }

    /// Order results by spawn order; anything missing was abandoned.
    fn collect(self, done: Vec<(Id, TaskOutcome<T>)>) -> Vec<(TierKind, TaskOutcome<T>)> {
        let mut slots: Vec<Option<(TierKind, TaskOutcome<T>)>> =
            (0..self.labels.len()).map(|_| None).collect();
        for (id, outcome) in done {
            if let Some(&(index, tier)) = self.labels.get(&id) {
                slots[index] = Some((tier, outcome));
            }
        }
        let mut tiers: Vec<(usize, TierKind)> = self.labels.into_values().collect();
        tiers.sort_by_key(|(index, _)| *index);
        tiers
            .into_iter()
            .zip(slots)
            .map(|((_, tier), slot)| slot.unwrap_or((tier, TaskOutcome::Abandoned)))
            .collect()
    }
}

impl<T: Send + 'static> Default for TaskGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_join_all_preserves_spawn_order() {
        let mut group = TaskGroup::new();
        group.spawn(TierKind::Bounded, async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            1
        });
        group.spawn(TierKind::Authoritative, async { 2 });

        let results = group.join_all().await;
        let values: Vec<_> = results
            .into_iter()
            .map(|(tier, o)| (tier, o.finished().unwrap()))
            .collect();
        assert_eq!(values, vec![(TierKind::Bounded, 1), (TierKind::Authoritative, 2)]);
    }

    #[tokio::test]
    async fn test_panic_is_attributed_to_its_tier() {
        let mut group: TaskGroup<u32> = TaskGroup::new();
        group.spawn(TierKind::Bounded, async { 7 });
        group.spawn(TierKind::Authoritative, async { panic!("boom") });

        let results = group.join_all().await;
        assert!(matches!(results[0], (TierKind::Bounded, TaskOutcome::Finished(7))));
        assert!(matches!(results[1], (TierKind::Authoritative, TaskOutcome::Panicked(_))));
    }

    #[tokio::test]
    async fn test_join_until_abandons_slow_task() {
        let ctx = Context::background();
        let mut group = TaskGroup::new();
        group.spawn(TierKind::Bounded, async { "fast" });
        group.spawn(TierKind::Authoritative, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "slow"
        });

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let results = group.join_until(&ctx).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(results[0], (TierKind::Bounded, TaskOutcome::Finished("fast"))));
        assert!(matches!(results[1], (TierKind::Authoritative, TaskOutcome::Abandoned)));
    }

    #[tokio::test]
    async fn test_detached_task_still_completes() {
        let ctx = Context::background();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut group = TaskGroup::new();
        group.spawn(TierKind::Authoritative, async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let _ = tx.send(());
        });
        ctx.cancel();

        let results = group.join_until(&ctx).await;
        assert!(matches!(results[0].1, TaskOutcome::Abandoned));
        // side effect lands after the caller gave up
        rx.await.unwrap();
    }
}
