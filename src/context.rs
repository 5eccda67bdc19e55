// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cancellable, deadline-bearing execution context.
//!
//! Every storage operation takes a [`Context`]. Cancelling it (or letting the
//! deadline pass) makes tiers stop producing results and return what they
//! already have.
//!
//! # Example
//!
//! ```
//! use relay_store::Context;
//! use std::time::Duration;
//!
//! let root = Context::background();
//! let ctx = root.with_timeout(Duration::from_secs(2));
//! assert!(!ctx.is_done());
//!
//! root.cancel();
//! assert!(ctx.is_done()); // children follow their parent
//! ```

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Execution context passed to every storage call.
///
/// Cloning is cheap and clones share cancellation. Children created with
/// [`child`](Self::child) or [`with_timeout`](Self::with_timeout) are
/// cancelled together with their parent, never the other way around.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A root context with no deadline.
    ///
    /// Callers touching storage should prefer a bounded context; an unbounded
    /// one waits as long as the tier takes.
    #[must_use]
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Wrap an existing token (e.g. a process lifetime token).
    #[must_use]
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    /// A child context that is cancelled when `self` is.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child context that additionally expires after `timeout`.
    ///
    /// The earlier of the parent's deadline and the new one wins.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(deadline, |d| d.min(deadline))),
        }
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once cancelled or past the deadline.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves when the context is cancelled or the deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// The underlying cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_not_done() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.deadline().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_children() {
        let parent = Context::background();
        let child = parent.child();
        let grandchild = child.with_timeout(Duration::from_secs(60));

        parent.cancel();

        assert!(child.is_done());
        assert!(grandchild.is_done());
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();

        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        assert!(!ctx.is_done());

        ctx.done().await;
        assert!(ctx.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_timeout_keeps_earlier_deadline() {
        let outer = Context::background().with_timeout(Duration::from_millis(10));
        let inner = outer.with_timeout(Duration::from_secs(10));
        assert_eq!(outer.deadline(), inner.deadline());
    }
}
