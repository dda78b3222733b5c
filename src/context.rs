//! Call contexts and the context bridge.
//!
//! A [`Context`] carries typed values, a cancellation signal and an optional
//! deadline down a call tree. RPC handlers receive one per call; the gateway
//! merges it with the process-wide context fixed at startup so handlers see
//! values from both.
//!
//! # Merge semantics
//! - `value::<T>()` consults the primary (call) context first, then the
//!   secondary (process) context
//! - with [`CancelPropagation::Primary`] cancellation and deadline come from
//!   the primary only; the secondary's cancellation does not reach handlers
//! - with [`CancelPropagation::Either`] whichever context fires first cancels
//!   the merged view and the earlier deadline applies

use std::sync::Arc;

use axum::http::Extensions;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tokio_util::sync::{CancellationToken, DropGuard};

/// How cancellation flows through a merged context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPropagation {
    /// Only the primary context's cancellation and deadline are observed.
    #[default]
    Primary,
    /// The first of the two contexts to be cancelled cancels the merged view.
    Either,
}

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    Cancelled,
    DeadlineExceeded,
}

/// A cheaply cloneable call context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    values: Extensions,
    parent: Option<Context>,
    fallback: Option<Context>,
    token: CancellationToken,
    deadline: Option<Instant>,
    // Stops the secondary watcher of an `Either` merge.
    _watch: Option<DropGuard>,
}

impl Context {
    /// An empty, never-cancelled root context.
    pub fn background() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// A root context cancelled through `token`.
    pub fn with_token(token: CancellationToken) -> Self {
        Self::from_inner(Inner {
            values: Extensions::new(),
            parent: None,
            fallback: None,
            token,
            deadline: None,
            _watch: None,
        })
    }

    fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    fn derive(&self, token: CancellationToken, deadline: Option<Instant>) -> Inner {
        Inner {
            values: Extensions::new(),
            parent: Some(self.clone()),
            fallback: None,
            token,
            deadline,
            _watch: None,
        }
    }

    /// A context that shadows `T` with `value` and shares this context's
    /// cancellation.
    pub fn with_value<T>(&self, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut inner = self.derive(self.inner.token.clone(), self.inner.deadline);
        inner.values.insert(value);
        Self::from_inner(inner)
    }

    /// A child that can be cancelled independently; cancelling `self` still
    /// cancels the child.
    pub fn child(&self) -> Self {
        Self::from_inner(self.derive(self.inner.token.child_token(), self.inner.deadline))
    }

    /// A child whose deadline is the earlier of `deadline` and this context's.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = earliest(self.inner.deadline, Some(deadline));
        Self::from_inner(self.derive(self.inner.token.child_token(), deadline))
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Look up a value, nearest first.
    pub fn value<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.inner
            .values
            .get::<T>()
            .or_else(|| self.inner.parent.as_ref().and_then(|p| p.value::<T>()))
            .or_else(|| self.inner.fallback.as_ref().and_then(|f| f.value::<T>()))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline, if there is one. Zero once passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Cancel this context and everything derived from it.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    /// Whether the context is done, and why.
    pub fn done(&self) -> Option<Done> {
        if self.inner.token.is_cancelled() {
            Some(Done::Cancelled)
        } else if self.inner.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(Done::DeadlineExceeded)
        } else {
            None
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.done().is_some()
    }

    /// Wait until the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) -> Done {
        match self.inner.deadline {
            Some(deadline) => tokio::select! {
                _ = self.inner.token.cancelled() => Done::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Done::DeadlineExceeded,
            },
            None => {
                self.inner.token.cancelled().await;
                Done::Cancelled
            }
        }
    }

    /// The cancellation token governing this context.
    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.inner.token.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .field("merged", &self.inner.fallback.is_some())
            .finish()
    }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Merge a call-scoped `primary` context with a process-scoped `secondary`.
///
/// [`CancelPropagation::Either`] spawns a watcher on the current Tokio
/// runtime; outside a runtime it degrades to `Primary`.
pub fn merge(primary: &Context, secondary: &Context, mode: CancelPropagation) -> Context {
    let mut inner = Inner {
        values: Extensions::new(),
        parent: Some(primary.clone()),
        fallback: Some(secondary.clone()),
        token: primary.inner.token.clone(),
        deadline: primary.inner.deadline,
        _watch: None,
    };

    if mode == CancelPropagation::Either {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                inner.deadline = earliest(primary.inner.deadline, secondary.inner.deadline);
                let token = primary.inner.token.child_token();
                let merged = token.clone();
                let watched = secondary.clone();
                handle.spawn(async move {
                    tokio::select! {
                        _ = watched.cancelled() => merged.cancel(),
                        _ = merged.cancelled() => {}
                    }
                });
                inner._watch = Some(token.clone().drop_guard());
                inner.token = token;
            }
            Err(_) => {
                tracing::warn!("No Tokio runtime; merged context observes primary cancellation only");
            }
        }
    }

    Context::from_inner(inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Tag(&'static str);

    #[derive(Debug, Clone, PartialEq)]
    struct Other(u32);

    #[test]
    fn values_shadow_nearest_first() {
        let root = Context::background().with_value(Tag("root"));
        let child = root.with_value(Tag("child"));
        assert_eq!(child.value::<Tag>(), Some(&Tag("child")));
        assert_eq!(root.value::<Tag>(), Some(&Tag("root")));
        assert_eq!(child.value::<Other>(), None);
    }

    #[test]
    fn merge_prefers_primary_values() {
        let primary = Context::background().with_value(Tag("call"));
        let secondary = Context::background()
            .with_value(Tag("process"))
            .with_value(Other(7));

        let merged = merge(&primary, &secondary, CancelPropagation::Primary);
        assert_eq!(merged.value::<Tag>(), Some(&Tag("call")));
        assert_eq!(merged.value::<Other>(), Some(&Other(7)));
    }

    #[tokio::test]
    async fn primary_mode_ignores_secondary_cancellation() {
        let primary = Context::background();
        let secondary = Context::background();
        let merged = merge(&primary, &secondary, CancelPropagation::Primary);

        secondary.cancel();
        assert!(!merged.is_cancelled());

        primary.cancel();
        assert_eq!(merged.done(), Some(Done::Cancelled));
    }

    #[tokio::test]
    async fn either_mode_observes_secondary_cancellation() {
        let primary = Context::background();
        let secondary = Context::background();
        let merged = merge(&primary, &secondary, CancelPropagation::Either);

        secondary.cancel();
        let done = tokio::time::timeout(Duration::from_secs(1), merged.cancelled())
            .await
            .expect("merged context should be cancelled");
        assert_eq!(done, Done::Cancelled);
        assert!(!primary.is_cancelled());
    }

    #[tokio::test]
    async fn either_mode_takes_earlier_deadline() {
        let primary = Context::background().with_timeout(Duration::from_secs(60));
        let secondary = Context::background().with_timeout(Duration::from_millis(10));

        let legacy = merge(&primary, &secondary, CancelPropagation::Primary);
        assert_eq!(legacy.deadline(), primary.deadline());

        let strict = merge(&primary, &secondary, CancelPropagation::Either);
        assert_eq!(strict.deadline(), secondary.deadline());
    }

    #[tokio::test]
    async fn deadline_marks_context_done() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        assert_eq!(ctx.cancelled().await, Done::DeadlineExceeded);
        assert_eq!(ctx.done(), Some(Done::DeadlineExceeded));
    }

    #[test]
    fn child_cancellation_does_not_reach_parent() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
