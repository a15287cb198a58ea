//! Cancellation and deadlines carried by every call.
//!
//! A [`Context`] travels with each operation through the middleware
//! pipeline. Retry backoffs and backend calls consult it, so a cancelled or
//! expired context stops work between attempts and interrupts sleeps.

use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::Error;

#[derive(Clone, Default)]
pub struct Context {
    cancel: Option<Arc<CancelState>>,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelState {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();
        let children = std::mem::take(
            &mut *self
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Cancels the context it was created with, and every context derived from
/// it.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.state.cancel();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let state = Arc::new(CancelState::default());
        if let Some(parent) = &self.cancel {
            let mut children = parent
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            children.retain(|child| child.strong_count() > 0);
            children.push(Arc::downgrade(&state));
            drop(children);
            if parent.is_cancelled() {
                state.cancel();
            }
        }
        let ctx = Context {
            cancel: Some(state.clone()),
            deadline: self.deadline,
        };
        (ctx, CancelHandle { state })
    }

    pub fn with_timeout(&self, timeout: Duration) -> Context {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The earlier of the existing deadline and `deadline` wins.
    pub fn with_deadline(&self, deadline: Instant) -> Context {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Context {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }

    pub fn err(&self) -> Option<Error> {
        if self.is_cancelled() {
            return Some(Error::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn check(&self) -> Result<(), Error> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes. Never
    /// resolves for a background context.
    pub async fn done(&self) {
        let cancelled = async {
            match &self.cancel {
                Some(state) => state.wait().await,
                None => pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancelled => {}
            _ = expired => {}
        }
    }

    /// Sleeps for `wait` unless the context ends first, in which case the
    /// context's error is returned.
    pub async fn sleep(&self, wait: Duration) -> Result<(), Error> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(wait) => Ok(()),
            _ = self.done() => Err(self.err().unwrap_or(Error::Canceled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_never_done() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn cancelling_a_parent_cancels_children() {
        let (parent, cancel) = Context::background().with_cancel();
        let (child, _) = parent.with_cancel();
        let grandchild = child.with_timeout(Duration::from_secs(60));
        cancel.cancel();
        assert!(matches!(grandchild.err(), Some(Error::Canceled)));
        assert!(matches!(child.check(), Err(Error::Canceled)));
    }

    #[test]
    fn child_of_cancelled_parent_starts_cancelled() {
        let (parent, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let (child, _) = parent.with_cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn dropped_children_are_forgotten() {
        let (parent, cancel) = Context::background().with_cancel();
        for _ in 0..1000 {
            let _ = parent.with_cancel();
        }
        let (kept, _) = parent.with_cancel();
        let state = parent.cancel.as_ref().unwrap();
        assert_eq!(state.children.lock().unwrap().len(), 1);
        cancel.cancel();
        assert!(kept.is_cancelled());
    }

    #[tokio::test]
    async fn sleep_is_interrupted_by_cancel() {
        let (ctx, cancel) = Context::background().with_cancel();
        let sleeper = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.sleep(Duration::from_secs(30)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let result = sleeper.await.unwrap();
        assert!(matches!(result, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn deadline_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(5));
        let result = ctx.sleep(Duration::from_secs(30)).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }
}
