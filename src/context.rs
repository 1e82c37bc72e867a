//! Bounded execution context handed to each benchmark.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Shared cancellation flag that sleepers can wait on.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, signal) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until cancelled or `timeout` elapses. Returns true when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, signal) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = signal
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// A session handle plus a deadline and a cancellation token.
///
/// Clones share the same token, so cancelling one cancels all of them.
#[derive(Debug)]
pub struct ExecutionContext<S> {
    session: Arc<S>,
    deadline: Instant,
    token: CancelToken,
}

impl<S> Clone for ExecutionContext<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            deadline: self.deadline,
            token: self.token.clone(),
        }
    }
}

impl<S> ExecutionContext<S> {
    /// Child context of `session` that expires after `timeout`.
    pub fn with_timeout(session: Arc<S>, timeout: Duration) -> Self {
        Self {
            session,
            deadline: Instant::now() + timeout,
            token: CancelToken::new(),
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cooperative cancellation point.
    pub fn check(&self) -> Result<(), ContextError> {
        if Instant::now() >= self.deadline {
            return Err(ContextError::DeadlineExceeded);
        }
        if self.token.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        Ok(())
    }

    /// Sleep that wakes early on cancellation or deadline.
    pub fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        self.check()?;
        let remaining = self.remaining();
        let wait = duration.min(remaining);
        if self.token.wait_timeout(wait) {
            return self.check();
        }
        if wait < duration {
            return Err(ContextError::DeadlineExceeded);
        }
        self.check()
    }
}
