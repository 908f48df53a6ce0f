//! Cooperative cancellation shared by every phase of a backup job.
//!
//! A [`CancellationToken`] is cheap to clone; clones observe the same state.
//! Child tokens are cancelled together with their parent but can also be
//! cancelled on their own, which is how a failing upload worker stops its
//! directory walk without cancelling the whole job.
//!
//! Blocking code can wait on [`CancellationToken::cancelled`] and
//! [`CancellationToken::deadline`] inside `crossbeam::channel::select!`.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crossbeam::channel::{self, Receiver, Sender};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    // Dropping the sender disconnects `signal`, which wakes every `select!`.
    trigger: Mutex<Option<Sender<()>>>,
    signal: Receiver<()>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new(deadline: Option<Instant>) -> Self {
        let (trigger, signal) = channel::bounded(0);
        Self {
            cancelled: AtomicBool::new(false),
            deadline,
            trigger: Mutex::new(Some(trigger)),
            signal,
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut trigger) = self.trigger.lock() {
            trigger.take();
        }
        let children = match self.children.lock() {
            Ok(mut children) => std::mem::take(&mut *children),
            Err(_) => return,
        };
        children
            .iter()
            .filter_map(Weak::upgrade)
            .for_each(|child| child.cancel());
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for CancellationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.inner.cancelled.load(Ordering::SeqCst))
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::new(None)),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner::new(Instant::now().checked_add(timeout))),
        }
    }

    /// Creates a token cancelled whenever `self` is. The child keeps the
    /// parent's deadline.
    pub fn child_token(&self) -> Self {
        let child = Arc::new(Inner::new(self.inner.deadline));
        if let Ok(mut children) = self.inner.children.lock() {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        // Parent may have been cancelled before the child was registered.
        if self.inner.cancelled.load(Ordering::SeqCst) {
            child.cancel();
        }
        Self { inner: child }
    }

    pub fn cancel(&self) {
        self.inner.cancel()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst) || self.deadline_passed()
    }

    fn deadline_passed(&self) -> bool {
        self.inner
            .deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Returns `Err` once the token is cancelled or its deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            Err(Error::cancelled())
        } else if self.deadline_passed() {
            Err(Error::deadline_exceeded())
        } else {
            Ok(())
        }
    }

    /// Receiver that becomes ready (disconnected) on cancellation.
    pub fn cancelled(&self) -> Receiver<()> {
        self.inner.signal.clone()
    }

    /// Receiver that fires at the deadline, or never.
    pub fn deadline(&self) -> Receiver<Instant> {
        match self.inner.deadline {
            Some(deadline) => channel::at(deadline),
            None => channel::never(),
        }
    }

    /// Sleeps for `duration` or until cancelled. Returns the cancellation
    /// error if woken early.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let cancelled = self.cancelled();
        let deadline = self.deadline();
        channel::select! {
            recv(cancelled) -> _ => {},
            recv(deadline) -> _ => {},
            default(duration) => {},
        }
        self.check()
    }
}
