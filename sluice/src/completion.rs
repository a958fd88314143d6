//! Per-message completion signalling.
//!
//! Every accepted message gets a `CompletionHandle` (returned to the producer)
//! and a `Completer` (parked in the message's slot). The completer is the only
//! writer: it resolves the handle once and is consumed doing so. A completer
//! dropped without resolving resolves the handle with `ShutdownForced`, so a
//! handle can never be left pending.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::disruptor::Sequence;
use crate::error::FailureReason;

/// Terminal value of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success,
    Failure(FailureReason),
}

impl Completion {
    pub fn is_success(&self) -> bool {
        matches!(self, Completion::Success)
    }
}

struct Inner {
    resolved: AtomicBool,
    value: Mutex<Option<Completion>>,
    ready: Condvar,
}

impl Inner {
    fn resolve(&self, completion: Completion) -> bool {
        let mut value = self.value.lock();
        if value.is_some() {
            return false;
        }
        *value = Some(completion);
        self.resolved.store(true, Ordering::Release);
        self.ready.notify_all();
        true
    }
}

/// Caller side of a message's completion. Cheap to clone.
#[derive(Clone)]
pub struct CompletionHandle {
    inner: Arc<Inner>,
    sequence: Sequence,
}

impl std::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("sequence", &self.sequence)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl CompletionHandle {
    /// Ring sequence the message was assigned.
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.load(Ordering::Acquire)
    }

    /// Non-blocking poll.
    pub fn try_result(&self) -> Option<Completion> {
        if !self.is_resolved() {
            return None;
        }
        self.inner.value.lock().clone()
    }

    /// Block until resolved.
    pub fn wait(&self) -> Completion {
        let mut value = self.inner.value.lock();
        loop {
            if let Some(completion) = value.as_ref() {
                return completion.clone();
            }
            self.inner.ready.wait(&mut value);
        }
    }

    /// Block until resolved or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Completion> {
        // Too far out to represent: same as waiting forever.
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut value = self.inner.value.lock();
        loop {
            if let Some(completion) = value.as_ref() {
                return Some(completion.clone());
            }
            if self
                .inner
                .ready
                .wait_until(&mut value, deadline)
                .timed_out()
            {
                return value.clone();
            }
        }
    }
}

/// Pipeline side of a message's completion. Not `Clone`: single writer.
pub(crate) struct Completer {
    inner: Arc<Inner>,
}

impl Completer {
    /// Resolve the handle. Returns false if it was already resolved.
    pub(crate) fn resolve(self, completion: Completion) -> bool {
        self.inner.resolve(completion)
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if !self.inner.resolved.load(Ordering::Acquire) {
            self.inner
                .resolve(Completion::Failure(FailureReason::ShutdownForced));
        }
    }
}

/// Create a linked handle/completer pair for `sequence`.
pub(crate) fn completion_pair(sequence: Sequence) -> (CompletionHandle, Completer) {
    let inner = Arc::new(Inner {
        resolved: AtomicBool::new(false),
        value: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        CompletionHandle {
            inner: inner.clone(),
            sequence,
        },
        Completer { inner },
    )
}

/// Slot-resident holder for a `Completer`.
///
/// Installing and taking are single atomic swaps, so the output worker and the
/// forced-shutdown sweep can race for the same completer and exactly one of
/// them gets it.
pub(crate) struct CompleterCell {
    ptr: AtomicPtr<Inner>,
}

impl Default for CompleterCell {
    fn default() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl CompleterCell {
    pub(crate) fn install(&self, completer: Completer) {
        // Move the Arc out without running Completer's Drop.
        let completer = std::mem::ManuallyDrop::new(completer);
        // SAFETY: `completer` is never used or dropped again.
        let inner = unsafe { ptr::read(&completer.inner) };
        let raw = Arc::into_raw(inner) as *mut Inner;
        let previous = self.ptr.swap(raw, Ordering::SeqCst);
        if !previous.is_null() {
            // SAFETY: non-null pointers in the cell always come from Arc::into_raw above.
            drop(Completer {
                inner: unsafe { Arc::from_raw(previous) },
            });
        }
    }

    pub(crate) fn take(&self) -> Option<Completer> {
        let raw = self.ptr.swap(ptr::null_mut(), Ordering::SeqCst);
        if raw.is_null() {
            None
        } else {
            // SAFETY: the swap transferred sole ownership of this Arc to us.
            Some(Completer {
                inner: unsafe { Arc::from_raw(raw) },
            })
        }
    }
}

impl Drop for CompleterCell {
    fn drop(&mut self) {
        drop(self.take());
    }
}

// SAFETY: the cell only ever holds an Arc<Inner>, and Inner is Send + Sync.
unsafe impl Send for CompleterCell {}
unsafe impl Sync for CompleterCell {}
