//! Publish outcomes and the adapter-side retry policy.
//!
//! The pipeline never retries on a caller's behalf. A rejected message is
//! handed back by value together with the reason, and the adapter decides
//! how to nack / requeue / delay it. `RetryPolicy` is a ready-made version
//! of that loop for adapters that simply want to wait and try again.

use std::fmt;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::completion::CompletionHandle;
use crate::insights::PublishEvent;
use crate::pipeline::Publisher;

const DEFAULT_CAPACITY_EXCEEDED_DELAY_MS: u64 = 100;
const DEFAULT_PROCESSING_DISABLED_DELAY_MS: u64 = 1_000;

/// Result of `Publisher::try_publish`.
#[must_use]
#[derive(Debug)]
pub enum PublishOutcome<M> {
    Accepted(CompletionHandle),
    /// Ring transiently full. The message is returned untouched.
    CapacityExceeded(M),
    /// Pipeline paused, draining or not running. The message is returned untouched.
    ProcessingDisabled(M),
}

impl<M> PublishOutcome<M> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PublishOutcome::Accepted(_))
    }

    pub fn handle(&self) -> Option<&CompletionHandle> {
        match self {
            PublishOutcome::Accepted(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_result(self) -> Result<CompletionHandle, PublishError<M>> {
        match self {
            PublishOutcome::Accepted(handle) => Ok(handle),
            PublishOutcome::CapacityExceeded(message) => {
                Err(PublishError::new(Rejection::CapacityExceeded, message))
            }
            PublishOutcome::ProcessingDisabled(message) => {
                Err(PublishError::new(Rejection::ProcessingDisabled, message))
            }
        }
    }

    pub(crate) fn event(&self) -> PublishEvent {
        match self {
            PublishOutcome::Accepted(_) => PublishEvent::Accepted,
            PublishOutcome::CapacityExceeded(_) => PublishEvent::CapacityExceeded,
            PublishOutcome::ProcessingDisabled(_) => PublishEvent::ProcessingDisabled,
        }
    }
}

/// Why a publish was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("ring buffer capacity exceeded")]
    CapacityExceeded,
    #[error("processing is disabled")]
    ProcessingDisabled,
}

/// A refused publish. Owns the message so the caller can retry or nack it.
pub struct PublishError<M> {
    kind: Rejection,
    message: M,
}

impl<M> PublishError<M> {
    pub(crate) fn new(kind: Rejection, message: M) -> Self {
        Self { kind, message }
    }

    pub fn kind(&self) -> Rejection {
        self.kind
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn into_message(self) -> M {
        self.message
    }
}

impl<M> fmt::Debug for PublishError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishError")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<M> fmt::Display for PublishError<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl<M> std::error::Error for PublishError<M> {}

/// Retry delays an adapter applies to rejected publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub capacity_exceeded_delay_ms: u64,
    pub processing_disabled_delay_ms: u64,
    /// Give up after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            capacity_exceeded_delay_ms: DEFAULT_CAPACITY_EXCEEDED_DELAY_MS,
            processing_disabled_delay_ms: DEFAULT_PROCESSING_DISABLED_DELAY_MS,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(capacity_exceeded_delay: Duration, processing_disabled_delay: Duration) -> Self {
        Self {
            capacity_exceeded_delay_ms: saturating_millis(capacity_exceeded_delay),
            processing_disabled_delay_ms: saturating_millis(processing_disabled_delay),
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts.max(1));
        self
    }

    pub fn delay_for(&self, kind: Rejection) -> Duration {
        match kind {
            Rejection::CapacityExceeded => Duration::from_millis(self.capacity_exceeded_delay_ms),
            Rejection::ProcessingDisabled => {
                Duration::from_millis(self.processing_disabled_delay_ms)
            }
        }
    }

    /// `try_publish` until accepted, sleeping between attempts. After
    /// `max_attempts` the last rejection is returned with the message.
    pub fn publish<I, O>(
        &self,
        publisher: &Publisher<I, O>,
        message: I,
    ) -> Result<CompletionHandle, PublishError<I>> {
        let mut message = message;
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let rejected = match publisher.try_publish(message).into_result() {
                Ok(handle) => return Ok(handle),
                Err(rejected) => rejected,
            };

            if self.max_attempts.is_some_and(|max| attempt >= max) {
                trace_debug!(attempt, reason = %rejected.kind(), "giving up on publish");
                return Err(rejected);
            }

            let delay = self.delay_for(rejected.kind());
            trace_debug!(attempt, reason = %rejected.kind(), ?delay, "publish rejected, retrying");
            thread::sleep(delay);
            message = rejected.into_message();
        }
    }
}

fn saturating_millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::completion_pair;

    #[test]
    fn test_outcome_into_result() {
        let (handle, _completer) = completion_pair(3);
        let accepted: PublishOutcome<&str> = PublishOutcome::Accepted(handle);
        assert!(accepted.is_accepted());
        assert_eq!(accepted.handle().map(|h| h.sequence()), Some(3));
        assert_eq!(accepted.event(), PublishEvent::Accepted);

        let full = PublishOutcome::CapacityExceeded("m1");
        assert_eq!(full.event(), PublishEvent::CapacityExceeded);
        let err = full.into_result().unwrap_err();
        assert_eq!(err.kind(), Rejection::CapacityExceeded);
        assert_eq!(err.to_string(), "ring buffer capacity exceeded");
        assert_eq!(err.into_message(), "m1");

        let paused = PublishOutcome::ProcessingDisabled(String::from("m2"));
        let err = paused.into_result().unwrap_err();
        assert_eq!(err.kind(), Rejection::ProcessingDisabled);
        assert_eq!(err.message(), "m2");
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(Rejection::CapacityExceeded), Duration::from_millis(100));
        assert_eq!(policy.delay_for(Rejection::ProcessingDisabled), Duration::from_secs(1));
        assert_eq!(policy.max_attempts, None);

        let policy: RetryPolicy =
            serde_json::from_str(r#"{"capacity_exceeded_delay_ms": 5, "max_attempts": 3}"#).unwrap();
        assert_eq!(policy.capacity_exceeded_delay_ms, 5);
        assert_eq!(policy.processing_disabled_delay_ms, 1_000);
        assert_eq!(policy.max_attempts, Some(3));
    }

    #[test]
    fn test_retry_policy_huge_delay_saturates() {
        let policy = RetryPolicy::new(Duration::MAX, Duration::from_millis(3));
        assert_eq!(policy.capacity_exceeded_delay_ms, u64::MAX);
        assert_eq!(policy.processing_disabled_delay_ms, 3);
    }
}
