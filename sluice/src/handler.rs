//! Pluggable filter and sink, and the stage handlers that drive them.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::completion::Completion;
use crate::disruptor::{Outbound, RingBuffer, Sequence};
use crate::error::{DeliveryError, FailureReason, ProcessingError};
use crate::worker::{Processed, Stage, StageHandler};

/// Filter stage: turns an inbound payload into an outbound one.
///
/// `Ok(None)` skips the message: it is not delivered, and its handle still
/// resolves `Success`.
pub trait Filter<I, O>: Send + Sync {
    fn filter(&self, input: I) -> Result<Option<O>, ProcessingError>;
}

impl<I, O, F> Filter<I, O> for F
where
    F: Fn(I) -> Result<Option<O>, ProcessingError> + Send + Sync,
{
    fn filter(&self, input: I) -> Result<Option<O>, ProcessingError> {
        self(input)
    }
}

/// Output stage delivery target (indexer, forwarder, ...). Called once per
/// message by exactly one output worker.
pub trait Sink<O>: Send + Sync {
    fn deliver(&self, output: O) -> Result<(), DeliveryError>;
}

impl<O, F> Sink<O> for F
where
    F: Fn(O) -> Result<(), DeliveryError> + Send + Sync,
{
    fn deliver(&self, output: O) -> Result<(), DeliveryError> {
        self(output)
    }
}

pub(crate) struct FilterStage<I, O> {
    filter: Arc<dyn Filter<I, O>>,
}

impl<I, O> FilterStage<I, O> {
    pub(crate) fn new(filter: Arc<dyn Filter<I, O>>) -> Self {
        Self { filter }
    }
}

impl<I: Send + 'static, O: Send + 'static> StageHandler<I, O> for FilterStage<I, O> {
    fn handle(&self, ring: &RingBuffer<I, O>, sequence: Sequence) -> Processed {
        let slot = ring.slot(sequence);
        // SAFETY: this worker won `sequence` for the filter stage. The
        // producer's write happened before the publish watermark passed it,
        // and the output stage cannot reach the slot until we mark it done.
        let Some(input) = (unsafe { slot.take_inbound() }) else {
            trace_error!(sequence, "published slot has no inbound payload");
            let reason = FailureReason::Filter(ProcessingError::new("missing inbound payload"));
            unsafe { slot.put_outbound(Outbound::Failed(reason)) };
            return Processed::ok(false);
        };

        let outbound = match panic::catch_unwind(AssertUnwindSafe(|| self.filter.filter(input))) {
            Ok(Ok(Some(output))) => Outbound::Message(output),
            Ok(Ok(None)) => Outbound::Skipped,
            Ok(Err(e)) => {
                trace_warn!(sequence, error = %e, "filter failed");
                Outbound::Failed(e.into())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                trace_error!(sequence, panic = %message, "filter panicked");
                Outbound::Failed(FailureReason::Panicked {
                    stage: Stage::Filter.as_str(),
                    message,
                })
            }
        };

        let ok = !matches!(outbound, Outbound::Failed(_));
        unsafe { slot.put_outbound(outbound) };
        Processed::ok(ok)
    }
}

pub(crate) struct OutputStage<O> {
    sink: Arc<dyn Sink<O>>,
}

impl<O> OutputStage<O> {
    pub(crate) fn new(sink: Arc<dyn Sink<O>>) -> Self {
        Self { sink }
    }
}

impl<I: Send + 'static, O: Send + 'static> StageHandler<I, O> for OutputStage<O> {
    fn handle(&self, ring: &RingBuffer<I, O>, sequence: Sequence) -> Processed {
        let slot = ring.slot(sequence);
        // SAFETY: the filter watermark is past `sequence` and this worker won
        // it for the output stage, so the filter's write is visible and no
        // other thread touches the slot until we mark it done.
        let outbound = unsafe { slot.take_outbound() };

        let completion = match outbound {
            Some(Outbound::Message(output)) => self.deliver(sequence, output),
            Some(Outbound::Skipped) => Completion::Success,
            Some(Outbound::Failed(reason)) => Completion::Failure(reason),
            None => {
                trace_error!(sequence, "filtered slot has no outbound payload");
                Completion::Failure(FailureReason::Filter(ProcessingError::new(
                    "missing filter result",
                )))
            }
        };

        // Taken after delivery: a forced shutdown sweeping a stuck sink
        // resolves the handle instead, and this take then comes back empty.
        let completer = slot.completer().take();
        // Once marked done the slot may be reclaimed by a producer, so it has
        // to be empty before the worker reports it.
        unsafe { slot.clear() };

        Processed {
            ok: completion.is_success(),
            resolve: completer.map(|completer| (completer, completion)),
        }
    }
}

impl<O> OutputStage<O> {
    fn deliver(&self, sequence: Sequence, output: O) -> Completion {
        match panic::catch_unwind(AssertUnwindSafe(|| self.sink.deliver(output))) {
            Ok(Ok(())) => Completion::Success,
            Ok(Err(e)) => {
                trace_warn!(sequence, error = %e, "delivery failed");
                Completion::Failure(e.into())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                trace_error!(sequence, panic = %message, "sink panicked");
                Completion::Failure(FailureReason::Panicked {
                    stage: Stage::Output.as_str(),
                    message,
                })
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
