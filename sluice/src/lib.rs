//! # sluice
//!
//! Multi-stage log ingestion pipeline on a lock-free ring buffer.
//!
//! ## Features
//!
//! - **Multi-producer**: any number of threads publish through a `Publisher`
//! - **Two worker pools**: filter (decode/normalize) then output (deliver),
//!   each stealing work from a shared stage cursor
//! - **Backpressure**: `CapacityExceeded` / `ProcessingDisabled` hand the
//!   message back instead of dropping it
//! - **Completion handles**: one per accepted message, always resolved
//!
//! ```rust,ignore
//! use sluice::{CodecRegistry, DecodingFilter, Message, Pipeline, PipelineConfig, RawMessage};
//!
//! let mut pipeline = Pipeline::new(
//!     PipelineConfig::new(4096)?,
//!     DecodingFilter::new(CodecRegistry::with_defaults()),
//!     |message: Message| -> Result<(), sluice::DeliveryError> { Ok(index(message)) },
//! )?;
//! pipeline.start()?;
//!
//! let publisher = pipeline.publisher();
//! let handle = publisher.publish(RawMessage::new(1, "raw", "link down"))?;
//! assert!(handle.wait().is_success());
//!
//! let report = pipeline.stop()?;
//! ```

// Tracing macros - no-op when feature disabled
#[cfg(feature = "tracing")]
macro_rules! trace_debug { ($($arg:tt)*) => { tracing::debug!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_debug { ($($arg:tt)*) => {} }

#[cfg(feature = "tracing")]
macro_rules! trace_info { ($($arg:tt)*) => { tracing::info!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_info { ($($arg:tt)*) => {} }

#[cfg(feature = "tracing")]
macro_rules! trace_warn { ($($arg:tt)*) => { tracing::warn!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn { ($($arg:tt)*) => {} }

#[cfg(feature = "tracing")]
macro_rules! trace_error { ($($arg:tt)*) => { tracing::error!($($arg)*) } }
#[cfg(not(feature = "tracing"))]
macro_rules! trace_error { ($($arg:tt)*) => {} }

pub mod affinity;
pub mod backpressure;
pub mod codec;
pub mod completion;
pub mod config;
pub mod disruptor;
pub mod error;
mod handler;
pub mod insights;
pub mod message;
pub mod pipeline;
mod worker;

pub use backpressure::{PublishError, PublishOutcome, Rejection, RetryPolicy};
pub use codec::{Codec, CodecRegistry, DecodingFilter, MultiDecodingFilter, RawCodec};
pub use completion::{Completion, CompletionHandle};
pub use config::{PipelineConfig, PublishMode};
pub use disruptor::{RingBuffer, Sequence, Sequencer, WaitStrategy};
pub use error::{DeliveryError, FailureReason, ProcessingError, Result, SluiceError};
pub use handler::{Filter, Sink};
pub use insights::{
    MetricsSink, MetricsSnapshot, NoopMetrics, PublishEvent, WorkerMetrics, WorkerStats,
};
pub use message::{Message, RawMessage};
pub use pipeline::{Pipeline, PipelineBuilder, Publisher, ShutdownReport, State};
pub use worker::Stage;

/// Pipeline wired for log ingestion: raw messages in, decoded messages out.
pub type LogPipeline = Pipeline<RawMessage, Message>;

/// Log pipeline for transports that carry several messages per payload.
pub type BatchLogPipeline = Pipeline<RawMessage, Vec<Message>>;
