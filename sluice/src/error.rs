//! Error types for sluice.
//!
//! `SluiceError` covers construction and lifecycle. Per-message failures use
//! `ProcessingError`, `DeliveryError` and `FailureReason` and never escape a
//! worker thread.

use std::io;

use thiserror::Error;

use crate::pipeline::State;

pub type Result<T> = std::result::Result<T, SluiceError>;

#[derive(Error, Debug)]
pub enum SluiceError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("pipeline is {actual:?}, expected {expected:?}")]
    InvalidState { expected: State, actual: State },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

impl SluiceError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Filter-stage failure for a single message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ProcessingError(pub String);

impl ProcessingError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Sink failure for a single message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct DeliveryError(pub String);

impl DeliveryError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Why a completion handle resolved as a failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    #[error("filter failed: {0}")]
    Filter(ProcessingError),

    #[error("delivery failed: {0}")]
    Delivery(DeliveryError),

    #[error("{stage} worker panicked: {message}")]
    Panicked { stage: &'static str, message: String },

    #[error("shutdown timed out before the message was processed")]
    ShutdownForced,
}

impl From<ProcessingError> for FailureReason {
    fn from(e: ProcessingError) -> Self {
        Self::Filter(e)
    }
}

impl From<DeliveryError> for FailureReason {
    fn from(e: DeliveryError) -> Self {
        Self::Delivery(e)
    }
}
