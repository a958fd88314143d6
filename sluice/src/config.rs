//! Pipeline configuration.
//!
//! ```rust,ignore
//! let config = PipelineConfig::new(4096)?
//!     .with_filter_workers(4)?
//!     .with_output_workers(2)?
//!     .with_publish_mode(PublishMode::NonBlocking);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::disruptor::WaitStrategy;
use crate::error::{Result, SluiceError};

/// Default ring size (64K slots)
const DEFAULT_CAPACITY: u32 = 64 * 1024;
const DEFAULT_FILTER_WORKERS: u32 = 2;
const DEFAULT_OUTPUT_WORKERS: u32 = 1;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 30_000;

/// What `Publisher::submit` does when the ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Park the caller until capacity frees up.
    #[default]
    Blocking,
    /// Fail fast with `CapacityExceeded`.
    NonBlocking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of slots in the ring (power of 2 recommended)
    pub capacity: u32,
    pub filter_workers: u32,
    pub output_workers: u32,
    /// Give every slot its own cache lines
    pub padded_slots: bool,
    pub publish_mode: PublishMode,
    pub wait_strategy: WaitStrategy,
    /// Bounded drain wait before outstanding handles are force-resolved
    pub shutdown_timeout_ms: u64,
    /// CPU ids to pin worker threads to (round-robin). Empty = no pinning.
    pub worker_cores: Vec<usize>,
    /// Prefix for worker thread names
    pub thread_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            filter_workers: DEFAULT_FILTER_WORKERS,
            output_workers: DEFAULT_OUTPUT_WORKERS,
            padded_slots: false,
            publish_mode: PublishMode::default(),
            wait_strategy: WaitStrategy::default(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            worker_cores: Vec::new(),
            thread_name: "sluice".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Create a configuration with the given ring capacity
    pub fn new(capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(SluiceError::config("capacity must be greater than 0"));
        }
        Ok(Self {
            capacity,
            ..Default::default()
        })
    }

    pub fn with_filter_workers(mut self, count: u32) -> Result<Self> {
        if count == 0 {
            return Err(SluiceError::config("filter_workers must be at least 1"));
        }
        self.filter_workers = count;
        Ok(self)
    }

    pub fn with_output_workers(mut self, count: u32) -> Result<Self> {
        if count == 0 {
            return Err(SluiceError::config("output_workers must be at least 1"));
        }
        self.output_workers = count;
        Ok(self)
    }

    pub fn with_padded_slots(mut self, padded: bool) -> Self {
        self.padded_slots = padded;
        self
    }

    pub fn with_publish_mode(mut self, mode: PublishMode) -> Self {
        self.publish_mode = mode;
        self
    }

    pub fn with_wait_strategy(mut self, strategy: WaitStrategy) -> Self {
        self.wait_strategy = strategy;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Result<Self> {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 {
            return Err(SluiceError::config(
                "shutdown timeout must be at least 1ms",
            ));
        }
        self.shutdown_timeout_ms = ms;
        Ok(self)
    }

    pub fn with_worker_cores(mut self, cores: Vec<usize>) -> Self {
        self.worker_cores = cores;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Re-check every option. Needed for configurations built by serde or
    /// by mutating the public fields.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(SluiceError::config("capacity must be greater than 0"));
        }
        if self.filter_workers == 0 {
            return Err(SluiceError::config("filter_workers must be at least 1"));
        }
        if self.output_workers == 0 {
            return Err(SluiceError::config("output_workers must be at least 1"));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(SluiceError::config(
                "shutdown timeout must be at least 1ms",
            ));
        }
        Ok(())
    }
}
