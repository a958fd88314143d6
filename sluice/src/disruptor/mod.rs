//! Lock-free ring buffer for a multi-stage pipeline (LMAX Disruptor pattern).
//!
//! - `Sequencer` - claim cursor, contiguous publish watermark, stage watermarks
//! - `RingBuffer<I, O>` - fixed slot array guarded by a `Sequencer`
//! - `WaitStrategy` / `Backoff` - how idle threads wait for a cursor to move

mod ring;
mod sequencer;
mod slots;
mod wait;

pub use ring::RingBuffer;
pub use sequencer::Sequencer;
pub use slots::{CachePadded, Outbound};
pub use wait::{Backoff, Signal, WaitStrategy};

/// Sequence number type for ring buffer positions
pub type Sequence = u64;

/// Stage index of the filter pool.
pub const FILTER_STAGE: usize = 0;
/// Stage index of the output pool.
pub const OUTPUT_STAGE: usize = 1;
