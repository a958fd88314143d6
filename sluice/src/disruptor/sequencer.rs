//! Sequencer: claim cursor, publish watermark and per-stage watermarks.
//!
//! All cursors count sequences, so "watermark = n" means every sequence below
//! `n` is finished. The chain `claimed >= published >= stage[0] >= stage[1]`
//! always holds, and `claimed - stage[last] <= capacity`.
//!
//! Producers claim with a CAS loop gated on the last stage's watermark. Writes
//! may complete out of order; `publish` records each finished sequence in
//! `available` and then advances the published watermark over the contiguous
//! prefix only.
//!
//! Each stage is a work-stealing pool: workers CAS the stage's `next` cursor to
//! claim one sequence at a time, bounded by the upstream watermark. A worker
//! advertises the sequence it holds in its `in_flight` cell, so the stage
//! watermark is `min(next, in_flight[..])`, which stays in order even though
//! workers finish out of order.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::disruptor::slots::CachePadded;
use crate::disruptor::wait::Signal;
use crate::disruptor::Sequence;

/// `in_flight` value of a worker that holds nothing.
const IDLE: u64 = u64::MAX;
/// `available` value of a slot nobody has published into yet.
const UNPUBLISHED: u64 = u64::MAX;

struct StageCursor {
    /// Next sequence this pool hands out.
    next: CachePadded<AtomicU64>,
    /// Every sequence below this is done by this stage.
    watermark: CachePadded<AtomicU64>,
    /// Per worker: the sequence it may be working on, or `IDLE`.
    in_flight: Box<[CachePadded<AtomicU64>]>,
    /// Notified when `watermark` advances.
    signal: Signal,
}

impl StageCursor {
    fn new(workers: usize) -> Self {
        Self {
            next: CachePadded::new(AtomicU64::new(0)),
            watermark: CachePadded::new(AtomicU64::new(0)),
            in_flight: (0..workers)
                .map(|_| CachePadded::new(AtomicU64::new(IDLE)))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            signal: Signal::new(),
        }
    }
}

pub struct Sequencer {
    capacity: u64,
    /// `capacity - 1` when capacity is a power of 2.
    mask: Option<u64>,
    claim: CachePadded<AtomicU64>,
    published: CachePadded<AtomicU64>,
    /// Per slot: the last sequence published into it.
    available: Box<[AtomicU64]>,
    publish_signal: Signal,
    stages: Box<[StageCursor]>,
}

impl Sequencer {
    /// `workers_per_stage[i]` is the pool size of stage `i`.
    ///
    /// Callers validate that capacity and every pool size are non-zero.
    pub fn new(capacity: usize, workers_per_stage: &[usize]) -> Self {
        debug_assert!(capacity > 0);
        debug_assert!(!workers_per_stage.is_empty());
        let mask = if capacity.is_power_of_two() {
            Some((capacity as u64) - 1)
        } else {
            None
        };
        Self {
            capacity: capacity as u64,
            mask,
            claim: CachePadded::new(AtomicU64::new(0)),
            published: CachePadded::new(AtomicU64::new(0)),
            available: (0..capacity)
                .map(|_| AtomicU64::new(UNPUBLISHED))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            publish_signal: Signal::new(),
            stages: workers_per_stage
                .iter()
                .map(|&n| StageCursor::new(n))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub fn index(&self, sequence: Sequence) -> usize {
        match self.mask {
            Some(mask) => (sequence & mask) as usize,
            None => (sequence % self.capacity) as usize,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    // ------------------------------------------------------------------
    // Producer side
    // ------------------------------------------------------------------

    /// Reserve the next sequence, or `None` if the ring is full.
    pub fn try_claim(&self) -> Option<Sequence> {
        let gate = &self.last_stage().watermark;
        loop {
            let current = self.claim.load(Ordering::Relaxed);
            let consumed = gate.load(Ordering::Acquire);
            // A stale `current` can trail `consumed`; the CAS below rejects it.
            if current.saturating_sub(consumed) >= self.capacity {
                return None;
            }
            match self.claim.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current),
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    /// Mark `sequence` as written and advance the published watermark over
    /// every contiguous written sequence.
    pub fn publish(&self, sequence: Sequence) {
        self.available[self.index(sequence)].store(sequence, Ordering::SeqCst);

        let mut advanced = false;
        loop {
            let published = self.published.load(Ordering::SeqCst);
            if self.available[self.index(published)].load(Ordering::SeqCst) != published {
                break;
            }
            if self
                .published
                .compare_exchange(published, published + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                advanced = true;
            }
        }
        if advanced {
            self.publish_signal.notify();
        }
    }

    /// Sequences claimed so far.
    pub fn claimed(&self) -> u64 {
        self.claim.load(Ordering::Acquire)
    }

    /// Length of the contiguous published prefix.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// `capacity - (claimed - last stage watermark)`
    pub fn remaining_capacity(&self) -> u64 {
        let consumed = self.last_stage().watermark.load(Ordering::Acquire);
        let claimed = self.claim.load(Ordering::Acquire);
        self.capacity
            .saturating_sub(claimed.saturating_sub(consumed))
    }

    /// Signal notified when capacity frees up.
    pub fn capacity_signal(&self) -> &Signal {
        &self.last_stage().signal
    }

    // ------------------------------------------------------------------
    // Stage side
    // ------------------------------------------------------------------

    /// Claim the next sequence for `worker` of `stage`, bounded by the
    /// upstream watermark. `None` means nothing is available yet.
    pub fn try_claim_for_stage(&self, stage: usize, worker: usize) -> Option<Sequence> {
        let cursor = &self.stages[stage];
        let in_flight = &cursor.in_flight[worker];
        debug_assert_eq!(
            in_flight.load(Ordering::Relaxed),
            IDLE,
            "worker {} of stage {} claimed twice",
            worker,
            stage
        );
        loop {
            let next = cursor.next.load(Ordering::SeqCst);
            // Advertise before claiming: a concurrent watermark scan that
            // sees `next + 1` must also see this worker holding `next`.
            in_flight.store(next, Ordering::SeqCst);
            if next >= self.upstream(stage) {
                in_flight.store(IDLE, Ordering::SeqCst);
                // A peer finishing concurrently may have scanned our stale
                // advertisement; one of the two scans sees both cells clear.
                Self::advance_watermark(cursor);
                return None;
            }
            if cursor
                .next
                .compare_exchange(next, next + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(next);
            }
            std::hint::spin_loop();
        }
    }

    /// `worker` of `stage` finished `sequence`. Recomputes the stage
    /// watermark as the minimum over the pool; never moves it backwards.
    pub fn mark_done(&self, stage: usize, worker: usize, sequence: Sequence) {
        let cursor = &self.stages[stage];
        debug_assert_eq!(
            cursor.in_flight[worker].load(Ordering::Relaxed),
            sequence,
            "worker {} of stage {} finished a sequence it does not hold",
            worker,
            stage
        );
        cursor.in_flight[worker].store(IDLE, Ordering::SeqCst);
        Self::advance_watermark(cursor);
    }

    fn advance_watermark(cursor: &StageCursor) {
        // Read `next` before the workers: anything claimed below it is either
        // still advertised in `in_flight` or already done.
        let mut low = cursor.next.load(Ordering::SeqCst);
        for cell in cursor.in_flight.iter() {
            low = low.min(cell.load(Ordering::SeqCst));
        }

        let previous = cursor.watermark.fetch_max(low, Ordering::AcqRel);
        if low > previous {
            cursor.signal.notify();
        }
    }

    /// Every sequence below the returned value is done by `stage`.
    pub fn watermark(&self, stage: usize) -> u64 {
        self.stages[stage].watermark.load(Ordering::Acquire)
    }

    /// Whether `stage` has something to claim right now.
    pub fn has_work(&self, stage: usize) -> bool {
        self.stages[stage].next.load(Ordering::Acquire) < self.upstream(stage)
    }

    /// Signal notified when new work becomes visible to `stage`.
    pub fn upstream_signal(&self, stage: usize) -> &Signal {
        if stage == 0 {
            &self.publish_signal
        } else {
            &self.stages[stage - 1].signal
        }
    }

    /// Wake every parked thread (used on lifecycle changes).
    pub fn notify_all(&self) {
        self.publish_signal.notify();
        for stage in self.stages.iter() {
            stage.signal.notify();
        }
    }

    #[inline]
    fn upstream(&self, stage: usize) -> u64 {
        if stage == 0 {
            self.published.load(Ordering::SeqCst)
        } else {
            self.stages[stage - 1].watermark.load(Ordering::SeqCst)
        }
    }

    #[inline]
    fn last_stage(&self) -> &StageCursor {
        &self.stages[self.stages.len() - 1]
    }
}
