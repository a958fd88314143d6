//! RingBuffer: the slot array plus the sequencer that guards it.

use crate::completion::Completer;
use crate::disruptor::sequencer::Sequencer;
use crate::disruptor::slots::{Slot, SlotArray};
use crate::disruptor::Sequence;
use crate::error::{Result, SluiceError};

pub struct RingBuffer<I, O> {
    slots: SlotArray<I, O>,
    sequencer: Sequencer,
}

impl<I, O> RingBuffer<I, O> {
    /// Allocate `capacity` slots for a pipeline with one worker pool per
    /// entry of `workers_per_stage`.
    pub fn new(capacity: usize, padded: bool, workers_per_stage: &[usize]) -> Result<Self> {
        if capacity == 0 {
            return Err(SluiceError::config("capacity must be greater than 0"));
        }
        if workers_per_stage.is_empty() {
            return Err(SluiceError::config("at least one stage is required"));
        }
        if workers_per_stage.iter().any(|&n| n == 0) {
            return Err(SluiceError::config("every stage needs at least one worker"));
        }
        if !capacity.is_power_of_two() {
            trace_warn!(
                capacity,
                "ring capacity is not a power of 2, slot indexing falls back to modulo"
            );
        }

        Ok(Self {
            slots: SlotArray::new(capacity, padded),
            sequencer: Sequencer::new(capacity, workers_per_stage),
        })
    }

    #[inline(always)]
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    #[inline(always)]
    pub(crate) fn slot(&self, sequence: Sequence) -> &Slot<I, O> {
        self.slots.get(self.sequencer.index(sequence))
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_padded(&self) -> bool {
        self.slots.is_padded()
    }

    /// Write a claimed slot and make it visible to the first stage.
    ///
    /// # Safety
    ///
    /// - `sequence` must have come from `sequencer().try_claim()` and must not
    ///   have been written before.
    pub(crate) unsafe fn write_and_publish(
        &self,
        sequence: Sequence,
        value: I,
        completer: Completer,
    ) {
        let slot = self.slot(sequence);
        slot.put_inbound(value);
        slot.completer().install(completer);
        self.sequencer.publish(sequence);
    }
}

// SAFETY: slot fields are only touched by the thread that currently owns the
// sequence, and ownership is handed over through the sequencer's atomics.
unsafe impl<I: Send, O: Send> Send for RingBuffer<I, O> {}
unsafe impl<I: Send, O: Send> Sync for RingBuffer<I, O> {}
