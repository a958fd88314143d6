//! Slot storage.
//!
//! A slot carries the inbound payload (written by the claiming producer, taken
//! by the filter worker), the outbound payload (written by the filter worker,
//! taken by the output worker) and the message's completer. Which thread may
//! touch a field is decided by the sequencer, never by a lock.
//!
//! - `SlotArray::Packed` - slots laid out back to back
//! - `SlotArray::Padded` - every slot on its own cache lines (no false sharing)

use std::cell::UnsafeCell;
use std::ops::Deref;

use crate::completion::CompleterCell;
use crate::error::FailureReason;

/// Result of the filter stage, handed to the output stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound<O> {
    /// Ready for delivery.
    Message(O),
    /// Filtered out; nothing to deliver.
    Skipped,
    /// Filter failed; the handle resolves with this reason.
    Failed(FailureReason),
}

pub struct Slot<I, O> {
    inbound: UnsafeCell<Option<I>>,
    outbound: UnsafeCell<Option<Outbound<O>>>,
    completer: CompleterCell,
}

impl<I, O> Default for Slot<I, O> {
    fn default() -> Self {
        Self {
            inbound: UnsafeCell::new(None),
            outbound: UnsafeCell::new(None),
            completer: CompleterCell::default(),
        }
    }
}

impl<I, O> Slot<I, O> {
    /// Store the producer's payload.
    ///
    /// # Safety
    ///
    /// - The caller must hold the claim for this slot's sequence.
    /// - The sequence must not be published yet.
    #[inline]
    pub(crate) unsafe fn put_inbound(&self, value: I) {
        *self.inbound.get() = Some(value);
    }

    /// Take the producer's payload.
    ///
    /// # Safety
    ///
    /// - The sequence must be published.
    /// - The caller must be the filter worker that claimed this sequence.
    #[inline]
    pub(crate) unsafe fn take_inbound(&self) -> Option<I> {
        (*self.inbound.get()).take()
    }

    /// Store the filter result.
    ///
    /// # Safety
    ///
    /// - The caller must be the filter worker that claimed this sequence,
    ///   before it marks the sequence done.
    #[inline]
    pub(crate) unsafe fn put_outbound(&self, value: Outbound<O>) {
        *self.outbound.get() = Some(value);
    }

    /// Take the filter result.
    ///
    /// # Safety
    ///
    /// - The filter stage watermark must be past this sequence.
    /// - The caller must be the output worker that claimed this sequence.
    #[inline]
    pub(crate) unsafe fn take_outbound(&self) -> Option<Outbound<O>> {
        (*self.outbound.get()).take()
    }

    /// Drop anything left in the payload fields.
    ///
    /// # Safety
    ///
    /// - No other thread may access this slot's payloads (the last stage
    ///   still owns the sequence, or all workers have stopped).
    #[inline]
    pub(crate) unsafe fn clear(&self) {
        *self.inbound.get() = None;
        *self.outbound.get() = None;
    }

    #[inline]
    pub(crate) fn completer(&self) -> &CompleterCell {
        &self.completer
    }
}

/// Aligns (and therefore pads) `T` to two cache lines, matching the adjacent
/// line prefetcher on x86.
#[repr(align(128))]
#[derive(Default)]
pub struct CachePadded<T>(T);

impl<T> CachePadded<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        &self.0
    }
}

pub(crate) enum SlotArray<I, O> {
    Packed(Box<[Slot<I, O>]>),
    Padded(Box<[CachePadded<Slot<I, O>>]>),
}

impl<I, O> SlotArray<I, O> {
    pub(crate) fn new(capacity: usize, padded: bool) -> Self {
        if padded {
            SlotArray::Padded(
                (0..capacity)
                    .map(|_| CachePadded::default())
                    .collect::<Vec<_>>()
                    .into_boxed_slice(),
            )
        } else {
            SlotArray::Packed(
                (0..capacity)
                    .map(|_| Slot::default())
                    .collect::<Vec<_>>()
                    .into_boxed_slice(),
            )
        }
    }

    #[inline(always)]
    pub(crate) fn get(&self, index: usize) -> &Slot<I, O> {
        match self {
            SlotArray::Packed(slots) => &slots[index],
            SlotArray::Padded(slots) => &slots[index],
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            SlotArray::Packed(slots) => slots.len(),
            SlotArray::Padded(slots) => slots.len(),
        }
    }

    pub(crate) fn is_padded(&self) -> bool {
        matches!(self, SlotArray::Padded(_))
    }
}
