//! Per-thread dynamic instruction counters.
//!
//! One cache-padded slot per thread index, preallocated at construction so
//! the per-instruction path never allocates and never shares a cache line
//! with another thread's counter. Only the owning thread advances its slot;
//! other threads sample it (a child reads its parent's count when it starts
//! or finishes), so plain relaxed atomics are enough.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

use crate::{Result, ThreadIndex, TrackerError};

pub struct CounterBank {
    slots: Box<[CachePadded<AtomicU64>]>,
}

impl CounterBank {
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline(always)]
    fn slot(&self, thread: ThreadIndex) -> Result<&AtomicU64> {
        self.slots
            .get(thread.as_usize())
            .map(|s| &**s)
            .ok_or(TrackerError::CapacityExceeded {
                capacity: self.slots.len(),
            })
    }

    /// Count one more instruction for `thread` and return the new total.
    #[inline(always)]
    pub fn advance(&self, thread: ThreadIndex) -> Result<u64> {
        self.advance_by(thread, 1)
    }

    /// Add `n` instructions at once (batched delivery). A count that would
    /// pass `u64::MAX` is rejected and the slot keeps its old value.
    #[inline]
    pub fn advance_by(&self, thread: ThreadIndex, n: u64) -> Result<u64> {
        add_checked(self.slot(thread)?, thread, n)
    }

    #[inline(always)]
    pub fn current(&self, thread: ThreadIndex) -> Result<u64> {
        Ok(self.slot(thread)?.load(Ordering::Relaxed))
    }

    /// Borrow a thread's slot so callers that already know their index can
    /// skip the bounds check on every instruction.
    pub fn handle(&self, thread: ThreadIndex) -> Result<CounterHandle<'_>> {
        Ok(CounterHandle {
            slot: self.slot(thread)?,
            thread,
        })
    }
}

#[inline(always)]
fn add_checked(slot: &AtomicU64, thread: ThreadIndex, n: u64) -> Result<u64> {
    slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_add(n))
        .map(|prev| prev + n)
        .map_err(|_| TrackerError::CounterOverflow { thread })
}

impl Default for CounterBank {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

#[derive(Clone, Copy)]
pub struct CounterHandle<'a> {
    slot: &'a AtomicU64,
    thread: ThreadIndex,
}

impl CounterHandle<'_> {
    pub fn thread(&self) -> ThreadIndex {
        self.thread
    }

    #[inline(always)]
    pub fn advance(&self) -> Result<u64> {
        self.advance_by(1)
    }

    #[inline(always)]
    pub fn advance_by(&self, n: u64) -> Result<u64> {
        add_checked(self.slot, self.thread, n)
    }

    #[inline(always)]
    pub fn current(&self) -> u64 {
        self.slot.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_advance_is_monotonic() {
        let bank = CounterBank::with_capacity(4);
        let t = ThreadIndex(2);
        assert_eq!(bank.current(t).unwrap(), 0);
        assert_eq!(bank.advance(t).unwrap(), 1);
        assert_eq!(bank.advance(t).unwrap(), 2);
        assert_eq!(bank.advance_by(t, 10).unwrap(), 12);
        assert_eq!(bank.current(t).unwrap(), 12);
        // Other slots are untouched
        assert_eq!(bank.current(ThreadIndex(1)).unwrap(), 0);
    }

    #[test]
    fn test_out_of_range_index() {
        let bank = CounterBank::with_capacity(2);
        assert_eq!(
            bank.advance(ThreadIndex(2)),
            Err(TrackerError::CapacityExceeded { capacity: 2 })
        );
        assert!(bank.handle(ThreadIndex(5)).is_err());
    }

    #[test]
    fn test_handle_shares_slot() {
        let bank = CounterBank::with_capacity(1);
        let h = bank.handle(ThreadIndex::ROOT).unwrap();
        h.advance().unwrap();
        assert_eq!(h.advance_by(4).unwrap(), 5);
        assert_eq!(bank.current(ThreadIndex::ROOT).unwrap(), 5);
        assert_eq!(h.current(), 5);
        assert_eq!(h.thread(), ThreadIndex::ROOT);
    }

    #[test]
    fn test_overflow_is_rejected() {
        let bank = CounterBank::with_capacity(2);
        let t = ThreadIndex(1);
        assert_eq!(bank.advance_by(t, u64::MAX).unwrap(), u64::MAX);
        assert_eq!(
            bank.advance(t),
            Err(TrackerError::CounterOverflow { thread: t })
        );
        assert_eq!(
            bank.handle(t).unwrap().advance_by(7),
            Err(TrackerError::CounterOverflow { thread: t })
        );
        // The count never wraps.
        assert_eq!(bank.current(t).unwrap(), u64::MAX);
    }

    #[test]
    fn test_counters_are_independent_across_threads() {
        let bank = Arc::new(CounterBank::with_capacity(8));
        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let bank = Arc::clone(&bank);
                std::thread::spawn(move || {
                    for _ in 0..(1000 * (i as u64 + 1)) {
                        bank.advance(ThreadIndex(i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for i in 0..8u32 {
            assert_eq!(bank.current(ThreadIndex(i)).unwrap(), 1000 * (i as u64 + 1));
        }
    }
}
