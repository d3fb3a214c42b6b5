//! Range accumulator
//!
//! Collects purge ranges and hands them to the hooks in groups, so one
//! vectorized call can replace many single-range ones. When the vectorized
//! hook is disabled or rejects a group, every range in the group is purged
//! one call at a time instead. Purging a range twice is harmless, so a
//! partially applied vectorized call needs no bookkeeping.

use alloc::vec::Vec;

use crate::hooks::{HpaHooks, PurgeRange};

/// Hook calls issued by an accumulator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccumStats {
    /// Vectorized calls attempted
    pub nvectorized: u64,
    /// Vectorized calls that failed and fell back to serial purges
    pub nvectorized_failures: u64,
    /// Single-range purge calls
    pub nserial: u64,
}

/// Fixed-capacity buffer of ranges awaiting purge
pub struct RangeAccumulator<'a, H: HpaHooks> {
    hooks: &'a H,
    ranges: Vec<PurgeRange>,
    capacity: usize,
    total_bytes: usize,
    vectorized: bool,
    stats: AccumStats,
}

impl<'a, H: HpaHooks> RangeAccumulator<'a, H> {
    /// Accumulator flushing every `capacity` ranges. With `vectorized` unset
    /// every flush goes straight to single-range purges.
    pub fn new(hooks: &'a H, capacity: usize, vectorized: bool) -> Self {
        assert!(capacity > 0, "range accumulator needs capacity");
        Self {
            hooks,
            ranges: Vec::with_capacity(capacity),
            capacity,
            total_bytes: 0,
            vectorized,
            stats: AccumStats::default(),
        }
    }

    /// Ranges currently buffered
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Bytes currently buffered
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Calls issued so far
    pub fn stats(&self) -> AccumStats {
        self.stats
    }

    /// Buffer one range, flushing if that fills the buffer
    pub fn add(&mut self, addr: usize, len: usize) {
        assert!(self.ranges.len() < self.capacity);
        debug_assert!(len > 0);
        self.ranges.push(PurgeRange { addr, len });
        self.total_bytes += len;
        if self.ranges.len() == self.capacity {
            self.flush();
        }
    }

    /// Dispatch every buffered range. Panics on an empty buffer.
    pub fn flush(&mut self) {
        assert!(
            !self.ranges.is_empty() && self.total_bytes > 0,
            "flushing an empty range accumulator"
        );

        let done = self.vectorized && self.try_vectorized();
        if !done {
            for range in &self.ranges {
                self.hooks.purge(range.addr, range.len);
            }
            self.stats.nserial += self.ranges.len() as u64;
        }

        self.ranges.clear();
        self.total_bytes = 0;
    }

    fn try_vectorized(&mut self) -> bool {
        self.stats.nvectorized += 1;
        match self.hooks.vectorized_purge(&self.ranges, self.total_bytes) {
            Ok(()) => true,
            Err(err) => {
                self.stats.nvectorized_failures += 1;
                log::warn!(
                    "vectorized purge of {} ranges failed ({}), purging serially",
                    self.ranges.len(),
                    err
                );
                false
            }
        }
    }

    /// Flush whatever remains at the end of a batch
    pub fn finish(&mut self) {
        if !self.ranges.is_empty() {
            self.flush();
        }
    }
}
