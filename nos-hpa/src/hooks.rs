//! Injected platform hooks
//!
//! Everything that touches the operating system or the clock goes through
//! [`HpaHooks`], supplied once at shard construction. Every hook is
//! synchronous and may block; the shard never holds its lock across the
//! slow ones (purge, vectorized purge, hugify, dehugify).

use crate::error::Result;

/// Monotonic timestamp in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nstime(pub u64);

impl Nstime {
    /// Zero timestamp
    pub const ZERO: Nstime = Nstime(0);

    /// Timestamp from milliseconds
    pub const fn from_ms(ms: u64) -> Self {
        Nstime(ms * 1000 * 1000)
    }

    /// Nanoseconds
    pub const fn ns(self) -> u64 {
        self.0
    }

    /// Whole milliseconds elapsed from `earlier` to `self`; zero if the
    /// clock went backwards
    pub const fn ms_since(self, earlier: Nstime) -> u64 {
        self.0.saturating_sub(earlier.0) / 1000 / 1000
    }
}

/// One contiguous range handed to the purge hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgeRange {
    /// Start address
    pub addr: usize,
    /// Length in bytes
    pub len: usize,
}

/// Platform operations used by a shard
pub trait HpaHooks {
    /// Reserve and map a fresh unit of `size` bytes, huge-page aligned
    fn map(&self, size: usize) -> Result<usize>;

    /// Release a unit obtained from `map`
    fn unmap(&self, addr: usize, size: usize);

    /// Advisory reclaim of one range. Must be idempotent.
    fn purge(&self, addr: usize, size: usize);

    /// Advisory reclaim of many ranges in one call. An error means the whole
    /// batch must be retried range by range.
    fn vectorized_purge(&self, ranges: &[PurgeRange], total_bytes: usize) -> Result<()>;

    /// Promote a unit's backing to huge pages
    fn hugify(&self, addr: usize, size: usize, sync: bool) -> Result<()>;

    /// Revert a unit's backing to base pages
    fn dehugify(&self, addr: usize, size: usize);

    /// Current time. `first_reading` is set for the first reading of an
    /// operation, letting a clock cache skip a refresh for later ones.
    fn curtime(&self, first_reading: bool) -> Nstime;

    /// Milliseconds elapsed since `past`
    fn ms_since(&self, past: Nstime) -> u64 {
        self.curtime(false).ms_since(past)
    }
}

impl<T: HpaHooks + ?Sized> HpaHooks for &T {
    fn map(&self, size: usize) -> Result<usize> {
        (**self).map(size)
    }

    fn unmap(&self, addr: usize, size: usize) {
        (**self).unmap(addr, size)
    }

    fn purge(&self, addr: usize, size: usize) {
        (**self).purge(addr, size)
    }

    fn vectorized_purge(&self, ranges: &[PurgeRange], total_bytes: usize) -> Result<()> {
        (**self).vectorized_purge(ranges, total_bytes)
    }

    fn hugify(&self, addr: usize, size: usize, sync: bool) -> Result<()> {
        (**self).hugify(addr, size, sync)
    }

    fn dehugify(&self, addr: usize, size: usize) {
        (**self).dehugify(addr, size)
    }

    fn curtime(&self, first_reading: bool) -> Nstime {
        (**self).curtime(first_reading)
    }

    fn ms_since(&self, past: Nstime) -> u64 {
        (**self).ms_since(past)
    }
}
