//! Huge page unit
//!
//! A [`HugePageUnit`] tracks one `HUGEPAGE`-sized region. Each base page is
//! in one of three states, derived from two bitmaps:
//!
//! | active | touched | state                         |
//! |--------|---------|-------------------------------|
//! | 1      | 1       | in use                        |
//! | 0      | 1       | dirty (freed, still resident) |
//! | 0      | 0       | inactive (retained, reclaimed)|
//!
//! Purging is resumable: [`HugePageUnit::begin_purge`] snapshots the ranges
//! to reclaim into a [`PurgeState`], [`PurgeState::advance`] emits them one
//! at a time, and [`HugePageUnit::end_purge`] commits whatever was emitted.
//! The unit must not take allocations between begin and end.

use bitflags::bitflags;

use crate::bitmap::PageBitmap;
use crate::config::{HUGEPAGE, HUGEPAGE_PAGES, PAGE};
use crate::hooks::{HpaHooks, Nstime, PurgeRange};
use crate::purge::accum::RangeAccumulator;

bitflags! {
    /// Per-unit state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnitFlags: u16 {
        /// Backing is currently hugified
        const HUGE = 1 << 0;
        /// New page runs may be reserved from this unit
        const ALLOC_ALLOWED = 1 << 1;
        /// Unit is a purge candidate
        const PURGE_ALLOWED = 1 << 2;
        /// Unit is a hugify candidate (dwell clock running)
        const HUGIFY_ALLOWED = 1 << 3;
        /// A purge pass owns the unit
        const MID_PURGE = 1 << 4;
        /// A hugify call is in flight for the unit
        const MID_HUGIFY = 1 << 5;
        /// Pages were freed after the unit was hugified
        const DIRTIED_WHILE_HUGE = 1 << 6;
    }
}

/// Stable handle of a unit inside its shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub u32);

impl UnitId {
    /// Arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One huge page worth of pages
#[derive(Debug, Clone)]
pub struct HugePageUnit {
    addr: usize,
    age: u64,
    flags: UnitFlags,
    active: PageBitmap,
    touched: PageBitmap,
    nactive: usize,
    ntouched: usize,
    longest_free_range: usize,
    time_hugify_allowed: Nstime,
    dirty_seq: u64,
}

impl HugePageUnit {
    /// Fresh unit at `addr`, all pages inactive
    pub fn new(addr: usize, age: u64) -> Self {
        debug_assert_eq!(addr % HUGEPAGE, 0);
        Self {
            addr,
            age,
            flags: UnitFlags::ALLOC_ALLOWED,
            active: PageBitmap::new(),
            touched: PageBitmap::new(),
            nactive: 0,
            ntouched: 0,
            longest_free_range: HUGEPAGE_PAGES,
            time_hugify_allowed: Nstime::ZERO,
            dirty_seq: 0,
        }
    }

    /// Base address
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Creation sequence number within the shard
    pub fn age(&self) -> u64 {
        self.age
    }

    /// Current flags
    pub fn flags(&self) -> UnitFlags {
        self.flags
    }

    /// Pages in use
    pub fn nactive(&self) -> usize {
        self.nactive
    }

    /// Resident pages
    pub fn ntouched(&self) -> usize {
        self.ntouched
    }

    /// Freed but resident pages
    pub fn ndirty(&self) -> usize {
        self.ntouched - self.nactive
    }

    /// Reclaimed pages
    pub fn nretained(&self) -> usize {
        HUGEPAGE_PAGES - self.ntouched
    }

    /// No page in use
    pub fn is_empty(&self) -> bool {
        self.nactive == 0
    }

    /// Longest run of free pages
    pub fn longest_free_range(&self) -> usize {
        self.longest_free_range
    }

    /// Whether `addr` falls inside this unit
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr && addr < self.addr + HUGEPAGE
    }

    /// Backing is hugified
    pub fn is_huge(&self) -> bool {
        self.flags.contains(UnitFlags::HUGE)
    }

    /// Open for new reservations
    pub fn alloc_allowed(&self) -> bool {
        self.flags.contains(UnitFlags::ALLOC_ALLOWED)
    }

    /// Purge candidate
    pub fn purge_allowed(&self) -> bool {
        self.flags.contains(UnitFlags::PURGE_ALLOWED)
    }

    /// Hugify candidate with its dwell clock running
    pub fn hugify_allowed(&self) -> bool {
        self.flags.contains(UnitFlags::HUGIFY_ALLOWED)
    }

    /// Owned by an in-flight purge batch
    pub fn mid_purge(&self) -> bool {
        self.flags.contains(UnitFlags::MID_PURGE)
    }

    /// A hugify or dehugify call is in flight
    pub fn mid_hugify(&self) -> bool {
        self.flags.contains(UnitFlags::MID_HUGIFY)
    }

    /// A purge or hugify is in flight
    pub fn changing_state(&self) -> bool {
        self.flags.intersects(UnitFlags::MID_PURGE | UnitFlags::MID_HUGIFY)
    }

    /// Huge unit that gained dirty pages since promotion
    pub fn dirtied_while_huge(&self) -> bool {
        self.flags.contains(UnitFlags::DIRTIED_WHILE_HUGE)
    }

    /// Open or close the unit for reservations
    pub fn set_alloc_allowed(&mut self, allowed: bool) {
        self.flags.set(UnitFlags::ALLOC_ALLOWED, allowed);
    }

    /// Mark or clear the unit as a purge candidate
    pub fn set_purge_allowed(&mut self, allowed: bool) {
        self.flags.set(UnitFlags::PURGE_ALLOWED, allowed);
    }

    /// Enter or leave a purge batch
    pub fn set_mid_purge(&mut self, mid: bool) {
        self.flags.set(UnitFlags::MID_PURGE, mid);
    }

    /// Enter or leave a hugify or dehugify call
    pub fn set_mid_hugify(&mut self, mid: bool) {
        self.flags.set(UnitFlags::MID_HUGIFY, mid);
    }

    /// Start the hugify dwell clock, unless it is already running
    pub fn allow_hugify(&mut self, now: Nstime) {
        if !self.hugify_allowed() {
            self.flags.insert(UnitFlags::HUGIFY_ALLOWED);
            self.time_hugify_allowed = now;
        }
    }

    /// Stop the dwell clock
    pub fn disallow_hugify(&mut self) {
        self.flags.remove(UnitFlags::HUGIFY_ALLOWED);
    }

    /// When the dwell clock started
    pub fn time_hugify_allowed(&self) -> Nstime {
        self.time_hugify_allowed
    }

    /// Ordering key for oldest-dirty-first purging
    pub fn dirty_seq(&self) -> u64 {
        self.dirty_seq
    }

    /// Set the oldest-dirty-first ordering key
    pub fn set_dirty_seq(&mut self, seq: u64) {
        self.dirty_seq = seq;
    }

    /// Reserve the first run of `npages` free pages; returns its address
    pub fn reserve(&mut self, npages: usize) -> Option<usize> {
        debug_assert!(self.alloc_allowed());
        if npages == 0 || npages > self.longest_free_range {
            return None;
        }
        let begin = self.active.first_fit_unset(npages)?;
        self.active.set_range(begin, npages);
        self.nactive += npages;

        let newly_touched = npages - count_set(&self.touched, begin, npages);
        self.touched.set_range(begin, npages);
        self.ntouched += newly_touched;

        self.longest_free_range = self.active.longest_unset_run();
        self.check_invariants();
        Some(self.addr + begin * PAGE)
    }

    /// Return `npages` pages starting at `addr`; they become dirty
    pub fn unreserve(&mut self, addr: usize, npages: usize) {
        assert!(self.contains(addr) && addr % PAGE == 0);
        let begin = (addr - self.addr) / PAGE;
        assert!(begin + npages <= HUGEPAGE_PAGES);
        assert_eq!(
            count_set(&self.active, begin, npages),
            npages,
            "freeing pages that are not in use"
        );
        self.active.unset_range(begin, npages);
        self.nactive -= npages;
        self.longest_free_range = self.active.longest_unset_run();
        if self.is_huge() {
            self.flags.insert(UnitFlags::DIRTIED_WHILE_HUGE);
        }
        self.check_invariants();
    }

    /// Snapshot the dirty ranges for a purge pass.
    ///
    /// Dirty runs separated only by retained pages are merged into one range,
    /// so the snapshot may cover a few already-reclaimed pages. Allocation
    /// from the unit must stay disabled until [`end_purge`](Self::end_purge).
    pub fn begin_purge(&mut self) -> PurgeState {
        assert!(!self.alloc_allowed(), "purging a unit open for allocation");
        let dirty = self.touched.and_not(&self.active);
        let mut to_purge = PageBitmap::new();
        let mut nranges = 0;
        let mut next = 0;
        while let Some(first_dirty) = dirty.find(next, HUGEPAGE_PAGES, true) {
            let next_active = self
                .active
                .find(first_dirty, HUGEPAGE_PAGES, true)
                .unwrap_or(HUGEPAGE_PAGES);
            let mut last_dirty = next_active - 1;
            while !dirty.get(last_dirty) {
                last_dirty -= 1;
            }
            to_purge.set_range(first_dirty, last_dirty - first_dirty + 1);
            nranges += 1;
            next = next_active;
        }
        PurgeState {
            addr: self.addr,
            to_purge,
            cursor: 0,
            ndirty: self.ndirty(),
            nranges,
            npurged: 0,
        }
    }

    /// Commit a purge pass: every page behind the cursor is now inactive.
    /// Returns the number of dirty pages reclaimed.
    pub fn end_purge(&mut self, state: PurgeState) -> usize {
        assert_eq!(state.addr, self.addr);
        assert!(!self.alloc_allowed(), "unit took allocations mid-purge");
        let mut purged = state.to_purge;
        if state.cursor < HUGEPAGE_PAGES {
            purged.unset_range(state.cursor, HUGEPAGE_PAGES - state.cursor);
        }
        debug_assert_eq!(purged.and_not(&self.active), purged, "purging pages in use");
        let before = self.ntouched;
        self.touched = self.touched.and_not(&purged);
        self.ntouched = self.touched.count();
        self.check_invariants();
        before - self.ntouched
    }

    /// Back the unit with a huge page: every page becomes resident
    pub fn hugify(&mut self) {
        self.flags.insert(UnitFlags::HUGE);
        self.flags.remove(UnitFlags::DIRTIED_WHILE_HUGE);
        self.touched = PageBitmap::full();
        self.ntouched = HUGEPAGE_PAGES;
        self.check_invariants();
    }

    /// Back the unit with base pages again
    pub fn dehugify(&mut self) {
        self.flags.remove(UnitFlags::HUGE | UnitFlags::DIRTIED_WHILE_HUGE);
    }

    fn check_invariants(&self) {
        debug_assert!(self.active.is_subset_of(&self.touched));
        debug_assert_eq!(self.active.count(), self.nactive);
        debug_assert_eq!(self.touched.count(), self.ntouched);
    }
}

fn count_set(bits: &PageBitmap, begin: usize, len: usize) -> usize {
    (begin..begin + len).filter(|&b| bits.get(b)).count()
}

// ============================================================================
// Purge state
// ============================================================================

/// Resumable cursor over one unit's purge snapshot.
///
/// Owns a copy of everything it needs, so ranges can be drained after the
/// shard lock has been released.
#[derive(Debug, Clone)]
pub struct PurgeState {
    addr: usize,
    to_purge: PageBitmap,
    cursor: usize,
    ndirty: usize,
    nranges: usize,
    npurged: usize,
}

impl PurgeState {
    /// Dirty pages the pass will reclaim
    pub fn ndirty(&self) -> usize {
        self.ndirty
    }

    /// Dirty bytes the pass will reclaim
    pub fn dirty_bytes(&self) -> usize {
        self.ndirty * PAGE
    }

    /// Ranges in the snapshot
    pub fn nranges(&self) -> usize {
        self.nranges
    }

    /// Pages emitted so far
    pub fn npurged(&self) -> usize {
        self.npurged
    }

    /// Whether every range has been emitted
    pub fn is_done(&self) -> bool {
        self.cursor >= HUGEPAGE_PAGES || self.to_purge.next_run(self.cursor, true).is_none()
    }

    /// Next range at or after the cursor; moves the cursor past it
    pub fn next_range(&mut self) -> Option<PurgeRange> {
        assert!(self.cursor <= HUGEPAGE_PAGES, "purge cursor past end of unit");
        let (begin, len) = self.to_purge.next_run(self.cursor, true)?;
        self.cursor = begin + len;
        self.npurged += len;
        Some(PurgeRange {
            addr: self.addr + begin * PAGE,
            len: len * PAGE,
        })
    }

    /// Emit the next range into `accum`. Returns whether more ranges remain.
    pub fn advance<H: HpaHooks>(&mut self, accum: &mut RangeAccumulator<'_, H>) -> bool {
        match self.next_range() {
            Some(range) => {
                log::trace!("purge range {:#x}+{:#x}", range.addr, range.len);
                accum.add(range.addr, range.len);
                !self.is_done()
            }
            None => false,
        }
    }
}
