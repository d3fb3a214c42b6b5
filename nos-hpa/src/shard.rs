//! Huge page shard
//!
//! A [`Shard`] owns a set of [`HugePageUnit`]s behind one spin lock, serves
//! page-run allocations from them, and runs the deferred maintenance pass:
//! purge dirty pages down to the configured ratio, demote dirtied huge
//! units, and promote units that stayed full for long enough.
//!
//! # Lock discipline
//!
//! Unit bitmaps and shard counters only change with the lock held. The slow
//! hooks (purge, vectorized purge, hugify, dehugify, map) are always called
//! with the lock released. Before releasing it, every unit handed to a slow
//! hook is flagged as changing state, and a unit under purge is closed to
//! allocation, so the bookkeeping done after reacquiring the lock cannot
//! race with allocations on the same pages.

use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};

use crate::config::{hugepage_addr2base, ShardOpts, HUGEPAGE, INLINE_MAX_OPS, PAGE};
use crate::error::{invalid_argument, invalid_state, Result};
use crate::hooks::{HpaHooks, Nstime};
use crate::purge::{PurgeBatch, PurgeItem};
use crate::stats::{ShardStats, UnitStats};
use crate::unit::{HugePageUnit, UnitId};

/// Returned by [`Shard::time_until_deferred_work`] when nothing is pending
pub const DEFERRED_WORK_NONE: u64 = u64::MAX;

type Guard<'a> = MutexGuard<'a, ShardState>;

/// A run of pages handed out by [`Shard::alloc`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRun {
    /// Start address
    pub addr: usize,
    /// Size in bytes
    pub size: usize,
}

impl PageRun {
    /// Pages in the run
    pub fn npages(&self) -> usize {
        self.size / PAGE
    }
}

// ============================================================================
// Shard state (lock protected)
// ============================================================================

/// Everything guarded by the shard lock
#[derive(Debug, Default)]
struct ShardState {
    units: Vec<HugePageUnit>,
    by_addr: HashMap<usize, UnitId>,
    nactive: usize,
    ndirty: usize,
    npending_purge: usize,
    last_purge: Option<Nstime>,
    next_dirty_seq: u64,
    counters: ShardStats,
}

impl ShardState {
    fn insert_unit(&mut self, addr: usize) -> UnitId {
        let id = UnitId(self.units.len() as u32);
        self.units.push(HugePageUnit::new(addr, id.0 as u64));
        self.by_addr.insert(addr, id);
        id
    }

    fn unit(&self, id: UnitId) -> &HugePageUnit {
        &self.units[id.index()]
    }

    /// Mutate one unit, keeping the shard totals and the dirty ordering in
    /// step with it
    fn with_unit<R>(&mut self, id: UnitId, f: impl FnOnce(&mut HugePageUnit) -> R) -> R {
        let unit = &mut self.units[id.index()];
        let (active_before, dirty_before) = (unit.nactive(), unit.ndirty());
        let ret = f(unit);
        let (active_after, dirty_after) = (unit.nactive(), unit.ndirty());
        if dirty_before == 0 && dirty_after > 0 {
            self.next_dirty_seq += 1;
            unit.set_dirty_seq(self.next_dirty_seq);
        }
        self.nactive = self.nactive - active_before + active_after;
        self.ndirty = self.ndirty - dirty_before + dirty_after;
        ret
    }

    /// Best fit on the longest free run, oldest unit first among equals
    fn pick_alloc(&self, npages: usize) -> Option<UnitId> {
        self.units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.alloc_allowed() && u.longest_free_range() >= npages)
            .min_by_key(|(_, u)| (u.longest_free_range(), u.age()))
            .map(|(i, _)| UnitId(i as u32))
    }

    /// Oldest-dirty-first
    fn pick_purge(&self) -> Option<UnitId> {
        self.units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.purge_allowed())
            .min_by_key(|(_, u)| (u.dirty_seq(), u.age()))
            .map(|(i, _)| UnitId(i as u32))
    }

    /// Unit whose hugify dwell clock started first
    fn pick_hugify(&self, exclude: &[UnitId]) -> Option<UnitId> {
        self.units
            .iter()
            .enumerate()
            .filter(|(i, u)| u.hugify_allowed() && !exclude.contains(&UnitId(*i as u32)))
            .min_by_key(|(_, u)| (u.time_hugify_allowed(), u.age()))
            .map(|(i, _)| UnitId(i as u32))
    }

    fn check_counters(&self) {
        debug_assert_eq!(self.units.iter().map(|u| u.nactive()).sum::<usize>(), self.nactive);
        debug_assert_eq!(self.units.iter().map(|u| u.ndirty()).sum::<usize>(), self.ndirty);
    }
}

// ============================================================================
// Shard
// ============================================================================

/// Huge page shard
pub struct Shard<H: HpaHooks> {
    hooks: H,
    opts: ShardOpts,
    state: Mutex<ShardState>,
}

impl<H: HpaHooks> Shard<H> {
    /// Create an empty shard. No unit is mapped until the first allocation.
    pub fn new(hooks: H, opts: ShardOpts) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            hooks,
            opts,
            state: Mutex::new(ShardState::default()),
        })
    }

    /// Shard options
    pub fn opts(&self) -> &ShardOpts {
        &self.opts
    }

    /// Injected hooks
    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// Allocate a page-aligned run of `size` bytes
    pub fn alloc(&self, size: usize) -> Result<PageRun> {
        if size == 0 || size % PAGE != 0 {
            return Err(invalid_argument("size must be a non-zero multiple of PAGE"));
        }
        if size > self.opts.max_alloc_size {
            return Err(invalid_argument("size exceeds max_alloc_size"));
        }
        let npages = size / PAGE;

        let mut state = self.state.lock();
        let id = match state.pick_alloc(npages) {
            Some(id) => id,
            None => {
                drop(state);
                let (guard, id) = self.grow()?;
                state = guard;
                id
            }
        };
        let addr = state
            .with_unit(id, |u| u.reserve(npages))
            .ok_or_else(|| invalid_state("unit lost its free run"))?;
        self.update_eligibility(&mut state, id);
        state.check_counters();

        self.deferred_work(state, false);
        Ok(PageRun { addr, size })
    }

    /// Return a run obtained from [`alloc`](Self::alloc). Its pages become
    /// dirty.
    ///
    /// # Panics
    ///
    /// Panics if any page of the run is not currently allocated.
    pub fn dealloc(&self, run: PageRun) -> Result<()> {
        let base = hugepage_addr2base(run.addr);
        if run.size == 0 || run.size % PAGE != 0 || run.addr + run.size > base + HUGEPAGE {
            return Err(invalid_argument("run does not fit in one unit"));
        }

        let mut state = self.state.lock();
        let id = *state
            .by_addr
            .get(&base)
            .ok_or_else(|| invalid_argument("address not owned by this shard"))?;
        state.with_unit(id, |u| u.unreserve(run.addr, run.npages()));
        self.update_eligibility(&mut state, id);
        state.check_counters();

        self.deferred_work(state, false);
        Ok(())
    }

    /// Run purge and hugify maintenance now. Safe to call at any frequency.
    /// Returns whether more work remains.
    pub fn do_deferred_work(&self) -> bool {
        let state = self.state.lock();
        self.deferred_work(state, true)
    }

    /// Milliseconds until the next deferred pass has something to do: `0`
    /// when work is due now, [`DEFERRED_WORK_NONE`] when nothing is pending.
    pub fn time_until_deferred_work(&self) -> u64 {
        let state = self.state.lock();
        let mut time = DEFERRED_WORK_NONE;

        if let Some(id) = state.pick_hugify(&[]) {
            let since = self.hooks.ms_since(state.unit(id).time_hugify_allowed());
            if since < self.opts.hugify_delay_ms {
                time = self.opts.hugify_delay_ms - since;
            } else {
                return 0;
            }
        }

        if self.opts.hugify_sync && state.units.iter().any(|u| u.dirtied_while_huge()) {
            return 0;
        }

        if self.has_purge_work(&state) {
            let Some(last_purge) = state.last_purge else {
                return 0;
            };
            let since = self.hooks.ms_since(last_purge);
            if since < self.opts.min_purge_interval_ms {
                time = time.min(self.opts.min_purge_interval_ms - since);
            } else {
                return 0;
            }
        }
        time
    }

    /// Counters plus a snapshot of the shard totals
    pub fn stats(&self) -> ShardStats {
        let state = self.state.lock();
        ShardStats {
            nunits: state.units.len(),
            nactive: state.nactive,
            ndirty: state.ndirty,
            ..state.counters
        }
    }

    /// Per-unit snapshot, in mapping order
    pub fn unit_stats(&self) -> Vec<UnitStats> {
        let state = self.state.lock();
        state
            .units
            .iter()
            .map(|u| UnitStats {
                addr: u.addr(),
                nactive: u.nactive(),
                ndirty: u.ndirty(),
                nretained: u.nretained(),
                huge: u.is_huge(),
            })
            .collect()
    }

    /// Dirty-page target for the current active count, `None` when purging
    /// is disabled
    pub fn target_dirty(&self) -> Option<usize> {
        let state = self.state.lock();
        self.ndirty_max(&state)
    }

    /// Unmap every unit. Fails if any page is still allocated.
    pub fn destroy(self) -> Result<()> {
        let state = self.state.into_inner();
        if state.nactive != 0 {
            return Err(invalid_state("destroying a shard with live allocations"));
        }
        for unit in &state.units {
            debug_assert!(!unit.changing_state());
            self.hooks.unmap(unit.addr(), HUGEPAGE);
        }
        log::debug!("shard destroyed, {} units unmapped", state.units.len());
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Growth
    // ------------------------------------------------------------------------

    /// Map a fresh unit. Called without the lock; returns with it held.
    fn grow(&self) -> Result<(Guard<'_>, UnitId)> {
        let addr = self.hooks.map(HUGEPAGE).map_err(|err| {
            log::warn!("failed to map a new unit: {}", err);
            err
        })?;
        if addr % HUGEPAGE != 0 {
            self.hooks.unmap(addr, HUGEPAGE);
            return Err(invalid_state("mapper returned a misaligned unit"));
        }
        let mut state = self.state.lock();
        let id = state.insert_unit(addr);
        log::debug!("mapped unit {:?} at {:#x}", id, addr);
        Ok((state, id))
    }

    // ------------------------------------------------------------------------
    // Policy
    // ------------------------------------------------------------------------

    fn ndirty_max(&self, state: &ShardState) -> Option<usize> {
        dirty_target(&self.opts, state.nactive)
    }

    fn good_hugify_candidate(&self, unit: &HugePageUnit) -> bool {
        unit.nactive() * PAGE >= self.opts.hugification_threshold
    }

    /// Recompute whether a unit may be purged or hugified after a change
    fn update_eligibility(&self, state: &mut ShardState, id: UnitId) {
        let candidate = self.good_hugify_candidate(state.unit(id));
        let unit = &mut state.units[id.index()];
        if unit.changing_state() {
            unit.set_purge_allowed(false);
            unit.disallow_hugify();
            return;
        }
        unit.set_purge_allowed(unit.ndirty() > 0);
        if candidate && !unit.is_huge() {
            if !unit.hugify_allowed() {
                unit.allow_hugify(self.hooks.curtime(true));
            }
        } else {
            unit.disallow_hugify();
        }
    }

    /// Dirty pages not already claimed by an in-flight batch exceed the
    /// target
    fn should_purge(&self, state: &ShardState) -> bool {
        let Some(max) = self.ndirty_max(state) else {
            return false;
        };
        state.ndirty - state.npending_purge > max
    }

    fn has_purge_work(&self, state: &ShardState) -> bool {
        self.should_purge(state) && state.pick_purge().is_some()
    }

    fn min_purge_interval_passed(&self, state: &ShardState) -> bool {
        if self.opts.min_purge_interval_ms == 0 {
            return true;
        }
        match state.last_purge {
            Some(last) => self.hooks.ms_since(last) >= self.opts.min_purge_interval_ms,
            None => true,
        }
    }

    // ------------------------------------------------------------------------
    // Deferred work
    // ------------------------------------------------------------------------

    /// One maintenance pass. A forced pass is unbounded; an inline one runs
    /// only when deferral is disallowed, capped at a few operations.
    fn deferred_work<'a>(&'a self, mut state: Guard<'a>, forced: bool) -> bool {
        if !forced && self.opts.deferral_allowed {
            return self.has_purge_work(&state);
        }
        let max_ops = if forced { usize::MAX } else { INLINE_MAX_OPS };
        let mut nops = 0;

        if self.has_purge_work(&state) && self.min_purge_interval_passed(&state) {
            let max_units = max_ops.min(self.opts.max_units_per_pass.unwrap_or(usize::MAX));
            let (guard, npurged) = self.purge(state, max_units);
            state = guard;
            nops += npurged;
        }

        if self.opts.hugify_sync {
            state = self.dehugify_dirtied(state);
        }

        // Hugify at least once so promotion progresses even when purging
        // used up the operation budget.
        let mut attempted = Vec::new();
        loop {
            let (guard, hugified) = self.try_hugify(state, &mut attempted);
            state = guard;
            if !hugified {
                break;
            }
            nops += 1;
            if nops >= max_ops {
                break;
            }
        }

        state.check_counters();
        let hugify_capped = nops >= max_ops && state.pick_hugify(&attempted).is_some();
        self.has_purge_work(&state) || hugify_capped
    }

    /// Purge units in batches until the dirty target is met or `max_units`
    /// units have been purged. Returns the number of units purged.
    fn purge<'a>(&'a self, mut state: Guard<'a>, max_units: usize) -> (Guard<'a>, usize) {
        let watermark = self.opts.range_watermark();
        let mut batch = PurgeBatch::new(max_units, self.opts.max_units_per_batch, watermark);

        loop {
            batch.pass_start();
            while !batch.is_full() && self.should_purge(&state) {
                let Some(id) = state.pick_purge() else {
                    break;
                };
                let item = self.purge_start_unit(&mut state, id);
                state.npending_purge += item.state.ndirty();
                batch.push(item);
            }
            if batch.is_empty() {
                break;
            }

            let ndirty = batch.ndirty();
            log::trace!("purge batch: {} ranges, {} dirty pages", batch.nranges(), ndirty);
            drop(state);
            let accum_stats = batch.drain(&self.hooks, watermark, self.opts.vectorized_enabled());
            state = self.state.lock();

            state.npending_purge -= ndirty;
            state.last_purge = Some(self.hooks.curtime(false));
            let counters = &mut state.counters;
            counters.npurges += ndirty as u64;
            counters.nvectorized_purges += accum_stats.nvectorized;
            counters.nvectorized_failures += accum_stats.nvectorized_failures;
            counters.nserial_purges += accum_stats.nserial;
            for item in batch.take_items() {
                self.purge_finish_unit(&mut state, item);
            }
        }

        state.counters.npurge_passes += 1;
        log::debug!(
            "purge pass done: {} units, {} dirty pages left",
            batch.npurged_units_total(),
            state.ndirty
        );
        (state, batch.npurged_units_total())
    }

    fn purge_start_unit(&self, state: &mut ShardState, id: UnitId) -> PurgeItem {
        let unit = state.unit(id);
        debug_assert!(unit.purge_allowed() && !unit.changing_state());
        let addr = unit.addr();
        let dehugify = unit.is_huge();
        let purge_state = state.with_unit(id, |u| {
            u.set_mid_purge(true);
            u.set_purge_allowed(false);
            u.disallow_hugify();
            u.set_alloc_allowed(false);
            u.begin_purge()
        });
        PurgeItem {
            unit: id,
            addr,
            state: purge_state,
            dehugify,
        }
    }

    fn purge_finish_unit(&self, state: &mut ShardState, item: PurgeItem) {
        let id = item.unit;
        debug_assert!(state.unit(id).mid_purge() && !state.unit(id).alloc_allowed());
        if item.dehugify {
            state.counters.ndehugifies += 1;
        }
        state.with_unit(id, |u| {
            if item.dehugify {
                u.dehugify();
            }
            u.end_purge(item.state);
            u.set_mid_purge(false);
            u.set_alloc_allowed(true);
        });
        self.update_eligibility(state, id);
    }

    /// Demote every huge unit that gained dirty pages since promotion
    fn dehugify_dirtied<'a>(&'a self, mut state: Guard<'a>) -> Guard<'a> {
        let targets: Vec<(UnitId, usize)> = state
            .units
            .iter()
            .enumerate()
            .filter(|(_, u)| u.is_huge() && u.dirtied_while_huge() && !u.changing_state())
            .map(|(i, u)| (UnitId(i as u32), u.addr()))
            .collect();
        if targets.is_empty() {
            return state;
        }

        for &(id, _) in &targets {
            state.with_unit(id, |u| u.set_mid_hugify(true));
            self.update_eligibility(&mut state, id);
        }
        drop(state);
        for &(_, addr) in &targets {
            self.hooks.dehugify(addr, HUGEPAGE);
        }
        let mut state = self.state.lock();
        for &(id, _) in &targets {
            state.with_unit(id, |u| {
                u.dehugify();
                u.set_mid_hugify(false);
            });
            state.counters.ndehugifies += 1;
            self.update_eligibility(&mut state, id);
        }
        log::debug!("dehugified {} dirtied units", targets.len());
        state
    }

    /// Promote the longest-waiting candidate if its dwell time has passed.
    /// Returns whether a hugify call was made.
    fn try_hugify<'a>(&'a self, mut state: Guard<'a>, attempted: &mut Vec<UnitId>) -> (Guard<'a>, bool) {
        let Some(id) = state.pick_hugify(attempted) else {
            return (state, false);
        };
        let unit = state.unit(id);
        if self.hooks.ms_since(unit.time_hugify_allowed()) < self.opts.hugify_delay_ms {
            return (state, false);
        }
        let addr = unit.addr();
        attempted.push(id);
        state.with_unit(id, |u| {
            u.set_mid_hugify(true);
            u.set_purge_allowed(false);
            u.disallow_hugify();
        });

        drop(state);
        let result = self.hooks.hugify(addr, HUGEPAGE, self.opts.hugify_sync);
        let mut state = self.state.lock();

        state.counters.nhugifies += 1;
        match result {
            Ok(()) => {
                state.with_unit(id, |u| {
                    u.hugify();
                    u.set_mid_hugify(false);
                });
                log::debug!("hugified unit {:?} at {:#x}", id, addr);
            }
            Err(err) => {
                state.counters.nhugify_failures += 1;
                state.with_unit(id, |u| u.set_mid_hugify(false));
                log::warn!("hugify of unit at {:#x} failed: {}", addr, err);
            }
        }
        self.update_eligibility(&mut state, id);
        (state, true)
    }
}

/// Dirty pages a shard with `nactive` pages in use may keep
pub fn dirty_target(opts: &ShardOpts, nactive: usize) -> Option<usize> {
    opts.dirty_ratio.map(|ratio| ratio.mul_frac(nactive))
}
