//! Purge batch
//!
//! A batch groups several units so their ranges share vectorized purge
//! calls. Every unit in a batch is closed to allocation until the batch is
//! finished, so a batch stops taking units once it holds enough ranges to
//! fill one vectorized call.

use alloc::vec::Vec;

use crate::config::HUGEPAGE;
use crate::hooks::HpaHooks;
use crate::purge::accum::{AccumStats, RangeAccumulator};
use crate::unit::{PurgeState, UnitId};

/// One unit checked out for purging
#[derive(Debug)]
pub struct PurgeItem {
    /// Unit being purged
    pub unit: UnitId,
    /// Unit base address
    pub addr: usize,
    /// Snapshot and cursor
    pub state: PurgeState,
    /// Demote the unit before purging it
    pub dehugify: bool,
}

/// Units and caps for one round of purging
#[derive(Debug)]
pub struct PurgeBatch {
    items: Vec<PurgeItem>,
    items_capacity: usize,
    nranges: usize,
    ndirty_in_batch: usize,
    max_units: usize,
    range_watermark: usize,
    npurged_units_total: usize,
}

impl PurgeBatch {
    /// Batch purging at most `max_units` units over all rounds, at most
    /// `items_capacity` per round, closing a round at `range_watermark` ranges
    pub fn new(max_units: usize, items_capacity: usize, range_watermark: usize) -> Self {
        assert!(max_units > 0 && items_capacity > 0 && range_watermark > 0);
        Self {
            items: Vec::with_capacity(items_capacity),
            items_capacity,
            nranges: 0,
            ndirty_in_batch: 0,
            max_units,
            range_watermark,
            npurged_units_total: 0,
        }
    }

    /// Reset per-round counters
    pub fn pass_start(&mut self) {
        debug_assert!(self.items.is_empty());
        self.nranges = 0;
        self.ndirty_in_batch = 0;
    }

    /// No unit in the current round
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the round must stop taking units. Ranges may overshoot the
    /// watermark: the unit that crosses it is still purged whole.
    pub fn is_full(&self) -> bool {
        self.npurged_units_total == self.max_units
            || self.items.len() == self.items_capacity
            || self.nranges >= self.range_watermark
    }

    /// Whether the pass-wide unit cap has been reached
    pub fn units_exhausted(&self) -> bool {
        self.npurged_units_total == self.max_units
    }

    /// Add a checked-out unit to the current round
    pub fn push(&mut self, item: PurgeItem) {
        debug_assert!(!self.is_full());
        self.nranges += item.state.nranges();
        self.ndirty_in_batch += item.state.ndirty();
        self.npurged_units_total += 1;
        self.items.push(item);
    }

    /// Ranges in this round
    pub fn nranges(&self) -> usize {
        self.nranges
    }

    /// Dirty pages in this round
    pub fn ndirty(&self) -> usize {
        self.ndirty_in_batch
    }

    /// Units purged across all rounds
    pub fn npurged_units_total(&self) -> usize {
        self.npurged_units_total
    }

    /// Demote flagged units, then drain every unit's ranges through one
    /// accumulator, in the order the units were added. Runs without the
    /// shard lock.
    pub fn drain<H: HpaHooks>(&mut self, hooks: &H, capacity: usize, vectorized: bool) -> AccumStats {
        for item in self.items.iter().filter(|item| item.dehugify) {
            hooks.dehugify(item.addr, HUGEPAGE);
        }

        let mut accum = RangeAccumulator::new(hooks, capacity, vectorized);
        for item in &mut self.items {
            while item.state.advance(&mut accum) {}
        }
        accum.finish();
        accum.stats()
    }

    /// Hand the drained items back for commit
    pub fn take_items(&mut self) -> alloc::vec::Drain<'_, PurgeItem> {
        self.items.drain(..)
    }
}
