//! NOS HPA
//!
//! This crate provides the deferred-work engine of a huge-page backed page
//! allocator shard. A shard carves page runs out of huge-page sized units
//! and, between allocations, keeps its memory footprint in check:
//! it purges dirty pages back to the platform once they exceed a ratio of
//! the pages in use, promotes densely used units to huge pages after a
//! dwell time, and demotes huge units that get dirtied again.
//!
//! All platform effects go through [`HpaHooks`], so the engine runs the
//! same against real `madvise` calls and against test doubles.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

pub mod bitmap;
pub mod config;
pub mod error;
pub mod hooks;
pub mod purge;
pub mod shard;
pub mod stats;
pub mod unit;

// Re-export commonly used types
pub use config::{Fxp, ShardOpts, HUGEPAGE, HUGEPAGE_PAGES, PAGE};
pub use error::{Error, Result};
pub use hooks::{HpaHooks, Nstime, PurgeRange};
pub use purge::{PurgeBatch, RangeAccumulator};
pub use shard::{dirty_target, PageRun, Shard, DEFERRED_WORK_NONE};
pub use stats::{ShardStats, UnitStats};
pub use unit::{HugePageUnit, PurgeState, UnitFlags, UnitId};
