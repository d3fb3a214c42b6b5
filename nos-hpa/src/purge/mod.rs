//! Purge batching
//!
//! This module contains the cross-unit batching used by the deferred-work
//! pass: the range accumulator that feeds the purge hooks, and the batch
//! that bounds how many units are held out of allocation at once.

pub mod accum;
pub mod batch;

pub use accum::{AccumStats, RangeAccumulator};
pub use batch::{PurgeBatch, PurgeItem};
