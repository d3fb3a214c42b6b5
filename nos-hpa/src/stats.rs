//! Shard statistics

/// Shard-wide counters.
///
/// Event counters accumulate for the life of the shard; `nunits`, `nactive`
/// and `ndirty` are a snapshot taken under the shard lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    /// Deferred-work purge passes run
    pub npurge_passes: u64,
    /// Dirty pages purged
    pub npurges: u64,
    /// Hugify calls issued
    pub nhugifies: u64,
    /// Hugify calls that failed
    pub nhugify_failures: u64,
    /// Dehugify calls issued
    pub ndehugifies: u64,
    /// Vectorized purge calls issued
    pub nvectorized_purges: u64,
    /// Vectorized purge calls that fell back to serial purges
    pub nvectorized_failures: u64,
    /// Single-range purge calls issued
    pub nserial_purges: u64,
    /// Units mapped
    pub nunits: usize,
    /// Pages in use
    pub nactive: usize,
    /// Dirty pages
    pub ndirty: usize,
}

/// Snapshot of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitStats {
    /// Base address
    pub addr: usize,
    /// Pages in use
    pub nactive: usize,
    /// Dirty pages
    pub ndirty: usize,
    /// Reclaimed pages
    pub nretained: usize,
    /// Hugified
    pub huge: bool,
}
