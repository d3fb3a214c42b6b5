//! Shard configuration
//!
//! Page geometry, the fixed-point dirty ratio, and the immutable per-shard
//! options. Options can be built directly or parsed from the
//! `key:value,key:value` option string the allocator accepts at startup.

use static_assertions::const_assert;

use crate::error::{config_error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Base page size shift
pub const LG_PAGE: usize = 12;

/// Base page size
pub const PAGE: usize = 1 << LG_PAGE;

/// Huge page size shift
pub const LG_HUGEPAGE: usize = 21;

/// Huge page size (one unit)
pub const HUGEPAGE: usize = 1 << LG_HUGEPAGE;

/// Base pages per huge page
pub const HUGEPAGE_PAGES: usize = HUGEPAGE / PAGE;

/// Range capacity used when vectorized purging is disabled
pub const MIN_VECTOR_LEN: usize = 8;

/// Bound on operations for a non-forced (inline) deferred pass
pub const INLINE_MAX_OPS: usize = 16;

const_assert!(PAGE.is_power_of_two());
const_assert!(HUGEPAGE_PAGES % 64 == 0);
const_assert!(HUGEPAGE > PAGE);

/// Round `size` up to the base page size
pub const fn page_ceil(size: usize) -> usize {
    (size + PAGE - 1) & !(PAGE - 1)
}

/// Round `addr` down to the enclosing huge page
pub const fn hugepage_addr2base(addr: usize) -> usize {
    addr & !(HUGEPAGE - 1)
}

// ============================================================================
// Fixed-point fraction
// ============================================================================

/// 16.16 fixed-point fraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fxp(u32);

impl Fxp {
    /// One, as a fraction
    pub const ONE: Fxp = Fxp(1 << 16);

    /// Fraction from a whole percentage
    pub const fn from_percent(pct: u32) -> Self {
        Fxp((pct << 16) / 100)
    }

    /// Raw 16.16 bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// `x * self`, rounded down. `self` must not exceed one.
    pub fn mul_frac(self, x: usize) -> usize {
        debug_assert!(self <= Fxp::ONE);
        let x = x as u64;
        let frac = self.0 as u64;
        if x < (1u64 << 48) {
            ((x * frac) >> 16) as usize
        } else {
            ((x >> 16) * frac) as usize
        }
    }

    /// Parse `25%` or a decimal such as `0.25`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let pct: u32 = pct
                .trim()
                .parse()
                .map_err(|_| config_error("malformed percentage"))?;
            if pct > 100 {
                return Err(config_error("fraction above one"));
            }
            return Ok(Fxp::from_percent(pct));
        }

        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, f),
            None => (s, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(config_error("empty fraction"));
        }
        let int: u64 = if int_part.is_empty() {
            0
        } else {
            int_part
                .parse()
                .map_err(|_| config_error("malformed fraction"))?
        };
        if int > 1 {
            return Err(config_error("fraction above one"));
        }
        let mut frac_bits: u64 = 0;
        let mut scale: u64 = 1;
        for c in frac_part.chars().take(9) {
            let digit = c.to_digit(10).ok_or_else(|| config_error("malformed fraction"))?;
            frac_bits = frac_bits * 10 + digit as u64;
            scale *= 10;
        }
        let bits = (int << 16) + (frac_bits << 16) / scale;
        if bits > Fxp::ONE.0 as u64 {
            return Err(config_error("fraction above one"));
        }
        Ok(Fxp(bits as u32))
    }
}

// ============================================================================
// Shard options
// ============================================================================

/// Immutable per-shard policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardOpts {
    /// Largest single request this shard services, in bytes
    pub max_alloc_size: usize,
    /// Active bytes a unit needs before it may be hugified
    pub hugification_threshold: usize,
    /// Fraction of active pages allowed to stay dirty; `None` never purges
    pub dirty_ratio: Option<Fxp>,
    /// Leave purge/hugify work to explicit deferred-work calls
    pub deferral_allowed: bool,
    /// Dwell time before an eligible unit is hugified
    pub hugify_delay_ms: u64,
    /// Block on hugify, and demote huge units as soon as they get dirty
    pub hugify_sync: bool,
    /// Minimum spacing between purges; 0 disables rate limiting
    pub min_purge_interval_ms: u64,
    /// Units purged per deferred-work invocation; `None` is unbounded
    pub max_units_per_pass: Option<usize>,
    /// Ranges per vectorized purge call; 0 disables vectorized purging
    pub vectorized_batch_max: usize,
    /// Units held out of allocation by one purge batch
    pub max_units_per_batch: usize,
}

impl Default for ShardOpts {
    fn default() -> Self {
        Self {
            max_alloc_size: 64 * 1024,
            hugification_threshold: HUGEPAGE * 95 / 100,
            dirty_ratio: Some(Fxp::from_percent(25)),
            deferral_allowed: false,
            hugify_delay_ms: 10 * 1000,
            hugify_sync: false,
            min_purge_interval_ms: 5 * 1000,
            max_units_per_pass: None,
            vectorized_batch_max: 0,
            max_units_per_batch: 16,
        }
    }
}

impl ShardOpts {
    /// Ranges a batch may hold before it stops taking new units; also the
    /// accumulator capacity.
    pub fn range_watermark(&self) -> usize {
        if self.vectorized_batch_max == 0 {
            MIN_VECTOR_LEN
        } else {
            self.vectorized_batch_max
        }
    }

    /// Whether flushes try the vectorized hook first
    pub fn vectorized_enabled(&self) -> bool {
        self.vectorized_batch_max > 0
    }

    /// Check option consistency
    pub fn validate(&self) -> Result<()> {
        if self.max_alloc_size == 0 || self.max_alloc_size % PAGE != 0 {
            return Err(config_error("max_alloc_size must be a non-zero multiple of PAGE"));
        }
        if self.max_alloc_size > HUGEPAGE {
            return Err(config_error("max_alloc_size exceeds HUGEPAGE"));
        }
        if self.hugification_threshold > HUGEPAGE {
            return Err(config_error("hugification_threshold exceeds HUGEPAGE"));
        }
        if let Some(ratio) = self.dirty_ratio {
            if ratio > Fxp::ONE {
                return Err(config_error("dirty_ratio above one"));
            }
        }
        if self.max_units_per_batch == 0 {
            return Err(config_error("max_units_per_batch must be non-zero"));
        }
        if self.max_units_per_pass == Some(0) {
            return Err(config_error("max_units_per_pass must be non-zero"));
        }
        Ok(())
    }

    /// Parse an option string such as `hpa_dirty_mult:25%,hpa_hugify_sync:true`,
    /// starting from the defaults.
    pub fn parse(conf: &str) -> Result<Self> {
        let mut opts = ShardOpts::default();
        for pair in conf.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once(':')
                .ok_or_else(|| config_error("expected key:value"))?;
            opts.set(key.trim(), value.trim())?;
        }
        opts.validate()?;
        Ok(opts)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "hpa_slab_max_alloc" => self.max_alloc_size = parse_usize(value)?,
            "hpa_hugification_threshold" => self.hugification_threshold = parse_usize(value)?,
            "hpa_dirty_mult" => {
                self.dirty_ratio = if value == "-1" { None } else { Some(Fxp::parse(value)?) };
            }
            "deferral_allowed" => self.deferral_allowed = parse_bool(value)?,
            "hpa_hugify_delay_ms" => self.hugify_delay_ms = parse_u64(value)?,
            "hpa_hugify_sync" => self.hugify_sync = parse_bool(value)?,
            "hpa_min_purge_interval_ms" => self.min_purge_interval_ms = parse_u64(value)?,
            "experimental_hpa_max_purge_nhp" => {
                self.max_units_per_pass = if value == "-1" { None } else { Some(parse_usize(value)?) };
            }
            "process_madvise_max_batch" => self.vectorized_batch_max = parse_usize(value)?,
            "hpa_purge_max_batch" => self.max_units_per_batch = parse_usize(value)?,
            _ => return Err(config_error("unknown option")),
        }
        Ok(())
    }
}

fn parse_usize(value: &str) -> Result<usize> {
    value.parse().map_err(|_| config_error("malformed integer"))
}

fn parse_u64(value: &str) -> Result<u64> {
    value.parse().map_err(|_| config_error("malformed integer"))
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(config_error("malformed boolean")),
    }
}
