//! Fixed-size page bitmap
//!
//! One bit per base page of a huge page unit, with word-at-a-time run
//! search. Used for the active/touched page sets of a unit and for the
//! purge snapshot taken at the start of a purge pass.

use crate::config::HUGEPAGE_PAGES;

const WORD_BITS: usize = 64;
const NWORDS: usize = HUGEPAGE_PAGES / WORD_BITS;

/// One bit per page of a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageBitmap {
    words: [u64; NWORDS],
}

impl Default for PageBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageBitmap {
    /// Number of pages covered
    pub const NBITS: usize = HUGEPAGE_PAGES;

    /// Bitmap with every bit unset
    pub const fn new() -> Self {
        Self { words: [0; NWORDS] }
    }

    /// Bitmap with every bit set
    pub const fn full() -> Self {
        Self { words: [!0; NWORDS] }
    }

    /// Whether `bit` is set
    pub fn get(&self, bit: usize) -> bool {
        assert!(bit < Self::NBITS);
        self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    /// Set `len` bits starting at `begin`
    pub fn set_range(&mut self, begin: usize, len: usize) {
        self.apply_range(begin, len, |w, mask| *w |= mask);
    }

    /// Unset `len` bits starting at `begin`
    pub fn unset_range(&mut self, begin: usize, len: usize) {
        self.apply_range(begin, len, |w, mask| *w &= !mask);
    }

    fn apply_range(&mut self, begin: usize, len: usize, mut op: impl FnMut(&mut u64, u64)) {
        assert!(begin + len <= Self::NBITS);
        let end = begin + len;
        let mut bit = begin;
        while bit < end {
            let wi = bit / WORD_BITS;
            let off = bit % WORD_BITS;
            let n = (WORD_BITS - off).min(end - bit);
            let mask = if n == WORD_BITS { !0 } else { ((1u64 << n) - 1) << off };
            op(&mut self.words[wi], mask);
            bit += n;
        }
    }

    /// Whether every bit in the range is unset
    pub fn range_empty(&self, begin: usize, len: usize) -> bool {
        len == 0 || self.find(begin, begin + len, true).is_none()
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Whether no bit is set
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// `self & !other`
    pub fn and_not(&self, other: &PageBitmap) -> PageBitmap {
        let mut out = *self;
        for (w, o) in out.words.iter_mut().zip(other.words.iter()) {
            *w &= !o;
        }
        out
    }

    /// Whether every set bit of `self` is also set in `other`
    pub fn is_subset_of(&self, other: &PageBitmap) -> bool {
        self.words.iter().zip(other.words.iter()).all(|(s, o)| s & !o == 0)
    }

    /// First bit in `[min, max)` equal to `set`
    pub fn find(&self, min: usize, max: usize, set: bool) -> Option<usize> {
        assert!(min <= max && max <= Self::NBITS);
        if min == max {
            return None;
        }
        let word_start = min / WORD_BITS;
        let word_end = max.div_ceil(WORD_BITS);
        for wi in word_start..word_end {
            let mut w = if set { self.words[wi] } else { !self.words[wi] };
            if wi == word_start {
                w &= !0u64 << (min % WORD_BITS);
            }
            if w != 0 {
                let bit = wi * WORD_BITS + w.trailing_zeros() as usize;
                return if bit < max { Some(bit) } else { None };
            }
        }
        None
    }

    /// Next maximal run of bits equal to `set` starting at or after `start`,
    /// as `(begin, len)`
    pub fn next_run(&self, start: usize, set: bool) -> Option<(usize, usize)> {
        if start >= Self::NBITS {
            return None;
        }
        let begin = self.find(start, Self::NBITS, set)?;
        let end = self.find(begin, Self::NBITS, !set).unwrap_or(Self::NBITS);
        Some((begin, end - begin))
    }

    /// Start of the first run of at least `len` unset bits
    pub fn first_fit_unset(&self, len: usize) -> Option<usize> {
        let mut start = 0;
        while let Some((begin, run)) = self.next_run(start, false) {
            if run >= len {
                return Some(begin);
            }
            start = begin + run;
        }
        None
    }

    /// Length of the longest run of unset bits
    pub fn longest_unset_run(&self) -> usize {
        let mut start = 0;
        let mut longest = 0;
        while let Some((begin, run)) = self.next_run(start, false) {
            longest = longest.max(run);
            start = begin + run;
        }
        longest
    }
}
