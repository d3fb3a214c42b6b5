//! Shard integration tests
//!
//! Drives a [`Shard`] through its public API against recording hooks and
//! checks which platform calls it makes.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use mockall::mock;
use mockall::predicate::eq;
use proptest::prelude::*;

use nos_hpa::error::{hook_failed, not_supported, Result};
use nos_hpa::{
    Fxp, HpaHooks, Nstime, PageRun, PurgeRange, Shard, ShardOpts, DEFERRED_WORK_NONE, HUGEPAGE,
    HUGEPAGE_PAGES, PAGE,
};

// ============================================================================
// Recording hooks
// ============================================================================

#[derive(Default)]
struct TestHooks {
    next_addr: AtomicUsize,
    now_ms: AtomicU64,
    fail_vectorized: AtomicBool,
    fail_hugify: AtomicBool,
    nmap: AtomicUsize,
    nunmap: AtomicUsize,
    npurge: AtomicUsize,
    nvectorized: AtomicUsize,
    nhugify: AtomicUsize,
    ndehugify: AtomicUsize,
}

impl TestHooks {
    fn new() -> Self {
        let hooks = Self::default();
        hooks.next_addr.store(HUGEPAGE * 123, Ordering::Relaxed);
        hooks
    }

    fn set_time_ms(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::Relaxed);
    }

    fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}

impl HpaHooks for TestHooks {
    fn map(&self, size: usize) -> Result<usize> {
        self.nmap.fetch_add(1, Ordering::Relaxed);
        Ok(self.next_addr.fetch_add(size, Ordering::Relaxed))
    }

    fn unmap(&self, _addr: usize, _size: usize) {
        self.nunmap.fetch_add(1, Ordering::Relaxed);
    }

    fn purge(&self, _addr: usize, _size: usize) {
        self.npurge.fetch_add(1, Ordering::Relaxed);
    }

    fn vectorized_purge(&self, ranges: &[PurgeRange], total_bytes: usize) -> Result<()> {
        assert!(!ranges.is_empty());
        assert_eq!(ranges.iter().map(|r| r.len).sum::<usize>(), total_bytes);
        self.nvectorized.fetch_add(1, Ordering::Relaxed);
        if self.fail_vectorized.load(Ordering::Relaxed) {
            Err(not_supported("process_madvise"))
        } else {
            Ok(())
        }
    }

    fn hugify(&self, _addr: usize, size: usize, _sync: bool) -> Result<()> {
        assert_eq!(size, HUGEPAGE);
        self.nhugify.fetch_add(1, Ordering::Relaxed);
        if self.fail_hugify.load(Ordering::Relaxed) {
            Err(hook_failed("MADV_HUGEPAGE"))
        } else {
            Ok(())
        }
    }

    fn dehugify(&self, _addr: usize, _size: usize) {
        self.ndehugify.fetch_add(1, Ordering::Relaxed);
    }

    fn curtime(&self, _first_reading: bool) -> Nstime {
        Nstime::from_ms(self.now_ms.load(Ordering::Relaxed))
    }
}

fn test_opts() -> ShardOpts {
    ShardOpts {
        max_alloc_size: HUGEPAGE,
        hugification_threshold: HUGEPAGE,
        dirty_ratio: Some(Fxp::from_percent(25)),
        deferral_allowed: true,
        hugify_delay_ms: 10 * 1000,
        min_purge_interval_ms: 0,
        ..ShardOpts::default()
    }
}

fn sub_run(run: PageRun, first_page: usize, npages: usize) -> PageRun {
    PageRun {
        addr: run.addr + first_page * PAGE,
        size: npages * PAGE,
    }
}

// ============================================================================
// Purging
// ============================================================================

#[test]
fn test_vectorized_failure_falls_back_to_serial() {
    let opts = ShardOpts { vectorized_batch_max: 64, ..test_opts() };
    let shard = Shard::new(TestHooks::new(), opts).unwrap();
    shard.hooks().fail_vectorized.store(true, Ordering::Relaxed);

    let run = shard.alloc(PAGE).unwrap();
    shard.dealloc(run).unwrap();
    assert!(!shard.do_deferred_work());

    let hooks = shard.hooks();
    assert_eq!(TestHooks::count(&hooks.nvectorized), 1);
    assert_eq!(TestHooks::count(&hooks.npurge), 1);
    let stats = shard.stats();
    assert_eq!(stats.nvectorized_failures, 1);
    assert_eq!(stats.nserial_purges, 1);
    assert_eq!(stats.ndirty, 0);
}

#[test]
fn test_range_watermark_splits_batches() {
    let opts = ShardOpts { vectorized_batch_max: 2, ..test_opts() };
    let shard = Shard::new(TestHooks::new(), opts).unwrap();

    let runs: Vec<_> = (0..5).map(|_| shard.alloc(HUGEPAGE).unwrap()).collect();
    // Three ranges of 100 dirty pages in each of the first three units.
    for &run in &runs[..3] {
        for first in [0, 150, 300] {
            shard.dealloc(sub_run(run, first, 100)).unwrap();
        }
    }
    assert_eq!(shard.stats().ndirty, 900);
    assert_eq!(shard.target_dirty(), Some((3 * 212 + 2 * HUGEPAGE_PAGES) / 4));

    assert!(!shard.do_deferred_work());

    // Two units purged, each batch closed after one unit, two calls each.
    let hooks = shard.hooks();
    assert_eq!(TestHooks::count(&hooks.nvectorized), 4);
    assert_eq!(TestHooks::count(&hooks.npurge), 0);
    let stats = shard.stats();
    assert_eq!(stats.ndirty, 300);
    assert_eq!(stats.npurges, 600);
    assert_eq!(stats.npurge_passes, 1);

    let dirty: Vec<_> = shard.unit_stats().iter().map(|u| u.ndirty).collect();
    assert_eq!(dirty, [0, 0, 300, 0, 0]);
}

#[test]
fn test_units_per_batch_cap() {
    let opts = ShardOpts {
        vectorized_batch_max: 16,
        max_units_per_batch: 1,
        ..test_opts()
    };
    let shard = Shard::new(TestHooks::new(), opts).unwrap();
    let a = shard.alloc(HUGEPAGE).unwrap();
    let b = shard.alloc(HUGEPAGE).unwrap();
    shard.dealloc(a).unwrap();
    shard.dealloc(b).unwrap();

    assert!(!shard.do_deferred_work());
    assert_eq!(TestHooks::count(&shard.hooks().nvectorized), 2);
    assert_eq!(shard.stats().ndirty, 0);
}

#[test]
fn test_single_range_vectors_stop_at_target() {
    let opts = ShardOpts { vectorized_batch_max: 1, ..test_opts() };
    let shard = Shard::new(TestHooks::new(), opts).unwrap();
    let runs: Vec<_> = (0..7).map(|_| shard.alloc(HUGEPAGE).unwrap()).collect();
    for &run in &runs[..3] {
        shard.dealloc(run).unwrap();
    }
    assert_eq!(shard.target_dirty(), Some(HUGEPAGE_PAGES));

    assert!(!shard.do_deferred_work());
    assert_eq!(TestHooks::count(&shard.hooks().nvectorized), 2);
    assert_eq!(TestHooks::count(&shard.hooks().npurge), 0);
    assert_eq!(shard.stats().ndirty, HUGEPAGE_PAGES);
}

#[test]
fn test_units_share_one_batch() {
    let opts = ShardOpts { vectorized_batch_max: 16, ..test_opts() };
    let shard = Shard::new(TestHooks::new(), opts).unwrap();
    let a = shard.alloc(HUGEPAGE).unwrap();
    let b = shard.alloc(HUGEPAGE).unwrap();
    shard.dealloc(a).unwrap();
    shard.dealloc(b).unwrap();

    assert!(!shard.do_deferred_work());
    assert_eq!(TestHooks::count(&shard.hooks().nvectorized), 1);
}

#[test]
fn test_purged_pages_are_reused() {
    let shard = Shard::new(TestHooks::new(), test_opts()).unwrap();
    let run = shard.alloc(64 * PAGE).unwrap();
    shard.dealloc(run).unwrap();
    shard.do_deferred_work();

    let unit = shard.unit_stats()[0];
    assert_eq!(unit.ndirty, 0);
    assert_eq!(unit.nretained, HUGEPAGE_PAGES);

    let again = shard.alloc(64 * PAGE).unwrap();
    assert_eq!(again, run);
    assert_eq!(shard.stats().nunits, 1);
}

#[test]
fn test_below_target_skips_purge_with_hugify_pending() {
    let opts = ShardOpts { hugification_threshold: 300 * PAGE, ..test_opts() };
    let shard = Shard::new(TestHooks::new(), opts).unwrap();

    // Unit A qualifies for hugify with 212 pages still retained.
    let _a = shard.alloc(300 * PAGE).unwrap();
    let b = shard.alloc(HUGEPAGE).unwrap();
    let _c = shard.alloc(HUGEPAGE).unwrap();
    shard.dealloc(sub_run(b, 0, 220)).unwrap();

    assert_eq!(shard.stats().ndirty, 220);
    assert_eq!(shard.target_dirty(), Some((300 + 292 + HUGEPAGE_PAGES) / 4));
    assert_eq!(shard.time_until_deferred_work(), 10 * 1000);

    assert!(!shard.do_deferred_work());
    let hooks = shard.hooks();
    assert_eq!(TestHooks::count(&hooks.npurge), 0);
    assert_eq!(TestHooks::count(&hooks.nvectorized), 0);
    let stats = shard.stats();
    assert_eq!(stats.ndirty, 220);
    assert_eq!(stats.npurge_passes, 0);

    // Hugifying A makes its retained pages dirty; only then is purging due.
    hooks.set_time_ms(10 * 1000);
    assert!(shard.do_deferred_work());
    assert_eq!(TestHooks::count(&hooks.nhugify), 2);
    assert_eq!(TestHooks::count(&hooks.npurge), 0);
    assert_eq!(shard.stats().ndirty, 220 + 212);

    assert!(!shard.do_deferred_work());
    assert_eq!(TestHooks::count(&hooks.npurge), 1);
    let dirty: Vec<_> = shard.unit_stats().iter().map(|u| u.ndirty).collect();
    assert_eq!(dirty, [212, 0, 0]);
}

#[test]
fn test_no_dirty_pages_means_no_work() {
    let shard = Shard::new(TestHooks::new(), test_opts()).unwrap();
    let _run = shard.alloc(8 * PAGE).unwrap();
    assert_eq!(shard.time_until_deferred_work(), DEFERRED_WORK_NONE);
    assert!(!shard.do_deferred_work());
    let hooks = shard.hooks();
    assert_eq!(TestHooks::count(&hooks.npurge), 0);
    assert_eq!(TestHooks::count(&hooks.nvectorized), 0);
    assert_eq!(shard.stats().npurge_passes, 0);
}

// ============================================================================
// Hugify / dehugify
// ============================================================================

#[test]
fn test_hugify_waits_for_delay() {
    let shard = Shard::new(TestHooks::new(), test_opts()).unwrap();
    let _run = shard.alloc(HUGEPAGE).unwrap();

    shard.hooks().set_time_ms(4000);
    assert_eq!(shard.time_until_deferred_work(), 6000);
    shard.do_deferred_work();
    assert_eq!(TestHooks::count(&shard.hooks().nhugify), 0);

    shard.hooks().set_time_ms(10 * 1000);
    assert_eq!(shard.time_until_deferred_work(), 0);
    shard.do_deferred_work();
    assert_eq!(TestHooks::count(&shard.hooks().nhugify), 1);
    assert!(shard.unit_stats()[0].huge);
    assert_eq!(shard.stats().nhugifies, 1);
}

#[test]
fn test_hugify_failure_restarts_dwell_clock() {
    let shard = Shard::new(TestHooks::new(), test_opts()).unwrap();
    let _run = shard.alloc(HUGEPAGE).unwrap();
    shard.hooks().fail_hugify.store(true, Ordering::Relaxed);

    shard.hooks().set_time_ms(10 * 1000);
    shard.do_deferred_work();
    assert_eq!(TestHooks::count(&shard.hooks().nhugify), 1);
    assert!(!shard.unit_stats()[0].huge);
    assert_eq!(shard.stats().nhugify_failures, 1);
    assert_eq!(shard.time_until_deferred_work(), 10 * 1000);

    shard.hooks().fail_hugify.store(false, Ordering::Relaxed);
    shard.hooks().set_time_ms(20 * 1000);
    shard.do_deferred_work();
    assert_eq!(TestHooks::count(&shard.hooks().nhugify), 2);
    assert!(shard.unit_stats()[0].huge);
}

#[test]
fn test_purging_huge_unit_dehugifies_first() {
    let shard = Shard::new(TestHooks::new(), test_opts()).unwrap();
    let run = shard.alloc(HUGEPAGE).unwrap();
    shard.hooks().set_time_ms(10 * 1000);
    shard.do_deferred_work();
    assert!(shard.unit_stats()[0].huge);

    shard.dealloc(run).unwrap();
    assert!(!shard.do_deferred_work());

    let hooks = shard.hooks();
    assert_eq!(TestHooks::count(&hooks.ndehugify), 1);
    assert_eq!(TestHooks::count(&hooks.npurge), 1);
    let unit = shard.unit_stats()[0];
    assert!(!unit.huge);
    assert_eq!(unit.ndirty, 0);
    assert_eq!(shard.stats().ndehugifies, 1);
}

#[test]
fn test_sync_hugify_demotes_dirtied_units() {
    let opts = ShardOpts { hugify_sync: true, ..test_opts() };
    let shard = Shard::new(TestHooks::new(), opts).unwrap();
    let run = shard.alloc(HUGEPAGE).unwrap();
    shard.hooks().set_time_ms(10 * 1000);
    shard.do_deferred_work();
    assert!(shard.unit_stats()[0].huge);

    shard.dealloc(sub_run(run, 0, 1)).unwrap();
    assert_eq!(shard.time_until_deferred_work(), 0);
    assert!(!shard.do_deferred_work());

    assert_eq!(TestHooks::count(&shard.hooks().ndehugify), 1);
    assert_eq!(TestHooks::count(&shard.hooks().npurge), 0);
    assert!(!shard.unit_stats()[0].huge);
    assert_eq!(shard.time_until_deferred_work(), DEFERRED_WORK_NONE);
}

#[test]
fn test_async_hugify_keeps_dirtied_units_huge() {
    let shard = Shard::new(TestHooks::new(), test_opts()).unwrap();
    let run = shard.alloc(HUGEPAGE).unwrap();
    shard.hooks().set_time_ms(10 * 1000);
    shard.do_deferred_work();

    shard.dealloc(sub_run(run, 0, 1)).unwrap();
    shard.do_deferred_work();
    assert_eq!(TestHooks::count(&shard.hooks().ndehugify), 0);
    assert!(shard.unit_stats()[0].huge);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_shard_from_option_string() {
    let opts = ShardOpts::parse("hpa_slab_max_alloc:8192,deferral_allowed:true").unwrap();
    let shard = Shard::new(TestHooks::new(), opts).unwrap();
    assert!(shard.alloc(2 * PAGE).is_ok());
    assert!(shard.alloc(3 * PAGE).is_err());
}

#[test]
fn test_invalid_opts_rejected() {
    let opts = ShardOpts { max_units_per_batch: 0, ..test_opts() };
    assert!(Shard::new(TestHooks::new(), opts).is_err());
}

#[test]
fn test_destroy_with_live_pages_fails() {
    let hooks = TestHooks::new();
    let shard = Shard::new(&hooks, test_opts()).unwrap();
    let runs: Vec<_> = (0..3).map(|_| shard.alloc(HUGEPAGE).unwrap()).collect();
    for &run in &runs[..2] {
        shard.dealloc(run).unwrap();
    }
    assert_eq!(shard.stats().nunits, 3);
    assert_eq!(TestHooks::count(&hooks.nmap), 3);
    assert!(shard.destroy().is_err());
    assert_eq!(TestHooks::count(&hooks.nunmap), 0);
}

#[test]
fn test_destroy_after_free() {
    let hooks = TestHooks::new();
    let shard = Shard::new(&hooks, test_opts()).unwrap();
    let runs: Vec<_> = (0..3).map(|_| shard.alloc(HUGEPAGE).unwrap()).collect();
    for run in runs {
        shard.dealloc(run).unwrap();
    }
    assert!(shard.destroy().is_ok());
    assert_eq!(TestHooks::count(&hooks.nunmap), 3);
}

#[test]
#[should_panic(expected = "freeing pages that are not in use")]
fn test_double_free_panics() {
    let shard = Shard::new(TestHooks::new(), test_opts()).unwrap();
    let run = shard.alloc(4 * PAGE).unwrap();
    shard.dealloc(run).unwrap();
    let _ = shard.dealloc(run);
}

#[test]
fn test_concurrent_alloc_dealloc() {
    let shard = Arc::new(Shard::new(TestHooks::new(), test_opts()).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let shard = Arc::clone(&shard);
            thread::spawn(move || {
                for round in 0..50 {
                    let runs: Vec<_> = (1..=8)
                        .map(|n| shard.alloc(((n + t + round) % 16 + 1) * PAGE).unwrap())
                        .collect();
                    for run in runs {
                        shard.dealloc(run).unwrap();
                    }
                    if round % 5 == 0 {
                        shard.do_deferred_work();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(shard.stats().nactive, 0);
    assert!(!shard.do_deferred_work());
    assert_eq!(shard.stats().ndirty, 0);
    let shard = Arc::try_unwrap(shard).ok().unwrap();
    assert!(shard.destroy().is_ok());
}

// ============================================================================
// Call-count checks with mocked hooks
// ============================================================================

mock! {
    Hooks {}
    impl HpaHooks for Hooks {
        fn map(&self, size: usize) -> Result<usize>;
        fn unmap(&self, addr: usize, size: usize);
        fn purge(&self, addr: usize, size: usize);
        fn vectorized_purge(&self, ranges: &[PurgeRange], total_bytes: usize) -> Result<()>;
        fn hugify(&self, addr: usize, size: usize, sync: bool) -> Result<()>;
        fn dehugify(&self, addr: usize, size: usize);
        fn curtime(&self, first_reading: bool) -> Nstime;
    }
}

const MOCK_BASE: usize = HUGEPAGE * 123;

#[test]
fn test_mock_empty_shard_makes_no_calls() {
    let mut hooks = MockHooks::new();
    hooks.expect_map().never();
    hooks.expect_purge().never();
    hooks.expect_vectorized_purge().never();
    hooks.expect_hugify().never();
    hooks.expect_dehugify().never();
    hooks.expect_curtime().return_const(Nstime::ZERO);

    let shard = Shard::new(hooks, test_opts()).unwrap();
    assert!(!shard.do_deferred_work());
    assert_eq!(shard.time_until_deferred_work(), DEFERRED_WORK_NONE);
}

#[test]
fn test_mock_clean_unit_is_not_purged() {
    let mut hooks = MockHooks::new();
    hooks
        .expect_map()
        .with(eq(HUGEPAGE))
        .times(1)
        .returning(|_| Ok(MOCK_BASE));
    hooks.expect_purge().never();
    hooks.expect_vectorized_purge().never();
    hooks.expect_curtime().return_const(Nstime::ZERO);

    let shard = Shard::new(hooks, test_opts()).unwrap();
    let run = shard.alloc(16 * PAGE).unwrap();
    assert_eq!(run.addr, MOCK_BASE);
    assert!(!shard.do_deferred_work());
}

#[test]
fn test_mock_serial_fallback_per_range() {
    let mut hooks = MockHooks::new();
    hooks.expect_map().times(1).returning(|_| Ok(MOCK_BASE));
    hooks
        .expect_vectorized_purge()
        .withf(|ranges, total| ranges.len() == 3 && *total == 3 * PAGE)
        .times(1)
        .returning(|_, _| Err(not_supported("process_madvise")));
    for page in [0, 2, 4] {
        hooks
            .expect_purge()
            .with(eq(MOCK_BASE + page * PAGE), eq(PAGE))
            .times(1)
            .return_const(());
    }
    hooks.expect_curtime().return_const(Nstime::ZERO);

    let opts = ShardOpts {
        dirty_ratio: Some(Fxp::from_percent(0)),
        vectorized_batch_max: 8,
        ..test_opts()
    };
    let shard = Shard::new(hooks, opts).unwrap();
    let run = shard.alloc(8 * PAGE).unwrap();
    for page in [0, 2, 4] {
        shard.dealloc(sub_run(run, page, 1)).unwrap();
    }
    assert!(!shard.do_deferred_work());
    assert_eq!(shard.stats().ndirty, 0);
}

#[test]
fn test_mock_map_failure_propagates() {
    let mut hooks = MockHooks::new();
    hooks
        .expect_map()
        .times(1)
        .returning(|_| Err(nos_hpa::error::out_of_memory()));
    let shard = Shard::new(hooks, test_opts()).unwrap();
    assert_eq!(shard.alloc(PAGE), Err(nos_hpa::Error::OutOfMemory));
    assert_eq!(shard.stats().nunits, 0);
}

#[test]
fn test_mock_misaligned_map_is_unmapped() {
    let mut hooks = MockHooks::new();
    hooks.expect_map().times(1).returning(|_| Ok(MOCK_BASE + PAGE));
    hooks
        .expect_unmap()
        .with(eq(MOCK_BASE + PAGE), eq(HUGEPAGE))
        .times(1)
        .return_const(());
    let shard = Shard::new(hooks, test_opts()).unwrap();
    assert!(shard.alloc(PAGE).is_err());
}

// ============================================================================
// Counter invariants
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
    Work,
}

fn purge_calls(hooks: &TestHooks) -> usize {
    TestHooks::count(&hooks.npurge) + TestHooks::count(&hooks.nvectorized)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1usize..=32).prop_map(Op::Alloc),
        3 => any::<usize>().prop_map(Op::Free),
        1 => Just(Op::Work),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]
    #[test]
    fn prop_counters_match_units(ops in prop::collection::vec(op_strategy(), 1..120)) {
        let shard = Shard::new(TestHooks::new(), test_opts()).unwrap();
        let mut live: Vec<PageRun> = Vec::new();
        let mut live_pages = 0;

        for op in ops {
            match op {
                Op::Alloc(npages) => {
                    let run = shard.alloc(npages * PAGE).unwrap();
                    live_pages += npages;
                    live.push(run);
                }
                Op::Free(i) if !live.is_empty() => {
                    let run = live.swap_remove(i % live.len());
                    live_pages -= run.npages();
                    shard.dealloc(run).unwrap();
                }
                Op::Free(_) => {}
                Op::Work => {
                    let target = shard.target_dirty().unwrap();
                    let before = shard.stats();
                    let largest_unit_dirty =
                        shard.unit_stats().iter().map(|u| u.ndirty).max().unwrap_or(0);
                    let calls_before = purge_calls(shard.hooks());

                    shard.do_deferred_work();
                    let after = shard.stats();
                    prop_assert!(after.ndirty <= target);
                    if before.ndirty > target {
                        // Whole units are purged, so the last one may
                        // overshoot the target by at most its own dirty pages.
                        prop_assert!(after.ndirty + largest_unit_dirty > target);
                    } else {
                        prop_assert_eq!(after.ndirty, before.ndirty);
                        prop_assert_eq!(after.npurge_passes, before.npurge_passes);
                        prop_assert_eq!(purge_calls(shard.hooks()), calls_before);
                    }
                }
            }

            let stats = shard.stats();
            let units = shard.unit_stats();
            prop_assert_eq!(stats.nactive, live_pages);
            prop_assert_eq!(units.iter().map(|u| u.nactive).sum::<usize>(), stats.nactive);
            prop_assert_eq!(units.iter().map(|u| u.ndirty).sum::<usize>(), stats.ndirty);
            for unit in &units {
                prop_assert_eq!(unit.nactive + unit.ndirty + unit.nretained, HUGEPAGE_PAGES);
            }
        }
    }
}
