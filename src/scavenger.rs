//! Returning the physical memory behind free pages to the OS.
//!
//! The scavenger walks the heap from the top down, remembering in
//! `scav_addr` where to resume. Scavenged pages keep their addresses; the
//! next allocation that picks them up is told how many bytes were scavenged.
//!
//! A background worker releases memory at a pace chosen at the end of every
//! collection cycle so that the heap's retained size approaches a goal
//! derived from the live heap. Heap growth also scavenges synchronously to
//! stay under the goal.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::globals::{CHUNK_PAGES, PAGE_SIZE};
use crate::heap::{HeapInner, PageHeap};
use crate::internal::addr_range::OffAddr;
use crate::mmap::SysMemory;
use crate::page_alloc::PageAlloc;
use crate::Config;

/// The address right below `addr`, so that the next search starts under it.
fn below(addr: OffAddr) -> OffAddr {
    OffAddr::from_linear(addr.linear().saturating_sub(1))
}

/// Chunks verified under one acquisition of the heap lock by the unlocked
/// scan before it lets the lock go.
const VERIFY_BATCH: usize = 16;

/// `max` bytes as a page count, rounded up.
fn max_pages(max: usize) -> usize {
    max / PAGE_SIZE + (max % PAGE_SIZE != 0) as usize
}

impl PageAlloc {
    /// Points the scavenge hint at the top of the heap. Called whenever the
    /// pacing changes.
    pub fn reset_scavenge_addr(&mut self) {
        let (_, end) = self.bounds();
        self.scav_epoch += 1;
        self.scav_addr = if end == 0 {
            OffAddr::MIN
        } else {
            below(OffAddr::chunk_base(end))
        };
    }

    fn lower_scav_addr(&mut self, addr: OffAddr) {
        if addr < self.scav_addr {
            self.scav_addr = addr;
        }
    }

    /// Releases the highest free and unscavenged run of chunk `ci` at or
    /// below the block of page `search_idx`, up to `max_pages` pages.
    /// Returns the bytes released, 0 if the chunk had nothing to give.
    pub(crate) fn scavenge_chunk(
        &mut self,
        ci: usize,
        search_idx: usize,
        max_pages: usize,
        sys: &dyn SysMemory,
    ) -> usize {
        match self.release_in_chunk(ci, search_idx, max_pages, sys) {
            Some((addr, bytes)) => {
                self.lower_scav_addr(below(addr));
                bytes
            }
            None => 0,
        }
    }

    /// `scavenge_chunk` without touching the hint. Returns the start and the
    /// size in bytes of the released run.
    fn release_in_chunk(
        &mut self,
        ci: usize,
        search_idx: usize,
        max_pages: usize,
        sys: &dyn SysMemory,
    ) -> Option<(OffAddr, usize)> {
        let (min, huge) = (self.min_scav_pages(), self.huge_pages());
        let (base, npages) = self
            .chunk(ci)?
            .find_scavenge_candidate(search_idx, min, max_pages, huge)?;
        self.chunk_mut(ci).scavenge_range(base, npages);
        let addr = OffAddr::chunk_base(ci).add(base * PAGE_SIZE);
        let bytes = npages * PAGE_SIZE;
        sys.unused(addr.addr(), bytes);
        log::trace!("scavenged {} pages at {:?}", npages, addr);
        Some((addr, bytes))
    }

    /// Releases at most one run of free and unscavenged pages, of at most
    /// `max` bytes unless that would split a huge page. Returns the bytes
    /// released; 0 means nothing is left below the hint.
    pub fn scavenge_one(&mut self, max: usize, sys: &dyn SysMemory) -> usize {
        if self.scav_addr == OffAddr::MIN {
            return 0;
        }
        let max_pages = max_pages(max);
        let top = self.scav_addr.chunk_index();
        let released = self.scavenge_chunk(top, self.scav_addr.chunk_page_index(), max_pages, sys);
        if released != 0 {
            return released;
        }
        let (start, end) = self.bounds();
        for ci in (start..top.min(end)).rev() {
            if self.summary.leaf(ci).max() == 0 {
                continue;
            }
            let released = self.scavenge_chunk(ci, CHUNK_PAGES - 1, max_pages, sys);
            if released != 0 {
                return released;
            }
            self.lower_scav_addr(below(OffAddr::chunk_base(ci)));
        }
        self.scav_addr = OffAddr::MIN;
        0
    }

    /// Releases at least `nbytes` bytes, unless the heap runs out of free
    /// and unscavenged pages first. Returns the bytes released.
    pub fn scavenge(&mut self, nbytes: usize, sys: &dyn SysMemory) -> usize {
        let mut released = 0;
        while released < nbytes {
            let r = self.scavenge_one(nbytes - released, sys);
            if r == 0 {
                break;
            }
            released += r;
        }
        released
    }
}

/// What the collector knows at the end of a cycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct GcPacing {
    /// Heap goal of the next cycle.
    pub next_gc: u64,
    /// Heap goal of the cycle that just ended.
    pub last_next_gc: u64,
    /// Bytes in use by the heap when the cycle ended.
    pub last_heap_inuse: u64,
}

/// Pacing of the background scavenger. Guarded by the heap lock.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ScavengePacing {
    pub retained_goal: u64,
    /// Retained bytes when the pacing was last set.
    pub retained_basis: u64,
    pub time_basis: Instant,
    pub bytes_per_ns: f64,
    /// Bumped every time the pacing changes.
    pub gen: u64,
    /// Last `gen` the background worker acted on.
    pub worker_gen: u64,
}

impl ScavengePacing {
    pub fn new() -> Self {
        Self {
            retained_goal: u64::MAX,
            retained_basis: 0,
            time_basis: Instant::now(),
            bytes_per_ns: 0.0,
            gen: 0,
            worker_gen: 0,
        }
    }

    pub fn has_update(&self) -> bool {
        self.gen != self.worker_gen
    }

    /// Picks a retained goal from the collector's numbers and a release
    /// rate that reaches it within the configured CPU budget.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        gc: &GcPacing,
        retained: u64,
        unscav_huge_pages: u64,
        phys_page_size: u64,
        phys_huge_page_size: u64,
        config: &Config,
        now: Instant,
    ) {
        let ratio = if gc.last_next_gc == 0 {
            1.0
        } else {
            gc.next_gc as f64 / gc.last_next_gc as f64
        };
        let mut goal = (gc.last_heap_inuse as f64 * ratio) as u64;
        goal += (goal as f64 * (config.retain_extra_percent / 100.0)) as u64;
        let page = phys_page_size.max(1);
        goal = (goal + page - 1) / page * page;

        if retained <= goal {
            self.retained_goal = goal;
            self.bytes_per_ns = 0.0;
            return;
        }

        let total_work = retained - goal;
        let share = config.scavenge_percent / 100.0;
        let page_period = config.scavenge_page_latency.as_nanos() as f64 / share;
        let huge_period = config.scavenge_huge_page_latency.as_nanos() as f64 / share;

        let mut regular_work = total_work;
        let mut huge_time = 0.0;
        if phys_huge_page_size != 0 {
            let mut huge_work = unscav_huge_pages * phys_huge_page_size;
            if huge_work >= total_work {
                huge_work = total_work / phys_huge_page_size * phys_huge_page_size;
            }
            regular_work = total_work - huge_work;
            huge_time = (huge_work / phys_huge_page_size) as f64 * huge_period;
        }
        let regular_time = (regular_work / page) as f64 * page_period;
        let total_time = (huge_time + regular_time).max(1.0);

        self.retained_goal = goal;
        self.retained_basis = retained;
        self.time_basis = now;
        self.bytes_per_ns = total_work as f64 / total_time;
        self.gen += 1;
    }

    /// Retained size the worker should be at by `now`. Never below the goal.
    pub fn want(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.time_basis).as_nanos() as f64;
        let progress = (self.bytes_per_ns * elapsed) as u64;
        self.retained_basis.saturating_sub(progress).max(self.retained_goal)
    }
}

impl PageHeap {
    /// Sets the scavenger's pace for the cycle that starts now and wakes the
    /// background worker. Called by the collector at the end of each cycle.
    pub fn pace_scavenger(&self, gc: GcPacing) {
        {
            let mut inner = self.inner.lock();
            let huge = inner.pages.unscav_huge_pages() as u64;
            let retained = self.retained() as u64;
            let phys = self.sys.phys_page_size() as u64;
            let huge_size = self.sys.phys_huge_page_size() as u64;
            inner
                .pacing
                .update(&gc, retained, huge, phys, huge_size, &self.config, Instant::now());
            inner.pages.reset_scavenge_addr();
            log::debug!(
                "scavenger paced: retained {} goal {} rate {:.3} B/ns",
                retained,
                inner.pacing.retained_goal,
                inner.pacing.bytes_per_ns
            );
        }
        self.signal.wake();
    }

    /// Releases at least `nbytes` of free memory to the OS if there is that
    /// much. Takes the heap lock only while a candidate is verified and
    /// released.
    pub fn scavenge(&self, nbytes: usize) -> usize {
        let mut released = 0;
        while released < nbytes {
            let r = self.scavenge_one(nbytes - released);
            if r == 0 {
                break;
            }
            released += r;
        }
        released
    }

    /// Releases every free page. The hint restarts from the top of the heap.
    pub fn scavenge_all(&self) -> usize {
        self.inner.lock().pages.reset_scavenge_addr();
        self.scavenge(usize::MAX)
    }

    fn scavenge_one(&self, max: usize) -> usize {
        let max = max_pages(max);
        match self.scavenge_at_hint(max) {
            Ok(released) => released,
            Err(scan) => self.scavenge_below(scan, max),
        }
    }

    /// Tries the chunk under the hint. If it has nothing, returns where the
    /// unlocked scan picks up.
    fn scavenge_at_hint(&self, max_pages: usize) -> Result<usize, Scan> {
        let mut inner = self.inner.lock();
        let pages = &mut inner.pages;
        if pages.scav_addr == OffAddr::MIN {
            return Ok(0);
        }
        let top = pages.scav_addr.chunk_index();
        let idx = pages.scav_addr.chunk_page_index();
        let released = pages.scavenge_chunk(top, idx, max_pages, &*self.sys);
        if released != 0 {
            self.stats.heap_released.fetch_add(released, Ordering::Relaxed);
            return Ok(released);
        }
        let (start, end) = pages.bounds();
        Err(Scan {
            start,
            top: top.min(end),
            epoch: pages.scav_epoch,
        })
    }

    /// Walks the leaf summaries below `scan.top` without the lock. Whatever
    /// they promise is checked again under it. The hint is only moved if it
    /// was not reset in the meantime.
    fn scavenge_below(&self, scan: Scan, max_pages: usize) -> usize {
        let sys = &*self.sys;
        let mut ci = scan.top;
        'scan: while ci > scan.start {
            ci -= 1;
            if self.summary.leaf(ci).max() == 0 {
                continue;
            }
            let mut inner = self.inner.lock();
            let pages = &mut inner.pages;
            let current = pages.scav_epoch == scan.epoch;
            let mut verified = 0;
            loop {
                if let Some((addr, bytes)) = pages.release_in_chunk(ci, CHUNK_PAGES - 1, max_pages, sys) {
                    if current {
                        pages.lower_scav_addr(below(addr));
                    }
                    self.stats.heap_released.fetch_add(bytes, Ordering::Relaxed);
                    return bytes;
                }
                if current {
                    pages.lower_scav_addr(below(OffAddr::chunk_base(ci)));
                }
                verified += 1;
                // Free chunks that were already released fail with a bitmap
                // read. Check a few of them per lock acquisition.
                loop {
                    if verified == VERIFY_BATCH || ci == scan.start {
                        continue 'scan;
                    }
                    ci -= 1;
                    if self.summary.leaf(ci).max() != 0 {
                        break;
                    }
                }
            }
        }
        let mut inner = self.inner.lock();
        if inner.pages.scav_epoch == scan.epoch {
            inner.pages.scav_addr = OffAddr::MIN;
        }
        0
    }

    /// `scavenge` for callers already holding the heap lock.
    pub(crate) fn scavenge_locked(&self, inner: &mut HeapInner, nbytes: usize) -> usize {
        let released = inner.pages.scavenge(nbytes, &*self.sys);
        self.stats.heap_released.fetch_add(released, Ordering::Relaxed);
        released
    }

    /// One round of background work.
    fn background_unit(&self) -> Unit {
        let mut inner = self.inner.lock();
        inner.pacing.worker_gen = inner.pacing.gen;
        let retained = self.retained() as u64;
        let pacing = inner.pacing;
        if pacing.bytes_per_ns == 0.0 || retained <= pacing.retained_goal {
            return Unit::Park;
        }
        let want = pacing.want(Instant::now());
        let mut released = 0;
        if retained > want {
            released = self.scavenge_locked(&mut inner, (retained - want) as usize) as u64;
        }
        drop(inner);

        let owed = retained.saturating_sub(want);
        let ttnext = if released > owed {
            Duration::from_nanos(((released - owed) as f64 / pacing.bytes_per_ns) as u64)
        } else {
            Duration::ZERO
        };
        Unit::Worked { released, ttnext }
    }
}

/// Where the unlocked part of a scavenge resumes.
#[derive(Clone, Copy, Debug)]
struct Scan {
    start: usize,
    top: usize,
    /// `PageAlloc::scav_epoch` when the scan started.
    epoch: u64,
}

enum Unit {
    Park,
    Worked { released: u64, ttnext: Duration },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScavengerState {
    /// Waiting for a pacing update.
    Parked,
    Running,
    Sleeping(Duration),
    Stopped,
}

struct SignalState {
    state: ScavengerState,
    /// A wake-up that has not been consumed yet.
    pending: bool,
    shutdown: bool,
}

/// Where the background worker parks and sleeps.
pub(crate) struct ScavengerSignal {
    lock: Mutex<SignalState>,
    cv: Condvar,
}

impl ScavengerSignal {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(SignalState {
                state: ScavengerState::Stopped,
                pending: false,
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Cuts a park or a sleep short. A wake-up sent while the worker runs is
    /// kept for its next park or sleep.
    pub fn wake(&self) {
        let mut s = self.lock.lock();
        s.pending = true;
        self.cv.notify_all();
    }

    fn state(&self) -> ScavengerState {
        self.lock.lock().state
    }

    fn set_state(&self, state: ScavengerState) {
        self.lock.lock().state = state;
    }

    fn is_shutdown(&self) -> bool {
        self.lock.lock().shutdown
    }

    fn shutdown(&self) {
        let mut s = self.lock.lock();
        s.shutdown = true;
        self.cv.notify_all();
    }

    fn park(&self) {
        let mut s = self.lock.lock();
        s.state = ScavengerState::Parked;
        while !s.pending && !s.shutdown {
            self.cv.wait(&mut s);
        }
        s.pending = false;
        s.state = ScavengerState::Running;
    }

    /// Sleeps for `d` unless woken or a pacing update is pending. Returns
    /// true if the whole sleep happened.
    fn sleep(&self, heap: &PageHeap, d: Duration) -> bool {
        let mut s = self.lock.lock();
        if s.pending || heap.inner.lock().pacing.has_update() {
            s.pending = false;
            return false;
        }
        let start = Instant::now();
        let deadline = start + d;
        s.state = ScavengerState::Sleeping(d);
        while !s.pending && !s.shutdown {
            if self.cv.wait_until(&mut s, deadline).timed_out() {
                break;
            }
        }
        s.pending = false;
        s.state = ScavengerState::Running;
        start.elapsed() >= d
    }
}

/// Handle to the background scavenger thread of a heap. Dropping it stops
/// the thread.
pub struct BackgroundScavenger {
    heap: Arc<PageHeap>,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundScavenger {
    /// Starts the worker. It parks until the first pacing update.
    pub fn start(heap: Arc<PageHeap>) -> std::io::Result<Self> {
        {
            let mut s = heap.signal.lock.lock();
            s.shutdown = false;
            s.state = ScavengerState::Parked;
        }
        let worker = heap.clone();
        let thread = thread::Builder::new()
            .name("scavenger".to_string())
            .spawn(move || run(worker))?;
        Ok(Self {
            heap,
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> ScavengerState {
        self.heap.signal.state()
    }

    pub fn heap(&self) -> &Arc<PageHeap> {
        &self.heap
    }

    /// Stops the worker and waits for it to exit.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.heap.signal.shutdown();
            if thread.join().is_err() {
                log::error!("scavenger thread panicked");
            }
            self.heap.signal.set_state(ScavengerState::Stopped);
        }
    }
}

impl Drop for BackgroundScavenger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(heap: Arc<PageHeap>) {
    let signal = &heap.signal;
    let verbose = heap.config.verbose;
    let min_sleep = heap.config.scavenger_min_sleep;
    let mut retry = min_sleep;

    signal.park();
    while !signal.is_shutdown() {
        let (released, ttnext) = match heap.background_unit() {
            Unit::Park => {
                signal.park();
                continue;
            }
            Unit::Worked { released, ttnext } => (released, ttnext),
        };

        if verbose {
            let stats = heap.statistics();
            logln_if!(released > 0, "scvg: {} MB released", released >> 20);
            logln_if!(
                true,
                "scvg: inuse: {}, idle: {}, sys: {}, released: {}, consumed: {} (MB)",
                stats.heap_inuse >> 20,
                stats.heap_idle >> 20,
                stats.heap_sys >> 20,
                stats.heap_released >> 20,
                stats.retained >> 20
            );
        }

        if released == 0 {
            // Nothing to release right now. Back off.
            if signal.sleep(&heap, retry) {
                retry = retry.checked_mul(2).unwrap_or(retry);
            }
            continue;
        }
        retry = min_sleep;

        if ttnext > min_sleep {
            signal.sleep(&heap, ttnext);
            continue;
        }
        thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::BitRange;
    use crate::globals::CHUNK_BYTES;
    use crate::mmap::NoopMemory;
    use std::collections::BTreeMap;

    const BASE: usize = 0xc000 << 22;

    fn base_chunk() -> usize {
        OffAddr::new(BASE).chunk_index()
    }

    fn page(ci: usize, i: usize) -> usize {
        OffAddr::chunk_base(ci).add(i * PAGE_SIZE).addr()
    }

    #[test]
    fn test_reset_scavenge_addr() {
        let mut pages = PageAlloc::new(4096, 0);
        pages.reset_scavenge_addr();
        assert_eq!(pages.scav_addr(), OffAddr::MIN);
        pages.grow(BASE, 2 * CHUNK_BYTES);
        pages.reset_scavenge_addr();
        assert_eq!(pages.scav_addr(), OffAddr::new(BASE + 2 * CHUNK_BYTES - 1));
    }

    #[test]
    fn test_scavenge_one_top_down() {
        let ci = base_chunk();
        // Two chunks, everything used except two runs, nothing scavenged.
        let alloc = BTreeMap::from([
            (ci, vec![BitRange::new(0, 100), BitRange::new(110, 402)]),
            (ci + 1, vec![BitRange::new(0, 500)]),
        ]);
        let mut pages = PageAlloc::from_bit_ranges(&alloc, &BTreeMap::new());
        let sys = NoopMemory::new();

        assert_eq!(pages.scavenge_one(usize::MAX, &sys), 12 * PAGE_SIZE);
        assert_eq!(sys.unused_calls(), vec![(page(ci + 1, 500), 12 * PAGE_SIZE)]);
        assert_eq!(pages.scav_addr(), OffAddr::new(page(ci + 1, 500) - 1));

        // Truncated to what was asked for, from the top of the run.
        assert_eq!(pages.scavenge_one(3 * PAGE_SIZE, &sys), 3 * PAGE_SIZE);
        assert_eq!(sys.unused_calls()[1], (page(ci, 107), 3 * PAGE_SIZE));
        assert_eq!(pages.scavenge_one(usize::MAX, &sys), 7 * PAGE_SIZE);
        assert_eq!(pages.scavenge_one(usize::MAX, &sys), 0);
        assert_eq!(pages.scav_addr(), OffAddr::MIN);
        assert_eq!(sys.released_bytes(), 22 * PAGE_SIZE);
        pages.verify_summaries().unwrap();
    }

    #[test]
    fn test_scavenge_skips_full_chunks() {
        let ci = base_chunk();
        let alloc = BTreeMap::from([
            (ci, vec![BitRange::new(0, 1)]),
            (ci + 1, vec![BitRange::new(0, CHUNK_PAGES)]),
            (ci + 2, vec![BitRange::new(0, CHUNK_PAGES)]),
        ]);
        let mut pages = PageAlloc::from_bit_ranges(&alloc, &BTreeMap::new());
        let sys = NoopMemory::new();
        assert_eq!(pages.scavenge(PAGE_SIZE, &sys), PAGE_SIZE);
        assert_eq!(sys.unused_calls(), vec![(page(ci, CHUNK_PAGES - 1), PAGE_SIZE)]);
        assert_eq!(pages.scavenge(usize::MAX, &sys), (CHUNK_PAGES - 2) * PAGE_SIZE);
        assert_eq!(sys.unused_calls()[1], (page(ci, 1), (CHUNK_PAGES - 2) * PAGE_SIZE));
    }

    #[test]
    fn test_scavenge_conservation() {
        let ci = base_chunk();
        let alloc = BTreeMap::from([
            (ci, vec![BitRange::new(3, 10), BitRange::new(200, 1)]),
            (ci + 1, vec![BitRange::new(0, 64), BitRange::new(300, 212)]),
            (ci + 3, vec![BitRange::new(128, 128)]),
        ]);
        let scav = BTreeMap::from([(ci, vec![BitRange::new(20, 30)]), (ci + 3, vec![BitRange::new(0, 64)])]);
        let mut pages = PageAlloc::from_bit_ranges(&alloc, &scav);
        let expected = pages.free_unscavenged_pages() * PAGE_SIZE;
        let sys = NoopMemory::new();
        // Ask in small bites so that the hint is exercised.
        let mut total = 0;
        loop {
            let r = pages.scavenge(5 * PAGE_SIZE, &sys);
            if r == 0 {
                break;
            }
            total += r;
        }
        assert_eq!(total, expected);
        assert_eq!(sys.released_bytes(), expected);
        assert_eq!(pages.free_unscavenged_pages(), 0);
        pages.verify_summaries().unwrap();
    }

    /// A heap of four chunks whose pages are all free and released.
    fn released_heap(sys: Arc<NoopMemory>) -> (Arc<PageHeap>, usize) {
        let config = Config {
            arena_size: 4 * CHUNK_BYTES,
            ..Config::default()
        };
        let heap = PageHeap::new(config, sys).unwrap();
        let base = heap.alloc_pages(4 * CHUNK_PAGES);
        heap.free_pages(base, 4 * CHUNK_PAGES);
        assert_eq!(heap.scavenge_all(), 4 * CHUNK_BYTES);
        (heap, base)
    }

    #[test]
    fn test_reset_during_unlocked_scan_is_kept() {
        let (heap, _) = released_heap(Arc::new(NoopMemory::new()));
        heap.with_pages(|pages| pages.reset_scavenge_addr());
        let scan = heap.scavenge_at_hint(1).unwrap_err();

        // Pacing resets the hint while the leaves are being read.
        let reset = heap.with_pages(|pages| {
            pages.reset_scavenge_addr();
            pages.scav_addr()
        });
        assert_ne!(reset, OffAddr::MIN);
        assert_eq!(heap.scavenge_below(scan, 1), 0);
        assert_eq!(heap.with_pages(|pages| pages.scav_addr()), reset);

        // With no reset in between, the failed scan exhausts the hint.
        let scan = heap.scavenge_at_hint(1).unwrap_err();
        assert_eq!(heap.scavenge_below(scan, 1), 0);
        assert_eq!(heap.with_pages(|pages| pages.scav_addr()), OffAddr::MIN);
    }

    #[test]
    fn test_unlocked_scan_passes_released_chunks() {
        let sys = Arc::new(NoopMemory::new());
        let (heap, base) = released_heap(sys.clone());
        // One unscavenged free page at the very bottom of the heap.
        assert_eq!(heap.alloc_pages(1), base);
        heap.free_pages(base, 1);
        heap.with_pages(|pages| pages.reset_scavenge_addr());

        let calls = sys.unused_calls().len();
        assert_eq!(heap.scavenge(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(sys.unused_calls()[calls..], [(base, PAGE_SIZE)]);
        assert!(heap.with_pages(|pages| pages.scav_addr()) < OffAddr::new(base));
        assert_eq!(heap.scavenge(PAGE_SIZE), 0);
        heap.with_pages(|pages| pages.verify_summaries()).unwrap();
    }

    #[test]
    fn test_scavenge_physical_pages() {
        // 32 KiB physical pages are 4 logical pages.
        let ci = base_chunk();
        let alloc = BTreeMap::from([(ci, vec![BitRange::new(0, 5), BitRange::new(15, 497)])]);
        let mut pages = PageAlloc::from_bit_ranges_with(&alloc, &BTreeMap::new(), 32 << 10, 0);
        let sys = NoopMemory::new();
        // Free pages are [5, 15); only [8, 12) is a whole physical page.
        assert_eq!(pages.scavenge(usize::MAX, &sys), 4 * PAGE_SIZE);
        assert_eq!(sys.unused_calls(), vec![(page(ci, 8), 4 * PAGE_SIZE)]);
    }

    #[test]
    fn test_scavenge_keeps_huge_pages_whole() {
        let ci = base_chunk();
        // 2 MiB huge pages are 256 logical pages. The whole chunk is free.
        let alloc = BTreeMap::from([(ci, vec![])]);
        let mut pages = PageAlloc::from_bit_ranges_with(&alloc, &BTreeMap::new(), 4096, 2 << 20);
        assert_eq!(pages.unscav_huge_pages(), 2);
        let sys = NoopMemory::new();
        assert_eq!(pages.scavenge_one(PAGE_SIZE, &sys), 256 * PAGE_SIZE);
        assert_eq!(sys.unused_calls(), vec![(page(ci, 256), 256 * PAGE_SIZE)]);
        assert_eq!(pages.unscav_huge_pages(), 1);
    }

    fn pacing_config() -> Config {
        Config {
            retain_extra_percent: 10.0,
            scavenge_percent: 1.0,
            scavenge_page_latency: Duration::from_micros(10),
            scavenge_huge_page_latency: Duration::from_micros(10),
            ..Config::default()
        }
    }

    #[test]
    fn test_pacing_below_goal() {
        let mut pacing = ScavengePacing::new();
        let gc = GcPacing {
            next_gc: 200 << 20,
            last_next_gc: 100 << 20,
            last_heap_inuse: 50 << 20,
        };
        // Goal is 50M * 2 * 1.1 = 110M.
        pacing.update(&gc, 100 << 20, 0, 4096, 0, &pacing_config(), Instant::now());
        assert_eq!(pacing.retained_goal, 110 << 20);
        assert_eq!(pacing.bytes_per_ns, 0.0);
        assert!(!pacing.has_update());
    }

    #[test]
    fn test_pacing_rate() {
        let mut pacing = ScavengePacing::new();
        let gc = GcPacing {
            next_gc: 100 << 20,
            last_next_gc: 100 << 20,
            last_heap_inuse: 10 << 20,
        };
        let now = Instant::now();
        let goal = 11u64 << 20;
        let retained = goal + 1000 * 4096;
        pacing.update(&gc, retained, 0, 4096, 0, &pacing_config(), now);
        assert_eq!(pacing.retained_goal, goal);
        assert!(pacing.has_update());
        // 1000 pages at 1ms each.
        let expected = (1000.0 * 4096.0) / 1e9;
        assert!((pacing.bytes_per_ns - expected).abs() < 1e-12);

        assert_eq!(pacing.want(now), retained);
        let want = pacing.want(now + Duration::from_millis(500));
        assert!(want.abs_diff(retained - 500 * 4096) <= 1);
        // The line stops at the goal.
        assert_eq!(pacing.want(now + Duration::from_secs(10)), goal);
    }

    #[test]
    fn test_pacing_huge_pages() {
        let mut pacing = ScavengePacing::new();
        let gc = GcPacing {
            next_gc: 1,
            last_next_gc: 1,
            last_heap_inuse: 0,
        };
        let huge = 2u64 << 20;
        // 3 free huge pages but only 2.5 huge pages worth of work.
        let retained = 2 * huge + huge / 2;
        pacing.update(&gc, retained, 3, 4096, huge, &pacing_config(), Instant::now());
        // Two huge pages at 1ms each and 256 regular pages at 1ms each.
        let time = (2.0 + 256.0) * 1e6;
        assert!((pacing.bytes_per_ns - retained as f64 / time).abs() < 1e-12);
    }

    fn wait_for(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        f()
    }

    #[test]
    fn test_pacing_update_cuts_sleep_short() {
        let config = Config {
            arena_size: 4 * CHUNK_BYTES,
            // About 4 bytes per 10ms: one released page buys a long sleep.
            scavenge_percent: 0.0001,
            ..Config::default()
        };
        let heap = PageHeap::new(config, Arc::new(NoopMemory::new())).unwrap();
        let base = heap.alloc_pages(4 * CHUNK_PAGES);
        heap.free_pages(base, 4 * CHUNK_PAGES);

        let mut worker = BackgroundScavenger::start(heap.clone()).unwrap();
        heap.pace_scavenger(GcPacing {
            next_gc: 1,
            last_next_gc: 1,
            last_heap_inuse: 8 << 20,
        });
        let long = Duration::from_secs(2);
        assert!(wait_for(Duration::from_secs(10), || matches!(
            worker.state(),
            ScavengerState::Sleeping(d) if d >= long
        )));

        let woken = Instant::now();
        heap.pace_scavenger(GcPacing {
            next_gc: 1,
            last_next_gc: 1,
            last_heap_inuse: 4 << 20,
        });
        let gen = heap.inner.lock().pacing.gen;
        assert!(wait_for(Duration::from_millis(500), || {
            heap.inner.lock().pacing.worker_gen == gen
        }));
        assert!(woken.elapsed() < long);

        worker.stop();
        assert_eq!(worker.state(), ScavengerState::Stopped);
    }
}
