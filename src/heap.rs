//! The heap context: page allocator, statistics, scavenger pacing and the
//! per-size-class free lists, behind one explicit handle.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::central::Central;
use crate::globals::{CHUNK_BYTES, CHUNK_PAGES, PAGE_SIZE};
use crate::internal::addr_range::OffAddr;
use crate::internal::radix_tree::SummaryTree;
use crate::mmap::{OsMemory, SysMemory};
use crate::page_alloc::PageAlloc;
use crate::scavenger::{ScavengePacing, ScavengerSignal};
use crate::span::{Span, SpanId, SpanSet, SpanState};
use crate::statistics::HeapStatistics;
use crate::util::align_up;
use crate::{Config, ConfigError};

#[derive(Default)]
pub(crate) struct MemStats {
    /// Bytes of address space mapped for the heap.
    pub heap_sys: AtomicUsize,
    /// Bytes of `heap_sys` with no physical memory behind them.
    pub heap_released: AtomicUsize,
    /// Bytes handed out as pages.
    pub heap_inuse: AtomicUsize,
    pub metadata_sys: AtomicUsize,
}

/// Everything guarded by the heap lock.
pub(crate) struct HeapInner {
    pub pages: PageAlloc,
    pub pacing: ScavengePacing,
    /// Mapped but not yet grown part of the last arena, `[base, end)`.
    cur_arena: (usize, usize),
    arenas: Vec<(usize, usize)>,
}

pub struct PageHeap {
    pub(crate) config: Config,
    pub(crate) sys: Arc<dyn SysMemory>,
    pub(crate) inner: Mutex<HeapInner>,
    /// Shared with `inner.pages` so that leaf summaries can be read without
    /// the lock.
    pub(crate) summary: Arc<SummaryTree>,
    pub(crate) stats: CachePadded<MemStats>,
    pub(crate) signal: ScavengerSignal,
    /// Taken after a central's lock, never while holding `inner`.
    pub(crate) spans: Mutex<SpanSet>,
    centrals: Vec<Central>,
}

impl PageHeap {
    pub fn new(config: Config, sys: Arc<dyn SysMemory>) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let pages = PageAlloc::new(sys.phys_page_size(), sys.phys_huge_page_size());
        let summary = pages.summary_tree().clone();
        let centrals = config
            .size_classes
            .iter()
            .enumerate()
            .map(|(i, class)| Central::new(i, class.size, class.pages))
            .collect();
        logln_if!(
            config.verbose,
            "page heap: arena {} bytes, {} size classes, physical page {} huge page {}",
            config.arena_size,
            config.size_classes.len(),
            sys.phys_page_size(),
            sys.phys_huge_page_size()
        );
        Ok(Arc::new(Self {
            config,
            sys,
            inner: Mutex::new(HeapInner {
                pages,
                pacing: ScavengePacing::new(),
                cur_arena: (0, 0),
                arenas: Vec::new(),
            }),
            summary,
            stats: CachePadded::new(MemStats::default()),
            signal: ScavengerSignal::new(),
            spans: Mutex::new(SpanSet::new()),
            centrals,
        }))
    }

    /// A heap backed by the operating system's virtual memory.
    pub fn with_os_memory(config: Config) -> Result<Arc<Self>, ConfigError> {
        Self::new(config, Arc::new(OsMemory::new()))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sys(&self) -> &Arc<dyn SysMemory> {
        &self.sys
    }

    pub fn centrals(&self) -> &[Central] {
        &self.centrals
    }

    /// Mapped heap bytes that still have physical memory behind them.
    pub fn retained(&self) -> usize {
        let sys = self.stats.heap_sys.load(Ordering::Relaxed);
        sys.saturating_sub(self.stats.heap_released.load(Ordering::Relaxed))
    }

    /// Runs `f` on the page allocator under the heap lock.
    pub fn with_pages<R>(&self, f: impl FnOnce(&mut PageAlloc) -> R) -> R {
        f(&mut self.inner.lock().pages)
    }

    /// Allocates `npages` contiguous pages, growing the heap as needed.
    /// Running out of address space is fatal.
    pub fn alloc_pages(&self, npages: usize) -> usize {
        let (base, scav) = {
            let mut inner = self.inner.lock();
            match inner.pages.alloc(npages) {
                Some(found) => found,
                None => {
                    self.grow_locked(&mut inner, npages);
                    match inner.pages.alloc(npages) {
                        Some(found) => found,
                        None => fatal!("heap grew but {} pages are still unavailable", npages),
                    }
                }
            }
        };
        self.account_alloc(base, npages, scav);
        base
    }

    /// Bookkeeping for `npages` pages at `base` just taken out of the page
    /// allocator, `scav` bytes of which were scavenged.
    pub(crate) fn account_alloc(&self, base: usize, npages: usize, scav: usize) {
        if scav != 0 {
            self.sys.used(base, npages * PAGE_SIZE);
            self.stats.heap_released.fetch_sub(scav, Ordering::Relaxed);
        }
        self.stats.heap_inuse.fetch_add(npages * PAGE_SIZE, Ordering::Relaxed);
    }

    pub fn free_pages(&self, base: usize, npages: usize) {
        self.inner.lock().pages.free(base, npages);
        self.stats.heap_inuse.fetch_sub(npages * PAGE_SIZE, Ordering::Relaxed);
    }

    /// Adds at least `npages` pages to the page allocator, reserving a new
    /// arena when the current one is used up, then scavenges if the heap is
    /// now above its retained goal.
    fn grow_locked(&self, inner: &mut HeapInner, npages: usize) {
        let ask = align_up(npages, CHUNK_PAGES) * PAGE_SIZE;
        let phys = self.sys.phys_page_size();
        let mut total_growth = 0;
        let mut metadata = 0;

        let (mut base, mut end) = inner.cur_arena;
        let mut n_base = align_up(base + ask, phys);
        if n_base > end {
            let size = align_up(ask, self.config.arena_size);
            let av = match self.sys.reserve(size, CHUNK_BYTES) {
                Ok(av) => av,
                Err(e) => fatal!("out of memory allocating heap arena for {} pages: {}", npages, e),
            };
            if let Err(e) = self.sys.map(av, size) {
                fatal!("out of memory mapping heap arena: {}", e);
            }
            inner.arenas.push((av, size));
            if av == end {
                end = av + size;
            } else {
                // The rest of the old arena can no longer be extended, so it
                // goes to the page allocator as it is.
                if end != base {
                    metadata += inner.pages.grow(base, end - base);
                    total_growth += end - base;
                }
                base = av;
                end = av + size;
            }
            // New arenas have no physical memory behind them yet.
            self.stats.heap_sys.fetch_add(size, Ordering::Relaxed);
            self.stats.heap_released.fetch_add(size, Ordering::Relaxed);
            n_base = align_up(base + ask, phys);
        }

        inner.cur_arena = (n_base, end);
        metadata += inner.pages.grow(base, n_base - base);
        total_growth += n_base - base;
        self.stats.metadata_sys.fetch_add(metadata, Ordering::Relaxed);
        logln_if!(
            self.config.verbose,
            "heap grew by {} bytes at {:#x}, arena tail [{:#x}, {:#x})",
            total_growth,
            base,
            n_base,
            end
        );

        let retained = self.retained() as u64;
        let goal = inner.pacing.retained_goal;
        if retained + total_growth as u64 > goal {
            let todo = (total_growth as u64).min(retained + total_growth as u64 - goal);
            if inner.pages.scav_addr == OffAddr::MIN {
                inner.pages.reset_scavenge_addr();
            }
            let released = self.scavenge_locked(inner, todo as usize);
            log::debug!("heap growth scavenged {} of {} bytes", released, todo);
        }
    }

    fn alloc_span(&self, npages: usize, state: SpanState) -> SpanId {
        let base = self.alloc_pages(npages);
        let span = match state {
            SpanState::Manual => Span::manual(base, npages),
            _ => Span::large(base, npages),
        };
        self.spans.lock().insert(span)
    }

    /// A span of `npages` pages holding a single object.
    pub fn alloc_large(&self, npages: usize) -> SpanId {
        self.alloc_span(npages, SpanState::InUse)
    }

    /// A span of `npages` pages for memory the runtime manages itself.
    pub fn alloc_manual(&self, npages: usize) -> SpanId {
        self.alloc_span(npages, SpanState::Manual)
    }

    /// Returns the pages of span `id` to the page allocator.
    pub fn free_span(&self, id: SpanId) {
        let span = self.spans.lock().remove(id);
        log::trace!("freeing span {:?} at {:#x}+{}", id, span.base(), span.npages());
        self.free_pages(span.base(), span.npages());
    }

    pub fn span_of(&self, addr: usize) -> Option<SpanId> {
        self.spans.lock().span_of(addr)
    }

    pub fn span_range(&self, id: SpanId) -> Option<Range<usize>> {
        self.spans.lock().get(id).map(|span| span.base()..span.limit())
    }

    pub fn span_state(&self, id: SpanId) -> Option<SpanState> {
        self.spans.lock().get(id).map(Span::state)
    }

    /// The smallest size class that fits `size` bytes.
    pub fn size_class_of(&self, size: usize) -> Option<usize> {
        self.centrals
            .iter()
            .filter(|c| c.elem_size() >= size)
            .min_by_key(|c| c.elem_size())
            .map(Central::class)
    }

    /// Allocates `size` bytes from its size class, or from a span of its
    /// own when no class fits.
    pub fn alloc_object(&self, size: usize) -> usize {
        let size = size.max(1);
        match self.size_class_of(size) {
            Some(class) => self.centrals[class].alloc(self),
            None => {
                let npages = align_up(size, PAGE_SIZE) / PAGE_SIZE;
                let base = self.alloc_pages(npages);
                self.spans.lock().insert(Span::large(base, npages));
                base
            }
        }
    }

    pub fn free_object(&self, addr: usize) {
        let (id, class, state) = {
            let spans = self.spans.lock();
            match spans.span_of(addr).and_then(|id| Some((id, spans.get(id)?))) {
                Some((id, span)) => (id, span.class(), span.state()),
                None => fatal!("free of {:#x} outside of any span", addr),
            }
        };
        match (class, state) {
            (Some(class), _) => self.centrals[class].free(self, addr),
            (None, SpanState::InUse) => self.free_span(id),
            (None, state) => fatal!("free_object of {:#x} in a {:?} span", addr, state),
        }
    }

    pub fn statistics(&self) -> HeapStatistics {
        let (chunks, scavenge_goal) = {
            let inner = self.inner.lock();
            let goal = inner.pacing.retained_goal;
            (
                inner.pages.in_use().total_bytes() / CHUNK_BYTES,
                if goal == u64::MAX { None } else { Some(goal as usize) },
            )
        };
        let spans = self.spans.lock().len();
        let heap_sys = self.stats.heap_sys.load(Ordering::Relaxed);
        let heap_released = self.stats.heap_released.load(Ordering::Relaxed);
        let heap_inuse = self.stats.heap_inuse.load(Ordering::Relaxed);
        HeapStatistics {
            heap_sys,
            heap_released,
            heap_inuse,
            heap_idle: heap_sys.saturating_sub(heap_inuse),
            retained: heap_sys.saturating_sub(heap_released),
            metadata_sys: self.stats.metadata_sys.load(Ordering::Relaxed),
            chunks,
            spans,
            scavenge_goal,
        }
    }
}

impl Drop for PageHeap {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for &(base, size) in inner.arenas.iter() {
            self.sys.free(base, size);
        }
        log::debug!("page heap released {} arenas", inner.arenas.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::NoopMemory;
    use crate::GcPacing;

    const ARENA: usize = 4 * CHUNK_BYTES;

    fn config() -> Config {
        Config {
            arena_size: ARENA,
            ..Config::default()
        }
    }

    fn heap() -> (Arc<PageHeap>, Arc<NoopMemory>) {
        let sys = Arc::new(NoopMemory::new());
        (PageHeap::new(config(), sys.clone()).unwrap(), sys)
    }

    #[test]
    fn test_invalid_config() {
        let config = Config {
            arena_size: 12345,
            ..Config::default()
        };
        assert!(matches!(
            PageHeap::new(config, Arc::new(NoopMemory::new())),
            Err(ConfigError::ArenaSize(12345))
        ));
    }

    #[test]
    fn test_alloc_grows_heap() {
        let (heap, sys) = heap();
        let a = heap.alloc_pages(3);
        assert_eq!(sys.reserved_bytes(), ARENA);
        assert_eq!(sys.mapped_bytes(), ARENA);
        let b = heap.alloc_pages(1);
        assert_eq!(b, a + 3 * PAGE_SIZE);

        let stats = heap.statistics();
        assert_eq!(stats.heap_sys, ARENA);
        assert_eq!(stats.heap_inuse, 4 * PAGE_SIZE);
        // Fresh pages come out scavenged, so only the handed out ones count.
        assert_eq!(stats.retained, 4 * PAGE_SIZE);
        assert_eq!(stats.chunks, 1);
        assert!(stats.metadata_sys > 0);

        heap.free_pages(a, 3);
        assert_eq!(heap.statistics().heap_inuse, PAGE_SIZE);
        // Freed pages are reused and their memory is still there.
        assert_eq!(heap.alloc_pages(2), a);
        assert_eq!(heap.retained(), 4 * PAGE_SIZE);
    }

    #[test]
    fn test_grow_extends_arena() {
        let (heap, sys) = heap();
        let a = heap.alloc_pages(CHUNK_PAGES * 3);
        let b = heap.alloc_pages(CHUNK_PAGES);
        assert_eq!(b, a + 3 * CHUNK_BYTES);
        assert_eq!(sys.reserved_bytes(), ARENA);
        // Contiguous arenas join up.
        let c = heap.alloc_pages(CHUNK_PAGES + 1);
        assert_eq!(c, a + ARENA);
        assert_eq!(sys.reserved_bytes(), 2 * ARENA);
        heap.with_pages(|pages| assert_eq!(pages.in_use().ranges().len(), 1));
        heap.with_pages(|pages| pages.verify_summaries()).unwrap();
    }

    #[test]
    fn test_grow_with_gaps() {
        let sys = Arc::new(NoopMemory::new().with_gap(CHUNK_BYTES));
        let heap = PageHeap::new(config(), sys.clone()).unwrap();
        heap.alloc_pages(CHUNK_PAGES * 3);
        // Too big for the rest of the arena: the remainder is grown as is
        // and the run comes from the next arena.
        let b = heap.alloc_pages(CHUNK_PAGES * 2);
        assert_eq!(sys.reserved_bytes(), 2 * ARENA);
        heap.with_pages(|pages| {
            assert_eq!(pages.in_use().ranges().len(), 2);
            assert_eq!(pages.in_use().total_bytes(), 4 * CHUNK_BYTES + 2 * CHUNK_BYTES);
        });
        // The leftover chunk of the first arena is still usable.
        let c = heap.alloc_pages(CHUNK_PAGES);
        assert!(c < b);
    }

    #[test]
    #[should_panic]
    fn test_out_of_memory() {
        let sys = Arc::new(NoopMemory::new().with_limit(ARENA));
        let heap = PageHeap::new(config(), sys).unwrap();
        heap.alloc_pages(CHUNK_PAGES * 4);
        heap.alloc_pages(1);
    }

    #[test]
    fn test_growth_scavenges_toward_goal() {
        let (heap, sys) = heap();
        let all = heap.alloc_pages(CHUNK_PAGES * 4);
        assert_eq!(heap.retained(), ARENA);
        heap.pace_scavenger(GcPacing {
            next_gc: 1,
            last_next_gc: 1,
            last_heap_inuse: 0,
        });
        heap.free_pages(all, CHUNK_PAGES * 4);
        assert_eq!(sys.released_bytes(), 0);

        // Growing past a goal of zero releases the old, now free, memory.
        let big = heap.alloc_pages(CHUNK_PAGES * 4 + 1);
        assert_eq!(big, all);
        assert_eq!(sys.released_bytes(), ARENA);
        let stats = heap.statistics();
        assert_eq!(stats.heap_sys, 3 * ARENA);
        assert_eq!(stats.retained, ARENA + PAGE_SIZE);
        assert_eq!(stats.scavenge_goal, Some(0));
    }

    #[test]
    fn test_large_and_manual_spans() {
        let (heap, _) = heap();
        let large = heap.alloc_large(3);
        let manual = heap.alloc_manual(1);
        let range = heap.span_range(large).unwrap();
        assert_eq!(range.len(), 3 * PAGE_SIZE);
        assert_eq!(heap.span_of(range.start + PAGE_SIZE), Some(large));
        assert_eq!(heap.span_state(manual), Some(SpanState::Manual));
        assert_eq!(heap.statistics().spans, 2);

        heap.free_span(large);
        assert_eq!(heap.span_of(range.start), None);
        assert_eq!(heap.statistics().heap_inuse, PAGE_SIZE);
        // The freed run is handed out again.
        let again = heap.alloc_large(2);
        assert_eq!(heap.span_range(again).unwrap().start, range.start);
    }

    #[test]
    fn test_objects() {
        let (heap, _) = heap();
        assert_eq!(heap.size_class_of(1), Some(0));
        assert_eq!(heap.size_class_of(17), Some(1));
        assert_eq!(heap.size_class_of(32769), None);

        let small = heap.alloc_object(24);
        let id = heap.span_of(small).unwrap();
        assert_eq!(heap.span_range(id).unwrap().start, small);
        let next = heap.alloc_object(32);
        assert_eq!(next, small + 32);

        let big = heap.alloc_object(100_000);
        let big_id = heap.span_of(big).unwrap();
        assert_eq!(heap.span_range(big_id).unwrap().len(), 13 * PAGE_SIZE);
        heap.free_object(big);
        assert_eq!(heap.span_of(big), None);

        heap.free_object(small);
        heap.free_object(next);
        // The only partial span of a class is kept around.
        assert_eq!(heap.span_of(small), Some(id));
    }

    #[test]
    #[should_panic]
    fn test_free_object_in_manual_span() {
        let (heap, _) = heap();
        let id = heap.alloc_manual(1);
        let start = heap.span_range(id).unwrap().start;
        heap.free_object(start);
    }

    #[test]
    fn test_drop_releases_arenas() {
        let (heap, sys) = heap();
        heap.alloc_pages(CHUNK_PAGES * 5);
        assert_eq!(sys.reserved_bytes(), 2 * ARENA);
        drop(heap);
        assert_eq!(sys.reserved_bytes(), 0);
        assert_eq!(sys.mapped_bytes(), 0);
    }
}
