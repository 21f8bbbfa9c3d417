use std::sync::Arc;

use crate::globals::PAGE_CACHE_PAGES;
use crate::heap::PageHeap;
use crate::page_cache::PageCache;

/// LocalHeap is the handle one thread (or one scheduling unit) uses to
/// allocate pages. Small runs come out of its private `PageCache` without
/// taking the heap lock; the cache is refilled from the page allocator when
/// it runs dry and handed back when the LocalHeap is dropped.
pub struct LocalHeap {
    heap: Arc<PageHeap>,
    cache: PageCache,
}

impl LocalHeap {
    pub fn new(heap: Arc<PageHeap>) -> Self {
        Self {
            heap,
            cache: PageCache::default(),
        }
    }

    pub fn heap(&self) -> &Arc<PageHeap> {
        &self.heap
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    /// Allocates `npages` contiguous pages. Runs shorter than a quarter of
    /// the cache try the cache first.
    pub fn alloc_pages(&mut self, npages: usize) -> usize {
        if npages < PAGE_CACHE_PAGES / 4 {
            if self.cache.is_empty() {
                self.cache = self.heap.inner.lock().pages.alloc_to_cache();
            }
            if let Some((base, scav)) = self.cache.alloc(npages) {
                self.heap.account_alloc(base, npages, scav);
                return base;
            }
        }
        self.heap.alloc_pages(npages)
    }

    pub fn free_pages(&mut self, base: usize, npages: usize) {
        self.heap.free_pages(base, npages);
    }

    /// Hands every page left in the cache back to the heap.
    pub fn flush(&mut self) {
        if !self.cache.is_empty() {
            self.cache.flush(&mut self.heap.inner.lock().pages);
        }
    }
}

impl Drop for LocalHeap {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::{CHUNK_BYTES, CHUNK_PAGES, PAGE_SIZE};
    use crate::mmap::NoopMemory;
    use crate::Config;

    fn heap() -> Arc<PageHeap> {
        let config = Config {
            arena_size: CHUNK_BYTES,
            ..Config::default()
        };
        PageHeap::new(config, Arc::new(NoopMemory::new())).unwrap()
    }

    #[test]
    fn test_small_runs_use_cache() {
        let heap = heap();
        // Make the heap exist so that the cache has something to take.
        let first = heap.alloc_pages(1);
        let mut local = LocalHeap::new(heap.clone());
        let a = local.alloc_pages(1);
        assert_eq!(a, first + PAGE_SIZE);
        assert_eq!(local.cache().base(), first);
        assert_eq!(local.cache().cache(), !0b11);
        let b = local.alloc_pages(4);
        assert_eq!(b, a + PAGE_SIZE);
        assert_eq!(heap.statistics().heap_inuse, 6 * PAGE_SIZE);

        // The heap itself only sees what is past the cached block.
        let other = heap.alloc_pages(1);
        assert_eq!(other, first + PAGE_CACHE_PAGES * PAGE_SIZE);
    }

    #[test]
    fn test_large_runs_skip_cache() {
        let heap = heap();
        let mut local = LocalHeap::new(heap.clone());
        let a = local.alloc_pages(PAGE_CACHE_PAGES / 4);
        assert!(local.cache().is_empty());
        local.free_pages(a, PAGE_CACHE_PAGES / 4);
        assert_eq!(heap.statistics().heap_inuse, 0);
    }

    #[test]
    fn test_drop_flushes() {
        let heap = heap();
        let first = heap.alloc_pages(1);
        let mut local = LocalHeap::new(heap.clone());
        let a = local.alloc_pages(2);
        assert_eq!(a, first + PAGE_SIZE);
        heap.with_pages(|pages| {
            let (start, _) = pages.bounds();
            assert_eq!(pages.chunk(start).unwrap().bits.pages64(0), !0);
        });
        drop(local);
        heap.with_pages(|pages| {
            let (start, end) = pages.bounds();
            assert_eq!(end - start, 1);
            let chunk = pages.chunk(start).unwrap();
            assert_eq!(chunk.bits.pages64(0), 0b111);
            assert_eq!(chunk.bits.bits().count_ones(), 3);
            pages.verify_summaries().unwrap();
        });
        heap.free_pages(a, 2);
        heap.free_pages(first, 1);
        heap.with_pages(|pages| {
            let (start, _) = pages.bounds();
            assert_eq!(pages.summary_tree().leaf(start).max(), CHUNK_PAGES);
        });
    }
}
