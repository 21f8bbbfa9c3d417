use core::fmt;

use crate::globals::{PAGE_CACHE_PAGES, PAGE_SIZE};
use crate::internal::addr_range::OffAddr;
use crate::page_alloc::PageAlloc;
use crate::util::align_down;
use crate::util::bits::{find_consec_n64, set_consec_bits64};

/// A window of `PAGE_CACHE_PAGES` pages taken out of the page allocator in
/// one go and owned by a single `LocalHeap`, which can then allocate small
/// runs from it without the heap lock.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PageCache {
    base: usize,
    /// 1 is a free page.
    cache: u64,
    /// 1 is a scavenged page.
    scav: u64,
}

impl PageCache {
    pub const fn new(base: usize, cache: u64, scav: u64) -> Self {
        Self { base, cache, scav }
    }

    pub const fn base(&self) -> usize {
        self.base
    }

    pub const fn cache(&self) -> u64 {
        self.cache
    }

    pub const fn scav(&self) -> u64 {
        self.scav
    }

    pub const fn is_empty(&self) -> bool {
        self.cache == 0
    }

    /// Takes `npages` contiguous pages out of the cache. Returns the base
    /// address and how many of the bytes were scavenged.
    pub fn alloc(&mut self, npages: usize) -> Option<(usize, usize)> {
        if self.cache == 0 {
            return None;
        }
        if npages == 1 {
            let i = self.cache.trailing_zeros() as usize;
            let scav = ((self.scav >> i) & 1) as usize;
            self.cache &= !(1 << i);
            self.scav &= !(1 << i);
            return Some((self.base + i * PAGE_SIZE, scav * PAGE_SIZE));
        }
        self.alloc_n(npages)
    }

    fn alloc_n(&mut self, npages: usize) -> Option<(usize, usize)> {
        if npages == 0 || npages > PAGE_CACHE_PAGES {
            return None;
        }
        let i = find_consec_n64(self.cache, npages);
        if i >= PAGE_CACHE_PAGES {
            return None;
        }
        let mask = set_consec_bits64(0, i, npages);
        let scav = (self.scav & mask).count_ones() as usize;
        self.cache &= !mask;
        self.scav &= !mask;
        Some((self.base + i * PAGE_SIZE, scav * PAGE_SIZE))
    }

    /// Hands every page still in the cache back to `pages` and empties the
    /// cache. Must run under the heap lock.
    pub fn flush(&mut self, pages: &mut PageAlloc) {
        if self.is_empty() {
            return;
        }
        let base = OffAddr::new(self.base);
        let ci = base.chunk_index();
        let pi = base.chunk_page_index();
        let chunk = pages.chunk_mut(ci);
        for i in 0..PAGE_CACHE_PAGES {
            if self.cache & (1 << i) != 0 {
                chunk.bits.free1(pi + i);
            }
            if self.scav & (1 << i) != 0 {
                chunk.scavenged.set1(pi + i);
            }
        }
        if base < pages.search_addr {
            pages.search_addr = base;
        }
        pages.update(base, PAGE_CACHE_PAGES, false, false);
        *self = PageCache::default();
    }
}

impl fmt::Debug for PageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCache")
            .field("base", &format_args!("{:#x}", self.base))
            .field("cache", &format_args!("{:#018x}", self.cache))
            .field("scav", &format_args!("{:#018x}", self.scav))
            .finish()
    }
}

impl PageAlloc {
    /// Takes the aligned block of `PAGE_CACHE_PAGES` pages holding the first
    /// free page out of the allocator. Returns an empty cache if the heap is
    /// exhausted.
    pub fn alloc_to_cache(&mut self) -> PageCache {
        if self.search_addr.chunk_index() >= self.bounds().1 {
            return PageCache::default();
        }
        let ci = self.search_addr.chunk_index();
        let addr = if self.summary.leaf(ci).max() != 0 {
            let hint = self.search_addr.chunk_page_index();
            match self.chunk_of(ci).bits.find(1, hint) {
                Some((j, _)) => OffAddr::chunk_base(ci).add(j * PAGE_SIZE),
                None => {
                    self.dump_chunk(ci);
                    fatal!("bad summary data: chunk {} has no free page from {}", ci, hint);
                }
            }
        } else {
            match self.find(1) {
                Some((addr, _)) => addr,
                None => {
                    self.search_addr = OffAddr::MAX;
                    return PageCache::default();
                }
            }
        };

        let ci = addr.chunk_index();
        let pi = addr.chunk_page_index();
        let chunk = self.chunk_of(ci);
        let c = PageCache {
            base: OffAddr::from_linear(align_down(addr.linear(), PAGE_CACHE_PAGES * PAGE_SIZE)).addr(),
            cache: !chunk.bits.pages64(pi),
            scav: chunk.scavenged.block64(pi),
        };
        let base = OffAddr::new(c.base);
        self.alloc_range(base, PAGE_CACHE_PAGES);
        self.update(base, PAGE_CACHE_PAGES, false, true);
        // Everything up to the end of the block now belongs to the cache.
        self.search_addr = base.add((PAGE_CACHE_PAGES - 1) * PAGE_SIZE);
        c
    }
}
