//! Page-granularity allocator over a sparse address space.
//!
//! Every chunk of `CHUNK_PAGES` pages owns an allocation bitmap and a
//! scavenged bitmap. A radix tree of summaries sits on top so that a free run
//! of any length can be found without touching the bitmaps of full chunks.

use std::mem::size_of;
use std::sync::Arc;

use crate::globals::{CHUNK_BYTES, CHUNK_PAGES, MAX_CHUNKS, PAGE_SIZE, SUMMARY_LEVELS};
use crate::internal::addr_range::{AddrRange, AddrRanges, OffAddr};
use crate::internal::page_bits::MallocData;
use crate::internal::radix_tree::SummaryTree;
use crate::internal::sparse_array::SparseArray;
use crate::internal::summary::Summary;
use crate::util::{align_down, align_up};

pub struct PageAlloc {
    pub(crate) summary: Arc<SummaryTree>,
    /// Chunk index to `slot + 1` in `chunks`; 0 marks a chunk never grown.
    chunk_slots: SparseArray<u32>,
    chunks: Vec<MallocData>,
    /// No free page lives below this address.
    pub(crate) search_addr: OffAddr,
    /// No scavengeable page lives above this address.
    pub(crate) scav_addr: OffAddr,
    /// Bumped by every reset of `scav_addr`.
    pub(crate) scav_epoch: u64,
    /// Known chunks are `[start, end)`.
    start: usize,
    end: usize,
    in_use: AddrRanges,
    metadata_bytes: usize,
    /// Physical page size in pages; the scavenger releases whole groups of it.
    min_scav_pages: usize,
    /// Huge page size in pages, or 0 when huge pages are not in play.
    huge_pages: usize,
}

impl PageAlloc {
    pub fn new(phys_page_size: usize, phys_huge_page_size: usize) -> Self {
        if !phys_page_size.is_power_of_two() {
            fatal!("physical page size {:#x} is not a power of two", phys_page_size);
        }
        let min_scav_pages = (phys_page_size / PAGE_SIZE).max(1);
        if min_scav_pages > 64 {
            fatal!("physical page size {:#x} is too large", phys_page_size);
        }
        let huge_pages = if phys_huge_page_size > PAGE_SIZE.max(phys_page_size) {
            phys_huge_page_size / PAGE_SIZE
        } else {
            0
        };
        Self {
            summary: Arc::new(SummaryTree::new()),
            chunk_slots: SparseArray::reserve(MAX_CHUNKS),
            chunks: Vec::new(),
            search_addr: OffAddr::MAX,
            scav_addr: OffAddr::MIN,
            scav_epoch: 0,
            start: 0,
            end: 0,
            in_use: AddrRanges::new(),
            metadata_bytes: 0,
            min_scav_pages,
            huge_pages,
        }
    }

    pub fn summary_tree(&self) -> &Arc<SummaryTree> {
        &self.summary
    }

    pub fn search_addr(&self) -> OffAddr {
        self.search_addr
    }

    pub fn scav_addr(&self) -> OffAddr {
        self.scav_addr
    }

    /// Chunk indices `[start, end)` spanned by the heap so far.
    pub fn bounds(&self) -> (usize, usize) {
        (self.start, self.end)
    }

    pub fn in_use(&self) -> &AddrRanges {
        &self.in_use
    }

    /// Bytes of summary and chunk metadata committed by `grow`.
    pub fn metadata_bytes(&self) -> usize {
        self.metadata_bytes
    }

    pub fn min_scav_pages(&self) -> usize {
        self.min_scav_pages
    }

    pub fn huge_pages(&self) -> usize {
        self.huge_pages
    }

    pub fn chunk(&self, ci: usize) -> Option<&MallocData> {
        match self.chunk_slots.get(ci) {
            Some(&slot) if slot != 0 => Some(&self.chunks[slot as usize - 1]),
            _ => None,
        }
    }

    pub fn has_chunk(&self, ci: usize) -> bool {
        self.chunk(ci).is_some()
    }

    pub(crate) fn chunk_of(&self, ci: usize) -> &MallocData {
        match self.chunk(ci) {
            Some(chunk) => chunk,
            None => fatal!("missing chunk {} (heap spans chunks [{}, {}))", ci, self.start, self.end),
        }
    }

    pub(crate) fn chunk_mut(&mut self, ci: usize) -> &mut MallocData {
        match self.chunk_slots.get(ci) {
            Some(&slot) if slot != 0 => &mut self.chunks[slot as usize - 1],
            _ => fatal!("missing chunk {} (heap spans chunks [{}, {}))", ci, self.start, self.end),
        }
    }

    /// Adds `[base, base + size)` to the heap. The range is widened to whole
    /// chunks, which start out free and scavenged. Returns the bytes of
    /// metadata committed to describe them.
    pub fn grow(&mut self, base: usize, size: usize) -> usize {
        if size == 0 {
            fatal!("grow of zero bytes at {:#x}", base);
        }
        let lo = OffAddr::new(base).linear();
        let limit = align_up(lo + size, CHUNK_BYTES);
        let lo = align_down(lo, CHUNK_BYTES);
        let (start, end) = (lo / CHUNK_BYTES, limit / CHUNK_BYTES);
        if end > MAX_CHUNKS {
            fatal!("grow of [{:#x}, {:#x}) beyond the addressable heap", base, base + size);
        }
        let base = OffAddr::from_linear(lo);
        let limit = OffAddr::from_linear(limit);

        let mut bytes = self.summary.commit(base, limit.sub(1));
        bytes += self.chunk_slots.commit(start..end, || 0);
        for ci in start..end {
            let next = self.chunks.len() as u32 + 1;
            match self.chunk_slots.get_mut(ci) {
                Some(slot) if *slot == 0 => *slot = next,
                Some(_) => fatal!("chunk {} grown twice", ci),
                None => fatal!("chunk {} not committed after grow", ci),
            }
            self.chunks.push(MallocData::new_scavenged());
            bytes += size_of::<MallocData>();
        }

        if self.end == 0 || start < self.start {
            self.start = start;
        }
        if end > self.end {
            self.end = end;
        }
        if base < self.search_addr {
            self.search_addr = base;
        }
        self.in_use.add(AddrRange { base, limit });
        self.metadata_bytes += bytes;
        log::debug!(
            "page alloc grew by {:?}, chunks [{}, {}), {} metadata bytes",
            AddrRange { base, limit },
            self.start,
            self.end,
            bytes
        );

        self.update(base, (end - start) * CHUNK_PAGES, true, false);
        bytes
    }

    /// Allocates `npages` contiguous pages. Returns the base address and how
    /// many bytes of the run had been scavenged, or `None` if no free run is
    /// long enough.
    pub fn alloc(&mut self, npages: usize) -> Option<(usize, usize)> {
        if npages == 0 {
            fatal!("alloc of zero pages");
        }
        if self.search_addr.chunk_index() >= self.end {
            return None;
        }

        let mut found = None;
        // Only try the chunk of the hint if the run can fit in what is left of it.
        if CHUNK_PAGES - self.search_addr.chunk_page_index() >= npages {
            let ci = self.search_addr.chunk_index();
            let max = self.summary.leaf(ci).max();
            if max >= npages {
                let hint = self.search_addr.chunk_page_index();
                match self.chunk_of(ci).bits.find(npages, hint) {
                    Some((j, h)) => {
                        let base = OffAddr::chunk_base(ci);
                        found = Some((base.add(j * PAGE_SIZE), base.add(h * PAGE_SIZE)));
                    }
                    None => {
                        self.dump_chunk(ci);
                        fatal!(
                            "bad summary data: max = {}, npages = {}, search index {} of {:?}",
                            max,
                            npages,
                            hint,
                            self.search_addr
                        );
                    }
                }
            }
        }

        let (addr, search_addr) = match found.or_else(|| self.find(npages)) {
            Some(found) => found,
            None => {
                // Not even one page is left, so the whole heap is exhausted.
                // Longer runs may still fail only for lack of contiguity.
                if npages == 1 {
                    self.search_addr = OffAddr::MAX;
                }
                return None;
            }
        };
        let scav = self.alloc_range(addr, npages);
        if search_addr > self.search_addr {
            self.search_addr = search_addr;
        }
        self.update(addr, npages, true, true);
        Some((addr.addr(), scav))
    }

    /// Walks the summary tree from the root looking for `npages` free pages.
    /// Returns the run and the best search hint seen on the way.
    pub(crate) fn find(&self, npages: usize) -> Option<(OffAddr, OffAddr)> {
        let tree = &*self.summary;
        let mut i = 0;
        // First address that can possibly be free, past everything skipped.
        let mut best: Option<OffAddr> = None;
        let mut last = (0, Summary::EMPTY);

        'next_level: for l in 0..SUMMARY_LEVELS {
            let b = SummaryTree::level_bits(l);
            let e = 1 << b;
            let shift = SummaryTree::level_shift(l);
            let p = SummaryTree::level_log_pages(l);
            i <<= b;

            let search_idx = self.search_addr.linear() >> shift;
            let j0 = if search_idx & !(e - 1) == i { search_idx & (e - 1) } else { 0 };

            // `start` and `size` describe the run currently being grown, in
            // pages relative to entry `i`.
            let (mut start, mut size) = (0, 0);
            for j in j0..e {
                let sum = tree.get(l, i + j);
                if sum.is_empty() {
                    size = 0;
                    continue;
                }
                let s = sum.start();
                if size != 0 && size + s >= npages {
                    size += s;
                    break;
                }
                if sum.max() >= npages {
                    last = (i + j, sum);
                    i += j;
                    continue 'next_level;
                }
                if best.is_none() {
                    best = Some(OffAddr::from_linear((i + j) << shift));
                }
                if size == 0 || s < 1 << p {
                    size = sum.end();
                    start = ((j + 1) << p) - size;
                    continue;
                }
                size += 1 << p;
            }
            if size >= npages {
                let addr = OffAddr::from_linear(i << shift).add(start * PAGE_SIZE);
                return Some((addr, best.unwrap_or(addr.add(npages * PAGE_SIZE))));
            }
            if l == 0 {
                return None;
            }
            log::error!("summary[{}][{}] = {:?}", l - 1, last.0, last.1);
            log::error!(
                "level = {}, npages = {}, j0 = {}, search_addr = {:?}, i = {}, e = {}",
                l,
                npages,
                j0,
                self.search_addr,
                i,
                e
            );
            for j in 0..e {
                log::error!("summary[{}][{}] = {:?}", l, i + j, tree.get(l, i + j));
            }
            fatal!("bad summary data");
        }

        // `i` is now the index of a chunk whose summary promises a long
        // enough run.
        let base = OffAddr::chunk_base(i);
        match self.chunk_of(i).bits.find(npages, 0) {
            Some((j, h)) => {
                let addr = base.add(j * PAGE_SIZE);
                Some((addr, best.unwrap_or(base.add(h * PAGE_SIZE))))
            }
            None => {
                self.dump_chunk(i);
                fatal!("bad summary data: chunk {} cannot fit {} pages", i, npages);
            }
        }
    }

    /// Marks `[addr, addr + npages)` used and returns the bytes in it that
    /// were scavenged.
    pub(crate) fn alloc_range(&mut self, addr: OffAddr, npages: usize) -> usize {
        let limit = addr.add(npages * PAGE_SIZE - 1);
        let (sc, ec) = (addr.chunk_index(), limit.chunk_index());
        let (si, ei) = (addr.chunk_page_index(), limit.chunk_page_index());

        let scav = if sc == ec {
            self.chunk_mut(sc).alloc_range(si, ei + 1 - si)
        } else {
            let mut scav = self.chunk_mut(sc).alloc_range(si, CHUNK_PAGES - si);
            for ci in sc + 1..ec {
                scav += self.chunk_mut(ci).alloc_all();
            }
            scav + self.chunk_mut(ec).alloc_range(0, ei + 1)
        };
        scav * PAGE_SIZE
    }

    /// Returns `npages` pages at `base` to the allocator. Every page must be
    /// allocated.
    pub fn free(&mut self, base: usize, npages: usize) {
        if npages == 0 {
            fatal!("free of zero pages at {:#x}", base);
        }
        let base = OffAddr::new(base);
        let used = self.count_used(base, npages);
        if used != npages {
            self.dump_chunk(base.chunk_index());
            fatal!(
                "free of {} pages at {:?} of which only {} are allocated",
                npages,
                base,
                used
            );
        }
        if base < self.search_addr {
            self.search_addr = base;
        }
        if npages == 1 {
            self.chunk_mut(base.chunk_index()).bits.free1(base.chunk_page_index());
        } else {
            let limit = base.add(npages * PAGE_SIZE - 1);
            let (sc, ec) = (base.chunk_index(), limit.chunk_index());
            let (si, ei) = (base.chunk_page_index(), limit.chunk_page_index());
            if sc == ec {
                self.chunk_mut(sc).bits.free(si, ei + 1 - si);
            } else {
                self.chunk_mut(sc).bits.free(si, CHUNK_PAGES - si);
                for ci in sc + 1..ec {
                    self.chunk_mut(ci).bits.free_all();
                }
                self.chunk_mut(ec).bits.free(0, ei + 1);
            }
        }
        self.update(base, npages, true, false);
    }

    fn count_used(&self, base: OffAddr, npages: usize) -> usize {
        let limit = base.add(npages * PAGE_SIZE - 1);
        let (sc, ec) = (base.chunk_index(), limit.chunk_index());
        (sc..=ec)
            .map(|ci| {
                let from = if ci == sc { base.chunk_page_index() } else { 0 };
                let to = if ci == ec { limit.chunk_page_index() + 1 } else { CHUNK_PAGES };
                self.chunk_of(ci).bits.bits().popcnt_range(from, to - from)
            })
            .sum()
    }

    /// Brings the summaries in line with the bitmaps after `npages` pages at
    /// `base` changed. `contig` says the change was one contiguous alloc (or
    /// free, per `alloc`), which lets whole interior chunks skip the bitmap.
    pub(crate) fn update(&mut self, base: OffAddr, npages: usize, contig: bool, alloc: bool) {
        let limit = base.add(npages * PAGE_SIZE - 1);
        let (sc, ec) = (base.chunk_index(), limit.chunk_index());
        let tree = &*self.summary;

        if sc == ec {
            let x = tree.leaf(sc);
            let y = self.chunk_of(sc).summarize();
            if x == y {
                return;
            }
            tree.set_leaf(sc, y);
        } else if contig {
            tree.set_leaf(sc, self.chunk_of(sc).summarize());
            let whole = if alloc { Summary::EMPTY } else { Summary::FREE_CHUNK };
            for ci in sc + 1..ec {
                tree.set_leaf(ci, whole);
            }
            tree.set_leaf(ec, self.chunk_of(ec).summarize());
        } else {
            for ci in sc..=ec {
                tree.set_leaf(ci, self.chunk_of(ci).summarize());
            }
        }
        tree.propagate(base, limit);
    }

    /// Free huge pages that still have physical memory behind them.
    pub fn unscav_huge_pages(&self) -> usize {
        if self.huge_pages == 0 {
            return 0;
        }
        self.chunks.iter().map(|c| c.unscav_huge_pages(self.huge_pages)).sum()
    }

    pub(crate) fn dump_chunk(&self, ci: usize) {
        log::error!("summary[{}][{}] = {:?}", SummaryTree::LEAF, ci, self.summary.leaf(ci));
        if let Some(chunk) = self.chunk(ci) {
            log::error!("chunk {} alloc bits: {:?}", ci, chunk.bits.bits());
            log::error!("chunk {} scavenged: {:?}", ci, chunk.scavenged);
        }
    }
}
