//! Building page allocators from bitmap descriptions and checking them
//! against their own summaries. Used by tests and debugging tools.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::globals::{CHUNK_BYTES, CHUNK_PAGES, SUMMARY_LEVELS};
use crate::internal::addr_range::OffAddr;
use crate::internal::page_bits::{MallocData, PageBits};
use crate::internal::radix_tree::SummaryTree;
use crate::internal::summary::Summary;
use crate::page_alloc::PageAlloc;

/// Pages `[i, i + n)` of a chunk.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BitRange {
    pub i: usize,
    pub n: usize,
}

impl BitRange {
    pub const fn new(i: usize, n: usize) -> Self {
        Self { i, n }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    #[error("summary[{level}][{index}] is {found:?}, its contents say {expected:?}")]
    Summary {
        level: usize,
        index: usize,
        found: Summary,
        expected: Summary,
    },
    #[error("chunk {chunk} word {word}: pages {overlap:#018x} are used and scavenged")]
    UsedAndScavenged { chunk: usize, word: usize, overlap: u64 },
}

fn bit_ranges(bits: &PageBits) -> Vec<BitRange> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < CHUNK_PAGES {
        if !bits.get(i) {
            i += 1;
            continue;
        }
        let start = i;
        while i < CHUNK_PAGES && bits.get(i) {
            i += 1;
        }
        out.push(BitRange::new(start, i - start));
    }
    out
}

impl PageAlloc {
    /// A page allocator whose heap is exactly the chunks named in `alloc`.
    /// Pages in `alloc` are used and pages in `scav` are scavenged. Chunks
    /// absent from `scav` start with nothing scavenged.
    pub fn from_bit_ranges(
        alloc: &BTreeMap<usize, Vec<BitRange>>,
        scav: &BTreeMap<usize, Vec<BitRange>>,
    ) -> PageAlloc {
        Self::from_bit_ranges_with(alloc, scav, 4096, 0)
    }

    pub fn from_bit_ranges_with(
        alloc: &BTreeMap<usize, Vec<BitRange>>,
        scav: &BTreeMap<usize, Vec<BitRange>>,
        phys_page_size: usize,
        phys_huge_page_size: usize,
    ) -> PageAlloc {
        let mut pages = PageAlloc::new(phys_page_size, phys_huge_page_size);
        for &ci in alloc.keys() {
            pages.grow(OffAddr::chunk_base(ci).addr(), CHUNK_BYTES);
        }
        for (&ci, ranges) in alloc {
            let chunk = pages.chunk_mut(ci);
            chunk.scavenged.clear_all();
            for r in ranges {
                chunk.alloc_range(r.i, r.n);
            }
            if let Some(scav) = scav.get(&ci) {
                for r in scav {
                    chunk.scavenge_range(r.i, r.n);
                }
            }
            pages.update(OffAddr::chunk_base(ci), CHUNK_PAGES, false, false);
        }
        pages.init_scav_state();
        pages
    }

    /// Points the scavenger at the top of the heap, as if a new cycle had
    /// just been paced.
    pub fn init_scav_state(&mut self) {
        self.reset_scavenge_addr();
    }

    /// The used and scavenged ranges of chunk `ci`, in the shape
    /// `from_bit_ranges` takes.
    pub fn chunk_data(&self, ci: usize) -> Option<(Vec<BitRange>, Vec<BitRange>)> {
        let chunk: &MallocData = self.chunk(ci)?;
        Some((bit_ranges(chunk.bits.bits()), bit_ranges(&chunk.scavenged)))
    }

    pub fn leaf_summary(&self, ci: usize) -> Summary {
        self.summary.leaf(ci)
    }

    pub fn summary_at(&self, level: usize, index: usize) -> Summary {
        self.summary.get(level, index)
    }

    fn chunks(&self) -> impl Iterator<Item = (usize, &MallocData)> + '_ {
        let (start, end) = self.bounds();
        (start..end).filter_map(move |ci| Some((ci, self.chunk(ci)?)))
    }

    /// Free pages in the whole heap.
    pub fn free_pages(&self) -> usize {
        self.chunks()
            .map(|(_, c)| CHUNK_PAGES - c.bits.bits().count_ones())
            .sum()
    }

    /// Free pages that still have physical memory behind them.
    pub fn free_unscavenged_pages(&self) -> usize {
        self.chunks()
            .map(|(_, c)| {
                c.bits
                    .bits()
                    .words()
                    .iter()
                    .zip(c.scavenged.words())
                    .map(|(&a, &s)| (!(a | s)).count_ones() as usize)
                    .sum::<usize>()
            })
            .sum()
    }

    /// Re-derives every summary of the heap from the bitmaps and compares
    /// it with the tree. Also checks that no page is used and scavenged.
    pub fn verify_summaries(&self) -> Result<(), Inconsistency> {
        let leaf = SummaryTree::LEAF;
        for (ci, chunk) in self.chunks() {
            let (used, scav) = (chunk.bits.bits().words(), chunk.scavenged.words());
            for (word, (&a, &s)) in used.iter().zip(scav).enumerate() {
                if a & s != 0 {
                    return Err(Inconsistency::UsedAndScavenged {
                        chunk: ci,
                        word,
                        overlap: a & s,
                    });
                }
            }
        }

        for r in self.in_use().ranges() {
            let limit = r.limit.sub(1);
            let (lo, hi) = SummaryTree::addrs_to_summary_range(leaf, r.base, limit);
            for ci in lo..hi {
                let expected = match self.chunk(ci) {
                    Some(chunk) => chunk.summarize(),
                    None => Summary::EMPTY,
                };
                let found = self.summary.leaf(ci);
                if found != expected {
                    return Err(Inconsistency::Summary {
                        level: leaf,
                        index: ci,
                        found,
                        expected,
                    });
                }
            }
            for l in (1..SUMMARY_LEVELS).rev() {
                let b = SummaryTree::level_bits(l);
                let (lo, hi) = SummaryTree::addrs_to_summary_range(l, r.base, limit);
                for i in (lo..hi).step_by(1 << b) {
                    let parent = i >> b;
                    let expected = self.summary.merge_children(l, parent);
                    let found = self.summary.get(l - 1, parent);
                    if found != expected {
                        return Err(Inconsistency::Summary {
                            level: l - 1,
                            index: parent,
                            found,
                            expected,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::PAGE_SIZE;

    const BASE: usize = 0xc000 << 22;

    fn base_chunk() -> usize {
        OffAddr::new(BASE).chunk_index()
    }

    #[test]
    fn test_from_bit_ranges() {
        let ci = base_chunk();
        let alloc = BTreeMap::from([
            (ci, vec![BitRange::new(0, 10), BitRange::new(500, 12)]),
            (ci + 2, vec![BitRange::new(0, CHUNK_PAGES)]),
        ]);
        let scav = BTreeMap::from([(ci, vec![BitRange::new(100, 28)])]);
        let pages = PageAlloc::from_bit_ranges(&alloc, &scav);

        assert_eq!(pages.bounds(), (ci, ci + 3));
        assert!(!pages.has_chunk(ci + 1));
        assert_eq!(pages.leaf_summary(ci).unpack(), (0, 490, 0));
        assert_eq!(pages.leaf_summary(ci + 2), Summary::EMPTY);
        assert_eq!(
            pages.chunk_data(ci),
            Some((
                vec![BitRange::new(0, 10), BitRange::new(500, 12)],
                vec![BitRange::new(100, 28)]
            ))
        );
        assert_eq!(pages.chunk_data(ci + 1), None);
        assert_eq!(pages.free_pages(), 490);
        assert_eq!(pages.free_unscavenged_pages(), 490 - 28);
        assert_eq!(pages.scav_addr(), OffAddr::chunk_base(ci + 3).sub(1));
        pages.verify_summaries().unwrap();
    }

    #[test]
    fn test_verify_catches_stale_summary() {
        let ci = base_chunk();
        let alloc = BTreeMap::from([(ci, vec![BitRange::new(0, 1)])]);
        let mut pages = PageAlloc::from_bit_ranges(&alloc, &BTreeMap::new());
        // Change the bitmap behind the tree's back.
        pages.chunk_mut(ci).alloc_range(1, 1);
        assert_eq!(
            pages.verify_summaries(),
            Err(Inconsistency::Summary {
                level: SummaryTree::LEAF,
                index: ci,
                found: Summary::pack(0, CHUNK_PAGES - 1, CHUNK_PAGES - 1),
                expected: Summary::pack(0, CHUNK_PAGES - 2, CHUNK_PAGES - 2),
            })
        );

        pages.update(OffAddr::chunk_base(ci), 1, false, true);
        pages.verify_summaries().unwrap();
        // A stale parent is caught as well.
        let root = OffAddr::chunk_base(ci).linear() >> SummaryTree::level_shift(0);
        let good = pages.summary_at(0, root);
        pages.summary_tree().set(0, root, Summary::EMPTY);
        assert!(matches!(
            pages.verify_summaries(),
            Err(Inconsistency::Summary { level: 0, .. })
        ));
        pages.summary_tree().set(0, root, good);
        pages.verify_summaries().unwrap();
    }

    #[test]
    fn test_verify_catches_used_and_scavenged() {
        let ci = base_chunk();
        let alloc = BTreeMap::from([(ci, vec![BitRange::new(64, 2)])]);
        let mut pages = PageAlloc::from_bit_ranges(&alloc, &BTreeMap::new());
        pages.chunk_mut(ci).scavenge_range(65, 3);
        assert_eq!(
            pages.verify_summaries(),
            Err(Inconsistency::UsedAndScavenged {
                chunk: ci,
                word: 1,
                overlap: 0b10,
            })
        );
        assert_eq!(pages.free_pages() * PAGE_SIZE, (CHUNK_PAGES - 2) * PAGE_SIZE);
    }
}
