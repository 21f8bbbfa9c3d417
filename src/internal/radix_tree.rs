use atomic::{Atomic, Ordering};

use super::addr_range::OffAddr;
use super::sparse_array::SparseArray;
use super::summary::Summary;
use crate::globals::{HEAP_ADDR_BITS, LOG_CHUNK_BYTES, PAGE_SHIFT, SUMMARY_LEVELS, SUMMARY_LEVEL_BITS};
use crate::util::{align_down, align_up};

/// Fixed-depth radix tree of free-run summaries over the whole heap address
/// space. Level 0 is the root; the last level has one entry per chunk.
///
/// Entries are atomics so that the scavenger can read leaf summaries without
/// the heap lock. Every write happens with the heap lock held.
pub struct RadixTree<const LEVELS: usize> {
    levels: [SparseArray<Atomic<Summary>>; LEVELS],
}

pub type SummaryTree = RadixTree<SUMMARY_LEVELS>;

impl<const LEVELS: usize> RadixTree<LEVELS> {
    pub const LEAF: usize = LEVELS - 1;

    /// Address bits consumed by level `l`.
    pub const fn level_bits(l: usize) -> usize {
        if l == 0 {
            HEAP_ADDR_BITS - LOG_CHUNK_BYTES - (LEVELS - 1) * SUMMARY_LEVEL_BITS
        } else {
            SUMMARY_LEVEL_BITS
        }
    }

    /// Shift turning a linear address into an entry index at level `l`.
    pub const fn level_shift(l: usize) -> usize {
        LOG_CHUNK_BYTES + (LEVELS - 1 - l) * SUMMARY_LEVEL_BITS
    }

    /// Log2 of the number of pages one entry at level `l` covers.
    pub const fn level_log_pages(l: usize) -> usize {
        Self::level_shift(l) - PAGE_SHIFT
    }

    pub const fn level_len(l: usize) -> usize {
        1 << (HEAP_ADDR_BITS - Self::level_shift(l))
    }

    pub fn new() -> Self {
        Self {
            levels: std::array::from_fn(|l| SparseArray::reserve(Self::level_len(l))),
        }
    }

    /// Entry range `[lo, hi)` at level `l` touched by the inclusive address
    /// range `[base, limit]`, rounded out to whole blocks of siblings.
    pub fn addrs_to_summary_range(l: usize, base: OffAddr, limit: OffAddr) -> (usize, usize) {
        let e = 1 << Self::level_bits(l);
        let sh = Self::level_shift(l);
        let lo = base.linear() >> sh;
        let hi = (limit.linear() >> sh) + 1;
        (align_down(lo, e), align_up(hi, e))
    }

    /// Commits the entries every level needs to describe `[base, limit]`.
    /// Returns the number of bytes newly committed.
    pub fn commit(&self, base: OffAddr, limit: OffAddr) -> usize {
        let mut bytes = 0;
        for (l, level) in self.levels.iter().enumerate() {
            let (lo, hi) = Self::addrs_to_summary_range(l, base, limit);
            bytes += level.commit(lo..hi, || Atomic::new(Summary::EMPTY));
        }
        bytes
    }

    /// Reads an entry. Uncommitted entries read as fully used.
    #[inline]
    pub fn get(&self, l: usize, i: usize) -> Summary {
        match self.levels[l].get(i) {
            Some(entry) => entry.load(Ordering::Relaxed),
            None => Summary::EMPTY,
        }
    }

    #[inline]
    pub fn set(&self, l: usize, i: usize, sum: Summary) {
        match self.levels[l].get(i) {
            Some(entry) => entry.store(sum, Ordering::Relaxed),
            None => fatal!("write of summary {:?} to uncommitted entry summary[{}][{}]", sum, l, i),
        }
    }

    #[inline]
    pub fn leaf(&self, chunk: usize) -> Summary {
        self.get(Self::LEAF, chunk)
    }

    #[inline]
    pub fn set_leaf(&self, chunk: usize, sum: Summary) {
        self.set(Self::LEAF, chunk, sum)
    }

    /// Recomputes the parents of every leaf in `[base, limit]`, level by
    /// level, and stops as soon as a level comes out unchanged.
    pub fn propagate(&self, base: OffAddr, limit: OffAddr) {
        for l in (1..LEVELS).rev() {
            let e = 1 << Self::level_bits(l);
            let log_pages = Self::level_log_pages(l);
            let (lo, hi) = Self::addrs_to_summary_range(l, base, limit);
            let mut changed = false;
            for i in (lo..hi).step_by(e) {
                let sum = Summary::merge((i..i + e).map(|j| self.get(l, j)), log_pages);
                let parent = i >> Self::level_bits(l);
                if self.get(l - 1, parent) != sum {
                    changed = true;
                    self.set(l - 1, parent, sum);
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Summary for the block of `1 << level_bits(l)` siblings at level `l`
    /// whose parent is entry `parent` of level `l - 1`.
    pub fn merge_children(&self, l: usize, parent: usize) -> Summary {
        let b = Self::level_bits(l);
        let first = parent << b;
        Summary::merge(
            (first..first + (1 << b)).map(|j| self.get(l, j)),
            Self::level_log_pages(l),
        )
    }

    pub fn committed_bytes(&self) -> usize {
        self.levels.iter().map(|level| level.committed_bytes()).sum()
    }
}

impl<const LEVELS: usize> Default for RadixTree<LEVELS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::{CHUNK_BYTES, CHUNK_PAGES, LOG_CHUNK_PAGES};

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_geometry() {
        let bits: Vec<_> = (0..5).map(SummaryTree::level_bits).collect();
        assert_eq!(bits, [14, 3, 3, 3, 3]);
        let shifts: Vec<_> = (0..5).map(SummaryTree::level_shift).collect();
        assert_eq!(shifts, [34, 31, 28, 25, 22]);
        let pages: Vec<_> = (0..5).map(SummaryTree::level_log_pages).collect();
        assert_eq!(pages, [21, 18, 15, 12, LOG_CHUNK_PAGES]);
        assert_eq!(SummaryTree::level_len(0), 1 << 14);
        assert_eq!(SummaryTree::level_len(4), 1 << 26);
    }

    #[test]
    fn test_addrs_to_summary_range() {
        let base = OffAddr::from_linear(9 * CHUNK_BYTES);
        let limit = OffAddr::from_linear(20 * CHUNK_BYTES - 1);
        let leaf = SummaryTree::LEAF;
        assert_eq!(SummaryTree::addrs_to_summary_range(leaf, base, limit), (8, 24));
        assert_eq!(SummaryTree::addrs_to_summary_range(leaf - 1, base, limit), (0, 8));
        assert_eq!(
            SummaryTree::addrs_to_summary_range(0, base, limit),
            (0, SummaryTree::level_len(0))
        );
    }

    #[test]
    fn test_propagate() {
        let tree = SummaryTree::new();
        let base = OffAddr::from_linear(64 * CHUNK_BYTES);
        let limit = OffAddr::from_linear(72 * CHUNK_BYTES - 1);
        assert!(tree.commit(base, limit) > 0);
        for ci in 64..72 {
            tree.set_leaf(ci, Summary::FREE_CHUNK);
        }
        tree.set_leaf(67, Summary::pack(1, 100, 2));
        tree.propagate(base, limit);

        let parent = tree.get(SummaryTree::LEAF - 1, 8);
        assert_eq!(parent.unpack(), (3 * CHUNK_PAGES + 1, 4 * CHUNK_PAGES + 2, 4 * CHUNK_PAGES + 2));
        assert_eq!(parent, tree.merge_children(SummaryTree::LEAF, 8));
        let root = tree.get(0, 0);
        assert_eq!(root.start(), 0);
        assert_eq!(root.max(), 4 * CHUNK_PAGES + 2);
        assert_eq!(tree.get(SummaryTree::LEAF, 0), Summary::EMPTY);
    }

    #[test]
    #[should_panic]
    fn test_set_uncommitted() {
        let tree = SummaryTree::new();
        tree.set_leaf(12, Summary::FREE_CHUNK);
    }
}
