use std::mem::size_of;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

pub const ENTRIES_PER_BLOCK: usize = 4096;

/// Array whose whole index space is reserved up front but whose backing
/// storage is committed lazily, a block of `ENTRIES_PER_BLOCK` entries at a
/// time.
///
/// Reads of uncommitted entries return `None`. Committing never moves
/// existing entries, so a reference obtained from `get` stays valid for the
/// lifetime of the array.
pub struct SparseArray<T> {
    blocks: Box<[OnceLock<Box<[T]>>]>,
    len: usize,
    committed_blocks: AtomicUsize,
}

impl<T> SparseArray<T> {
    pub fn reserve(len: usize) -> Self {
        let nblocks = (len + ENTRIES_PER_BLOCK - 1) / ENTRIES_PER_BLOCK;
        Self {
            blocks: (0..nblocks).map(|_| OnceLock::new()).collect(),
            len,
            committed_blocks: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn block_len(&self, block: usize) -> usize {
        (self.len - block * ENTRIES_PER_BLOCK).min(ENTRIES_PER_BLOCK)
    }

    /// Makes every entry in `range` addressable, initializing fresh blocks
    /// with `init`. Returns the number of bytes newly committed.
    pub fn commit(&self, range: Range<usize>, init: impl Fn() -> T) -> usize {
        if range.start >= range.end {
            return 0;
        }
        if range.end > self.len {
            fatal!(
                "commit of [{}, {}) outside of reservation of {} entries",
                range.start,
                range.end,
                self.len
            );
        }
        let first = range.start / ENTRIES_PER_BLOCK;
        let last = (range.end - 1) / ENTRIES_PER_BLOCK;
        let mut bytes = 0;
        for block in first..=last {
            if self.blocks[block].get().is_some() {
                continue;
            }
            let n = self.block_len(block);
            let mut fresh = false;
            self.blocks[block].get_or_init(|| {
                fresh = true;
                (0..n).map(|_| init()).collect()
            });
            if fresh {
                self.committed_blocks.fetch_add(1, Ordering::Relaxed);
                bytes += n * size_of::<T>();
            }
        }
        bytes
    }

    #[inline]
    pub fn is_committed(&self, index: usize) -> bool {
        index < self.len && self.blocks[index / ENTRIES_PER_BLOCK].get().is_some()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        self.blocks[index / ENTRIES_PER_BLOCK]
            .get()
            .map(|block| &block[index % ENTRIES_PER_BLOCK])
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len {
            return None;
        }
        self.blocks[index / ENTRIES_PER_BLOCK]
            .get_mut()
            .map(|block| &mut block[index % ENTRIES_PER_BLOCK])
    }

    /// Bytes of backing storage committed so far, excluding the block table.
    pub fn committed_bytes(&self) -> usize {
        let mut total = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            if block.get().is_some() {
                total += self.block_len(i) * size_of::<T>();
            }
        }
        total
    }

    pub fn committed_blocks(&self) -> usize {
        self.committed_blocks.load(Ordering::Relaxed)
    }
}
