use core::fmt;

use crate::globals::{ARENA_BASE_OFFSET, CHUNK_BYTES, HEAP_ADDR_BITS, PAGE_SIZE};

/// An address in the linear view of the address space.
///
/// Raw addresses are shifted by `ARENA_BASE_OFFSET` so that comparisons
/// follow heap order even on platforms whose address space is split.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OffAddr(usize);

impl OffAddr {
    /// Bottom of the linear view. Never part of the heap.
    pub const MIN: OffAddr = OffAddr(0);
    /// Top of the linear view. Used as the "heap exhausted" search hint.
    pub const MAX: OffAddr = OffAddr(usize::MAX >> (usize::BITS as usize - HEAP_ADDR_BITS));

    #[inline]
    pub const fn new(addr: usize) -> Self {
        OffAddr(addr.wrapping_sub(ARENA_BASE_OFFSET))
    }

    #[inline]
    pub const fn from_linear(linear: usize) -> Self {
        OffAddr(linear)
    }

    #[inline]
    pub const fn linear(self) -> usize {
        self.0
    }

    /// The raw address.
    #[inline]
    pub const fn addr(self) -> usize {
        self.0.wrapping_add(ARENA_BASE_OFFSET)
    }

    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        OffAddr(self.0 + bytes)
    }

    #[inline]
    pub const fn sub(self, bytes: usize) -> Self {
        OffAddr(self.0 - bytes)
    }

    #[inline]
    pub const fn diff(self, other: OffAddr) -> usize {
        self.0 - other.0
    }

    #[inline]
    pub const fn chunk_index(self) -> usize {
        self.0 / CHUNK_BYTES
    }

    /// Index of the page inside its chunk.
    #[inline]
    pub const fn chunk_page_index(self) -> usize {
        (self.0 % CHUNK_BYTES) / PAGE_SIZE
    }

    #[inline]
    pub const fn chunk_base(chunk: usize) -> Self {
        OffAddr(chunk * CHUNK_BYTES)
    }
}

impl fmt::Debug for OffAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

/// Half-open range of addresses `[base, limit)`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AddrRange {
    pub base: OffAddr,
    pub limit: OffAddr,
}

impl AddrRange {
    /// Builds a range from raw addresses.
    pub const fn new(base: usize, limit: usize) -> Self {
        Self {
            base: OffAddr::new(base),
            limit: OffAddr::new(limit),
        }
    }

    pub const fn start(&self) -> usize {
        self.base.addr()
    }

    pub const fn end(&self) -> usize {
        self.limit.addr()
    }

    pub fn size(&self) -> usize {
        if self.base < self.limit {
            self.limit.diff(self.base)
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        let a = OffAddr::new(addr);
        a >= self.base && a < self.limit
    }

    /// Removes the part of `self` that overlaps `b`. `b` may cover one side of
    /// `self` or all of it; cutting a hole in the middle is a bug.
    pub fn subtract(self, b: AddrRange) -> AddrRange {
        let mut a = self;
        if a.base >= b.base && a.limit <= b.limit {
            return AddrRange::default();
        } else if a.base < b.base && a.limit > b.limit {
            fatal!("bad prune: {:?} splits {:?}", b, a);
        } else if a.limit > b.limit && a.base < b.limit {
            a.base = b.limit;
        } else if a.base < b.base && a.limit > b.base {
            a.limit = b.base;
        }
        a
    }
}

impl fmt::Debug for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.base, self.limit)
    }
}

/// Sorted set of disjoint address ranges, coalesced as they are added.
#[derive(Clone, Default, Debug)]
pub struct AddrRanges {
    ranges: Vec<AddrRange>,
    total_bytes: usize,
}

impl AddrRanges {
    pub fn new() -> Self {
        Self {
            ranges: Vec::with_capacity(16),
            total_bytes: 0,
        }
    }

    pub fn ranges(&self) -> &[AddrRange] {
        &self.ranges
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Index of the first range whose base is above `addr`.
    pub fn find_succ(&self, addr: usize) -> usize {
        let base = OffAddr::new(addr);
        self.ranges.partition_point(|r| r.base <= base)
    }

    pub fn contains(&self, addr: usize) -> bool {
        let i = self.find_succ(addr);
        i != 0 && self.ranges[i - 1].contains(addr)
    }

    /// Inserts `r`, which must not overlap anything already present.
    pub fn add(&mut self, r: AddrRange) {
        if r.is_empty() {
            return;
        }
        let i = self.find_succ(r.start());
        let down = i > 0 && self.ranges[i - 1].limit == r.base;
        let up = i < self.ranges.len() && r.limit == self.ranges[i].base;
        match (down, up) {
            (true, true) => {
                self.ranges[i - 1].limit = self.ranges[i].limit;
                self.ranges.remove(i);
            }
            (true, false) => self.ranges[i - 1].limit = r.limit,
            (false, true) => self.ranges[i].base = r.base,
            (false, false) => self.ranges.insert(i, r),
        }
        self.total_bytes += r.size();
    }

    /// Removes and returns the top `nbytes` of the highest range, or the
    /// whole highest range if it is smaller.
    pub fn remove_last(&mut self, nbytes: usize) -> AddrRange {
        let last = match self.ranges.last_mut() {
            Some(last) => last,
            None => return AddrRange::default(),
        };
        let r = *last;
        let size = r.size();
        if size > nbytes {
            let new_limit = r.limit.sub(nbytes);
            last.limit = new_limit;
            self.total_bytes -= nbytes;
            return AddrRange {
                base: new_limit,
                limit: r.limit,
            };
        }
        self.ranges.pop();
        self.total_bytes -= size;
        r
    }

    /// Drops everything at or above `addr`, splitting the range containing it.
    pub fn remove_above(&mut self, addr: usize) {
        let pivot = self.find_succ(addr);
        if pivot == 0 {
            self.ranges.clear();
            self.total_bytes = 0;
            return;
        }
        let mut removed: usize = self.ranges[pivot..].iter().map(|r| r.size()).sum();
        let r = self.ranges[pivot - 1];
        if r.contains(addr) {
            let kept = r.subtract(AddrRange {
                base: OffAddr::new(addr),
                limit: OffAddr::MAX,
            });
            removed += r.size() - kept.size();
            self.ranges[pivot - 1] = kept;
        }
        self.ranges.truncate(pivot);
        self.ranges.retain(|r| !r.is_empty());
        self.total_bytes -= removed;
    }

    /// Deep copy of `self` into `other`, reusing `other`'s storage.
    pub fn clone_into(&self, other: &mut AddrRanges) {
        other.ranges.clear();
        other.ranges.extend_from_slice(&self.ranges);
        other.total_bytes = self.total_bytes;
    }
}
