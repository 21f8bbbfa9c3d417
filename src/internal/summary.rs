use core::fmt;
use modular_bitfield::prelude::*;

use crate::globals::{CHUNK_PAGES, LOG_MAX_PACKED_VALUE, MAX_PACKED_VALUE};

#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
struct PackedSummary {
    start: B21,
    max: B21,
    end: B21,
    #[skip]
    __: B1,
}

/// Packed description of the free runs in a region of pages: the free run at
/// the start of the region, the longest free run anywhere in it and the free
/// run at its end.
///
/// Each count takes 21 bits. A count of `MAX_PACKED_VALUE` does not fit, but
/// it only happens when the whole region is free, so bit 63 alone stands for
/// start = max = end = `MAX_PACKED_VALUE`. The zero value is a fully used
/// region.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Summary(u64);

const FULL_BIT: u64 = 1 << 63;

impl Summary {
    /// Fully used region.
    pub const EMPTY: Summary = Summary(0);
    /// A chunk with every page free.
    pub const FREE_CHUNK: Summary = Summary(
        (CHUNK_PAGES as u64)
            | ((CHUNK_PAGES as u64) << LOG_MAX_PACKED_VALUE)
            | ((CHUNK_PAGES as u64) << (2 * LOG_MAX_PACKED_VALUE)),
    );

    pub fn pack(start: usize, max: usize, end: usize) -> Self {
        if max == MAX_PACKED_VALUE {
            return Summary(FULL_BIT);
        }
        debug_assert!(start <= max && end <= max, "bad summary ({}, {}, {})", start, max, end);
        let packed = PackedSummary::new()
            .with_start(start as u32)
            .with_max(max as u32)
            .with_end(end as u32);
        Summary(u64::from_le_bytes(packed.into_bytes()))
    }

    #[inline]
    fn fields(self) -> PackedSummary {
        PackedSummary::from_bytes(self.0.to_le_bytes())
    }

    #[inline]
    pub fn start(self) -> usize {
        if self.0 & FULL_BIT != 0 {
            return MAX_PACKED_VALUE;
        }
        self.fields().start() as usize
    }

    #[inline]
    pub fn max(self) -> usize {
        if self.0 & FULL_BIT != 0 {
            return MAX_PACKED_VALUE;
        }
        self.fields().max() as usize
    }

    #[inline]
    pub fn end(self) -> usize {
        if self.0 & FULL_BIT != 0 {
            return MAX_PACKED_VALUE;
        }
        self.fields().end() as usize
    }

    pub fn unpack(self) -> (usize, usize, usize) {
        if self.0 & FULL_BIT != 0 {
            return (MAX_PACKED_VALUE, MAX_PACKED_VALUE, MAX_PACKED_VALUE);
        }
        let f = self.fields();
        (f.start() as usize, f.max() as usize, f.end() as usize)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn to_bits(self) -> u64 {
        self.0
    }

    /// Combines the summaries of consecutive sibling regions of
    /// `1 << log_entry_pages` pages each into the summary of their parent.
    pub fn merge<I>(entries: I, log_entry_pages: usize) -> Summary
    where
        I: IntoIterator<Item = Summary>,
    {
        let entry_pages = 1usize << log_entry_pages;
        let mut iter = entries.into_iter();
        let (mut start, mut max, mut end) = match iter.next() {
            Some(first) => first.unpack(),
            None => return Summary::EMPTY,
        };
        for (j, sum) in iter.enumerate() {
            let (si, mi, ei) = sum.unpack();
            // Every entry so far was completely free.
            if start == (j + 1) * entry_pages {
                start += si;
            }
            max = max.max(end + si).max(mi);
            if ei == entry_pages {
                end += entry_pages;
            } else {
                end = ei;
            }
        }
        Summary::pack(start, max, end)
    }
}

impl fmt::Debug for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (start, max, end) = self.unpack();
        write!(f, "({}, {}, {})", start, max, end)
    }
}
