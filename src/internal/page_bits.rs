use core::fmt;

use super::summary::Summary;
use crate::globals::CHUNK_PAGES;
use crate::util::align_down;
use crate::util::bits::{clear_consec_bits64, fill_aligned, find_consec_n64, set_consec_bits64};

const WORDS: usize = CHUNK_PAGES / 64;

/// One bit per page of a chunk.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PageBits([u64; WORDS]);

impl PageBits {
    pub const fn new() -> Self {
        Self([0; WORDS])
    }

    pub const fn from_words(words: [u64; WORDS]) -> Self {
        Self(words)
    }

    #[inline]
    pub fn words(&self) -> &[u64; WORDS] {
        &self.0
    }

    #[inline]
    pub fn get(&self, i: usize) -> bool {
        self.0[i / 64] & (1 << (i % 64)) != 0
    }

    /// The aligned 64-bit block containing bit `i`.
    #[inline]
    pub fn block64(&self, i: usize) -> u64 {
        self.0[i / 64]
    }

    #[inline]
    pub fn set1(&mut self, i: usize) {
        self.0[i / 64] |= 1 << (i % 64);
    }

    /// Sets bits `[i, i + n)`.
    pub fn set_range(&mut self, i: usize, n: usize) {
        if n == 0 {
            return;
        }
        if n == 1 {
            self.set1(i);
            return;
        }
        let j = i + n - 1;
        if i / 64 == j / 64 {
            self.0[i / 64] = set_consec_bits64(self.0[i / 64], i % 64, n);
            return;
        }
        self.0[i / 64] = set_consec_bits64(self.0[i / 64], i % 64, 64 - i % 64);
        for k in i / 64 + 1..j / 64 {
            self.0[k] = !0;
        }
        self.0[j / 64] = set_consec_bits64(self.0[j / 64], 0, j % 64 + 1);
    }

    pub fn set_all(&mut self) {
        self.0 = [!0; WORDS];
    }

    #[inline]
    pub fn clear1(&mut self, i: usize) {
        self.0[i / 64] &= !(1 << (i % 64));
    }

    /// Clears bits `[i, i + n)`.
    pub fn clear_range(&mut self, i: usize, n: usize) {
        if n == 0 {
            return;
        }
        if n == 1 {
            self.clear1(i);
            return;
        }
        let j = i + n - 1;
        if i / 64 == j / 64 {
            self.0[i / 64] = clear_consec_bits64(self.0[i / 64], i % 64, n);
            return;
        }
        self.0[i / 64] = clear_consec_bits64(self.0[i / 64], i % 64, 64 - i % 64);
        for k in i / 64 + 1..j / 64 {
            self.0[k] = 0;
        }
        self.0[j / 64] = clear_consec_bits64(self.0[j / 64], 0, j % 64 + 1);
    }

    pub fn clear_all(&mut self) {
        self.0 = [0; WORDS];
    }

    /// Number of set bits in `[i, i + n)`.
    pub fn popcnt_range(&self, i: usize, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let j = i + n - 1;
        if i / 64 == j / 64 {
            let mask = set_consec_bits64(0, 0, n);
            return ((self.0[i / 64] >> (i % 64)) & mask).count_ones() as usize;
        }
        let mut s = (self.0[i / 64] >> (i % 64)).count_ones() as usize;
        for k in i / 64 + 1..j / 64 {
            s += self.0[k].count_ones() as usize;
        }
        s + (self.0[j / 64] & set_consec_bits64(0, 0, j % 64 + 1)).count_ones() as usize
    }

    pub fn count_ones(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl fmt::Debug for PageBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, w) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:#018x}", w)?;
        }
        f.write_str("]")
    }
}

/// Allocation bitmap of a chunk: a set bit is a used page.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct MallocBits(PageBits);

impl MallocBits {
    pub const fn new() -> Self {
        Self(PageBits::new())
    }

    #[inline]
    pub fn bits(&self) -> &PageBits {
        &self.0
    }

    #[inline]
    pub fn is_free(&self, i: usize) -> bool {
        !self.0.get(i)
    }

    /// Packed (start, max, end) description of the free runs of the chunk.
    pub fn summarize(&self) -> Summary {
        let words = self.0.words();
        let mut start = None;
        let mut max = 0;
        let mut cur = 0;
        for &x in words.iter() {
            if x == 0 {
                cur += 64;
                continue;
            }
            // Close the run that reaches into this word from below.
            cur += x.trailing_zeros() as usize;
            if start.is_none() {
                start = Some(cur);
            }
            max = max.max(cur);
            cur = x.leading_zeros() as usize;
        }
        let start = match start {
            Some(start) => start,
            None => return Summary::pack(CHUNK_PAGES, CHUNK_PAGES, CHUNK_PAGES),
        };
        max = max.max(cur);

        // Runs strictly inside a word can't beat a max this large.
        if max < 62 {
            for &w in words.iter() {
                if w == 0 {
                    continue;
                }
                let mut x = w >> w.trailing_zeros();
                // While a zero sits below some one bit.
                while x & x.wrapping_add(1) != 0 {
                    x >>= (!x).trailing_zeros();
                    let zeros = x.trailing_zeros();
                    max = max.max(zeros as usize);
                    x >>= zeros;
                }
            }
        }
        Summary::pack(start, max, cur)
    }

    /// Finds a run of `npages` free pages, starting the search at the word
    /// containing `hint`. Returns the index of the run and the first free
    /// index seen, which is a valid new hint.
    pub fn find(&self, npages: usize, hint: usize) -> Option<(usize, usize)> {
        match npages {
            0 => None,
            1 => self.find1(hint).map(|i| (i, i)),
            2..=64 => self.find_small_n(npages, hint),
            _ => self.find_large_n(npages, hint),
        }
    }

    fn find1(&self, hint: usize) -> Option<usize> {
        let words = self.0.words();
        for i in hint / 64..WORDS {
            let x = words[i];
            if x == !0 {
                continue;
            }
            return Some(i * 64 + (!x).trailing_zeros() as usize);
        }
        None
    }

    fn find_small_n(&self, npages: usize, hint: usize) -> Option<(usize, usize)> {
        let words = self.0.words();
        let mut end = 0;
        let mut new_hint = None;
        for i in hint / 64..WORDS {
            let bi = words[i];
            if bi == !0 {
                end = 0;
                continue;
            }
            if new_hint.is_none() {
                new_hint = Some(i * 64 + (!bi).trailing_zeros() as usize);
            }
            // Straddle the previous word's free tail and this word's free head.
            let start = bi.trailing_zeros() as usize;
            if end + start >= npages {
                return Some((i * 64 - end, new_hint.unwrap_or(i * 64 - end)));
            }
            let j = find_consec_n64(!bi, npages);
            if j < 64 {
                return Some((i * 64 + j, new_hint.unwrap_or(i * 64 + j)));
            }
            end = bi.leading_zeros() as usize;
        }
        None
    }

    fn find_large_n(&self, npages: usize, hint: usize) -> Option<(usize, usize)> {
        let words = self.0.words();
        let mut start = 0;
        let mut size = 0;
        let mut new_hint = None;
        for i in hint / 64..WORDS {
            let x = words[i];
            if x == !0 {
                size = 0;
                continue;
            }
            if new_hint.is_none() {
                new_hint = Some(i * 64 + (!x).trailing_zeros() as usize);
            }
            if size == 0 {
                size = x.leading_zeros() as usize;
                start = i * 64 + 64 - size;
                continue;
            }
            let s = x.trailing_zeros() as usize;
            if s + size >= npages {
                size += s;
                break;
            }
            if s < 64 {
                size = x.leading_zeros() as usize;
                start = i * 64 + 64 - size;
                continue;
            }
            size += 64;
        }
        if size < npages {
            return None;
        }
        Some((start, new_hint.unwrap_or(start)))
    }

    /// Finds and marks `npages` pages. For a single page the returned hint
    /// is the index just past it, since that page is now used.
    pub fn alloc(&mut self, npages: usize, hint: usize) -> Option<(usize, usize)> {
        let (i, new_hint) = self.find(npages, hint)?;
        self.alloc_range(i, npages);
        if npages == 1 {
            return Some((i, i + 1));
        }
        Some((i, new_hint))
    }

    #[inline]
    pub fn alloc_range(&mut self, i: usize, n: usize) {
        self.0.set_range(i, n);
    }

    #[inline]
    pub fn alloc_all(&mut self) {
        self.0.set_all();
    }

    #[inline]
    pub fn free1(&mut self, i: usize) {
        self.0.clear1(i);
    }

    #[inline]
    pub fn free(&mut self, i: usize, n: usize) {
        self.0.clear_range(i, n);
    }

    #[inline]
    pub fn free_all(&mut self) {
        self.0.clear_all();
    }

    /// The 64 allocation bits of the aligned block containing page `i`.
    #[inline]
    pub fn pages64(&self, i: usize) -> u64 {
        self.0.block64(i)
    }
}

/// Per-chunk page state: which pages are used and which free pages have had
/// their physical memory returned to the OS. A page is never both used and
/// scavenged.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct MallocData {
    pub bits: MallocBits,
    pub scavenged: PageBits,
}

impl MallocData {
    /// A fresh chunk: every page free and scavenged.
    pub fn new_scavenged() -> Self {
        let mut scavenged = PageBits::new();
        scavenged.set_all();
        Self {
            bits: MallocBits::new(),
            scavenged,
        }
    }

    /// Marks `[i, i + n)` used and returns how many of those pages were
    /// scavenged.
    pub fn alloc_range(&mut self, i: usize, n: usize) -> usize {
        let scav = self.scavenged.popcnt_range(i, n);
        self.bits.alloc_range(i, n);
        self.scavenged.clear_range(i, n);
        scav
    }

    pub fn alloc_all(&mut self) -> usize {
        let scav = self.scavenged.count_ones();
        self.bits.alloc_all();
        self.scavenged.clear_all();
        scav
    }

    #[inline]
    pub fn summarize(&self) -> Summary {
        self.bits.summarize()
    }

    /// Marks `[base, base + npages)` scavenged.
    #[inline]
    pub fn scavenge_range(&mut self, base: usize, npages: usize) {
        self.scavenged.set_range(base, npages);
    }

    /// Whether any page at or below the block of `search_idx` is free and
    /// unscavenged in a `min`-aligned group.
    pub fn has_scavenge_candidate(&self, search_idx: usize, min: usize) -> bool {
        (0..=search_idx / 64).rev().any(|i| {
            fill_aligned(self.scavenged.block64(i * 64) | self.bits.pages64(i * 64), min) != !0
        })
    }

    /// Finds the highest run of free and unscavenged pages at or below the
    /// block containing `search_idx`, made of whole `min`-page groups, and
    /// returns `(start, size)` with `size` truncated to `max` pages (rounded
    /// up to `min`).
    ///
    /// If truncation would split a free-and-unscavenged huge page of
    /// `huge_pages` pages, the start is lowered to the huge page boundary so
    /// that the whole huge page is released together.
    pub fn find_scavenge_candidate(
        &self,
        search_idx: usize,
        min: usize,
        max: usize,
        huge_pages: usize,
    ) -> Option<(usize, usize)> {
        if min == 0 || min > 64 || !min.is_power_of_two() {
            fatal!("bad scavenge alignment of {} pages", min);
        }
        let max = if max == 0 { min } else { crate::util::align_up(max, min) };
        // 1s are used or scavenged, so 0s are candidates.
        let word = |i: usize| fill_aligned(self.scavenged.block64(i * 64) | self.bits.pages64(i * 64), min);

        let mut i = search_idx / 64;
        loop {
            if word(i) != !0 {
                break;
            }
            if i == 0 {
                return None;
            }
            i -= 1;
        }

        let x = word(i);
        let z1 = (!x).leading_zeros() as usize;
        let end = i * 64 + (64 - z1);
        let run = if z1 < 64 && x << z1 != 0 {
            (x << z1).leading_zeros() as usize
        } else {
            // The run reaches the bottom of this word and may continue below.
            let mut run = 64 - z1;
            for j in (0..i).rev() {
                let x = word(j);
                run += x.leading_zeros() as usize;
                if x != 0 {
                    break;
                }
            }
            run
        };

        let mut size = run.min(max);
        let mut start = end - size;

        if huge_pages > 1 {
            let above = crate::util::align_up(start, huge_pages);
            if above <= end {
                let below = align_down(start, huge_pages);
                if below >= end - run {
                    size += start - below;
                    start = below;
                }
            }
        }
        Some((start, size))
    }

    /// Number of huge pages of `huge_pages` pages that are entirely free and
    /// unscavenged.
    pub fn unscav_huge_pages(&self, huge_pages: usize) -> usize {
        if huge_pages <= 1 || huge_pages > CHUNK_PAGES {
            return 0;
        }
        let mut n = 0;
        let mut i = 0;
        while i < CHUNK_PAGES {
            if self.bits.0.popcnt_range(i, huge_pages) == 0 && self.scavenged.popcnt_range(i, huge_pages) == 0 {
                n += 1;
            }
            i += huge_pages;
        }
        n
    }
}
