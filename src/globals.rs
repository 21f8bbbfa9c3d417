pub const PAGE_SHIFT: usize = 13;
/// Logical page size. This is the allocator's accounting unit and has nothing
/// to do with the physical page size of the OS.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub const LOG_CHUNK_PAGES: usize = 9;
/// Pages per chunk. A chunk is a leaf of the summary tree.
pub const CHUNK_PAGES: usize = 1 << LOG_CHUNK_PAGES;
pub const LOG_CHUNK_BYTES: usize = LOG_CHUNK_PAGES + PAGE_SHIFT;
pub const CHUNK_BYTES: usize = 1 << LOG_CHUNK_BYTES;

/// Number of pages handed to a `PageCache` at once; one bit per page in a u64.
pub const PAGE_CACHE_PAGES: usize = 64;

#[cfg(target_pointer_width = "64")]
pub const HEAP_ADDR_BITS: usize = 48;
#[cfg(target_pointer_width = "32")]
pub const HEAP_ADDR_BITS: usize = 32;

#[cfg(target_pointer_width = "64")]
pub const SUMMARY_LEVELS: usize = 5;
#[cfg(target_pointer_width = "32")]
pub const SUMMARY_LEVELS: usize = 4;

/// Bits of the address consumed by each level below the root.
pub const SUMMARY_LEVEL_BITS: usize = 3;
pub const SUMMARY_L0_BITS: usize =
    HEAP_ADDR_BITS - LOG_CHUNK_BYTES - (SUMMARY_LEVELS - 1) * SUMMARY_LEVEL_BITS;

/// Largest count a summary field must hold: all pages under a root entry.
pub const LOG_MAX_PACKED_VALUE: usize =
    LOG_CHUNK_PAGES + (SUMMARY_LEVELS - 1) * SUMMARY_LEVEL_BITS;
pub const MAX_PACKED_VALUE: usize = 1 << LOG_MAX_PACKED_VALUE;

/// Offset subtracted from raw addresses to get the linear view used by the
/// search hints. On x86_64 the user half of the address space begins at
/// 0x0000_8000_0000_0000 in this view, which keeps the hint order monotonic
/// even if the heap is ever placed in the upper half.
#[cfg(target_arch = "x86_64")]
pub const ARENA_BASE_OFFSET: usize = 0xffff_8000_0000_0000;
#[cfg(not(target_arch = "x86_64"))]
pub const ARENA_BASE_OFFSET: usize = 0;

/// Total number of chunks addressable by the heap.
pub const MAX_CHUNKS: usize = 1 << (HEAP_ADDR_BITS - LOG_CHUNK_BYTES);
