//! Virtual memory primitives the heap is built on.
//!
//! Addresses handed to `SysMemory` are aligned to the physical page size by
//! the caller. The logical page size of the heap is a multiple of it.

use std::io;

use parking_lot::Mutex;
use thiserror::Error;

use crate::util::align_up;

#[derive(Error, Debug)]
pub enum SysError {
    #[error("failed to reserve {size:#x} bytes of address space: {source}")]
    Reserve { size: usize, source: io::Error },
    #[error("failed to map {size:#x} bytes at {addr:#x}: {source}")]
    Map {
        addr: usize,
        size: usize,
        source: io::Error,
    },
    #[error("failed to allocate {size:#x} bytes: {source}")]
    Alloc { size: usize, source: io::Error },
    #[error("address space limit reached: {size:#x} bytes requested, {left:#x} left")]
    Exhausted { size: usize, left: usize },
}

/// The OS side of the heap.
///
/// Memory goes through three states: reserved (address space only, any
/// access faults), mapped (usable, may or may not have physical backing)
/// and unused (mapped, but the OS may drop the physical pages and hand back
/// zeroes on the next touch).
pub trait SysMemory: Send + Sync {
    /// Reserves `size` bytes of address space aligned to `align`.
    fn reserve(&self, size: usize, align: usize) -> Result<usize, SysError>;
    /// Makes reserved memory usable.
    fn map(&self, addr: usize, size: usize) -> Result<(), SysError>;
    /// Reserves and maps in one step. Used for memory outside the heap.
    fn alloc(&self, size: usize) -> Result<usize, SysError>;
    /// Gives the address space back.
    fn free(&self, addr: usize, size: usize);
    /// Lets the OS reclaim the physical memory behind the range.
    fn unused(&self, addr: usize, size: usize);
    /// Announces that a range passed to `unused` is about to be touched again.
    fn used(&self, addr: usize, size: usize);
    /// Makes any access to the range fault. Debugging aid.
    fn fault(&self, addr: usize, size: usize);
    fn phys_page_size(&self) -> usize;
    /// Transparent huge page size, or 0 if huge pages are unavailable.
    fn phys_huge_page_size(&self) -> usize;
}

#[cfg(windows)]
pub mod _win {
    use super::*;

    use core::ptr::null_mut;
    use std::mem::MaybeUninit;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        sysinfoapi::GetSystemInfo,
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
    };

    pub struct OsMemory {
        page_size: usize,
    }

    impl OsMemory {
        pub fn new() -> Self {
            let page_size = unsafe {
                let mut info = MaybeUninit::zeroed();
                GetSystemInfo(info.as_mut_ptr());
                info.assume_init().dwPageSize as usize
            };
            Self { page_size }
        }
    }

    impl Default for OsMemory {
        fn default() -> Self {
            Self::new()
        }
    }

    impl SysMemory for OsMemory {
        fn reserve(&self, size: usize, align: usize) -> Result<usize, SysError> {
            unsafe {
                // Reserve with slack to learn an aligned address, then reserve
                // exactly there. Windows cannot release part of a reservation.
                let mem = VirtualAlloc(null_mut(), size + align, MEM_RESERVE, PAGE_NOACCESS);
                if mem.is_null() {
                    return Err(SysError::Reserve {
                        size,
                        source: io::Error::last_os_error(),
                    });
                }
                VirtualFree(mem, 0, MEM_RELEASE);
                let aligned = align_up(mem as usize, align);
                let mem = VirtualAlloc(aligned as *mut _, size, MEM_RESERVE, PAGE_NOACCESS);
                if mem.is_null() {
                    return Err(SysError::Reserve {
                        size,
                        source: io::Error::last_os_error(),
                    });
                }
                Ok(mem as usize)
            }
        }

        fn map(&self, addr: usize, size: usize) -> Result<(), SysError> {
            let mem = unsafe { VirtualAlloc(addr as *mut _, size, MEM_COMMIT, PAGE_READWRITE) };
            if mem.is_null() {
                return Err(SysError::Map {
                    addr,
                    size,
                    source: io::Error::last_os_error(),
                });
            }
            Ok(())
        }

        fn alloc(&self, size: usize) -> Result<usize, SysError> {
            let mem = unsafe { VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
            if mem.is_null() {
                return Err(SysError::Alloc {
                    size,
                    source: io::Error::last_os_error(),
                });
            }
            Ok(mem as usize)
        }

        fn free(&self, addr: usize, _size: usize) {
            unsafe {
                VirtualFree(addr as *mut _, 0, MEM_RELEASE);
            }
        }

        fn unused(&self, addr: usize, size: usize) {
            unsafe {
                VirtualFree(addr as *mut _, size, MEM_DECOMMIT);
            }
        }

        fn used(&self, addr: usize, size: usize) {
            unsafe {
                VirtualAlloc(addr as *mut _, size, MEM_COMMIT, PAGE_READWRITE);
            }
        }

        fn fault(&self, addr: usize, size: usize) {
            unsafe {
                VirtualFree(addr as *mut _, size, MEM_DECOMMIT);
            }
        }

        fn phys_page_size(&self) -> usize {
            self.page_size
        }

        fn phys_huge_page_size(&self) -> usize {
            0
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use super::*;

    use std::ptr::null_mut;

    pub struct OsMemory {
        page_size: usize,
        huge_page_size: usize,
    }

    impl OsMemory {
        pub fn new() -> Self {
            let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
                n if n > 0 => n as usize,
                _ => 4096,
            };
            Self {
                page_size,
                huge_page_size: huge_page_size(),
            }
        }
    }

    impl Default for OsMemory {
        fn default() -> Self {
            Self::new()
        }
    }

    #[cfg(target_os = "linux")]
    fn huge_page_size() -> usize {
        std::fs::read_to_string("/sys/kernel/mm/transparent_hugepage/hpage_pmd_size")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .filter(|&n: &usize| n.is_power_of_two())
            .unwrap_or(0)
    }

    #[cfg(not(target_os = "linux"))]
    fn huge_page_size() -> usize {
        0
    }

    unsafe fn mmap(size: usize, prot: libc::c_int) -> Result<usize, io::Error> {
        let map = libc::mmap(
            null_mut(),
            size as _,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if map == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(map as usize)
    }

    impl SysMemory for OsMemory {
        fn reserve(&self, size: usize, align: usize) -> Result<usize, SysError> {
            let align = align.max(self.page_size);
            unsafe {
                let map = mmap(size + align, libc::PROT_NONE)
                    .map_err(|source| SysError::Reserve { size, source })?;
                // Trim the slack on both sides of the aligned part.
                let start = align_up(map, align);
                if start > map {
                    libc::munmap(map as *mut _, start - map);
                }
                let tail = map + size + align - (start + size);
                if tail > 0 {
                    libc::munmap((start + size) as *mut _, tail);
                }
                Ok(start)
            }
        }

        fn map(&self, addr: usize, size: usize) -> Result<(), SysError> {
            let res = unsafe { libc::mprotect(addr as *mut _, size, libc::PROT_READ | libc::PROT_WRITE) };
            if res != 0 {
                return Err(SysError::Map {
                    addr,
                    size,
                    source: io::Error::last_os_error(),
                });
            }
            Ok(())
        }

        fn alloc(&self, size: usize) -> Result<usize, SysError> {
            unsafe {
                mmap(size, libc::PROT_READ | libc::PROT_WRITE)
                    .map_err(|source| SysError::Alloc { size, source })
            }
        }

        fn free(&self, addr: usize, size: usize) {
            unsafe {
                libc::munmap(addr as *mut _, size);
            }
        }

        fn unused(&self, addr: usize, size: usize) {
            unsafe {
                libc::madvise(addr as *mut _, size, libc::MADV_DONTNEED);
            }
        }

        fn used(&self, _addr: usize, _size: usize) {
            // Pages released with MADV_DONTNEED come back zeroed on first touch.
        }

        fn fault(&self, addr: usize, size: usize) {
            unsafe {
                libc::mprotect(addr as *mut _, size, libc::PROT_NONE);
            }
        }

        fn phys_page_size(&self) -> usize {
            self.page_size
        }

        fn phys_huge_page_size(&self) -> usize {
            self.huge_page_size
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

#[cfg(target_pointer_width = "64")]
const NOOP_BASE: usize = 0xc000 << 22;
#[cfg(target_pointer_width = "32")]
const NOOP_BASE: usize = 0x4000_0000;

/// Memory that is never backed by anything. Reservations are carved out of
/// a fictitious address range and every release is recorded, which makes the
/// heap fully observable in tests. Nothing may dereference these addresses.
pub struct NoopMemory {
    phys_page_size: usize,
    phys_huge_page_size: usize,
    state: Mutex<NoopState>,
}

#[derive(Default)]
struct NoopState {
    next: usize,
    gap: usize,
    limit: usize,
    reserved: usize,
    mapped: usize,
    released: usize,
    unused_calls: Vec<(usize, usize)>,
}

impl NoopMemory {
    pub fn new() -> Self {
        Self::with_page_sizes(4096, 0)
    }

    pub fn with_page_sizes(phys_page_size: usize, phys_huge_page_size: usize) -> Self {
        Self {
            phys_page_size,
            phys_huge_page_size,
            state: Mutex::new(NoopState {
                next: NOOP_BASE,
                limit: usize::MAX,
                ..NoopState::default()
            }),
        }
    }

    /// Leaves `gap` bytes of unused address space after every reservation,
    /// so that no two reservations are contiguous.
    pub fn with_gap(self, gap: usize) -> Self {
        self.state.lock().gap = gap;
        self
    }

    /// Fails any reservation that would take the total above `limit` bytes.
    pub fn with_limit(self, limit: usize) -> Self {
        self.state.lock().limit = limit;
        self
    }

    pub fn reserved_bytes(&self) -> usize {
        self.state.lock().reserved
    }

    pub fn mapped_bytes(&self) -> usize {
        self.state.lock().mapped
    }

    /// Sum of the sizes passed to `unused`.
    pub fn released_bytes(&self) -> usize {
        self.state.lock().released
    }

    pub fn unused_calls(&self) -> Vec<(usize, usize)> {
        self.state.lock().unused_calls.clone()
    }
}

impl Default for NoopMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SysMemory for NoopMemory {
    fn reserve(&self, size: usize, align: usize) -> Result<usize, SysError> {
        let mut state = self.state.lock();
        let left = state.limit - state.reserved;
        if size > left {
            return Err(SysError::Exhausted { size, left });
        }
        let addr = align_up(state.next, align.max(self.phys_page_size));
        state.next = addr + size + state.gap;
        state.reserved += size;
        Ok(addr)
    }

    fn map(&self, _addr: usize, size: usize) -> Result<(), SysError> {
        self.state.lock().mapped += size;
        Ok(())
    }

    fn alloc(&self, size: usize) -> Result<usize, SysError> {
        let addr = self.reserve(size, self.phys_page_size)?;
        self.map(addr, size)?;
        Ok(addr)
    }

    fn free(&self, _addr: usize, size: usize) {
        let mut state = self.state.lock();
        state.reserved -= size.min(state.reserved);
        state.mapped -= size.min(state.mapped);
    }

    fn unused(&self, addr: usize, size: usize) {
        let mut state = self.state.lock();
        state.released += size;
        state.unused_calls.push((addr, size));
    }

    fn used(&self, _addr: usize, _size: usize) {}

    fn fault(&self, _addr: usize, _size: usize) {}

    fn phys_page_size(&self) -> usize {
        self.phys_page_size
    }

    fn phys_huge_page_size(&self) -> usize {
        self.phys_huge_page_size
    }
}
