//! A `Mapper` is responsible for acquiring, zero-filling, and
//! releasing whole pages from the operating system. Every `Heap` and
//! every large/mapped chunk goes through this single abstraction.
//!
//! Grounded on the teacher's `mapper.rs`/`map.rs` (the `Mapper` trait
//! and its `reserve`/`release`/`allocate` shape), reimplemented with
//! direct `libc` `mmap`/`munmap` calls — the way
//! `Shadlock0133-mimalloc-rs`'s `os.rs` backs its own `_os_alloc`/
//! `_os_free` — instead of the teacher's C-source `build.rs` glue,
//! which this crate has no remaining use for (see DESIGN.md).
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use errno::{errno, Errno};
use log::warn;

/// A failed page-mapping or page-release call, carrying the OS `errno`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapError(pub Errno);

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page-mapping syscall failed: {}", self.0)
    }
}

impl std::error::Error for MapError {}

/// The page-primitive contract spec.md section 6 asks for:
/// `map_pages(n)`/`unmap_pages(ptr, n)`/`query_address_space_limit()`.
pub trait Mapper: Send + Sync {
    /// The mapping granularity; all `map_pages`/`unmap_pages` sizes
    /// must be a multiple of this value.
    fn page_size(&self) -> usize;

    /// Reserves and zero-fills `n` bytes (a multiple of `page_size()`)
    /// of anonymous memory, returning its base address.
    fn map_pages(&self, n: usize) -> Result<NonNull<u8>, MapError>;

    /// Releases an `n`-byte region previously returned by a single
    /// `map_pages` call.
    ///
    /// # Safety
    ///
    /// `base`/`n` must exactly match a prior `map_pages` return.
    unsafe fn unmap_pages(&self, base: NonNull<u8>, n: usize) -> Result<(), MapError>;

    /// The current soft limit, in bytes, on this process's virtual
    /// address space, or `usize::MAX` if no limit is configured.
    fn query_address_space_limit(&self) -> usize;
}

/// The mapper used by the process-wide allocator context: plain
/// anonymous `mmap`/`munmap`, no large pages, no NUMA policy.
pub struct DefaultMapper {
    page_size: usize,
}

impl DefaultMapper {
    pub fn new() -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(page_size > 0, "sysconf(_SC_PAGESIZE) failed");

        DefaultMapper {
            page_size: page_size as usize,
        }
    }
}

impl Default for DefaultMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl Mapper for DefaultMapper {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn map_pages(&self, n: usize) -> Result<NonNull<u8>, MapError> {
        debug_assert_eq!(n % self.page_size, 0, "map_pages size must be page-aligned");

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                n,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let err = errno();
            warn!("mmap({} bytes) failed: {}", n, err);
            return Err(MapError(err));
        }

        // Anonymous private mappings are guaranteed zero-filled by
        // the kernel; no manual zeroing needed.
        Ok(unsafe { NonNull::new_unchecked(ptr as *mut u8) })
    }

    unsafe fn unmap_pages(&self, base: NonNull<u8>, n: usize) -> Result<(), MapError> {
        debug_assert_eq!(n % self.page_size, 0, "unmap_pages size must be page-aligned");

        let ret = libc::munmap(base.as_ptr() as *mut c_void, n);
        if ret != 0 {
            let err = errno();
            warn!("munmap({:p}, {} bytes) failed: {}", base.as_ptr(), n, err);
            return Err(MapError(err));
        }
        Ok(())
    }

    fn query_address_space_limit(&self) -> usize {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };

        let ret = unsafe { libc::getrlimit(libc::RLIMIT_AS, &mut limit) };
        if ret != 0 {
            warn!("getrlimit(RLIMIT_AS) failed: {}", errno());
            return usize::MAX;
        }

        if limit.rlim_cur == libc::RLIM_INFINITY {
            usize::MAX
        } else {
            limit.rlim_cur as usize
        }
    }
}
