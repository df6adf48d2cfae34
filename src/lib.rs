//! A boundary-tag general-purpose allocator: size-class routing over
//! TINY/SMALL/LARGE requests, page-backed heaps carved into
//! boundary-tagged chunks, per-arena free lists, and a dedicated
//! large/mapped-chunk list, all guarded by a single process-wide mutex.
//!
//! The public Rust API is [`allocate`], [`reallocate`], [`release`],
//! and [`dump_allocations`]; `cutler_*` symbols below re-export the
//! same operations with a C ABI for interposition as the host
//! platform's allocator.
mod align;
mod arena;
mod chunk;
mod class;
mod context;
mod debug_audit;
mod dump;
mod free_list;
mod heap;
mod large;
mod mapper;

pub use context::{allocate, reallocate, release};
pub use debug_audit::check_all as check_invariants;
pub use dump::{dump_allocations, dump_allocations_to_string};

use std::os::raw::c_void;

/// Allocates `n` bytes; `n == 0` behaves as `n == 1`. Returns the null
/// pointer on failure.
///
/// # Safety
///
/// The returned pointer, if non-null, must only be passed to
/// `cutler_release`/`cutler_reallocate` from this same process.
#[no_mangle]
pub unsafe extern "C" fn cutler_allocate(n: usize) -> *mut c_void {
    allocate(n) as *mut c_void
}

/// Resizes the allocation at `p` to `n` bytes. `p == NULL` behaves as
/// `cutler_allocate(n)`; `n == 0` releases `p` and returns `NULL`.
///
/// # Safety
///
/// `p` must be `NULL` or a pointer previously returned by
/// `cutler_allocate`/`cutler_reallocate` and not yet released.
#[no_mangle]
pub unsafe extern "C" fn cutler_reallocate(p: *mut c_void, n: usize) -> *mut c_void {
    reallocate(p as *mut u8, n) as *mut c_void
}

/// Releases `p`. `p == NULL` is a no-op.
///
/// # Safety
///
/// `p` must be `NULL` or a pointer previously returned by
/// `cutler_allocate`/`cutler_reallocate` and not yet released.
#[no_mangle]
pub unsafe extern "C" fn cutler_release(p: *mut c_void) {
    release(p as *mut u8);
}

/// Writes the current allocation listing to standard output.
#[no_mangle]
pub extern "C" fn cutler_dump() {
    dump_allocations();
}
