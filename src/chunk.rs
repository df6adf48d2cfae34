//! Boundary-tagged chunk metadata: the header/footer pair that bounds
//! every piece of heap-carved memory, plus the pure size arithmetic
//! (`chunk_size`, `metadata_size`, `min_chunk_size`) every other layer
//! is built on.
//!
//! Grounded on `original_source/src/chunk.c` and `src/chunk.h`
//! (`Mikastiv/malloc`), generalized to the explicit `First`/`Last`
//! flag pair and the 4-bit flags / 60-bit size packing spec.md's
//! Design Notes call for.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ptr::NonNull;

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::align::{align_up, memory_copy};

/// Payload alignment for every chunk returned to a caller.
pub const ALIGN: usize = 16;
/// Largest request (including in-heap metadata) routed to the TINY class.
pub const MAX_TINY: usize = 128;
/// Smallest request routed to a dedicated page mapping.
pub const MIN_LARGE: usize = 4096;

const_assert!(ALIGN.is_power_of_two());
const_assert!(ALIGN >= 16);

bitflags! {
    /// Packed into the low 4 bits of a chunk header/footer word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ChunkFlags: u64 {
        const ALLOCATED = 1 << 0;
        const MAPPED     = 1 << 1;
        const FIRST      = 1 << 2;
        const LAST       = 1 << 3;
    }
}

const FLAGS_BITS: u32 = 4;
const FLAGS_MASK: u64 = (1 << FLAGS_BITS) - 1;

/// A chunk header (and, when the chunk lives in a heap, an identical
/// footer).  `packed` stores `flags` in its low 4 bits and `size` in
/// the remaining 60; `user_size` is the caller-requested byte count.
#[repr(C)]
#[derive(Debug)]
pub struct ChunkHeader {
    packed: u64,
    user_size: u64,
}

const_assert!(std::mem::size_of::<ChunkHeader>() <= ALIGN);

impl ChunkHeader {
    #[inline(always)]
    pub fn new(size: usize, flags: ChunkFlags) -> Self {
        ChunkHeader {
            packed: pack(size, flags),
            user_size: 0,
        }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        (self.packed >> FLAGS_BITS) as usize
    }

    #[inline(always)]
    pub fn set_size(&mut self, size: usize) {
        self.packed = pack(size, self.flags());
    }

    #[inline(always)]
    pub fn flags(&self) -> ChunkFlags {
        ChunkFlags::from_bits_truncate(self.packed & FLAGS_MASK)
    }

    #[inline(always)]
    pub fn set_flags(&mut self, flags: ChunkFlags) {
        self.packed = pack(self.size(), flags);
    }

    #[inline(always)]
    pub fn user_size(&self) -> usize {
        self.user_size as usize
    }

    #[inline(always)]
    pub fn set_user_size(&mut self, size: usize) {
        self.user_size = size as u64;
    }

    #[inline(always)]
    pub fn is_allocated(&self) -> bool {
        self.flags().contains(ChunkFlags::ALLOCATED)
    }

    #[inline(always)]
    pub fn is_mapped(&self) -> bool {
        self.flags().contains(ChunkFlags::MAPPED)
    }

    #[inline(always)]
    pub fn is_first(&self) -> bool {
        self.flags().contains(ChunkFlags::FIRST)
    }

    #[inline(always)]
    pub fn is_last(&self) -> bool {
        self.flags().contains(ChunkFlags::LAST)
    }
}

#[inline(always)]
fn pack(size: usize, flags: ChunkFlags) -> u64 {
    debug_assert!(
        (size as u64) < (1u64 << (64 - FLAGS_BITS)),
        "chunk size overflows the 60-bit size field"
    );
    ((size as u64) << FLAGS_BITS) | (flags.bits() & FLAGS_MASK)
}

/// `align_up(size_of::<ChunkHeader>(), ALIGN)`.
#[inline]
pub fn header_size() -> usize {
    align_up(std::mem::size_of::<ChunkHeader>(), ALIGN)
}

/// Bytes of metadata a chunk of this kind reserves: one header for a
/// mapped (large) chunk, a header *and* footer otherwise.
#[inline]
pub fn metadata_size(mapped: bool) -> usize {
    if mapped {
        header_size()
    } else {
        2 * header_size()
    }
}

/// Smallest legal chunk size: metadata plus `ALIGN` bytes of payload,
/// so a free chunk's overlaid `prev`/`next` pointers always fit.
#[inline]
pub fn min_chunk_size() -> usize {
    align_up(2 * header_size() + ALIGN, ALIGN)
}

/// Total chunk size (including metadata) needed to service a request
/// for `req` user bytes.
#[ensures(ret >= min_chunk_size(), "a chunk is always at least the minimum size")]
#[inline]
pub fn chunk_size(req: usize, mapped: bool) -> usize {
    let payload = align_up(req, ALIGN);
    let raw = align_up(payload + metadata_size(mapped), ALIGN);
    raw.max(min_chunk_size())
}

/// Returns the address of a chunk's payload, immediately after its header.
#[inline]
pub unsafe fn data_start(header: NonNull<ChunkHeader>) -> *mut u8 {
    (header.as_ptr() as *mut u8).add(header_size())
}

/// Recovers a chunk header from a payload pointer previously returned
/// by `data_start`.
#[inline]
pub unsafe fn header_from_data(ptr: *mut u8) -> *mut ChunkHeader {
    ptr.sub(header_size()) as *mut ChunkHeader
}

/// Returns a chunk's footer: the last `header_size()` bytes of the chunk.
///
/// # Safety
///
/// `header` must point at a live, non-mapped chunk.
#[inline]
pub unsafe fn footer_of(header: NonNull<ChunkHeader>) -> NonNull<ChunkHeader> {
    let size = header.as_ref().size();
    let addr = (header.as_ptr() as *mut u8).add(size - header_size());
    NonNull::new_unchecked(addr as *mut ChunkHeader)
}

/// Writes `header`'s footer to match its header, honoring the
/// footer-size-0 end-of-heap marker for the last chunk.
///
/// # Safety
///
/// `header` must point at a live, non-mapped chunk.
pub unsafe fn write_footer(mut header: NonNull<ChunkHeader>) {
    let is_last = header.as_ref().is_last();
    let mut footer = footer_of(header);

    if is_last {
        *footer.as_mut() = ChunkHeader::new(0, ChunkFlags::empty());
    } else {
        let size = header.as_ref().size();
        let flags = header.as_ref().flags();
        *footer.as_mut() = ChunkHeader::new(size, flags);
    }
}

/// Returns the next chunk in address order, or `None` if `header` is
/// the last chunk of its heap (signalled by its own footer's
/// size-0 end marker).
///
/// # Safety
///
/// `header` must point at a live, non-mapped chunk.
pub unsafe fn next(header: NonNull<ChunkHeader>) -> Option<NonNull<ChunkHeader>> {
    let footer = footer_of(header);
    if footer.as_ref().size() == 0 {
        return None;
    }

    let addr = (header.as_ptr() as *mut u8).add(header.as_ref().size());
    Some(NonNull::new_unchecked(addr as *mut ChunkHeader))
}

/// Returns the previous chunk in address order, or `None` if `header`
/// carries the `First` flag.
///
/// # Safety
///
/// `header` must point at a live, non-mapped chunk that is not the
/// first chunk of a mapping (i.e. is preceded by a valid footer).
pub unsafe fn prev(header: NonNull<ChunkHeader>) -> Option<NonNull<ChunkHeader>> {
    if header.as_ref().is_first() {
        return None;
    }

    let preceding_footer = (header.as_ptr() as *mut u8).sub(header_size()) as *mut ChunkHeader;
    let size = (*preceding_footer).size();
    let addr = (header.as_ptr() as *mut u8).sub(size);
    Some(NonNull::new_unchecked(addr as *mut ChunkHeader))
}

/// Splits `chunk` at `size` bytes, shrinking it in place and returning
/// a fresh free chunk covering the remainder.
///
/// `size` must be at least `min_chunk_size()`, and the remainder
/// (`chunk.size() - size`) must also be at least `min_chunk_size()`.
///
/// # Safety
///
/// `chunk` must point at a live, non-mapped, non-allocated chunk.
#[requires(size >= min_chunk_size())]
pub unsafe fn split(mut chunk: NonNull<ChunkHeader>, size: usize) -> NonNull<ChunkHeader> {
    let old_size = chunk.as_ref().size();
    let was_last = chunk.as_ref().is_last();
    debug_assert!(old_size - size >= min_chunk_size());

    let mut new_flags = chunk.as_ref().flags();
    new_flags.remove(ChunkFlags::LAST);
    chunk.as_mut().set_size(size);
    chunk.as_mut().set_flags(new_flags);
    write_footer(chunk);

    let tail_addr = (chunk.as_ptr() as *mut u8).add(size);
    let mut tail = NonNull::new_unchecked(tail_addr as *mut ChunkHeader);

    let mut tail_flags = ChunkFlags::empty();
    if was_last {
        tail_flags.insert(ChunkFlags::LAST);
    }
    *tail.as_mut() = ChunkHeader::new(old_size - size, tail_flags);
    write_footer(tail);

    tail
}

/// Merges `back` into `front`; both must currently be free and must
/// already have been unlinked from their free lists.  The merged
/// chunk is `front`, grown to cover `back`'s bytes; it is *not*
/// reinserted into any free list.
///
/// # Safety
///
/// `front` and `back` must be adjacent, live, non-mapped, non-allocated
/// chunks with `back` immediately following `front`.
#[requires(!front.as_ref().is_allocated() && !back.as_ref().is_allocated())]
pub unsafe fn coalesce(
    mut front: NonNull<ChunkHeader>,
    back: NonNull<ChunkHeader>,
) -> NonNull<ChunkHeader> {
    let back_is_last = back.as_ref().is_last();
    let merged_size = front.as_ref().size() + back.as_ref().size();

    front.as_mut().set_size(merged_size);
    if back_is_last {
        let mut flags = front.as_ref().flags();
        flags.insert(ChunkFlags::LAST);
        front.as_mut().set_flags(flags);
    }
    write_footer(front);

    front
}

/// Copies `min(old_user_size, new_user_size)` bytes of payload from
/// `old` to `new`. Used by `reallocate`'s move-and-copy slow path.
///
/// # Safety
///
/// Both pointers must be valid chunk payload starts for at least
/// `old_user_size`/`new_user_size` bytes respectively, and must not overlap.
pub unsafe fn copy_payload(new: *mut u8, old: *const u8, old_user_size: usize, new_user_size: usize) {
    memory_copy(new, old, old_user_size.min(new_user_size));
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_free_heap_chunk(size: usize) -> *mut u8 {
        let layout = std::alloc::Layout::from_size_align(size, ALIGN).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        let header = unsafe { &mut *(base as *mut ChunkHeader) };
        *header = ChunkHeader::new(size, ChunkFlags::FIRST | ChunkFlags::LAST);
        unsafe { write_footer(NonNull::new_unchecked(base as *mut ChunkHeader)) };
        base
    }

    #[test]
    fn header_size_fits_alignment() {
        assert!(header_size() <= ALIGN);
        assert!(header_size() >= std::mem::size_of::<ChunkHeader>());
    }

    #[test]
    fn chunk_size_monotonic_and_aligned() {
        for req in [0usize, 1, 15, 16, 17, 100, 1000] {
            let s = chunk_size(req, false);
            assert_eq!(s % ALIGN, 0);
            assert!(s >= min_chunk_size());
            assert!(s >= req + metadata_size(false));
        }
    }

    #[test]
    fn split_and_coalesce_roundtrip() {
        let size = 256;
        let base = make_free_heap_chunk(size);
        let header = unsafe { NonNull::new_unchecked(base as *mut ChunkHeader) };

        let left_size = min_chunk_size();
        let tail = unsafe { split(header, left_size) };

        assert_eq!(unsafe { header.as_ref() }.size(), left_size);
        assert!(unsafe { header.as_ref() }.is_first());
        assert!(!unsafe { header.as_ref() }.is_last());
        assert!(unsafe { tail.as_ref() }.is_last());
        assert_eq!(
            unsafe { header.as_ref() }.size() + unsafe { tail.as_ref() }.size(),
            size
        );

        let next = unsafe { next(header) }.expect("split chunk has a successor");
        assert_eq!(next.as_ptr(), tail.as_ptr());

        let merged = unsafe { coalesce(header, tail) };
        assert_eq!(unsafe { merged.as_ref() }.size(), size);
        assert!(unsafe { merged.as_ref() }.is_last());

        unsafe {
            std::alloc::dealloc(base, std::alloc::Layout::from_size_align(size, ALIGN).unwrap())
        };
    }

    #[test]
    fn prev_next_roundtrip() {
        let size = 256;
        let base = make_free_heap_chunk(size);
        let header = unsafe { NonNull::new_unchecked(base as *mut ChunkHeader) };
        let tail = unsafe { split(header, min_chunk_size()) };

        let back = unsafe { prev(tail) }.expect("tail has a predecessor");
        assert_eq!(back.as_ptr(), header.as_ptr());
        assert!(unsafe { prev(header) }.is_none());
        assert!(unsafe { next(tail) }.is_none());

        unsafe {
            std::alloc::dealloc(base, std::alloc::Layout::from_size_align(size, ALIGN).unwrap())
        };
    }
}
