//! A `Heap` is one contiguous, page-aligned region obtained from the
//! `Mapper`, carved at creation into a single free chunk spanning the
//! whole payload.
//!
//! Grounded on `original_source/src/heap.c`/`heap.h`
//! (`heap_data_start`, `heap_get_block`) and the teacher's `mill.rs`
//! for the "hand a fresh mapped region to the layer above" shape.
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

use crate::align::align_up;
use crate::chunk::{self, ChunkFlags, ChunkHeader, MAX_TINY, MIN_LARGE};
use crate::class::Class;
use crate::free_list::FreeList;
use crate::mapper::Mapper;

/// A page-backed region carved into chunks, owned by one `Arena`.
pub struct Heap {
    size: usize,
    next: Option<NonNull<Heap>>,
    free_list: FreeList,
}

/// `align_up(sizeof(Heap), ALIGN)`: bytes of the mapping consumed by
/// the heap header itself, before any chunk payload begins.
pub fn header_size() -> usize {
    align_up(std::mem::size_of::<Heap>(), chunk::ALIGN)
}

/// `align_up(100 * representative_chunk_size(class) + heap_header_size, page_size)`.
///
/// The "100x" multiplier is a required invariant (spec.md section 3):
/// it amortizes mapping overhead and keeps internal fragmentation
/// behavior deterministic across runs.
pub fn heap_size(class: Class, page_size: usize) -> usize {
    let representative = match class {
        Class::Tiny => MAX_TINY,
        Class::Small => MIN_LARGE,
    };

    align_up(100 * representative + header_size(), page_size)
}

impl Heap {
    /// Maps a fresh heap for `class` via `mapper`, and carves it into
    /// one free chunk spanning its entire payload.
    #[ensures(ret.is_ok() -> unsafe { ret.as_ref().unwrap().as_ref() }.free_list.head().is_some(),
              "a freshly created heap always holds exactly one free chunk")]
    pub fn create(class: Class, mapper: &dyn Mapper) -> Result<NonNull<Heap>, crate::mapper::MapError> {
        let page_size = mapper.page_size();
        let size = heap_size(class, page_size);

        let base = mapper.map_pages(size)?;
        let heap_ptr = base.as_ptr() as *mut Heap;

        unsafe {
            heap_ptr.write(Heap {
                size,
                next: None,
                free_list: FreeList::new(),
            });
        }

        let mut heap = unsafe { NonNull::new_unchecked(heap_ptr) };
        let chunk_bytes = size - header_size();

        let data = unsafe { (base.as_ptr() as *mut u8).add(header_size()) };
        let header_ptr = data as *mut ChunkHeader;
        unsafe {
            header_ptr.write(ChunkHeader::new(
                chunk_bytes,
                ChunkFlags::FIRST | ChunkFlags::LAST,
            ));
        }
        let chunk = unsafe { NonNull::new_unchecked(header_ptr) };
        unsafe { chunk::write_footer(chunk) };

        unsafe { heap.as_mut().free_list.prepend(chunk) };

        Ok(heap)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn next(&self) -> Option<NonNull<Heap>> {
        self.next
    }

    pub fn set_next(&mut self, next: Option<NonNull<Heap>>) {
        self.next = next;
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    pub fn free_list_mut(&mut self) -> &mut FreeList {
        &mut self.free_list
    }

    /// Returns the address of the first chunk header in this heap.
    pub fn data_start(&self) -> NonNull<ChunkHeader> {
        let self_addr = self as *const Heap as *mut u8;
        let data = unsafe { self_addr.add(header_size()) };
        unsafe { NonNull::new_unchecked(data as *mut ChunkHeader) }
    }

    /// True iff `ptr` falls within this heap's mapped range.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self as *const Heap as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.size
    }

    /// Delegates to this heap's own free list.
    pub fn find_fit(&self, size: usize) -> Option<NonNull<ChunkHeader>> {
        self.free_list.find_fit(size)
    }

    /// Walks every chunk of this heap in address order, for
    /// diagnostics and invariant audits.
    pub fn chunks(&self) -> HeapChunkIter {
        HeapChunkIter {
            cur: Some(self.data_start()),
        }
    }
}

pub struct HeapChunkIter {
    cur: Option<NonNull<ChunkHeader>>,
}

impl Iterator for HeapChunkIter {
    type Item = NonNull<ChunkHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.cur?;
        self.cur = unsafe { chunk::next(chunk) };
        Some(chunk)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapper::DefaultMapper;

    #[test]
    fn create_has_one_free_chunk_spanning_payload() {
        let mapper = DefaultMapper::new();
        let heap = Heap::create(Class::Tiny, &mapper).expect("map should succeed");
        let heap_ref = unsafe { heap.as_ref() };

        assert_eq!(heap_ref.chunks().count(), 1);
        let only = heap_ref.chunks().next().unwrap();
        let chunk = unsafe { only.as_ref() };
        assert!(chunk.is_first());
        assert!(chunk.is_last());
        assert!(!chunk.is_allocated());
        assert_eq!(chunk.size(), heap_ref.size() - header_size());

        assert!(heap_ref.contains(heap_ref.data_start().as_ptr() as *const u8));
    }
}
