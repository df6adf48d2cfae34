//! A per-heap doubly linked, unordered, first-fit free list.
//!
//! Grounded on `original_source/src/freelist.c`, generalized to a safe
//! doubly linked list (the original is singly linked via `prev`/`next`
//! already, we keep the same shape) with the `prev`/`next` pointers
//! overlaid on the free chunk's own payload, per spec.md section 3.
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

use crate::chunk::{self, ChunkHeader};

/// The `prev`/`next` pointers of a free chunk, overlaid on its payload.
/// Only ever read or written while the chunk is off the allocated path
/// (i.e. between `release`/creation and the next `find_fit`/`split`).
#[repr(C)]
struct FreeNode {
    prev: Option<NonNull<ChunkHeader>>,
    next: Option<NonNull<ChunkHeader>>,
}

static_assertions::const_assert!(std::mem::size_of::<FreeNode>() <= crate::chunk::ALIGN);

#[inline(always)]
unsafe fn node_ptr(chunk: NonNull<ChunkHeader>) -> *mut FreeNode {
    chunk::data_start(chunk) as *mut FreeNode
}

#[inline(always)]
unsafe fn get_prev(chunk: NonNull<ChunkHeader>) -> Option<NonNull<ChunkHeader>> {
    (*node_ptr(chunk)).prev
}

#[inline(always)]
unsafe fn get_next(chunk: NonNull<ChunkHeader>) -> Option<NonNull<ChunkHeader>> {
    (*node_ptr(chunk)).next
}

#[inline(always)]
unsafe fn set_links(
    chunk: NonNull<ChunkHeader>,
    prev: Option<NonNull<ChunkHeader>>,
    next: Option<NonNull<ChunkHeader>>,
) {
    *node_ptr(chunk) = FreeNode { prev, next };
}

/// Root of a heap's free list. Doubly linked, unordered, head-inserted.
#[derive(Default)]
pub struct FreeList {
    head: Option<NonNull<ChunkHeader>>,
}

impl FreeList {
    pub const fn new() -> Self {
        FreeList { head: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn head(&self) -> Option<NonNull<ChunkHeader>> {
        self.head
    }

    /// Inserts `chunk` at the head of the list in O(1). A second
    /// prepend of the current head is a no-op.
    ///
    /// # Safety
    ///
    /// `chunk` must be a free, non-mapped chunk not already on this list.
    #[ensures(self.head.is_some(), "a list holds at least one node after a prepend")]
    pub unsafe fn prepend(&mut self, chunk: NonNull<ChunkHeader>) {
        if self.head == Some(chunk) {
            return;
        }

        match self.head {
            Some(old_head) => {
                set_links(chunk, None, Some(old_head));
                set_links(old_head, Some(chunk), get_next(old_head));
            }
            None => {
                set_links(chunk, None, None);
            }
        }
        self.head = Some(chunk);
    }

    /// Unlinks `chunk` from the list in O(1) given its own prev/next.
    ///
    /// # Safety
    ///
    /// `chunk` must currently be a member of this list.
    #[ensures(self.iter().all(|c| c != chunk), "the removed chunk no longer appears on the list")]
    pub unsafe fn remove(&mut self, chunk: NonNull<ChunkHeader>) {
        let prev = get_prev(chunk);
        let next = get_next(chunk);

        match prev {
            Some(p) => set_links(p, get_prev(p), next),
            None => self.head = next,
        }

        if let Some(n) = next {
            set_links(n, prev, get_next(n));
        }
    }

    /// Returns the first chunk whose size is at least `size`, or
    /// `None` if the list holds no such chunk. O(n), head to tail.
    pub fn find_fit(&self, size: usize) -> Option<NonNull<ChunkHeader>> {
        let mut cur = self.head;
        while let Some(chunk) = cur {
            if unsafe { chunk.as_ref() }.size() >= size {
                return Some(chunk);
            }
            cur = unsafe { get_next(chunk) };
        }
        None
    }

    /// Iterates every chunk currently on the list, for diagnostics
    /// and invariant audits.
    pub fn iter(&self) -> FreeListIter {
        FreeListIter { cur: self.head }
    }
}

pub struct FreeListIter {
    cur: Option<NonNull<ChunkHeader>>,
}

impl Iterator for FreeListIter {
    type Item = NonNull<ChunkHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.cur?;
        self.cur = unsafe { get_next(chunk) };
        Some(chunk)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::{ChunkFlags, ALIGN};

    fn make_chunk(size: usize, flags: ChunkFlags) -> NonNull<ChunkHeader> {
        let layout = std::alloc::Layout::from_size_align(size, ALIGN).unwrap();
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        let header = unsafe { &mut *(base as *mut ChunkHeader) };
        *header = ChunkHeader::new(size, flags);
        unsafe { chunk::write_footer(NonNull::new_unchecked(base as *mut ChunkHeader)) };
        unsafe { NonNull::new_unchecked(base as *mut ChunkHeader) }
    }

    #[test]
    fn prepend_and_remove() {
        let mut list = FreeList::new();
        let a = make_chunk(64, ChunkFlags::FIRST);
        let b = make_chunk(128, ChunkFlags::empty());
        let c = make_chunk(96, ChunkFlags::LAST);

        unsafe {
            list.prepend(a);
            list.prepend(b);
            list.prepend(c);
        }

        let collected: Vec<usize> = list.iter().map(|c| unsafe { c.as_ref() }.size()).collect();
        assert_eq!(collected, vec![96, 128, 64]);

        unsafe { list.remove(b) };
        let collected: Vec<usize> = list.iter().map(|c| unsafe { c.as_ref() }.size()).collect();
        assert_eq!(collected, vec![96, 64]);

        unsafe { list.remove(c) };
        unsafe { list.remove(a) };
        assert!(list.is_empty());
    }

    #[test]
    fn find_fit_first_fit() {
        let mut list = FreeList::new();
        let a = make_chunk(64, ChunkFlags::empty());
        let b = make_chunk(256, ChunkFlags::empty());

        unsafe {
            list.prepend(a);
            list.prepend(b);
        }

        let fit = list.find_fit(100).expect("should find the 256-byte chunk");
        assert_eq!(unsafe { fit.as_ref() }.size(), 256);

        assert!(list.find_fit(1000).is_none());
    }

    #[test]
    fn double_prepend_of_head_is_noop() {
        let mut list = FreeList::new();
        let a = make_chunk(64, ChunkFlags::empty());
        unsafe {
            list.prepend(a);
            list.prepend(a);
        }
        assert_eq!(list.iter().count(), 1);
    }
}
