//! The large-chunk list: one entry per dedicated mapping backing a
//! single `LARGE`-class allocation.
//!
//! Grounded on spec.md section 3 ("Large-chunk list") — a per-mapping
//! header lives at the mapping's base, and the user-visible
//! `ChunkHeader` follows it at `ALIGN` offset so the returned payload
//! lines up with the in-heap case exactly like `original_source`'s
//! `large.c` places its own bookkeeping ahead of the block header.
use std::ptr::NonNull;

use crate::chunk::{self, ChunkFlags, ChunkHeader, ALIGN};
use crate::mapper::{MapError, Mapper};

/// Per-mapping bookkeeping, stored at the very start of the mapping.
/// Must fit within `ALIGN` bytes, since the chunk header starts right
/// after it.
#[repr(C)]
struct LargeMapping {
    /// Total bytes of the mapping, including this header and the
    /// chunk header/payload that follow it.
    mapping_size: usize,
    next: Option<NonNull<LargeMapping>>,
}

static_assertions::const_assert!(std::mem::size_of::<LargeMapping>() <= ALIGN);

/// Singly linked list of live large mappings, newest first.
#[derive(Default)]
pub struct LargeList {
    head: Option<NonNull<LargeMapping>>,
}

impl LargeList {
    pub const fn new() -> Self {
        LargeList { head: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Maps `chunk_size(req, mapped=true)` bytes, carves the
    /// per-mapping header and user-visible chunk header, and links the
    /// mapping at the head of the list. Returns the chunk header and
    /// the total bytes mapped (for `total_memory` accounting).
    pub fn insert(&mut self, req: usize, mapper: &dyn Mapper) -> Result<(NonNull<ChunkHeader>, usize), MapError> {
        let mapping_size = mapping_size_for(req, mapper.page_size());

        let base = mapper.map_pages(mapping_size)?;
        let mapping_ptr = base.as_ptr() as *mut LargeMapping;

        unsafe {
            mapping_ptr.write(LargeMapping {
                mapping_size,
                next: self.head,
            });
        }
        let mapping = unsafe { NonNull::new_unchecked(mapping_ptr) };
        self.head = Some(mapping);

        let header_ptr = unsafe { base.as_ptr().add(ALIGN) } as *mut ChunkHeader;
        unsafe {
            header_ptr.write(ChunkHeader::new(
                mapping_size - ALIGN,
                ChunkFlags::MAPPED | ChunkFlags::ALLOCATED,
            ));
        }
        let mut header = unsafe { NonNull::new_unchecked(header_ptr) };
        unsafe { header.as_mut().set_user_size(req) };

        Ok((header, mapping_size))
    }

    /// Removes the mapping owning `chunk` and releases it back to the
    /// OS. `chunk` must have been returned by a prior `insert` on this
    /// list.
    ///
    /// # Safety
    ///
    /// `chunk` must not be referenced again after this call.
    pub unsafe fn remove(&mut self, chunk: NonNull<ChunkHeader>, mapper: &dyn Mapper) -> Result<usize, MapError> {
        let mapping_ptr = (chunk.as_ptr() as *mut u8).sub(ALIGN) as *mut LargeMapping;
        let mapping = NonNull::new_unchecked(mapping_ptr);

        let mut cur = self.head;
        let mut prev: Option<NonNull<LargeMapping>> = None;

        while let Some(node) = cur {
            if node == mapping {
                let next = node.as_ref().next;
                match prev {
                    Some(mut p) => p.as_mut().next = next,
                    None => self.head = next,
                }

                let size = node.as_ref().mapping_size;
                let base = NonNull::new_unchecked(node.as_ptr() as *mut u8);
                mapper.unmap_pages(base, size)?;
                return Ok(size);
            }
            prev = cur;
            cur = node.as_ref().next;
        }

        Ok(0)
    }

    /// True iff `chunk` points just past a `LargeMapping` header
    /// currently on this list (used by `release`/`reallocate` to tell
    /// a mapped chunk from a heap chunk without trusting caller input).
    pub fn contains(&self, chunk: NonNull<ChunkHeader>) -> bool {
        let mapping_ptr = unsafe { (chunk.as_ptr() as *mut u8).sub(ALIGN) } as *mut LargeMapping;
        self.iter_mappings().any(|m| m.as_ptr() == mapping_ptr)
    }

    fn iter_mappings(&self) -> LargeMappingIter {
        LargeMappingIter { cur: self.head }
    }

    /// Iterates the user-visible chunk header of every live mapping,
    /// newest first, for diagnostics and accounting.
    pub fn iter(&self) -> LargeChunkIter {
        LargeChunkIter {
            cur: self.head,
        }
    }

    /// Sum of `mapping_size` across every mapping currently on this
    /// list: the large-mapping share of `total_memory`.
    pub fn total_mapped_bytes(&self) -> u64 {
        self.iter_mappings()
            .map(|m| unsafe { m.as_ref() }.mapping_size as u64)
            .sum()
    }
}

struct LargeMappingIter {
    cur: Option<NonNull<LargeMapping>>,
}

impl Iterator for LargeMappingIter {
    type Item = NonNull<LargeMapping>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cur?;
        self.cur = unsafe { node.as_ref() }.next;
        Some(node)
    }
}

pub struct LargeChunkIter {
    cur: Option<NonNull<LargeMapping>>,
}

impl Iterator for LargeChunkIter {
    /// The mapping base (for the dump header line) and the chunk header.
    type Item = (NonNull<u8>, NonNull<ChunkHeader>);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cur?;
        self.cur = unsafe { node.as_ref() }.next;

        let base = node.as_ptr() as *mut u8;
        let header = unsafe { base.add(ALIGN) } as *mut ChunkHeader;
        Some((
            unsafe { NonNull::new_unchecked(base) },
            unsafe { NonNull::new_unchecked(header) },
        ))
    }
}

/// Total bytes a mapping servicing a `req`-byte large request needs:
/// the user-visible chunk (`chunk_size(req, mapped=true)`) plus the
/// `ALIGN` bytes reserved for the per-mapping header, rounded up to a
/// whole number of pages.
pub fn mapping_size_for(req: usize, page_size: usize) -> usize {
    let chunk_size = chunk::chunk_size(req, true);
    crate::align::align_up(chunk_size + ALIGN, page_size)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapper::DefaultMapper;

    #[test]
    fn insert_then_remove_roundtrip() {
        let mapper = DefaultMapper::new();
        let mut list = LargeList::new();

        let (chunk, mapping_size) = list.insert(8192, &mapper).expect("mapping should succeed");
        assert!(mapping_size > 8192);
        assert!(unsafe { chunk.as_ref() }.is_mapped());
        assert!(unsafe { chunk.as_ref() }.is_allocated());
        assert_eq!(unsafe { chunk.as_ref() }.user_size(), 8192);
        assert!(list.contains(chunk));
        assert_eq!(list.iter().count(), 1);
        assert_eq!(list.total_mapped_bytes(), mapping_size as u64);

        let freed = unsafe { list.remove(chunk, &mapper) }.expect("unmap should succeed");
        assert!(freed > 0);
        assert!(list.is_empty());
        assert_eq!(list.total_mapped_bytes(), 0);
    }
}
