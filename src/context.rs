//! The process-wide allocator front end: two arenas, the large-chunk
//! list, a running `total_memory`, and the single mutex guarding all of
//! it (spec.md section 4.6/5).
//!
//! Grounded on `original_source/src/main.c`'s `malloc`/`realloc`/`free`
//! dispatch and the teacher's use of `lazy_static` for a process-wide
//! singleton (`mapper.rs`'s `NAMED_MAPPERS`/`DEFAULT_MAPPER`).
use std::ptr::NonNull;
use std::sync::Mutex;

use log::{debug, trace};

use crate::arena::Arena;
use crate::chunk::{self, ChunkFlags, ChunkHeader};
use crate::class::{classify, select_class, Class, SizeClass};
use crate::large::{self, LargeList};
use crate::mapper::{DefaultMapper, Mapper};

/// Every piece of state guarded by the single process-wide mutex.
pub struct Context {
    tiny: Arena,
    small: Arena,
    large: LargeList,
    total_memory: u64,
    mapper: Box<dyn Mapper>,
}

// The raw `NonNull` pointers reachable through `Arena`/`LargeList` are
// only ever dereferenced while `CONTEXT`'s mutex is held.
unsafe impl Send for Context {}

impl Context {
    fn new() -> Self {
        Context {
            tiny: Arena::new(Class::Tiny),
            small: Arena::new(Class::Small),
            large: LargeList::new(),
            total_memory: 0,
            mapper: Box::new(DefaultMapper::new()),
        }
    }

    pub(crate) fn tiny(&self) -> &Arena {
        &self.tiny
    }

    pub(crate) fn small(&self) -> &Arena {
        &self.small
    }

    pub(crate) fn large(&self) -> &LargeList {
        &self.large
    }

    pub(crate) fn total_memory(&self) -> u64 {
        self.total_memory
    }

    #[cfg(test)]
    fn with_mapper(mapper: Box<dyn Mapper>) -> Self {
        Context {
            tiny: Arena::new(Class::Tiny),
            small: Arena::new(Class::Small),
            large: LargeList::new(),
            total_memory: 0,
            mapper,
        }
    }
}

lazy_static::lazy_static! {
    /// Lazily constructed on first lock acquisition; `lazy_static`'s
    /// internal `Once` is the initialization-flag discipline spec.md
    /// section 5 calls for. Never torn down: mappings are intentionally
    /// leaked at process exit.
    pub(crate) static ref CONTEXT: Mutex<Context> = Mutex::new(Context::new());
}

fn find_owning_class(ctx: &Context, ptr: *const u8) -> Option<Class> {
    if ctx.tiny.find_heap(ptr).is_some() {
        Some(Class::Tiny)
    } else if ctx.small.find_heap(ptr).is_some() {
        Some(Class::Small)
    } else {
        None
    }
}

/// Removes `chunk` from its heap's free list, splits off a tail if
/// there is room, marks it `Allocated`, and records `user_size`.
fn take_and_prepare(
    arena: &mut Arena,
    mut chunk: NonNull<ChunkHeader>,
    needed: usize,
    user_size: usize,
) -> *mut u8 {
    let ptr = chunk.as_ptr() as *const u8;
    if let Some(mut heap) = arena.find_heap(ptr) {
        unsafe { heap.as_mut().free_list_mut().remove(chunk) };

        let avail = unsafe { chunk.as_ref() }.size();
        if avail - needed >= chunk::min_chunk_size() {
            let tail = unsafe { chunk::split(chunk, needed) };
            unsafe { heap.as_mut().free_list_mut().prepend(tail) };
        }
    }

    unsafe {
        let mut flags = chunk.as_ref().flags();
        flags.insert(ChunkFlags::ALLOCATED);
        chunk.as_mut().set_flags(flags);
        chunk.as_mut().set_user_size(user_size);
    }

    unsafe { chunk::data_start(chunk) }
}

fn do_allocate(ctx: &mut Context, size: usize) -> *mut u8 {
    let size = if size == 0 { 1 } else { size };

    let class = match classify(size) {
        SizeClass::Large => {
            let page_size = ctx.mapper.page_size();
            let mapping_size = large::mapping_size_for(size, page_size);
            let limit = ctx.mapper.query_address_space_limit() as u64;

            if ctx.total_memory.saturating_add(mapping_size as u64) > limit {
                debug!("allocate({}): refusing large mapping, would exceed soft limit", size);
                return std::ptr::null_mut();
            }

            return match ctx.large.insert(size, ctx.mapper.as_ref()) {
                Ok((header, mapped)) => {
                    ctx.total_memory += mapped as u64;
                    unsafe { chunk::data_start(header) }
                }
                Err(e) => {
                    debug!("allocate({}): large mapping failed: {}", size, e);
                    std::ptr::null_mut()
                }
            };
        }
        SizeClass::Small(class) => class,
    };

    let needed = chunk::chunk_size(size, false);

    let mut chunk = match class {
        Class::Tiny => ctx.tiny.find_fit(needed),
        Class::Small => ctx.small.find_fit(needed),
    };

    if chunk.is_none() {
        let page_size = ctx.mapper.page_size();
        let would_be = crate::heap::heap_size(class, page_size);
        let limit = ctx.mapper.query_address_space_limit() as u64;

        if ctx.total_memory.saturating_add(would_be as u64) > limit {
            debug!("allocate({}): refusing heap growth, would exceed soft limit", size);
            return std::ptr::null_mut();
        }

        let grown = match class {
            Class::Tiny => ctx.tiny.grow(ctx.mapper.as_ref()),
            Class::Small => ctx.small.grow(ctx.mapper.as_ref()),
        };
        match grown {
            Ok(heap) => ctx.total_memory += unsafe { heap.as_ref() }.size() as u64,
            Err(e) => {
                debug!("allocate({}): heap growth failed: {}", size, e);
                return std::ptr::null_mut();
            }
        }

        chunk = match class {
            Class::Tiny => ctx.tiny.find_fit(needed),
            Class::Small => ctx.small.find_fit(needed),
        };
    }

    let chunk = match chunk {
        Some(c) => c,
        None => return std::ptr::null_mut(),
    };

    let arena = match class {
        Class::Tiny => &mut ctx.tiny,
        Class::Small => &mut ctx.small,
    };
    take_and_prepare(arena, chunk, needed, size)
}

fn do_release(ctx: &mut Context, ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }

    let header_ptr = unsafe { chunk::header_from_data(ptr) };
    if (header_ptr as usize) % chunk::ALIGN != 0 {
        trace!("release({:p}): misaligned derived header, ignoring", ptr);
        return;
    }
    let mut header = unsafe { NonNull::new_unchecked(header_ptr) };

    if !unsafe { header.as_ref() }.is_allocated() {
        trace!("release({:p}): chunk not allocated, ignoring (double free?)", ptr);
        return;
    }

    if unsafe { header.as_ref() }.is_mapped() {
        if let Ok(freed) = unsafe { ctx.large.remove(header, ctx.mapper.as_ref()) } {
            ctx.total_memory = ctx.total_memory.saturating_sub(freed as u64);
        }
        return;
    }

    let class = match find_owning_class(ctx, ptr as *const u8) {
        Some(c) => c,
        None => {
            trace!("release({:p}): owning heap not found, ignoring", ptr);
            return;
        }
    };

    unsafe {
        let mut flags = header.as_ref().flags();
        flags.remove(ChunkFlags::ALLOCATED);
        header.as_mut().set_flags(flags);
    }

    let arena = match class {
        Class::Tiny => &mut ctx.tiny,
        Class::Small => &mut ctx.small,
    };
    let mut heap = arena
        .find_heap(header.as_ptr() as *const u8)
        .expect("owning heap located above");

    if let Some(prev) = unsafe { chunk::prev(header) } {
        if !unsafe { prev.as_ref() }.is_allocated() {
            unsafe { heap.as_mut().free_list_mut().remove(prev) };
            header = unsafe { chunk::coalesce(prev, header) };
        }
    }
    if let Some(next) = unsafe { chunk::next(header) } {
        if !unsafe { next.as_ref() }.is_allocated() {
            unsafe { heap.as_mut().free_list_mut().remove(next) };
            header = unsafe { chunk::coalesce(header, next) };
        }
    }

    let heap_ref = unsafe { heap.as_ref() };
    let whole_heap = unsafe { header.as_ref() }.is_first() && unsafe { header.as_ref() }.is_last();
    let heap_size_bytes = heap_ref.size() as u64;

    if whole_heap && arena.len() > 1 {
        unsafe { arena.remove_heap(heap, ctx.mapper.as_ref()) }.ok();
        ctx.total_memory = ctx.total_memory.saturating_sub(heap_size_bytes);
    } else {
        unsafe { heap.as_mut().free_list_mut().prepend(header) };
    }
}

fn do_reallocate(ctx: &mut Context, ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return do_allocate(ctx, size);
    }
    if size == 0 {
        do_release(ctx, ptr);
        return std::ptr::null_mut();
    }

    let header_ptr = unsafe { chunk::header_from_data(ptr) };
    if (header_ptr as usize) % chunk::ALIGN != 0 {
        return std::ptr::null_mut();
    }
    let mut header = unsafe { NonNull::new_unchecked(header_ptr) };

    if !unsafe { header.as_ref() }.is_allocated() {
        return std::ptr::null_mut();
    }

    let mapped = unsafe { header.as_ref() }.is_mapped();
    let usable = unsafe { header.as_ref() }.size() - chunk::metadata_size(mapped);

    if usable >= size {
        unsafe { header.as_mut().set_user_size(size) };
        return ptr;
    }

    if !mapped {
        if let Some(grown) = try_grow_in_place(ctx, header, size) {
            return grown;
        }
    }

    let old_user_size = unsafe { header.as_ref() }.user_size();
    let new_ptr = do_allocate(ctx, size);
    if new_ptr.is_null() {
        return std::ptr::null_mut();
    }

    unsafe { chunk::copy_payload(new_ptr, ptr, old_user_size, size) };
    do_release(ctx, ptr);
    new_ptr
}

/// Attempts to grow `header`'s chunk in place by absorbing its free
/// successor, per spec.md section 4.6's `reallocate` in-place path.
/// Returns `None` when the fast path does not apply and the caller
/// should fall back to allocate-copy-release.
fn try_grow_in_place(ctx: &mut Context, mut header: NonNull<ChunkHeader>, size: usize) -> Option<*mut u8> {
    let ptr = unsafe { chunk::data_start(header) } as *const u8;
    let class = find_owning_class(ctx, ptr)?;
    if select_class(size) != class {
        return None;
    }

    let next = unsafe { chunk::next(header) }?;
    if unsafe { next.as_ref() }.is_allocated() {
        return None;
    }

    let needed = chunk::chunk_size(size, false);
    let combined = unsafe { header.as_ref() }.size() + unsafe { next.as_ref() }.size();
    if combined < needed {
        return None;
    }

    let arena = match class {
        Class::Tiny => &mut ctx.tiny,
        Class::Small => &mut ctx.small,
    };
    let mut heap = arena.find_heap(ptr)?;
    unsafe { heap.as_mut().free_list_mut().remove(next) };

    unsafe {
        let mut flags = header.as_ref().flags();
        flags.remove(ChunkFlags::ALLOCATED);
        header.as_mut().set_flags(flags);
    }

    let mut merged = unsafe { chunk::coalesce(header, next) };
    let merged_size = unsafe { merged.as_ref() }.size();
    if merged_size - needed >= chunk::min_chunk_size() {
        let tail = unsafe { chunk::split(merged, needed) };
        unsafe { heap.as_mut().free_list_mut().prepend(tail) };
    }

    unsafe {
        let mut flags = merged.as_ref().flags();
        flags.insert(ChunkFlags::ALLOCATED);
        merged.as_mut().set_flags(flags);
        merged.as_mut().set_user_size(size);
    }

    Some(unsafe { chunk::data_start(merged) })
}

/// Allocates `size` bytes, returning the null pointer on failure.
/// `size == 0` behaves as `size == 1`.
pub fn allocate(size: usize) -> *mut u8 {
    let mut ctx = CONTEXT.lock().unwrap();
    do_allocate(&mut ctx, size)
}

/// Releases `ptr` (previously returned by `allocate`/`reallocate`). A
/// null pointer, a misaligned pointer, or a pointer not currently
/// allocated is a silent no-op.
pub fn release(ptr: *mut u8) {
    let mut ctx = CONTEXT.lock().unwrap();
    do_release(&mut ctx, ptr);
}

/// Resizes the allocation at `ptr` to `size` bytes, preserving
/// `min(old_user_size, size)` bytes of its contents.
pub fn reallocate(ptr: *mut u8, size: usize) -> *mut u8 {
    let mut ctx = CONTEXT.lock().unwrap();
    do_reallocate(&mut ctx, ptr, size)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mapper::{DefaultMapper, MapError};

    /// Delegates real mapping work to `DefaultMapper` but reports an
    /// artificially low address-space limit, so soft-limit refusal can
    /// be exercised without touching the process's real `RLIMIT_AS`.
    struct FakeMapper {
        inner: DefaultMapper,
        limit: usize,
    }

    impl Mapper for FakeMapper {
        fn page_size(&self) -> usize {
            self.inner.page_size()
        }
        fn map_pages(&self, n: usize) -> Result<NonNull<u8>, MapError> {
            self.inner.map_pages(n)
        }
        unsafe fn unmap_pages(&self, base: NonNull<u8>, n: usize) -> Result<(), MapError> {
            self.inner.unmap_pages(base, n)
        }
        fn query_address_space_limit(&self) -> usize {
            self.limit
        }
    }

    #[test]
    fn oom_under_soft_limit_returns_null_and_preserves_existing() {
        let page_size = DefaultMapper::new().page_size();
        let heap_sz = crate::heap::heap_size(Class::Tiny, page_size);
        let mapper = FakeMapper {
            inner: DefaultMapper::new(),
            limit: heap_sz * 4,
        };
        let mut ctx = Context::with_mapper(Box::new(mapper));

        let mut pointers = Vec::new();
        loop {
            let p = do_allocate(&mut ctx, 64);
            if p.is_null() {
                break;
            }
            pointers.push(p);
        }

        assert!(ctx.tiny.len() <= 4, "soft limit should cap heap growth at 4 heaps");
        assert!(!pointers.is_empty());

        for &p in &pointers {
            unsafe { p.write(0xAB) };
        }

        for p in pointers {
            do_release(&mut ctx, p);
        }
    }

    #[test]
    fn allocate_write_release_roundtrip() {
        let p = allocate(64);
        assert!(!p.is_null());
        assert_eq!(p as usize % chunk::ALIGN, 0);

        unsafe { std::slice::from_raw_parts_mut(p, 64) }.fill(0xAB);
        release(p);
    }

    #[test]
    fn zero_size_allocates_one_byte() {
        let p = allocate(0);
        assert!(!p.is_null());
        release(p);
    }

    #[test]
    fn reallocate_grows_and_preserves_prefix() {
        let p = allocate(60);
        assert!(!p.is_null());
        unsafe { std::slice::from_raw_parts_mut(p, 60) }.fill(b'A');

        let q = reallocate(p, 90);
        assert!(!q.is_null());
        let prefix = unsafe { std::slice::from_raw_parts(q, 60) };
        assert!(prefix.iter().all(|&b| b == b'A'));

        release(q);
    }

    #[test]
    fn reallocate_to_zero_releases_and_returns_null() {
        let p = allocate(32);
        assert!(reallocate(p, 0).is_null());
    }

    #[test]
    fn double_release_is_a_noop() {
        let p = allocate(16);
        release(p);
        release(p);
    }

    #[test]
    fn large_allocation_round_trips() {
        let p = allocate(8192);
        assert!(!p.is_null());
        unsafe { std::slice::from_raw_parts_mut(p, 8192) }.fill(0x7F);
        release(p);
    }
}
