//! An internal invariant walker: checks P1–P9 from spec.md section 8
//! across every heap and the large-chunk list. Cheap enough to run
//! after every operation in tests; also reachable from `#[invariant]`
//! attributes when `check_contracts`/`check_contracts_in_tests` is on.
//!
//! Grounded on the teacher's `debug_allocation_map.rs` (the
//! `Result<(), &'static str>` walker style, one function per
//! invariant group) generalized from slab bitmaps to boundary-tag
//! chunk traversal.
use crate::arena::Arena;
use crate::chunk;
use crate::context::Context;
use crate::heap::Heap;

/// Walks one heap's chunks in address order, checking P1–P5.
fn check_heap(heap: &Heap) -> Result<(), &'static str> {
    let mut seen_first = false;
    let mut seen_last = false;
    let mut running_size: usize = 0;
    let mut free_count = 0usize;
    let mut prev_was_free = false;

    for chunk in heap.chunks() {
        let c = unsafe { chunk.as_ref() };

        if c.is_first() {
            if seen_first {
                return Err("more than one chunk carries First");
            }
            seen_first = true;
        }
        if c.is_last() {
            if seen_last {
                return Err("more than one chunk carries Last");
            }
            seen_last = true;
        }

        let footer = unsafe { chunk::footer_of(chunk) };
        let footer_ref = unsafe { footer.as_ref() };
        if c.is_last() {
            if footer_ref.size() != 0 {
                return Err("last chunk's footer is not the size-0 end marker");
            }
        } else if footer_ref.size() != c.size() || footer_ref.flags() != c.flags() {
            return Err("header and footer disagree");
        }

        running_size += c.size();

        let is_free = !c.is_allocated() && !c.is_mapped();
        if is_free {
            free_count += 1;
            if prev_was_free {
                return Err("two adjacent free chunks inside one heap");
            }
        }
        prev_was_free = is_free;

        if c.is_allocated() {
            let usable = c.size() - chunk::metadata_size(c.is_mapped());
            if c.user_size() > usable {
                return Err("user_size exceeds chunk's usable size");
            }
        }
    }

    if !seen_first || !seen_last {
        return Err("heap has no chunk carrying First/Last");
    }

    let expected = heap.size() - crate::heap::header_size();
    if running_size != expected {
        return Err("sum of chunk sizes does not cover the heap payload");
    }

    let list_count = heap.free_list().iter().count();
    if list_count != free_count {
        return Err("free list membership does not match free chunk count");
    }

    Ok(())
}

fn check_arena(arena: &Arena) -> Result<(), &'static str> {
    for heap in arena.heaps() {
        check_heap(unsafe { heap.as_ref() })?;
    }
    Ok(())
}

/// Checks every invariant this module knows how to verify against
/// `ctx`. Assumes the caller already holds the process-wide lock.
pub fn check_context(ctx: &Context) -> Result<(), &'static str> {
    check_arena(ctx.tiny())?;
    check_arena(ctx.small())?;

    let mut live_bytes: u64 = 0;
    for heap in ctx.tiny().heaps() {
        live_bytes += unsafe { heap.as_ref() }.size() as u64;
    }
    for heap in ctx.small().heaps() {
        live_bytes += unsafe { heap.as_ref() }.size() as u64;
    }
    live_bytes += ctx.large().total_mapped_bytes();

    if live_bytes != ctx.total_memory() {
        return Err("total_memory does not equal the sum of live heap and mapping bytes");
    }

    Ok(())
}

/// Locks the process-wide context and checks every invariant. Intended
/// for tests: production code holds the lock for the whole critical
/// section and should call `check_context` directly.
pub fn check_all() -> Result<(), &'static str> {
    let ctx = crate::context::CONTEXT.lock().unwrap();
    check_context(&ctx)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::{allocate, reallocate, release};

    #[test]
    fn fresh_allocations_pass_audit() {
        let p1 = allocate(64);
        let p2 = allocate(64);
        let p3 = allocate(64);
        check_all().expect("invariants should hold");

        release(p2);
        check_all().expect("invariants should hold after a middle release");

        release(p1);
        release(p3);
        check_all().expect("invariants should hold after draining the heap");
    }

    #[test]
    fn reallocate_sequence_passes_audit() {
        let p = allocate(32);
        let q = reallocate(p, 8192);
        check_all().expect("invariants should hold across a tiny-to-large transition");
        release(q);
        check_all().expect("invariants should hold after releasing the large chunk");
    }
}
