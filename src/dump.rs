//! The `dump_allocations` diagnostic: a byte-exact listing of every
//! live allocation, grouped by heap/mapping, plus a running total.
//!
//! Grounded on `original_source/src/debug.c`'s `show_alloc_mem` (the
//! per-tag/per-chunk line format) and spec.md section 6. Deliberately
//! writes through plain `std::io::Write` rather than hand-rolled
//! byte-output helpers — those are named out of scope in spec.md
//! section 1 ("the small byte-output helpers used by the diagnostic
//! dumper").
use std::io::{self, Write};
use std::ptr::NonNull;

use crate::chunk::{self, ChunkHeader};
use crate::context::CONTEXT;

fn write_tag_line(out: &mut impl Write, tag: &str, base: usize) -> io::Result<()> {
    writeln!(out, "{} : 0x{:x}", tag, base)
}

fn write_chunk_line(out: &mut impl Write, chunk: NonNull<ChunkHeader>) -> io::Result<u64> {
    let user_size = unsafe { chunk.as_ref() }.user_size();
    let start = unsafe { chunk::data_start(chunk) } as usize;
    let end = start + user_size;
    writeln!(out, "0x{:x} - 0x{:x} : {} bytes", start, end, user_size)?;
    Ok(user_size as u64)
}

/// Writes the current allocation listing to `out` under the lock.
///
/// A heap or mapping with no currently allocated chunks contributes no
/// lines at all (not even its tag line) — matching the "all released"
/// scenario where the only output is the final total.
pub fn dump_allocations_to(out: &mut impl Write) -> io::Result<()> {
    let ctx = CONTEXT.lock().unwrap();
    let mut total: u64 = 0;

    for (tag, arena) in [("TINY", ctx.tiny()), ("SMALL", ctx.small())] {
        for heap in arena.heaps() {
            let heap_ref = unsafe { heap.as_ref() };
            let allocated: Vec<NonNull<ChunkHeader>> = heap_ref
                .chunks()
                .filter(|c| unsafe { c.as_ref() }.is_allocated())
                .collect();

            if allocated.is_empty() {
                continue;
            }

            write_tag_line(out, tag, heap_ref.data_start().as_ptr() as usize)?;
            for chunk in allocated {
                total += write_chunk_line(out, chunk)?;
            }
        }
    }

    for (base, chunk) in ctx.large().iter() {
        write_tag_line(out, "LARGE", base.as_ptr() as usize)?;
        total += write_chunk_line(out, chunk)?;
    }

    writeln!(out, "Total : {} bytes", total)
}

/// Writes the current allocation listing to standard output.
pub fn dump_allocations() {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if let Err(e) = dump_allocations_to(&mut handle) {
        log::warn!("dump_allocations: failed to write to stdout: {}", e);
    }
}

/// Renders the current allocation listing as a `String`, for tests and
/// callers that want the diagnostic without going through stdout.
pub fn dump_allocations_to_string() -> String {
    let mut buf = Vec::new();
    dump_allocations_to(&mut buf).expect("writing to a Vec<u8> never fails");
    String::from_utf8(buf).expect("dump output is always ASCII")
}
