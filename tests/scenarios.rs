//! End-to-end scenarios with literal inputs and expected behaviour.
//!
//! All scenarios drive the single process-wide allocator, so this file
//! must run single-threaded: `cargo test --test scenarios -- --test-threads=1`.
//! Grounded on `original_source/main.c`'s workload driver and the
//! scenario table in spec.md section 8.
use cutler::{allocate, check_invariants, dump_allocations_to_string, reallocate, release};

#[test]
fn s1_write_and_read_back_then_empty_dump() {
    let _ = env_logger::try_init();
    let p = allocate(12);
    assert!(!p.is_null());

    let text = b"Hello World\n\0";
    unsafe { std::ptr::copy_nonoverlapping(text.as_ptr(), p, 12) };

    let read_back = unsafe { std::slice::from_raw_parts(p, 12) };
    assert_eq!(read_back, b"Hello World\n");

    release(p);
    assert_eq!(dump_allocations_to_string(), "Total : 0 bytes\n");
}

#[test]
fn s2_reallocate_grows_and_preserves_prefix() {
    let _ = env_logger::try_init();
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
fn s3_releases_collapse_heap_to_one_free_chunk() {
    let _ = env_logger::try_init();
    let p1 = allocate(64);
    let p2 = allocate(64);
    let p3 = allocate(64);
    assert!(!p1.is_null() && !p2.is_null() && !p3.is_null());

    release(p2);
    release(p1);
    release(p3);

    check_invariants().expect("invariants should hold after draining the heap");
}

#[test]
fn s4_large_small_transition_preserves_prefix() {
    let _ = env_logger::try_init();
    let p = allocate(32);
    assert!(!p.is_null());
    unsafe { std::slice::from_raw_parts_mut(p, 32) }.fill(b'Z');

    let q = reallocate(p, 8192);
    assert!(!q.is_null());
    let prefix = unsafe { std::slice::from_raw_parts(q, 32) };
    assert!(prefix.iter().all(|&b| b == b'Z'));

    release(q);
    check_invariants().expect("invariants should hold after the transition");
}

#[test]
fn s5_workload_drains_to_empty() {
    let _ = env_logger::try_init();

    // A small linear congruential generator stands in for the seeded
    // random driver `original_source/main.c` uses to pick block sizes.
    struct Lcg(u64);
    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
            self.0
        }
        fn below(&mut self, bound: usize) -> usize {
            (self.next() % bound as u64) as usize
        }
    }

    let mut rng = Lcg(0xC0FFEE);
    let mut blocks: Vec<*mut u8> = (0..256)
        .map(|_| allocate(rng.below(64 * 1024)))
        .collect();
    assert!(blocks.iter().all(|p| !p.is_null()));

    for p in blocks.drain(128..) {
        release(p);
    }

    for p in blocks.iter_mut().take(128) {
        let new_size = rng.below(64 * 1024).max(1);
        let q = reallocate(*p, new_size);
        assert!(!q.is_null());
        *p = q;
    }

    blocks.extend((0..128).map(|_| allocate(rng.below(64 * 1024))));
    assert!(blocks.iter().all(|p| !p.is_null()));

    let _ = dump_allocations_to_string();
    check_invariants().expect("invariants should hold mid-workload");

    for p in blocks {
        release(p);
    }

    assert_eq!(dump_allocations_to_string(), "Total : 0 bytes\n");
}
