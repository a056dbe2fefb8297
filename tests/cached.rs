//! The process-wide cached allocator: cache hits, overflow to the arenas,
//! eviction, and per-thread isolation.
//!
//! All tests in this binary share the one global pool, so none of them may
//! assume anything about the pool's history. What *is* deterministic is the
//! calling thread's own cache: the test harness runs every test on a fresh
//! thread, so each test starts with an empty cache of its own.

use std::thread;

fn setup() {
    // First caller wins; everyone else keeps the existing pool.
    let _ = shardalloc::init(2);
    shardalloc::init_thread_cache();
}

#[test]
fn cache_round_trip_returns_the_same_block() {
    setup();

    let p = shardalloc::malloc(40);
    assert!(!p.is_null());
    unsafe {
        p.write_bytes(0x61, 40);
        shardalloc::free(p);
    }

    // The freed block went into this thread's (empty) cache, so the next
    // same-sized request must be served the identical block, lock-free.
    let q = shardalloc::malloc(40);
    assert_eq!(q, p);
    unsafe { shardalloc::free(q) };
}

#[test]
fn cache_serves_smaller_requests_from_larger_blocks() {
    setup();

    let p = shardalloc::malloc(100);
    assert!(!p.is_null());
    unsafe { shardalloc::free(p) };

    // A 50-byte request fits comfortably in the cached 100-byte block.
    let q = shardalloc::malloc(50);
    assert_eq!(q, p);
    unsafe {
        q.write_bytes(0x70, 50);
        assert_eq!(q.add(49).read(), 0x70);
        shardalloc::free(q);
    }
}

#[test]
fn cache_misses_fall_through_to_the_arenas() {
    setup();

    let p = shardalloc::malloc(32);
    assert!(!p.is_null());
    unsafe { shardalloc::free(p) };

    // The cached block is far too small for this request; the arena path
    // has to serve it.
    let q = shardalloc::malloc(64 * 1024);
    assert!(!q.is_null());
    assert_ne!(q, p);
    unsafe {
        q.write_bytes(0x11, 64 * 1024);
        shardalloc::free(q);
        let r = shardalloc::malloc(32); // the small block is still cached
        assert_eq!(r, p);
        shardalloc::free(r);
    }
}

#[test]
fn cache_overflow_falls_back_to_the_arenas() {
    setup();

    // Sixteen outstanding blocks, then a burst of frees: the first eight
    // fill the cache, the rest take the eviction-or-arena path. Everything
    // must remain allocatable and intact afterwards.
    let blocks: Vec<*mut u8> = (0..16)
        .map(|index| {
            let p = shardalloc::malloc(64);
            assert!(!p.is_null());
            unsafe { p.write_bytes(index as u8, 64) };
            p
        })
        .collect();

    for (index, &p) in blocks.iter().enumerate() {
        unsafe {
            assert_eq!(p.read(), index as u8, "payload clobbered before free");
            shardalloc::free(p);
        }
    }

    for _ in 0..16 {
        let p = shardalloc::malloc(64);
        assert!(!p.is_null());
        unsafe {
            p.write_bytes(0x99, 64);
            assert_eq!(p.add(63).read(), 0x99);
            shardalloc::free(p);
        }
    }
}

#[test]
fn oversized_blocks_bypass_the_cache() {
    setup();

    // Two megabytes exceeds the cache's whole byte budget; the free must go
    // straight to the owning arena.
    let size = 2 << 20;
    let p = shardalloc::malloc(size);
    assert!(!p.is_null());
    unsafe {
        p.write(0x01);
        p.add(size - 1).write(0x02);
        assert_eq!(p.read(), 0x01);
        assert_eq!(p.add(size - 1).read(), 0x02);
        shardalloc::free(p);
    }

    let q = shardalloc::malloc(size);
    assert!(!q.is_null());
    unsafe { shardalloc::free(q) };
}

#[test]
fn many_threads_allocate_through_their_own_caches() {
    setup();

    let handles: Vec<_> = (0..8)
        .map(|thread_index| {
            thread::spawn(move || {
                shardalloc::init_thread_cache();
                let fill = (thread_index as u8).wrapping_mul(37).wrapping_add(3);

                for round in 0..2000usize {
                    let size = 16 + (round % 60) * 24;
                    let p = shardalloc::malloc(size);
                    assert!(!p.is_null());
                    unsafe {
                        p.write(fill);
                        p.add(size - 1).write(fill);
                        assert_eq!(p.read(), fill);
                        assert_eq!(p.add(size - 1).read(), fill);
                        shardalloc::free(p);
                    }
                }

                // A burst of outstanding frees overflows the cache and
                // exercises the eviction path.
                let burst: Vec<usize> = (0..20)
                    .map(|_| {
                        let p = shardalloc::malloc(128);
                        assert!(!p.is_null());
                        unsafe { p.write_bytes(fill, 128) };
                        p as usize
                    })
                    .collect();
                for addr in burst {
                    let p = addr as *mut u8;
                    unsafe {
                        assert_eq!(p.read(), fill);
                        shardalloc::free(p);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn exiting_threads_return_their_cached_blocks() {
    setup();

    // Each short-lived thread parks a few frees in its cache and exits;
    // teardown has to ferry those blocks back to their arenas without
    // deadlocking or corrupting the heaps.
    for _ in 0..50 {
        thread::spawn(|| {
            shardalloc::init_thread_cache();
            let blocks: Vec<usize> = (0..6)
                .map(|_| {
                    let p = shardalloc::malloc(1000);
                    assert!(!p.is_null());
                    p as usize
                })
                .collect();
            for addr in blocks {
                unsafe { shardalloc::free(addr as *mut u8) };
            }
            // The six blocks are (mostly) sitting in this thread's cache
            // when it exits here.
        })
        .join()
        .unwrap();
    }

    // The pool is still fully functional afterwards.
    let p = shardalloc::malloc(1000);
    assert!(!p.is_null());
    unsafe { shardalloc::free(p) };
}
