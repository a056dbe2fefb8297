//! Multi-threaded behavior of the object API.
//!
//! These tests hammer one shared allocator from many threads and rely on
//! payload patterns to surface races: if two threads were ever handed
//! overlapping memory, the pattern checks fail.

use std::ptr::NonNull;
use std::sync::Barrier;
use std::thread;

use shardalloc::Allocator;

#[test]
fn synchronized_allocs_then_deallocs() {
    let allocator = Allocator::new(4).unwrap();
    let num_threads = 8;
    let barrier = Barrier::new(num_threads);

    thread::scope(|scope| {
        for thread_index in 0..num_threads {
            let allocator = &allocator;
            let barrier = &barrier;
            scope.spawn(move || {
                let size = 4096;
                let p = allocator.alloc(size).unwrap();
                let fill = thread_index as u8 ^ 0x5a;
                unsafe { p.as_ptr().write_bytes(fill, size) };

                // Everyone holds their allocation across the barrier, so
                // all eight ranges are live at once.
                barrier.wait();

                for offset in 0..size {
                    unsafe {
                        assert_eq!(p.as_ptr().add(offset).read(), fill);
                    }
                }
                unsafe { allocator.dealloc(p) };
            });
        }
    });
}

#[test]
fn interleaved_allocs_and_deallocs() {
    let allocator = Allocator::new(4).unwrap();
    let num_threads = 8;
    let barrier = Barrier::new(num_threads);

    thread::scope(|scope| {
        for thread_index in 0..num_threads {
            let allocator = &allocator;
            let barrier = &barrier;
            scope.spawn(move || {
                let sizes = [16usize, 256, 1024, 2048, 4096, 8192];
                let fill = (thread_index as u8).wrapping_mul(31).wrapping_add(7);

                for size in sizes {
                    barrier.wait();
                    for _ in 0..500 {
                        let p = allocator.alloc(size).unwrap();
                        unsafe {
                            // Pattern the edges and middle; a full fill per
                            // iteration would drown the allocator work in
                            // memset time.
                            p.as_ptr().write(fill);
                            p.as_ptr().add(size / 2).write(fill);
                            p.as_ptr().add(size - 1).write(fill);
                            assert_eq!(p.as_ptr().read(), fill);
                            assert_eq!(p.as_ptr().add(size / 2).read(), fill);
                            assert_eq!(p.as_ptr().add(size - 1).read(), fill);
                            allocator.dealloc(p);
                        }
                    }
                }
            });
        }
    });
}

#[test]
fn long_lived_allocations_survive_foreign_churn() {
    let allocator = Allocator::new(2).unwrap();

    // One thread parks long-lived allocations while the others churn. The
    // parked payloads must come through untouched.
    let parked: Vec<_> = (0..32)
        .map(|index| {
            let size = 64 + 100 * index;
            let p = allocator.alloc(size).unwrap();
            unsafe { p.as_ptr().write_bytes(index as u8, size) };
            (p, size, index as u8)
        })
        .collect();

    thread::scope(|scope| {
        for _ in 0..4 {
            let allocator = &allocator;
            scope.spawn(move || {
                for round in 0..2000usize {
                    let size = 16 + (round % 50) * 16;
                    let p = allocator.alloc(size).unwrap();
                    unsafe {
                        p.as_ptr().write_bytes(0xff, size);
                        allocator.dealloc(p);
                    }
                }
            });
        }
    });

    for (p, size, pattern) in parked {
        for offset in 0..size {
            unsafe {
                assert_eq!(p.as_ptr().add(offset).read(), pattern);
            }
        }
        unsafe { allocator.dealloc(p) };
    }
}

#[test]
fn cross_thread_free_finds_the_home_arena() {
    let allocator = Allocator::new(3).unwrap();

    // Allocate on the main thread, free on workers: the address-based arena
    // lookup has to route every block home regardless of the freeing
    // thread.
    let blocks: Vec<_> = (0..30).map(|_| allocator.alloc(512).unwrap()).collect();
    for p in &blocks {
        unsafe { p.as_ptr().write_bytes(0x33, 512) };
    }

    thread::scope(|scope| {
        for chunk in blocks.chunks(10) {
            let allocator = &allocator;
            // Raw pointers are not Send; ferry plain addresses instead.
            let addrs: Vec<usize> = chunk.iter().map(|p| p.as_ptr() as usize).collect();
            scope.spawn(move || {
                for addr in addrs {
                    unsafe { allocator.dealloc(NonNull::new_unchecked(addr as *mut u8)) };
                }
            });
        }
    });

    // All arenas took their blocks back without corruption; further
    // allocation still works.
    let p = allocator.alloc(512).unwrap();
    unsafe { allocator.dealloc(p) };
}
