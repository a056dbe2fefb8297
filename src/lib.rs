//! Concurrent multi-arena memory allocator with per-thread caching
//!
//! This crate provides a general-purpose dynamic allocator for variable-sized
//! byte allocations, built to serve many threads at once with little
//! contention. Memory is obtained from the kernel in large per-arena
//! reservations and recycled internally; nothing goes back to the kernel
//! until the allocator itself is dropped (for the process-global variant:
//! process exit).
//!
//! # Architecture
//! Three layers cooperate, each one shaving synchronization off the layer
//! below:
//!
//! 1. **Arena** — one 128 MiB virtual reservation holding a boundary-tagged
//!    block heap with fifteen size-segregated free lists. Behind its mutex,
//!    an arena is a complete single-threaded malloc: bounded best-fit search,
//!    block splitting, and immediate coalescing of freed neighbors.
//! 2. **Pool** — a fixed array of arenas. Allocations are spread round-robin
//!    so concurrent threads mostly lock different arenas; frees find the
//!    owning arena by address without any lock, since reservations are
//!    immutable and disjoint.
//! 3. **Thread cache** — eight recently freed blocks per thread, served back
//!    to matching allocations with no lock at all. A `free` immediately
//!    followed by a `malloc` of the same size never touches an arena.
//!
//! Within an arena, every block starts with one tag word holding its size
//! plus two flag bits, and free blocks mirror that word at their end:
//!
//! ```text
//! | prologue | used | free ......... | used | free | epilogue |
//!            ^ size|a|p       size|a|p ............ 0|a|p
//! ```
//!
//! The `p` bit caches the left neighbor's allocation status, which is what
//! lets *allocated* blocks omit the trailing tag entirely; only free blocks
//! pay for a footer. Coalescing still sees every boundary it needs: a free
//! left neighbor has a footer to read, and an allocated one needs no
//! navigation at all.
//!
//! # Usage
//! The simplest entry point is an owned [`Allocator`], sized to taste:
//!
//! ```
//! let allocator = shardalloc::Allocator::new(4).unwrap();
//!
//! let p = allocator.alloc(100).unwrap();
//! // 16-byte aligned, at least 100 usable bytes
//! assert_eq!(p.as_ptr() as usize % 16, 0);
//! unsafe {
//!     p.as_ptr().write_bytes(0xff, 100);
//!     allocator.dealloc(p);
//! }
//! ```
//!
//! An [`Allocator`] with a single arena degenerates to a classic one-lock
//! malloc, which is handy as a baseline for comparisons.
//!
//! For the full design — sharding plus thread caches — use the process-wide
//! functions. [`init`] builds the global pool once; each thread may then
//! allocate and free through [`malloc`]/[`free`]:
//!
//! ```
//! shardalloc::init(0).unwrap(); // 0 = twice the CPU count
//! shardalloc::init_thread_cache();
//!
//! let p = shardalloc::malloc(64);
//! assert!(!p.is_null());
//! unsafe {
//!     p.write_bytes(0xab, 64);
//!     shardalloc::free(p);
//! }
//! ```
//!
//! # Guarantees and limits
//! * Returned addresses are 16-byte aligned; stricter alignment is not
//!   supported.
//! * `malloc(0)` returns null, `free(null)` is a no-op, matching the C
//!   conventions this interface mirrors.
//! * A request an arena cannot satisfy from its 128 MiB reservation yields
//!   null; exhaustion is reported, never retried internally.
//! * Double frees and frees of foreign pointers are undefined behavior.
//!   Debug builds assert on what they can cheaply detect (including a full
//!   heap-structure validation after every arena operation).

mod arena;
mod cache;
mod pool;

use core::ptr::{self, NonNull};

use spin::Once;

use arena::{adjusted_size, BlockPtr};
use pool::ArenaPool;

/// A failure while bringing an allocator (or the global pool) up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The global pool was already initialized; the first configuration
    /// stays in effect.
    AlreadyInitialized,
    /// The kernel refused to reserve address space for an arena.
    MapFailed {
        /// `errno` as reported by the failing `mmap` call.
        errno: i32,
    },
}

/// A self-contained multi-arena allocator.
///
/// Every `Allocator` owns its arenas outright, so independent instances
/// never contend with each other (or with the global pool). Allocations are
/// spread over the arenas round-robin; this variant performs no thread
/// caching.
pub struct Allocator {
    pool: ArenaPool,
}

impl Allocator {
    /// Build an allocator with `arenas` arenas, each backed by its own
    /// 128 MiB reservation. Zero selects the default of twice the logical
    /// CPU count; one yields a single-lock allocator.
    pub fn new(arenas: usize) -> Result<Self, InitError> {
        Ok(Self {
            pool: ArenaPool::new(arenas)?,
        })
    }

    /// Allocate at least `size` bytes, 16-byte aligned.
    ///
    /// Returns `None` for zero-sized requests and on reservation
    /// exhaustion.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.pool.alloc(size)
    }

    /// Release an allocation.
    ///
    /// # Safety
    /// `payload` must have been returned by [`Allocator::alloc`] on this
    /// very instance and must not be freed twice or used afterwards.
    pub unsafe fn dealloc(&self, payload: NonNull<u8>) {
        self.pool.dealloc(payload);
    }

    /// Number of arenas backing this allocator.
    pub fn arena_count(&self) -> usize {
        self.pool.arena_count()
    }
}

static POOL: Once<ArenaPool> = Once::new();

/// The process-wide pool, if [`init`] has completed.
pub(crate) fn global_pool() -> Option<&'static ArenaPool> {
    POOL.get()
}

/// Initialize the process-wide arena pool.
///
/// `arenas` is the shard count; zero selects the default of twice the
/// logical CPU count. Call this once, before any [`malloc`]. A repeated
/// call reports [`InitError::AlreadyInitialized`] and leaves the existing
/// pool untouched.
pub fn init(arenas: usize) -> Result<(), InitError> {
    if POOL.is_completed() {
        return Err(InitError::AlreadyInitialized);
    }
    POOL.try_call_once(|| ArenaPool::new(arenas)).map(|_| ())
}

/// Set up the calling thread's cache.
///
/// Call once per mutator thread before its first [`malloc`]. (The cache
/// would also be created lazily on first use; calling this up front merely
/// keeps that cost out of the first allocation.)
pub fn init_thread_cache() {
    cache::init_current_thread();
}

/// Allocate at least `size` bytes from the process-wide allocator.
///
/// The calling thread's cache is consulted first; on a hit the cached block
/// is returned without taking any lock. Returns a 16-byte aligned pointer,
/// or null if `size` is zero, the pool is exhausted, or [`init`] has not
/// run.
pub fn malloc(size: usize) -> *mut u8 {
    let Some(pool) = POOL.get() else {
        return ptr::null_mut();
    };
    if size == 0 {
        return ptr::null_mut();
    }

    // SAFETY: cached blocks are live allocated blocks of the global pool,
    // owned by this thread since it freed them.
    if let Some(block) = unsafe { cache::take(adjusted_size(size)) } {
        return block.payload().as_ptr();
    }

    pool.alloc(size).map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Release a pointer obtained from [`malloc`]. Freeing null is a no-op.
///
/// The block usually just moves into the calling thread's cache. When the
/// cache refuses it, the block is handed back to its home arena, where it
/// is coalesced with free neighbors; with small probability the cache first
/// evicts its oldest entry instead and keeps the fresh block, which favors
/// recently touched memory.
///
/// # Safety
/// `ptr` must be null or a pointer returned by [`malloc`] that has not been
/// freed already; the memory must no longer be accessed afterwards.
pub unsafe fn free(ptr: *mut u8) {
    let Some(payload) = NonNull::new(ptr) else {
        return;
    };
    let Some(pool) = POOL.get() else {
        debug_assert!(false, "free called before init");
        return;
    };

    let block = BlockPtr::from_payload(payload);
    if cache::stash(block) {
        return;
    }

    if rand::random_bool(cache::EVICT_PROBABILITY) {
        if let Some(victim) = cache::evict_one() {
            pool.free_block(victim);
            if cache::stash(block) {
                return;
            }
        }
    }

    pool.free_block(block);
}
