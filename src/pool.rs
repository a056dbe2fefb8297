//! Sharding of mutator traffic across arenas.
//!
//! The pool owns a fixed array of arenas, each behind its own mutex, plus an
//! atomic round-robin counter. Allocations take the counter modulo the arena
//! count and lock only that arena, so unrelated threads proceed in parallel
//! on different shards. Frees look up the owning arena by address: every
//! arena's reservation span is immutable after construction, so the lookup
//! needs no lock at all, and reservations never overlap, so the owner is
//! unique.
//!
//! No thread ever holds more than one arena lock, and nothing here nests
//! locks, so there is no lock-order discipline to get wrong.

use core::ops::Range;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::mutex::{Mutex, MutexGuard};

use crate::arena::{Arena, BlockPtr, ARENA_MAX};
use crate::InitError;

/// One arena plus the data needed to route to it without locking.
struct Shard {
    /// The arena's reservation bounds; fixed for the pool's lifetime.
    span: Range<usize>,
    arena: Mutex<Arena>,
}

/// A fixed set of arenas sharing the allocation load.
pub(crate) struct ArenaPool {
    shards: Box<[Shard]>,
    /// Round-robin cursor. Purely advisory: skew or wrap-around only shifts
    /// load, never correctness.
    next: AtomicUsize,
}

impl ArenaPool {
    /// Build a pool of `arenas` arenas, each fully initialized with its
    /// reservation, sentinels and seed chunk. Zero selects the default of
    /// twice the logical CPU count.
    pub(crate) fn new(arenas: usize) -> Result<Self, InitError> {
        let count = if arenas == 0 {
            default_arena_count()
        } else {
            arenas
        };

        let mut shards = Vec::with_capacity(count);
        for _ in 0..count {
            let arena = Arena::new()?;
            shards.push(Shard {
                span: arena.span(),
                arena: Mutex::new(arena),
            });
        }

        log::debug!(
            "arena pool ready: {count} arenas, {} MiB reserved each",
            ARENA_MAX >> 20
        );

        Ok(Self {
            shards: shards.into_boxed_slice(),
            next: AtomicUsize::new(0),
        })
    }

    pub(crate) fn arena_count(&self) -> usize {
        self.shards.len()
    }

    /// Lock the next arena in round-robin order.
    ///
    /// A contended shard makes the caller wait rather than hunt for an idle
    /// one; keeping the mapping stable is worth the occasional short block.
    fn acquire(&self) -> MutexGuard<'_, Arena> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.shards[index].arena.lock()
    }

    /// Lock the arena whose reservation contains `addr`, if any.
    fn owner_of(&self, addr: usize) -> Option<MutexGuard<'_, Arena>> {
        self.shards
            .iter()
            .find(|shard| shard.span.contains(&addr))
            .map(|shard| shard.arena.lock())
    }

    /// Allocate `size` bytes from some arena. `None` on a zero-sized
    /// request or when the chosen arena's reservation is spent.
    pub(crate) fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        self.acquire().alloc(size)
    }

    /// Release a payload pointer previously returned by [`ArenaPool::alloc`].
    ///
    /// # Safety
    /// `payload` must have come from this pool and must not have been freed
    /// already.
    pub(crate) unsafe fn dealloc(&self, payload: NonNull<u8>) {
        self.free_block(BlockPtr::from_payload(payload));
    }

    /// Route a block back to its home arena and truly free it there.
    ///
    /// # Safety
    /// `block` must be an allocated block of one of this pool's arenas,
    /// exclusively owned by the caller.
    pub(crate) unsafe fn free_block(&self, block: BlockPtr) {
        match self.owner_of(block.addr()) {
            Some(mut arena) => arena.free_block(block),
            // A pointer this pool never handed out; freeing it is mutator
            // misuse. Catch it loudly in debug builds, leak it in release.
            None => debug_assert!(false, "freed pointer belongs to no arena"),
        }
    }
}

fn default_arena_count() -> usize {
    2 * std::thread::available_parallelism().map_or(1, |n| n.get())
}
