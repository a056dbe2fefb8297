//! Per-thread cache of recently freed blocks.
//!
//! Each mutator thread keeps a handful of blocks it freed recently and hands
//! them straight back to matching allocations, skipping the arena lock and
//! the whole search/split/coalesce machinery. Cached blocks stay marked
//! allocated in their home heap, so from the arena's point of view they are
//! simply still in use and no coalescing neighbor can absorb them.
//!
//! The cache is deliberately tiny: eight slots and one megabyte of aggregate
//! block bytes. A thread that frees more than fits either passes the block
//! through to its arena, or (with small probability) first evicts the oldest
//! cached entry to make room. The probabilistic eviction absorbs bursts
//! without letting any single thread hoard memory.
//!
//! Everything here is thread-local; no operation takes a lock.

use core::cell::RefCell;

use crate::arena::BlockPtr;

/// Slot capacity of one cache.
pub(crate) const MAX_ENTRIES: usize = 8;

/// Aggregate byte capacity of one cache.
pub(crate) const MAX_BYTES: usize = 1 << 20;

/// Probability of evicting (rather than bypassing) when the cache is full.
pub(crate) const EVICT_PROBABILITY: f64 = 0.1;

/// A fixed array of block slots with an aggregate byte budget.
///
/// `front` names the lowest occupied slot index (or [`MAX_ENTRIES`] when the
/// cache is empty); eviction and lookup both start there, so the lowest
/// slots act as the "old" end of the cache.
pub(crate) struct ThreadCache {
    slots: [Option<BlockPtr>; MAX_ENTRIES],
    entries: usize,
    bytes: usize,
    front: usize,
}

impl ThreadCache {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [None; MAX_ENTRIES],
            entries: 0,
            bytes: 0,
            front: MAX_ENTRIES,
        }
    }

    /// Try to stash `block`. Refuses (returning `false`) when all slots are
    /// taken or the block would push the cache over its byte budget.
    ///
    /// # Safety
    /// `block` must be a live allocated block exclusively owned by the
    /// calling thread.
    pub(crate) unsafe fn add(&mut self, block: BlockPtr) -> bool {
        if self.entries == MAX_ENTRIES {
            return false;
        }
        let size = block.size();
        if self.bytes + size > MAX_BYTES {
            return false;
        }

        let Some(index) = self.slots.iter().position(Option::is_none) else {
            return false;
        };
        self.slots[index] = Some(block);
        self.entries += 1;
        self.bytes += size;
        if index < self.front {
            self.front = index;
        }
        true
    }

    /// Remove and return the front-most cached block, or `None` if the
    /// cache is empty (which can happen when a block was refused purely for
    /// its size).
    ///
    /// # Safety
    /// The cached blocks must still be live.
    pub(crate) unsafe fn evict(&mut self) -> Option<BlockPtr> {
        if self.entries == 0 {
            return None;
        }
        let block = self.slots[self.front].take();
        debug_assert!(block.is_some(), "front always names an occupied slot");
        if let Some(block) = block {
            self.entries -= 1;
            self.bytes -= block.size();
        }
        self.advance_front();
        block
    }

    /// First-fit lookup: scan from the front for a block of at least
    /// `asize` bytes and remove it on a hit.
    ///
    /// Old entries are preferred on purpose. Everything in the cache was
    /// touched recently enough to be warm, so coverage beats strict recency
    /// here (the opposite call from the arena lists, which serve LIFO).
    ///
    /// # Safety
    /// The cached blocks must still be live.
    pub(crate) unsafe fn query(&mut self, asize: usize) -> Option<BlockPtr> {
        for index in self.front..MAX_ENTRIES {
            let Some(block) = self.slots[index] else {
                continue;
            };
            if block.size() >= asize {
                self.slots[index] = None;
                self.entries -= 1;
                self.bytes -= block.size();
                if index == self.front {
                    self.advance_front();
                }
                return Some(block);
            }
        }
        None
    }

    fn advance_front(&mut self) {
        while self.front < MAX_ENTRIES && self.slots[self.front].is_none() {
            self.front += 1;
        }
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        // The thread is going away; ferry whatever it still caches back to
        // the owning arenas instead of stranding the blocks forever.
        if let Some(pool) = crate::global_pool() {
            for slot in &mut self.slots {
                if let Some(block) = slot.take() {
                    // SAFETY: cached blocks are allocated blocks of the
                    // global pool that only this thread could reach.
                    unsafe { pool.free_block(block) };
                }
            }
        }
    }
}

std::thread_local! {
    static CACHE: RefCell<ThreadCache> = const { RefCell::new(ThreadCache::new()) };
}

/// Force creation of the calling thread's cache.
pub(crate) fn init_current_thread() {
    CACHE.with(|_| {});
}

/// Take a cached block of at least `asize` bytes, if the calling thread has
/// one.
///
/// # Safety
/// The global pool must outlive the returned block's use.
pub(crate) unsafe fn take(asize: usize) -> Option<BlockPtr> {
    // SAFETY: forwarded to the caller's contract.
    CACHE.with(|cache| unsafe { cache.borrow_mut().query(asize) })
}

/// Try to stash `block` in the calling thread's cache.
///
/// # Safety
/// `block` must be a live allocated block exclusively owned by the calling
/// thread.
pub(crate) unsafe fn stash(block: BlockPtr) -> bool {
    // SAFETY: forwarded to the caller's contract.
    CACHE.with(|cache| unsafe { cache.borrow_mut().add(block) })
}

/// Pop the calling thread's oldest cached block for hand-back to its arena.
///
/// # Safety
/// The global pool must still be alive.
pub(crate) unsafe fn evict_one() -> Option<BlockPtr> {
    // SAFETY: forwarded to the caller's contract.
    CACHE.with(|cache| unsafe { cache.borrow_mut().evict() })
}
