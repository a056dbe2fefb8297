//! The per-arena heap engine.
//!
//! An [`Arena`] is one self-contained heap: a single large virtual
//! reservation, a committed region growing forward inside it, and fifteen
//! segregated free lists over the free blocks of that region. All operations
//! here assume the caller holds the arena's lock (the lock itself lives in
//! [`crate::pool`]); within that lock the arena behaves like a
//! single-threaded malloc.
//!
//! The committed region is an implicit list of boundary-tagged blocks,
//! bracketed by two zero-sized allocated sentinels:
//!
//! ```text
//! | prologue | block | block | ... | block | epilogue |
//! ^ base                                   ^ heap_end - 8
//! ```
//!
//! The prologue stops coalescing from running off the low end. The epilogue
//! marks the top of committed memory; extending the heap turns the current
//! epilogue word into the header of a fresh free block and writes a new
//! epilogue above it, so growth costs no extra fixup of neighbor bits.

mod block;
mod reservation;
mod seglist;

pub(crate) use block::{adjusted_size, BlockPtr};

use block::{round_up, Word, DWORD, MIN_BLOCK, WORD};
use core::ops::Range;
use core::ptr::NonNull;
use reservation::Reservation;
use seglist::SegregatedLists;

use crate::InitError;

/// Granule by which a heap is extended when the free lists come up empty.
pub(crate) const CHUNK: usize = 4096;

/// Virtual address space reserved per arena (128 MiB). This is the hard
/// capacity of one arena; it is reserved up front and never resized.
pub(crate) const ARENA_MAX: usize = CHUNK << 15;

/// One lockable heap shard.
pub(crate) struct Arena {
    reservation: Reservation,
    /// Address of the first block header, just past the prologue.
    heap_start: *mut u8,
    /// One past the current epilogue header, i.e. the committed watermark.
    heap_end: *mut u8,
    lists: SegregatedLists,
}

// SAFETY: an arena is only ever mutated under its pool's mutex; the raw
// pointers never escape to code that does not hold that lock.
unsafe impl Send for Arena {}

impl Arena {
    /// Reserve, write the sentinels, and seed the heap with one free chunk.
    pub(crate) fn new() -> Result<Self, InitError> {
        let reservation = Reservation::new(ARENA_MAX)?;
        let base = reservation.base().as_ptr();

        // SAFETY: the reservation is fresh, writable and certainly larger
        // than the two sentinel words written here.
        unsafe {
            let words = base.cast::<Word>();
            words.write(block::pack(0, true, true)); // prologue
            words.add(1).write(block::pack(0, true, true)); // initial epilogue
        }

        let mut arena = Self {
            // SAFETY: both offsets are within the reservation.
            heap_start: unsafe { base.add(WORD) },
            heap_end: unsafe { base.add(2 * WORD) },
            reservation,
            lists: SegregatedLists::new(),
        };

        // SAFETY: the sentinels above form a valid (empty) heap, and the
        // previous block of the first extension is the allocated prologue.
        let seeded = unsafe { arena.extend(CHUNK, true) };
        debug_assert!(seeded.is_some(), "a fresh reservation cannot be exhausted");
        Ok(arena)
    }

    /// The reservation's address range. Immutable for the arena's lifetime,
    /// so it can be consulted without taking the arena lock.
    pub(crate) fn span(&self) -> Range<usize> {
        let base = self.reservation.base().as_ptr() as usize;
        base..base + self.reservation.len()
    }

    fn epilogue(&self) -> BlockPtr {
        // SAFETY: heap_end always sits one word past the epilogue header.
        unsafe { BlockPtr::from_header(self.heap_end.sub(WORD)) }
    }

    /// Allocate at least `size` usable bytes, or `None` on exhaustion.
    pub(crate) fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let asize = adjusted_size(size);

        // SAFETY: all block manipulation below stays inside this arena's
        // committed heap, which we own exclusively via the pool lock.
        unsafe {
            let b = match self.lists.find_fit(asize) {
                Some(found) => found,
                None => {
                    let prev_alloc = self.epilogue().prev_allocated();
                    self.extend(asize.max(CHUNK), prev_alloc)?
                }
            };
            debug_assert!(!b.is_allocated());

            self.lists.remove(b);
            b.write(b.size(), true, b.prev_allocated());
            self.split(b, asize);

            // The block just changed from free to allocated; its right
            // neighbor has to know.
            let next = b.next_physical();
            next.write(next.size(), next.is_allocated(), true);

            #[cfg(debug_assertions)]
            self.check_heap();

            Some(b.payload())
        }
    }

    /// Return an allocated block to this arena: mark free, coalesce with
    /// free neighbors, and list the result.
    ///
    /// # Safety
    /// `b` must be an allocated block of this arena not reachable by any
    /// other code (no double free), and the arena lock must be held.
    pub(crate) unsafe fn free_block(&mut self, b: BlockPtr) {
        debug_assert!(b.is_allocated(), "freeing a block that is not allocated");

        b.write(b.size(), false, b.prev_allocated());
        let next = b.next_physical();
        next.write(next.size(), next.is_allocated(), false);

        let merged = self.coalesce(b);
        self.lists.insert(merged);

        #[cfg(debug_assertions)]
        self.check_heap();
    }

    /// Merge a freshly freed block with whichever physical neighbors are
    /// free, unlisting them first. Returns the merged block, which is on no
    /// list.
    ///
    /// # Safety
    /// `b` must be a live free block of this arena that is not listed, with
    /// the arena lock held.
    unsafe fn coalesce(&mut self, b: BlockPtr) -> BlockPtr {
        let next = b.next_physical();
        let prev_free = !b.prev_allocated();
        let next_free = !next.is_allocated();
        let size = b.size();
        let next_size = next.size();

        let merged = match (prev_free, next_free) {
            (false, false) => return b,
            (false, true) => {
                self.lists.remove(next);
                b.write(size + next_size, false, true);
                b
            }
            (true, false) => {
                let prev = b.prev_physical();
                self.lists.remove(prev);
                prev.write(prev.size() + size, false, prev.prev_allocated());
                prev
            }
            (true, true) => {
                let prev = b.prev_physical();
                let prev_size = prev.size();
                self.lists.remove(prev);
                self.lists.remove(next);
                prev.write(prev_size + size + next_size, false, prev.prev_allocated());
                prev
            }
        };

        // The merged region is free; propagate that to its new right
        // neighbor.
        let next = merged.next_physical();
        next.write(next.size(), next.is_allocated(), false);
        merged
    }

    /// Shave the tail off an oversized allocated block, leaving `b` at
    /// exactly `asize` bytes and listing the remainder as a free block.
    ///
    /// A remainder too small to stand alone stays attached to `b` as
    /// internal fragmentation rather than becoming an unusable sliver.
    ///
    /// # Safety
    /// `b` must be a live allocated block of at least `asize` bytes, with
    /// the arena lock held.
    unsafe fn split(&mut self, b: BlockPtr, asize: usize) {
        debug_assert!(b.is_allocated());
        debug_assert!(b.size() >= asize);

        let total = b.size();
        if total - asize >= MIN_BLOCK {
            b.write(asize, true, b.prev_allocated());
            let rest = b.next_physical();
            rest.write(total - asize, false, true);
            self.lists.insert(rest);
        }
    }

    /// Commit `bytes` more heap, fold the new space into a free block
    /// (coalescing with a free old top), and list it.
    ///
    /// `prev_alloc` names the allocation status of the block that currently
    /// ends at the epilogue, which the old epilogue word inherits when it
    /// becomes the new block's header.
    ///
    /// # Safety
    /// The arena lock must be held.
    unsafe fn extend(&mut self, bytes: usize, prev_alloc: bool) -> Option<BlockPtr> {
        let bytes = round_up(bytes, DWORD);
        let old_end = self.grow(bytes)?;

        // The old epilogue header becomes the new block's header.
        let b = BlockPtr::from_header(old_end.sub(WORD));
        b.write(bytes, false, prev_alloc);
        b.next_physical().write_epilogue(false);

        let merged = self.coalesce(b);
        self.lists.insert(merged);
        Some(merged)
    }

    /// Advance the committed watermark by `bytes` within the reservation.
    /// Returns the old watermark, or `None` if the reservation is spent.
    fn grow(&mut self, bytes: usize) -> Option<*mut u8> {
        let end = self.heap_end;
        if end as usize + bytes > self.span().end {
            log::warn!(
                "arena reservation exhausted: {} bytes committed, {} more requested",
                end as usize - self.span().start,
                bytes
            );
            return None;
        }
        self.heap_end = end.wrapping_add(bytes);
        Some(end)
    }

    /// Walk the whole committed heap and assert every structural invariant:
    /// sizes are 16-byte granular and at least the minimum, free blocks
    /// mirror their header into their footer and never touch another free
    /// block, every header's prev-alloc bit matches its left neighbor, and
    /// the free lists contain exactly the free blocks.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn check_heap(&self) {
        // SAFETY: the caller holds the arena lock (or owns the arena), so
        // the heap cannot change under this walk.
        unsafe {
            let mut b = BlockPtr::from_header(self.heap_start);
            let mut prev_alloc = true; // the prologue is allocated
            let mut free_blocks = 0;

            loop {
                let size = b.size();
                if size == 0 {
                    // The epilogue: allocated, flush with the watermark.
                    assert!(b.is_allocated(), "epilogue must be allocated");
                    assert_eq!(
                        b.addr() + WORD,
                        self.heap_end as usize,
                        "epilogue must sit at the committed watermark"
                    );
                    assert_eq!(b.prev_allocated(), prev_alloc);
                    break;
                }

                assert!(size % DWORD == 0, "block size not 16-byte granular");
                assert!(size >= MIN_BLOCK, "undersized block");
                assert_eq!(b.prev_allocated(), prev_alloc, "stale prev-alloc bit");

                if !b.is_allocated() {
                    assert!(prev_alloc, "two adjacent free blocks survived");
                    assert_eq!(b.header(), b.footer(), "free block footer mismatch");
                    assert!(self.lists.contains(b), "free block missing from its list");
                    free_blocks += 1;
                }

                prev_alloc = b.is_allocated();
                b = b.next_physical();
            }

            assert_eq!(
                free_blocks,
                self.lists.total_len(),
                "free lists hold blocks the heap walk did not find"
            );
        }
    }
}
