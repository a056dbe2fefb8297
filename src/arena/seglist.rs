//! Size-segregated free lists.
//!
//! Each arena keeps fifteen doubly-linked lists of free blocks, binned by
//! size class. Class 0 holds the smallest blocks (up to one 64-byte
//! granule), every following class roughly doubles the upper bound, and the
//! last class is the catch-all for everything larger. The links live inside
//! the free blocks' own payload words (see [`super::block`]), so the lists
//! cost no memory beyond the head array.
//!
//! Insertion is LIFO at the head: freshly freed blocks are the warmest and
//! should be handed out again first. The fit search compensates for the
//! resulting unsorted lists by taking the best of a bounded number of
//! candidates instead of the first.

use super::block::BlockPtr;

/// Number of size classes per arena.
pub(crate) const MAX_LISTS: usize = 15;

/// Upper bound on candidates examined per class during a fit search.
const MAX_SEARCH: usize = 15;

/// The size class a block of `size` bytes belongs to.
///
/// The size is reduced to 64-byte granules; the class is the bit length of
/// the granule count, capped at the catch-all class. Blocks below 64 bytes
/// land in class 0, 64..127 in class 1, 128..255 in class 2, and so on.
pub(crate) fn class_of(size: usize) -> usize {
    let mut granules = size >> 6;
    let mut class = 0;
    while granules != 0 && class < MAX_LISTS - 1 {
        granules >>= 1;
        class += 1;
    }
    class
}

/// The fifteen free-list heads of one arena.
pub(crate) struct SegregatedLists {
    heads: [Option<BlockPtr>; MAX_LISTS],
}

impl SegregatedLists {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; MAX_LISTS],
        }
    }

    /// Push a free block onto the head of its size class.
    ///
    /// Inserting the current head again is a no-op, so callers never have to
    /// guard against re-insertion of the same block.
    ///
    /// # Safety
    /// `block` must be a live free block that is not on any list, or the
    /// current head of its class. The caller must hold the arena lock.
    pub(crate) unsafe fn insert(&mut self, block: BlockPtr) {
        debug_assert!(!block.is_allocated(), "allocated blocks are never listed");

        let class = class_of(block.size());
        let head = self.heads[class];
        if head == Some(block) {
            return;
        }

        block.set_list_prev(None);
        block.set_list_next(head);
        if let Some(head) = head {
            head.set_list_prev(Some(block));
        }
        self.heads[class] = Some(block);
    }

    /// Splice a block out of its list using its own link words.
    ///
    /// No list search happens here; the block's links already name its
    /// neighbors. Calling this on the degenerate empty class is a no-op.
    ///
    /// # Safety
    /// `block` must be a live free block on the list of its size class. The
    /// caller must hold the arena lock.
    pub(crate) unsafe fn remove(&mut self, block: BlockPtr) {
        let class = class_of(block.size());
        if self.heads[class].is_none() {
            return;
        }

        let prev = block.list_prev();
        let next = block.list_next();
        match prev {
            Some(prev) => prev.set_list_next(next),
            None => self.heads[class] = next,
        }
        if let Some(next) = next {
            next.set_list_prev(prev);
        }
        block.set_list_prev(None);
        block.set_list_next(None);
    }

    /// Find a free block of at least `asize` bytes, or `None`.
    ///
    /// Only the minimal class and the one above it are consulted, and at
    /// most [`MAX_SEARCH`] candidates are examined per class; the best
    /// (tightest) fit seen across both wins, with an exact fit ending the
    /// search immediately. Deeper classes are deliberately left alone: the
    /// caller is better off extending the heap than paying an unbounded
    /// walk.
    ///
    /// # Safety
    /// The lists must be consistent (every listed block live and free). The
    /// caller must hold the arena lock.
    pub(crate) unsafe fn find_fit(&self, asize: usize) -> Option<BlockPtr> {
        let min_class = class_of(asize);
        let last_class = (min_class + 1).min(MAX_LISTS - 1);

        let mut best: Option<(BlockPtr, usize)> = None;
        for class in min_class..=last_class {
            let mut cursor = self.heads[class];
            let mut examined = 0;
            while let Some(block) = cursor {
                if examined == MAX_SEARCH {
                    break;
                }
                examined += 1;

                let size = block.size();
                if size >= asize {
                    let slack = size - asize;
                    if slack == 0 {
                        return Some(block);
                    }
                    if best.map_or(true, |(_, best_slack)| slack < best_slack) {
                        best = Some((block, slack));
                    }
                }
                cursor = block.list_next();
            }
        }
        best.map(|(block, _)| block)
    }

    /// Whether `block` is currently on the list of its size class.
    ///
    /// # Safety
    /// Same consistency requirements as [`SegregatedLists::find_fit`].
    #[cfg(any(test, debug_assertions))]
    pub(crate) unsafe fn contains(&self, block: BlockPtr) -> bool {
        let mut cursor = self.heads[class_of(block.size())];
        while let Some(candidate) = cursor {
            if candidate == block {
                return true;
            }
            cursor = candidate.list_next();
        }
        false
    }

    /// Total number of listed blocks across all classes.
    ///
    /// # Safety
    /// Same consistency requirements as [`SegregatedLists::find_fit`].
    #[cfg(any(test, debug_assertions))]
    pub(crate) unsafe fn total_len(&self) -> usize {
        let mut count = 0;
        for head in self.heads {
            let mut cursor = head;
            while let Some(block) = cursor {
                count += 1;
                cursor = block.list_next();
            }
        }
        count
    }

    /// Number of blocks in one class.
    #[cfg(test)]
    unsafe fn class_len(&self, class: usize) -> usize {
        let mut count = 0;
        let mut cursor = self.heads[class];
        while let Some(block) = cursor {
            count += 1;
            cursor = block.list_next();
        }
        count
    }
}
