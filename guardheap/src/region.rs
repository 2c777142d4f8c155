//! Page-run region manager.
//!
//! The user area is tiled exactly by an address-ordered, doubly-linked chain
//! of regions. [`RegionPool`] owns the descriptor arena and two unordered
//! working sets indexing the chain by state: the *free list* of regions
//! available for allocation and the *pending list* of regions released by
//! the caller but held back from reuse. All three live in the reservation's
//! bookkeeping pages; the pool is handed its carved tables at construction.
//!
//! Allocation is best-fit with split-on-surplus; deallocation only enqueues.
//! Coalescing is deferred to [`flush_pending`](RegionPool::flush_pending),
//! which runs when an allocation cannot otherwise be satisfied. Holding
//! released regions in [`BlockState::PendingFree`] keeps their pages
//! decommitted for as long as possible, which is what makes stale pointers
//! fault instead of landing in a recycled allocation.

use crate::arena::{BlockArena, BlockIdx, BlockInfo, BlockState};
use crate::layout::IndexList;

/// Region bookkeeping for a user area of `page_count` pages.
pub(crate) struct RegionPool {
    arena: BlockArena,
    /// Unordered indices of all `Free` regions. Removal is swap-with-last.
    free: IndexList,
    /// Unordered indices of all `PendingFree` regions, in release order.
    pending: IndexList,
    /// The region covering page 0. Its descriptor is never destroyed (it has
    /// no lower neighbour to be merged into), so it anchors chain walks.
    head: BlockIdx,
}

impl RegionPool {
    /// Builds the pool over its carved bookkeeping tables, with a single
    /// free region spanning all `page_count` pages.
    pub fn new(page_count: u32, mut arena: BlockArena, mut free: IndexList, pending: IndexList) -> Self {
        let root = arena.alloc();
        arena.get_mut(root).page_count = page_count;
        free.push(root);
        Self {
            arena,
            free,
            pending,
            head: root,
        }
    }

    pub fn block(&self, idx: BlockIdx) -> &BlockInfo {
        self.arena.get(idx)
    }

    /// Takes the smallest free region of at least `pages` pages.
    ///
    /// Ties resolve to the first region encountered. A strictly larger
    /// region is split: the chosen descriptor keeps the low `pages` pages
    /// and becomes `Allocated`; a fresh descriptor takes the surplus tail,
    /// is linked in after it, and joins the free list. Returns `None` when
    /// no free region is large enough.
    pub fn take_best_fit(&mut self, pages: u32) -> Option<BlockIdx> {
        let mut best: Option<(usize, BlockIdx, u32)> = None;
        for (pos, idx) in self.free.iter().enumerate() {
            let block = self.arena.get(idx);
            assert!(
                block.state == BlockState::Free,
                "free list corrupted: entry is not a free region"
            );
            if block.page_count >= pages && best.is_none_or(|(_, _, count)| block.page_count < count)
            {
                best = Some((pos, idx, block.page_count));
            }
        }
        let (pos, idx, count) = best?;
        self.free.swap_remove(pos);

        let surplus = count - pages;
        if surplus > 0 {
            let tail = self.arena.alloc();
            let chosen = self.arena.get_mut(idx);
            let old_next = chosen.next;
            let tail_page_index = chosen.page_index + pages;
            chosen.page_count = pages;
            chosen.next = Some(tail);

            let t = self.arena.get_mut(tail);
            t.page_index = tail_page_index;
            t.page_count = surplus;
            t.prev = Some(idx);
            t.next = old_next;
            if let Some(n) = old_next {
                self.arena.get_mut(n).prev = Some(tail);
            }
            self.free.push(tail);
        }

        self.arena.get_mut(idx).state = BlockState::Allocated;
        Some(idx)
    }

    /// Moves an allocated region onto the pending list.
    ///
    /// Touches neither the chain nor the free list; the region's pages stay
    /// out of circulation until the next flush.
    pub fn enqueue_pending(&mut self, idx: BlockIdx) {
        let block = self.arena.get_mut(idx);
        debug_assert_eq!(block.state, BlockState::Allocated);
        block.state = BlockState::PendingFree;
        self.pending.push(idx);
    }

    /// Drains the pending list, coalescing each entry with free neighbours.
    ///
    /// For each pending region, in release order: merge into a free,
    /// physically adjacent lower neighbour if one exists, then absorb a
    /// free, physically adjacent higher neighbour. Only `Free` neighbours
    /// merge; a pending neighbour keeps its own entry and is processed on
    /// its own turn. Entries that merged into nothing become free regions
    /// themselves.
    pub fn flush_pending(&mut self) {
        for i in 0..self.pending.len() {
            let idx = self.pending.get(i);
            let mut work = idx;
            let mut merged_left = false;

            let block = *self.arena.get(idx);
            if let Some(prev) = block.prev {
                let p = self.arena.get(prev);
                if p.state == BlockState::Free
                    && p.page_index + p.page_count == block.page_index
                {
                    // Grow the left neighbour over this region and unlink it.
                    if let Some(n) = block.next {
                        self.arena.get_mut(n).prev = Some(prev);
                    }
                    let p = self.arena.get_mut(prev);
                    p.next = block.next;
                    p.page_count += block.page_count;
                    self.arena.free(idx);
                    work = prev;
                    merged_left = true;
                }
            }

            let w = *self.arena.get(work);
            if let Some(next) = w.next {
                let n = *self.arena.get(next);
                if n.state == BlockState::Free && n.page_index == w.page_index + w.page_count {
                    // Absorb the right neighbour and retire its descriptor.
                    if let Some(nn) = n.next {
                        self.arena.get_mut(nn).prev = Some(work);
                    }
                    let wm = self.arena.get_mut(work);
                    wm.next = n.next;
                    wm.page_count += n.page_count;

                    let pos = self
                        .free
                        .iter()
                        .position(|f| f == next)
                        .expect("free list corrupted: free neighbour missing");
                    self.free.swap_remove(pos);
                    self.arena.free(next);
                }
            }

            if !merged_left {
                // Nothing to the left took this region over; it becomes a
                // free region in its own right.
                self.arena.get_mut(work).state = BlockState::Free;
                self.free.push(work);
            }
        }
        self.pending.clear();
    }

    /// Number of regions currently on the free list.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Number of regions currently awaiting a flush.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Total pages across all free regions.
    pub fn free_pages(&self) -> usize {
        self.free
            .iter()
            .map(|idx| self.arena.get(idx).page_count as usize)
            .sum()
    }

    /// The chain as `(page_index, page_count, state)` triples, low to high.
    #[cfg(test)]
    pub fn chain(&self) -> Vec<(u32, u32, BlockState)> {
        let mut out = Vec::new();
        let mut cur = Some(self.head);
        while let Some(idx) = cur {
            let b = self.arena.get(idx);
            out.push((b.page_index, b.page_count, b.state));
            cur = b.next;
        }
        out
    }

    #[cfg(test)]
    pub fn arena(&self) -> &BlockArena {
        &self.arena
    }
}
