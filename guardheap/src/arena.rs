//! Fixed-capacity pool of block descriptors.
//!
//! Every region of the user area is described by one [`BlockInfo`] record.
//! Records live in the reservation's bookkeeping pages (see the layout
//! module) and are referenced by [`BlockIdx`] indices; unused records form
//! an intrusive singly-linked chain through their `next` field. Recycled
//! records are stamped [`BlockState::Unused`] so that a stale index trips
//! an assert instead of silently aliasing a live region.

use std::ptr::NonNull;

/// Index of a descriptor within the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockIdx(u32);

impl BlockIdx {
    fn get(self) -> usize {
        self.0 as usize
    }

    #[cfg(test)]
    pub(crate) fn for_test(raw: u32) -> Self {
        Self(raw)
    }
}

/// Lifecycle state of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// Available for allocation; on the free list.
    Free,
    /// Handed out to a caller; reachable through the page lookup table.
    Allocated,
    /// Released by the caller but held back from reuse; on the pending list.
    PendingFree,
    /// Recycled descriptor on the arena's unused chain.
    Unused,
}

/// Descriptor for one contiguous run of pages in the user area.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockInfo {
    pub state: BlockState,
    /// First page of the run, relative to the user area base.
    pub page_index: u32,
    /// Length of the run in pages, >= 1 while the descriptor is live.
    pub page_count: u32,
    /// Lower-address neighbour in the address-ordered chain.
    pub prev: Option<BlockIdx>,
    /// Higher-address neighbour; doubles as the unused-chain link.
    pub next: Option<BlockIdx>,
}

/// Pool of descriptors with an intrusive unused chain.
///
/// The records live in memory the pool does not own; see
/// [`from_raw`](Self::from_raw).
pub(crate) struct BlockArena {
    records: NonNull<BlockInfo>,
    capacity: u32,
    first_unused: Option<BlockIdx>,
}

impl BlockArena {
    /// Builds an arena over `capacity` records at `records`, initializing
    /// every one as `Unused` and chaining them.
    ///
    /// # Safety
    ///
    /// `records` must point to writable, correctly aligned storage for
    /// `capacity` records that outlives the arena and is not accessed by
    /// anything else while the arena is live.
    pub unsafe fn from_raw(records: NonNull<BlockInfo>, capacity: u32) -> Self {
        for i in 0..capacity {
            // SAFETY: i < capacity and the caller vouches for the storage.
            unsafe {
                records.add(i as usize).write(BlockInfo {
                    state: BlockState::Unused,
                    page_index: 0,
                    page_count: 0,
                    prev: None,
                    next: (i + 1 < capacity).then(|| BlockIdx(i + 1)),
                });
            }
        }
        Self {
            records,
            capacity,
            first_unused: (capacity > 0).then_some(BlockIdx(0)),
        }
    }

    /// Takes a descriptor off the unused chain and resets it.
    ///
    /// The descriptor comes back in state [`BlockState::Free`] with zeroed
    /// counts and no neighbours. Exhaustion and a non-`Unused` record at the
    /// chain head are both fatal.
    pub fn alloc(&mut self) -> BlockIdx {
        let idx = self.first_unused.expect("block arena exhausted");
        let info = self.get_mut(idx);
        assert!(
            info.state == BlockState::Unused,
            "block arena corrupted: live descriptor on the unused chain"
        );
        let next = info.next;
        *info = BlockInfo {
            state: BlockState::Free,
            page_index: 0,
            page_count: 0,
            prev: None,
            next: None,
        };
        self.first_unused = next;
        idx
    }

    /// Returns a descriptor to the unused chain.
    pub fn free(&mut self, idx: BlockIdx) {
        let head = self.first_unused;
        let info = self.get_mut(idx);
        info.state = BlockState::Unused;
        info.prev = None;
        info.next = head;
        self.first_unused = Some(idx);
    }

    pub fn get(&self, idx: BlockIdx) -> &BlockInfo {
        assert!(idx.0 < self.capacity, "block index out of range");
        // SAFETY: in range, and from_raw's contract gives the arena sole
        // access to the records.
        unsafe { self.records.add(idx.get()).as_ref() }
    }

    pub fn get_mut(&mut self, idx: BlockIdx) -> &mut BlockInfo {
        assert!(idx.0 < self.capacity, "block index out of range");
        // SAFETY: as in get, with &mut self for exclusivity.
        unsafe { self.records.add(idx.get()).as_mut() }
    }

    /// Number of descriptors the arena was built with.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Length of the unused chain.
    #[cfg(test)]
    pub fn unused_len(&self) -> usize {
        let mut n = 0;
        let mut cur = self.first_unused;
        while let Some(idx) = cur {
            n += 1;
            cur = self.get(idx).next;
        }
        n
    }
}
