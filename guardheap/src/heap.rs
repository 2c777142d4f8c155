//! The debug heap: placement policy and public API.
//!
//! [`GuardHeap`] turns byte-size requests into page-protected allocations.
//! Each allocation takes a run of pages ending in a decommitted guard page,
//! with the user pointer aligned toward the end of the last payload page so
//! that positive overruns land on the guard. Freeing decommits the payload
//! and parks the region on the pending list; the pages are not considered
//! for reuse until an allocation cannot be satisfied without them.
//!
//! Misuse -- double frees, pointers the heap never handed out, concurrent
//! unsynchronized calls, corrupted bookkeeping -- is fatal by design: the
//! heap panics with a diagnostic rather than limping on with a broken
//! invariant. The only soft failure is out-of-memory, reported as `None`.

use std::alloc::{GlobalAlloc, Layout};
use std::cell::UnsafeCell;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::PAGE_SIZE;
use crate::arena::{BlockArena, BlockState};
use crate::layout::{HeapLayout, IndexList, PageLookup};
use crate::region::RegionPool;
use crate::vm::{OsMemory, VirtualMemory};

/// Byte written into the slack between a payload page start and the user
/// pointer. Never read back today; it makes stray reads of the slack obvious
/// in a debugger and reserves the pattern for an integrity check on free.
const PAD_FILL: u8 = 0xFC;

/// Error from [`GuardHeap::new`] / [`GuardHeap::with_memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The OS refused to reserve address space for the heap.
    ReserveFailed,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReserveFailed => write!(f, "address space reservation failed"),
        }
    }
}

impl std::error::Error for InitError {}

// ---------------------------------------------------------------------------
// Reentrancy guard
// ---------------------------------------------------------------------------

/// Scoped claim of the heap's single-slot entry counter.
///
/// Entry atomically increments the counter and requires the post-increment
/// value to be exactly 1; exit decrements and requires exactly 0. Both
/// failures are fatal. Because the increment is a true atomic
/// read-modify-write, two racing entries each observe the collision -- one
/// at entry, the other at exit.
struct ReentrancyClaim<'a> {
    counter: &'a AtomicU32,
}

impl<'a> ReentrancyClaim<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        let post = counter.fetch_add(1, Ordering::AcqRel) + 1;
        assert!(
            post == 1,
            "unsynchronized multi-threaded or reentrant heap use detected"
        );
        Self { counter }
    }
}

impl Drop for ReentrancyClaim<'_> {
    fn drop(&mut self) {
        let post = self.counter.fetch_sub(1, Ordering::AcqRel).wrapping_sub(1);
        assert!(
            post == 0,
            "unsynchronized multi-threaded or reentrant heap use detected"
        );
    }
}

// ---------------------------------------------------------------------------
// GuardHeap
// ---------------------------------------------------------------------------

/// A page-protected debug heap over one contiguous address reservation.
///
/// Constructed once and torn down by `Drop`, which returns the whole
/// reservation to the OS. The reservation holds everything: bookkeeping
/// pages at the front (committed at construction, carrying the descriptor
/// records, the working-set tables, and the page lookup), then the `bytes`
/// of user area, whose pages are committed only while an allocation backs
/// them. All operations take `&self`:
/// interior mutability plus the reentrancy counter let the heap be shared
/// the way a production allocator would be, so that *unsynchronized*
/// concurrent use shows up as a panic at the offending call instead of being
/// quietly prevented by the type system. Callers that want real concurrency
/// wrap the heap in their own lock.
///
/// ```no_run
/// use guardheap::GuardHeap;
///
/// let heap = GuardHeap::new(2 * 1024 * 1024).unwrap();
/// let p = heap.allocate(128, 4).expect("out of memory");
/// // p points at the last 128 addressable bytes before an inaccessible
/// // page: p[127] is fine, p[128] faults.
/// heap.free(p);
/// ```
pub struct GuardHeap<V: VirtualMemory = OsMemory> {
    inner: UnsafeCell<HeapInner<V>>,
    reentrancy: AtomicU32,
}

// SAFETY: every entry point claims the reentrancy counter before touching
// the cell; a second concurrent entry panics at the claim, so at most one
// thread ever holds a reference into the cell. V is only driven by that
// thread, hence V: Send suffices.
unsafe impl<V: VirtualMemory + Send> Send for GuardHeap<V> {}
// SAFETY: as above; `&GuardHeap` grants no unguarded access to the cell.
unsafe impl<V: VirtualMemory + Send> Sync for GuardHeap<V> {}

struct HeapInner<V> {
    vm: V,
    /// Base of the whole reservation: bookkeeping pages, then user pages.
    reservation: NonNull<u8>,
    /// Size of the whole reservation in bytes.
    total_bytes: usize,
    /// Base of the user area, page-aligned, past the bookkeeping pages.
    base: NonNull<u8>,
    /// Pages in the user area.
    page_count: u32,
    regions: RegionPool,
    /// First-page index of every allocated region maps to its descriptor;
    /// every other entry is `None`.
    lookup: PageLookup,
}

impl GuardHeap<OsMemory> {
    /// Creates a heap with `bytes` of user area backed by the OS driver.
    ///
    /// `bytes` must be a positive multiple of [`PAGE_SIZE`] and at least two
    /// pages (every allocation needs a payload page and a guard page); pad
    /// generously -- the more spare pages, the longer freed ranges stay
    /// unmapped and the more use-after-free bugs actually fault.
    ///
    /// # Errors
    ///
    /// [`InitError::ReserveFailed`] if the OS refuses the reservation.
    pub fn new(bytes: usize) -> Result<Self, InitError> {
        Self::with_memory(OsMemory::new(), bytes)
    }
}

impl<V: VirtualMemory> GuardHeap<V> {
    /// Creates a heap over a caller-supplied virtual memory driver.
    ///
    /// See [`GuardHeap::new`] for the size contract.
    ///
    /// # Errors
    ///
    /// [`InitError::ReserveFailed`] if the driver refuses the reservation.
    pub fn with_memory(mut vm: V, bytes: usize) -> Result<Self, InitError> {
        assert!(
            bytes > 0 && bytes % PAGE_SIZE == 0,
            "heap size must be a positive multiple of the page size"
        );
        assert!(bytes / PAGE_SIZE >= 2, "heap must span at least two pages");
        let layout = HeapLayout::new(bytes);
        let page_count = layout.page_count();

        let reservation = vm
            .reserve(layout.total_bytes())
            .ok_or(InitError::ReserveFailed)?;
        // The bookkeeping pages stay committed for the heap's whole
        // lifetime; the user pages are committed only while allocations
        // back them.
        // SAFETY: the range is the front of our own reservation.
        unsafe { vm.commit(reservation, layout.bookkeeping_bytes()) };

        // Carve the tables out of the committed bookkeeping pages.
        // SAFETY: the offsets are within the committed range, mutually
        // disjoint, and aligned for their entry types; the reservation
        // outlives every table.
        let (arena, free, pending, lookup) = unsafe {
            (
                BlockArena::from_raw(
                    reservation.add(layout.block_table()).cast(),
                    layout.max_blocks(),
                ),
                IndexList::from_raw(reservation.add(layout.free_table()).cast(), page_count),
                IndexList::from_raw(reservation.add(layout.pending_table()).cast(), page_count),
                PageLookup::from_raw(reservation.add(layout.lookup_table()).cast(), page_count),
            )
        };
        // SAFETY: the user offset is page-aligned and within the reservation.
        let base = unsafe { reservation.add(layout.user_offset()) };
        tracing::debug!(
            pages = page_count,
            bookkeeping = layout.bookkeeping_bytes(),
            base = ?base,
            "debug heap reserved"
        );

        Ok(Self {
            inner: UnsafeCell::new(HeapInner {
                vm,
                reservation,
                total_bytes: layout.total_bytes(),
                base,
                page_count,
                regions: RegionPool::new(page_count, arena, free, pending),
                lookup,
            }),
            reentrancy: AtomicU32::new(0),
        })
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// `size` must be non-zero; `align` must be a power of two no larger
    /// than [`PAGE_SIZE`] (the pointer is placed within a page). The
    /// allocation's last byte sits as close to its guard page as `align`
    /// permits. Returns `None` when no free region can satisfy the request
    /// even after flushing pending frees -- the heap is full.
    pub fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let _claim = ReentrancyClaim::enter(&self.reentrancy);
        // SAFETY: the claim above guarantees exclusive access to the cell.
        let inner = unsafe { &mut *self.inner.get() };
        inner.allocate(size, align)
    }

    /// Frees an allocation and decommits its pages.
    ///
    /// `ptr` must be a pointer previously returned by
    /// [`allocate`](Self::allocate) on this heap and not yet freed; anything
    /// else is fatal (a second free of the same pointer is reported as a
    /// double free). The region is parked on the pending list, so the
    /// address range keeps faulting until allocation pressure forces it back
    /// into circulation.
    pub fn free(&self, ptr: NonNull<u8>) {
        let _claim = ReentrancyClaim::enter(&self.reentrancy);
        // SAFETY: the claim above guarantees exclusive access to the cell.
        let inner = unsafe { &mut *self.inner.get() };
        inner.free(ptr);
    }

    /// Usable bytes from `ptr` up to the allocation's guard page.
    ///
    /// `ptr` must be a live pointer returned by [`allocate`](Self::allocate);
    /// interior pointers are fatal.
    pub fn alloc_size(&self, ptr: NonNull<u8>) -> usize {
        let _claim = ReentrancyClaim::enter(&self.reentrancy);
        // SAFETY: the claim above guarantees exclusive access to the cell.
        let inner = unsafe { &*self.inner.get() };
        inner.alloc_size(ptr)
    }

    /// Whether `ptr` falls within the heap's user area.
    ///
    /// A coarse range check only -- it says nothing about whether the
    /// address is, or ever was, allocated.
    pub fn owns(&self, ptr: *const u8) -> bool {
        let _claim = ReentrancyClaim::enter(&self.reentrancy);
        // SAFETY: the claim above guarantees exclusive access to the cell.
        let inner = unsafe { &*self.inner.get() };
        let base = inner.base.as_ptr() as usize;
        let end = base + inner.page_count as usize * PAGE_SIZE;
        (base..=end).contains(&(ptr as usize))
    }

    /// Pages in the user area.
    pub fn page_count(&self) -> usize {
        let _claim = ReentrancyClaim::enter(&self.reentrancy);
        // SAFETY: the claim above guarantees exclusive access to the cell.
        unsafe { &*self.inner.get() }.page_count as usize
    }

    /// Regions currently available for allocation.
    pub fn free_regions(&self) -> usize {
        let _claim = ReentrancyClaim::enter(&self.reentrancy);
        // SAFETY: the claim above guarantees exclusive access to the cell.
        unsafe { &*self.inner.get() }.regions.free_len()
    }

    /// Freed regions still being held back from reuse.
    pub fn pending_regions(&self) -> usize {
        let _claim = ReentrancyClaim::enter(&self.reentrancy);
        // SAFETY: the claim above guarantees exclusive access to the cell.
        unsafe { &*self.inner.get() }.regions.pending_len()
    }

    /// Total pages across regions available for allocation.
    pub fn free_pages(&self) -> usize {
        let _claim = ReentrancyClaim::enter(&self.reentrancy);
        // SAFETY: the claim above guarantees exclusive access to the cell.
        unsafe { &*self.inner.get() }.regions.free_pages()
    }
}

impl<V: VirtualMemory> Drop for GuardHeap<V> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let base = inner.reservation;
        let bytes = inner.total_bytes;
        tracing::debug!(base = ?base, bytes, "debug heap released");
        // SAFETY: base/bytes are exactly the reservation obtained in
        // `with_memory`, and `&mut self` means no outstanding pointers are
        // legally in use. The bookkeeping tables are raw-backed, so nothing
        // dangles after the release.
        unsafe { inner.vm.release(base, bytes) };
    }
}

// SAFETY: `alloc` hands out unique, live, `layout`-aligned pointers with at
// least `layout.size()` usable bytes; `dealloc` returns them. The heap's own
// bookkeeping lives inside its reservation and never touches the global
// allocator, but a tracing subscriber that allocates while handling this
// heap's events would re-enter it and be reported as reentrancy -- run
// without one when the heap is installed as the global allocator.
unsafe impl<V: VirtualMemory> GlobalAlloc for GuardHeap<V> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout.size(), layout.align())
            .map_or(std::ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // SAFETY: GlobalAlloc guarantees `ptr` came from `alloc`, which
        // never returns null.
        self.free(unsafe { NonNull::new_unchecked(ptr) });
    }
}

// ---------------------------------------------------------------------------
// Placement policy
// ---------------------------------------------------------------------------

impl<V: VirtualMemory> HeapInner<V> {
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(size > 0, "zero-size allocation");
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        assert!(
            align <= PAGE_SIZE,
            "alignment larger than a page is not supported"
        );

        // Payload pages plus one trailing guard page. A request whose page
        // count overflows u32 could never fit anyway.
        let pages = u32::try_from(size.div_ceil(PAGE_SIZE) + 1).ok()?;

        let idx = match self.regions.take_best_fit(pages) {
            Some(idx) => idx,
            None => {
                tracing::debug!(
                    pending = self.regions.pending_len(),
                    "free list cannot satisfy request, flushing pending frees"
                );
                self.regions.flush_pending();
                self.regions.take_best_fit(pages)?
            }
        };

        let page_index = self.regions.block(idx).page_index;
        let payload_bytes = (pages as usize - 1) * PAGE_SIZE;
        // SAFETY: the region lies within the reservation; page_index and
        // pages come from the tiling.
        let base = unsafe { self.base.add(page_index as usize * PAGE_SIZE) };

        // Back the payload, then knock out the guard. The guard is
        // decommitted rather than left uncommitted so that the page is in a
        // known state when a later coalesce hands it to another allocation.
        // SAFETY: both ranges lie within this region's pages.
        unsafe {
            self.vm.commit(base, payload_bytes);
            self.vm.decommit(base.add(payload_bytes), PAGE_SIZE);
        }

        let slot = page_index as usize;
        assert!(self.lookup.get(slot).is_none(), "block lookup corrupted");
        self.lookup.set(slot, Some(idx));
        for offset in 1..pages as usize {
            assert!(
                self.lookup.get(slot + offset).is_none(),
                "block lookup corrupted"
            );
        }

        // Place the user pointer so the payload ends flush against the
        // guard, then align down to the caller's boundary.
        let ideal = (PAGE_SIZE - size % PAGE_SIZE) % PAGE_SIZE;
        let offset = ideal & !(align - 1);
        // SAFETY: offset < PAGE_SIZE <= payload_bytes, all committed above.
        unsafe { base.write_bytes(PAD_FILL, offset) };

        tracing::trace!(size, align, page_index, pages, offset, "allocate");
        // SAFETY: offset stays within the first payload page.
        Some(unsafe { base.add(offset) })
    }

    fn free(&mut self, ptr: NonNull<u8>) {
        let page_index = self.page_index_of(ptr);

        let idx = self
            .lookup
            .get(page_index)
            .unwrap_or_else(|| panic!("double free of {ptr:p}"));
        let block = *self.regions.block(idx);
        assert!(
            block.state == BlockState::Allocated,
            "block state corrupted"
        );
        debug_assert_eq!(block.page_index as usize, page_index);

        // Clear the reverse map first so a racing double free trips the
        // lookup check above.
        self.lookup.set(page_index, None);
        for offset in 1..block.page_count as usize {
            assert!(
                self.lookup.get(page_index + offset).is_none(),
                "block lookup corrupted"
            );
        }

        self.regions.enqueue_pending(idx);

        // Make the payload fault on the next access. The trailing guard
        // page is already inaccessible.
        // SAFETY: the range covers this region's payload pages only.
        unsafe {
            let block_base = self.base.add(page_index * PAGE_SIZE);
            self.vm
                .decommit(block_base, (block.page_count as usize - 1) * PAGE_SIZE);
        }

        tracing::trace!(
            page_index,
            pages = block.page_count,
            pending = self.regions.pending_len(),
            "free"
        );
    }

    fn alloc_size(&self, ptr: NonNull<u8>) -> usize {
        let page_index = self.page_index_of(ptr);
        let idx = self
            .lookup
            .get(page_index)
            .unwrap_or_else(|| panic!("{ptr:p} is not the start of a live allocation"));
        let block = self.regions.block(idx);
        (block.page_count as usize - 1) * PAGE_SIZE - ptr.as_ptr() as usize % PAGE_SIZE
    }

    /// Maps a user pointer to its page index, dying on foreign pointers.
    fn page_index_of(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        assert!(addr >= base, "pointer {ptr:p} is not from this heap");
        let page_index = (addr - base) / PAGE_SIZE;
        assert!(
            page_index < self.page_count as usize,
            "pointer {ptr:p} is not from this heap"
        );
        page_index
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
