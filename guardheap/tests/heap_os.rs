//! End-to-end exercises against the real OS virtual memory driver.
//!
//! Everything here stays on the survivable side of the heap: in-bounds
//! accesses, matched frees, deferred-reuse pressure. The deliberately
//! crashing scenarios (guard-page overrun, use after free) live in the
//! `heapdemo` tool, since they take the process down by design.

use guardheap::{GuardHeap, PAGE_SIZE};

#[test]
fn full_cycle_with_in_bounds_writes() {
    let heap = GuardHeap::new(2 * 1024 * 1024).expect("reservation");
    let p = heap.allocate(128, 4).expect("allocation");

    // SAFETY: 128 bytes were requested; alloc_size confirms they fit.
    unsafe {
        let buf = std::slice::from_raw_parts_mut(p.as_ptr(), 128);
        buf[0] = b'a';
        buf[127] = b'a';
        assert_eq!(buf[127], b'a');
    }
    assert!(heap.owns(p.as_ptr()));
    assert_eq!(heap.alloc_size(p), 128);
    heap.free(p);
}

#[test]
fn pointers_are_aligned_and_sized_as_requested() {
    let heap = GuardHeap::new(4 * 1024 * 1024).expect("reservation");
    for size in [1usize, 8, 100, 4096, 10_000] {
        for align in [1usize, 2, 8, 64, 512, 4096] {
            let p = heap.allocate(size, align).expect("allocation");
            assert_eq!(p.as_ptr() as usize % align, 0);
            let usable = heap.alloc_size(p);
            assert!(usable >= size && usable < size + PAGE_SIZE);

            // Every byte the heap claims is usable must actually be writable.
            // SAFETY: usable bytes up to the guard belong to this allocation.
            unsafe { p.as_ptr().write_bytes(0xA5, usable) };
            heap.free(p);
        }
    }
}

#[test]
fn deferred_reuse_under_fifo_churn() {
    // 2048 user pages; 500 two-page allocations fit with room to spare.
    let heap = GuardHeap::new(8 * 1024 * 1024).expect("reservation");
    let page_count = heap.page_count();

    let held: Vec<_> = (0..500)
        .map(|_| heap.allocate(128, 4).expect("allocation"))
        .collect();
    for p in &held {
        heap.free(*p);
    }

    // Released regions are parked, not reused.
    assert_eq!(heap.pending_regions(), 500);

    // A request for the whole user area can only be met by flushing and
    // coalescing every parked region back into the root.
    let all = heap
        .allocate((page_count - 1) * PAGE_SIZE, 1)
        .expect("flush must reclaim the full area");
    assert_eq!(heap.pending_regions(), 0);
    assert_eq!(heap.free_regions(), 0);
    heap.free(all);

    // One more allocation flushes the parked root; the remainder is a
    // single free region.
    let small = heap.allocate(128, 4).expect("allocation");
    assert_eq!(heap.free_regions(), 1);
    assert_eq!(heap.free_pages(), page_count - 2);
    heap.free(small);
}

#[test]
fn stats_reflect_the_region_ledger() {
    let heap = GuardHeap::new(64 * PAGE_SIZE).expect("reservation");
    assert_eq!(heap.page_count(), 64);
    assert_eq!(heap.free_regions(), 1);
    assert_eq!(heap.free_pages(), 64);

    let a = heap.allocate(PAGE_SIZE, 1).unwrap();
    let b = heap.allocate(PAGE_SIZE, 1).unwrap();
    assert_eq!(heap.free_regions(), 1);
    assert_eq!(heap.free_pages(), 60);

    heap.free(a);
    assert_eq!(heap.pending_regions(), 1);
    assert_eq!(heap.free_pages(), 60);

    heap.free(b);
    assert_eq!(heap.pending_regions(), 2);
}

#[test]
fn owns_is_a_range_check_only() {
    let heap = GuardHeap::new(16 * PAGE_SIZE).expect("reservation");
    let p = heap.allocate(64, 8).unwrap();
    assert!(heap.owns(p.as_ptr()));
    // A freed pointer still lies in the range; owns makes no validity claim.
    heap.free(p);
    assert!(heap.owns(p.as_ptr()));

    let unrelated = Box::new(0u8);
    assert!(!heap.owns(&raw const *unrelated));
}
