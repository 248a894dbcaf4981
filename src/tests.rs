use crate::*;
use crate::freeslot_bitmap::{free_slot_bitmap_slot_is_used, reserved_free_slot_bitmap_size};
use crate::testing::{FakeAllocatorRoot, SlotSpanRoot, TestSuperPage};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ---- Layout ----

#[test]
fn geometry() {
    assert_eq!(PARTITION_PAGE_SIZE, 4 * SYSTEM_PAGE_SIZE);
    assert_eq!(SUPER_PAGE_SIZE, 2 << 20);
    assert_eq!(SUPER_PAGE_SIZE % PARTITION_PAGE_SIZE, 0);
    assert!(SMALLEST_USED_BUCKET >= SMALLEST_BUCKET);
    assert_eq!(SMALLEST_USED_BUCKET % ALIGNMENT, 0);
}

#[test]
fn payload_sits_between_metadata_and_guard() {
    let sp = 7 * SUPER_PAGE_SIZE;
    assert_eq!(super_page_payload_begin(sp), sp + PARTITION_PAGE_SIZE + reserved_free_slot_bitmap_size());
    assert_eq!(super_page_payload_end(sp), sp + SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE);
    assert!(super_page_payload_begin(sp) < super_page_payload_end(sp));
}

#[test]
fn ref_count_layout() {
    assert_eq!(size_of::<PartitionRefCount>(), 4);
    assert_eq!(align_of::<PartitionRefCount>(), 4);
    if cfg!(feature = "ref-count-in-previous-slot") {
        assert!(SMALLEST_USED_BUCKET >= size_of::<PartitionFreelistEntry>() + size_of::<PartitionRefCount>());
    }
}

// ---- Slot spans with the bitmap ----

#[test]
fn bitmap_tracks_slot_span() {
    if !cfg!(feature = "freeslot-bitmap") {
        return;
    }

    let sp = TestSuperPage::new();
    let mut span: SlotSpan = SlotSpan::new(sp.payload_begin(), 32, 16, sp.pool());

    let slots: Vec<usize> = (0..16).filter_map(|_| span.alloc_slot()).collect();
    assert_eq!(slots.len(), 16);

    unsafe {
        span.free_slot(slots[3]);
        span.free_slot(slots[9]);
    }

    for (i, &s) in slots.iter().enumerate() {
        assert_eq!(unsafe { free_slot_bitmap_slot_is_used(s) }, i != 3 && i != 9, "slot {i}");
    }

    assert_eq!(span.alloc_slot(), Some(slots[9]));
    assert!(unsafe { free_slot_bitmap_slot_is_used(slots[9]) });
    assert!(unsafe { !free_slot_bitmap_slot_is_used(slots[3]) });
}

#[test]
fn spans_in_two_super_pages_stay_apart() {
    let sp = TestSuperPage::new();
    let other = sp.alloc_neighbor();
    let mut a: SlotSpan = SlotSpan::new(sp.payload_begin(), 64, 32, sp.pool());
    let mut b: SlotSpan = SlotSpan::for_super_page(other, 64, sp.pool());

    let mut r = StdRng::seed_from_u64(3);
    let mut live_a = Vec::new();
    let mut live_b = Vec::new();
    for _ in 0..2_000 {
        let (span, live) = if r.random_bool(0.5) { (&mut a, &mut live_a) } else { (&mut b, &mut live_b) };
        if live.is_empty() || r.random_bool(0.6) {
            if let Some(s) = span.alloc_slot() {
                live.push(s);
            }
        } else {
            let s = live.swap_remove(r.random_range(0..live.len()));
            unsafe { span.free_slot(s) };
        }
    }

    assert!(live_a.iter().all(|&s| s & SUPER_PAGE_BASE_MASK == sp.super_page()));
    assert!(live_b.iter().all(|&s| s & SUPER_PAGE_BASE_MASK == other));
    a.check_free_list();
    b.check_free_list();
}

#[test]
fn tampered_head_is_caught_before_use() {
    let sp = TestSuperPage::new();
    let pool = sp.pool();
    let mut span: SlotSpan = SlotSpan::new(sp.payload_begin(), 32, 4, pool);

    let a = span.alloc_slot().unwrap();
    let b = span.alloc_slot().unwrap();
    unsafe {
        span.free_slot(b);
        span.free_slot(a);
    }

    let head = span.freelist_head_for_testing().unwrap();
    assert_eq!(head.slot_start(), a);
    assert!(head.decode_next(&pool).is_ok());

    // A zeroed link reads as the end of the list; the next allocation then provisions.
    head.corrupt_next_for_testing(0);
    assert_eq!(head.decode_next(&pool), Ok(None));

    head.corrupt_next_for_testing(0x4242_4242);
    assert!(head.decode_next(&pool).is_err());
}

// ---- Quarantine over real slots ----

#[test]
fn quarantine_returns_slots_to_span() {
    let sp = TestSuperPage::new();
    let root = SlotSpanRoot::new(SlotSpan::new(sp.payload_begin(), 64, 64, sp.pool()));
    let quarantine = LightweightQuarantineRoot::new(&root, 64 * 8);

    {
        let branch = quarantine.create_branch_with_seed(false, 11);
        let mut objects = Vec::new();
        for _ in 0..20 {
            let o = root.alloc().unwrap();
            unsafe { std::ptr::write_bytes(o, 0xab, 64) };
            objects.push(o);
        }
        assert_eq!(root.num_allocated_slots(), 20);

        for &o in &objects {
            assert!(unsafe { branch.quarantine(o, (), o.addr()) });
        }

        // Only 8 fit; the rest were evicted onto the freelist.
        assert_eq!(branch.slot_count(), 8);
        assert_eq!(root.num_allocated_slots(), 8);
        assert_eq!(root.check_free_list(), 12);
    }

    // Dropping the branch released everything.
    assert_eq!(root.num_allocated_slots(), 0);
    assert_eq!(root.check_free_list(), 20);
    assert_eq!(quarantine.size_in_bytes(), 0);
    assert_eq!(quarantine.count(), 0);
}

#[test]
fn shared_branch_counts_add_up() {
    let fake = FakeAllocatorRoot::new();
    let root = LightweightQuarantineRoot::new(&fake, 4096);
    let branch = root.create_branch(true).into_shared();

    const THREADS: usize = 4;
    const PER_THREAD: usize = 500;

    std::thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                for i in 0..PER_THREAD {
                    let o = fake.alloc(16 + (i % 8) * 16);
                    unsafe { branch.quarantine(o, fake.slot_span_from_object(o), o.addr()) };
                    assert!(root.size_in_bytes() <= 4096);
                }
            });
        }
    });

    let mut stats = LightweightQuarantineStats::default();
    root.accumulate_stats(&mut stats);
    assert_eq!(stats.cumulative_count + stats.quarantine_miss_count, THREADS * PER_THREAD);
    assert_eq!(stats.count, branch.slot_count());
    assert_eq!(stats.size_in_bytes, branch.size_in_bytes());
    assert_eq!(fake.total_frees() + branch.slot_count(), THREADS * PER_THREAD);
    assert_eq!(fake.max_free_count(), 1);
}
