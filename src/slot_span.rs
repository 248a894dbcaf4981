// A run of equal-size slots inside one super page, with its freelist.
//
// Slots are provisioned lazily: a span starts with every slot unprovisioned and hands them out in
// address order until the first free, after which the freelist is preferred. Freed slots are
// pushed on the head of the freelist, so the most recently freed slot is reused first.

use crate::address_pool_manager::PoolInfo;
use crate::allocation_guard::allocations_allowed;
use crate::freelist::{freelist_corruption_detected, FreelistEntry, PartitionFreelistEntry};
use crate::freeslot_bitmap::{free_slot_bitmap_mark_slot_as_free, free_slot_bitmap_mark_slot_as_used};
use crate::{
    likely, super_page_payload_begin, super_page_payload_end, unlikely, ALIGNMENT, SMALLEST_BUCKET,
    SUPER_PAGE_BASE_MASK,
};

use std::ptr::NonNull;

pub struct SlotSpan<E: FreelistEntry = PartitionFreelistEntry> {
    begin: usize,
    slot_size: usize,
    num_slots: usize,
    pool: PoolInfo,
    freelist_head: Option<NonNull<E>>,
    num_unprovisioned_slots: usize,
    num_allocated_slots: usize,
}

// The span exclusively owns the slots it hands out and the freelist threaded through its free
// slots.
unsafe impl<E: FreelistEntry> Send for SlotSpan<E> {}

impl<E: FreelistEntry> SlotSpan<E> {
    /// A span of `num_slots` slots starting at `begin`, which must be committed memory in the
    /// payload of a super page of `pool`.
    pub fn new(begin: usize, slot_size: usize, num_slots: usize, pool: PoolInfo) -> Self {
        assert!(slot_size >= SMALLEST_BUCKET);
        assert!(slot_size % ALIGNMENT == 0);
        assert!(num_slots > 0);
        assert!(pool.contains(begin));

        let super_page = begin & SUPER_PAGE_BASE_MASK;
        assert!(begin >= super_page_payload_begin(super_page));
        assert!(begin + slot_size * num_slots <= super_page_payload_end(super_page));

        Self {
            begin,
            slot_size,
            num_slots,
            pool,
            freelist_head: None,
            num_unprovisioned_slots: num_slots,
            num_allocated_slots: 0,
        }
    }

    /// A span filling the whole payload of `super_page`.
    pub fn for_super_page(super_page: usize, slot_size: usize, pool: PoolInfo) -> Self {
        let begin = super_page_payload_begin(super_page);
        let num_slots = (super_page_payload_end(super_page) - begin) / slot_size;
        Self::new(begin, slot_size, num_slots, pool)
    }

    /// Hand out a slot, or None when the span is full. The freelist link is validated before the
    /// slot is returned; a corrupt link terminates the process.
    pub fn alloc_slot(&mut self) -> Option<usize> {
        assert!(allocations_allowed(), "allocation inside a no-allocation scope");

        let slot_start = if let Some(mut head) = self.freelist_head {
            let entry = unsafe { head.as_mut() };
            let next = entry.get_next(self.slot_size, &self.pool);
            // The link is well formed for the pool; it must also start a slot of this span.
            if let Some(n) = next {
                if unlikely(!self.is_slot_start(n.as_ptr().addr())) {
                    freelist_corruption_detected(self.slot_size);
                }
            }
            self.freelist_head = next;
            let slot_start = entry.clear_for_allocation();
            if cfg!(feature = "freeslot-bitmap") {
                unsafe { free_slot_bitmap_mark_slot_as_used(slot_start) };
            }
            slot_start
        } else if likely(self.num_unprovisioned_slots > 0) {
            // Never handed out, so its bitmap bit is still 0 (used).
            let slot_start = self.begin + (self.num_slots - self.num_unprovisioned_slots) * self.slot_size;
            self.num_unprovisioned_slots -= 1;
            slot_start
        } else {
            return None;
        };

        self.num_allocated_slots += 1;
        Some(slot_start)
    }

    /// Push a slot back on the freelist.
    ///
    /// # Safety
    ///
    /// `slot_start` must have come from `alloc_slot()` on this span and not been freed since. The
    /// caller gives up all access to it.
    pub unsafe fn free_slot(&mut self, slot_start: usize) {
        assert!(self.is_slot_start(slot_start));
        debug_assert!(self.num_allocated_slots > 0);

        if cfg!(feature = "freeslot-bitmap") {
            unsafe { free_slot_bitmap_mark_slot_as_free(slot_start) };
        }

        let mut entry = unsafe { E::emplace_and_init_null(slot_start) };
        unsafe { entry.as_mut() }.set_next(self.freelist_head, &self.pool);
        self.freelist_head = Some(entry);

        self.num_allocated_slots -= 1;
    }

    #[inline(always)]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.begin && address < self.end()
    }

    #[inline(always)]
    pub fn is_slot_start(&self, address: usize) -> bool {
        self.contains(address) && (address - self.begin) % self.slot_size == 0
    }

    /// The start of the slot `object` points into.
    #[inline(always)]
    pub fn object_to_slot_start(&self, object: usize) -> usize {
        debug_assert!(self.contains(object));
        self.begin + (object - self.begin) / self.slot_size * self.slot_size
    }

    pub fn begin(&self) -> usize {
        self.begin
    }

    pub fn end(&self) -> usize {
        self.begin + self.num_slots * self.slot_size
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn num_allocated_slots(&self) -> usize {
        self.num_allocated_slots
    }

    pub fn num_unprovisioned_slots(&self) -> usize {
        self.num_unprovisioned_slots
    }

    pub fn pool(&self) -> &PoolInfo {
        &self.pool
    }

    /// Validate the whole freelist, returning its length.
    pub fn check_free_list(&self) -> usize {
        match self.freelist_head {
            Some(head) => unsafe { head.as_ref() }.check_free_list(self.slot_size, &self.pool),
            None => 0,
        }
    }

    /// The freelist head, for tests that tamper with it.
    pub fn freelist_head_for_testing(&mut self) -> Option<&mut E> {
        self.freelist_head.map(|mut h| unsafe { h.as_mut() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation_guard::ScopedDisallowAllocations;
    use crate::testing::TestSuperPage;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const SLOT_SIZE: usize = 32;

    #[test]
    fn provisions_in_order_then_runs_out() {
        let sp = TestSuperPage::new();
        let begin = sp.payload_begin();
        let mut span: SlotSpan = SlotSpan::new(begin, SLOT_SIZE, 4, sp.pool());

        for i in 0..4 {
            assert_eq!(span.alloc_slot(), Some(begin + i * SLOT_SIZE));
        }
        assert_eq!(span.alloc_slot(), None);
        assert_eq!(span.num_allocated_slots(), 4);
        assert_eq!(span.num_unprovisioned_slots(), 0);
    }

    #[test]
    fn reuses_most_recently_freed() {
        let sp = TestSuperPage::new();
        let mut span: SlotSpan = SlotSpan::new(sp.payload_begin(), SLOT_SIZE, 8, sp.pool());

        let a = span.alloc_slot().unwrap();
        let b = span.alloc_slot().unwrap();
        let c = span.alloc_slot().unwrap();

        unsafe {
            span.free_slot(a);
            span.free_slot(c);
        }
        assert_eq!(span.check_free_list(), 2);
        assert_eq!(span.num_allocated_slots(), 1);

        assert_eq!(span.alloc_slot(), Some(c));
        assert_eq!(span.alloc_slot(), Some(a));
        assert_eq!(span.check_free_list(), 0);

        // The freelist is empty again, so provisioning resumes.
        let d = span.alloc_slot().unwrap();
        assert_eq!(d, b + 2 * SLOT_SIZE);
    }

    #[test]
    fn allocated_slots_are_zeroed_headers() {
        let sp = TestSuperPage::new();
        let mut span: SlotSpan = SlotSpan::new(sp.payload_begin(), SLOT_SIZE, 8, sp.pool());

        let a = span.alloc_slot().unwrap();
        let b = span.alloc_slot().unwrap();
        unsafe {
            std::ptr::write_bytes(a as *mut u8, 0xff, SLOT_SIZE);
            span.free_slot(b);
            span.free_slot(a);
        }

        let a2 = span.alloc_slot().unwrap();
        assert_eq!(a2, a);
        let header = unsafe { std::slice::from_raw_parts(a2 as *const u8, size_of::<PartitionFreelistEntry>()) };
        assert!(header.iter().all(|&x| x == 0));
    }

    #[test]
    fn whole_super_page() {
        let sp = TestSuperPage::new();
        let mut span: SlotSpan = SlotSpan::for_super_page(sp.super_page(), 256, sp.pool());
        assert!(span.num_slots() > 1000);
        assert!(span.end() <= super_page_payload_end(sp.super_page()));

        let mut n = 0;
        while span.alloc_slot().is_some() {
            n += 1;
        }
        assert_eq!(n, span.num_slots());
    }

    #[test]
    fn object_to_slot_start() {
        let sp = TestSuperPage::new();
        let span: SlotSpan = SlotSpan::new(sp.payload_begin(), 48, 10, sp.pool());
        let b = span.begin();

        assert_eq!(span.object_to_slot_start(b), b);
        assert_eq!(span.object_to_slot_start(b + 47), b);
        assert_eq!(span.object_to_slot_start(b + 48), b + 48);
        assert_eq!(span.object_to_slot_start(b + 9 * 48 + 5), b + 9 * 48);
        assert!(span.contains(b + 10 * 48 - 1));
        assert!(!span.contains(b + 10 * 48));
        assert!(!span.contains(b - 1));
    }

    #[test]
    fn slot_starts() {
        let sp = TestSuperPage::new();
        let span: SlotSpan = SlotSpan::new(sp.payload_begin(), SLOT_SIZE, 4, sp.pool());
        let b = span.begin();

        assert!(span.is_slot_start(b));
        assert!(span.is_slot_start(b + 3 * SLOT_SIZE));
        assert!(!span.is_slot_start(b + SLOT_SIZE + 16));
        assert!(!span.is_slot_start(b + 4 * SLOT_SIZE));
        assert!(!span.is_slot_start(b - SLOT_SIZE));
    }

    #[test]
    fn random_alloc_free_keeps_list_consistent() {
        let sp = TestSuperPage::new();
        let mut span: SlotSpan = SlotSpan::new(sp.payload_begin(), 64, 200, sp.pool());
        let mut live = Vec::new();
        let mut r = StdRng::seed_from_u64(1);

        for _ in 0..5_000 {
            if live.is_empty() || (r.random_bool(0.55) && live.len() < 200) {
                if let Some(s) = span.alloc_slot() {
                    assert!(!live.contains(&s));
                    live.push(s);
                }
            } else {
                let i = r.random_range(0..live.len());
                let s = live.swap_remove(i);
                unsafe { span.free_slot(s) };
            }

            assert_eq!(span.num_allocated_slots(), live.len());
        }

        assert_eq!(span.check_free_list() + live.len() + span.num_unprovisioned_slots(), span.num_slots());
    }

    #[test]
    #[should_panic(expected = "no-allocation scope")]
    fn alloc_in_disallowed_scope_panics() {
        let sp = TestSuperPage::new();
        let mut span: SlotSpan = SlotSpan::new(sp.payload_begin(), SLOT_SIZE, 4, sp.pool());
        let _d = ScopedDisallowAllocations::new();
        span.alloc_slot();
    }

    #[test]
    #[should_panic]
    fn span_must_be_in_pool() {
        let sp = TestSuperPage::new();
        let mut pool = sp.pool();
        pool.base += pool.size;
        let _span: SlotSpan = SlotSpan::new(sp.payload_begin(), SLOT_SIZE, 4, pool);
    }
}
