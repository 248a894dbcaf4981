// Fixtures shared by the unit tests, the integration tests and the benches. Not part of the API.

use crate::address_pool_manager::{PoolInfo, NON_BRP_POOL_HANDLE};
use crate::address_space::PartitionAddressSpace;
use crate::config::GigaCageConfig;
use crate::freeslot_bitmap::free_slot_bitmap_mark_slot_as_free;
use crate::lightweight_quarantine::AllocatorRoot;
use crate::slot_span::SlotSpan;
use crate::sync::SpinMutex;
use crate::super_page_payload_begin;

use ahash::HashMap;

const MIB: usize = 1 << 20;

/// Pools small enough that many address spaces can be reserved at once.
pub fn small_config() -> GigaCageConfig {
    GigaCageConfig { non_brp_pool_size: 64 * MIB, brp_pool_size: 64 * MIB, configurable_pool_size: 32 * MIB, reserve_card_table: false }
}

/// A committed super page in the non-BRP pool of a private address space. Dropping it releases
/// the whole reservation.
pub struct TestSuperPage {
    space: PartitionAddressSpace,
    super_page: usize,
}

impl TestSuperPage {
    pub fn new() -> Self {
        let space = PartitionAddressSpace::new(small_config());
        space.init();
        let super_page = space.alloc_super_page(NON_BRP_POOL_HANDLE);
        Self { space, super_page }
    }

    pub fn super_page(&self) -> usize {
        self.super_page
    }

    pub fn payload_begin(&self) -> usize {
        super_page_payload_begin(self.super_page)
    }

    pub fn pool(&self) -> PoolInfo {
        match self.space.pool_info(NON_BRP_POOL_HANDLE) {
            Some(info) => info,
            None => panic!("test address space lost its non-BRP pool"),
        }
    }

    pub fn space(&self) -> &PartitionAddressSpace {
        &self.space
    }

    /// Another committed super page of the same pool.
    pub fn alloc_neighbor(&self) -> usize {
        self.space.alloc_super_page(NON_BRP_POOL_HANDLE)
    }

    /// Start of slot `i` when the payload is cut into `slot_size` slots.
    pub fn slot(&self, i: usize, slot_size: usize) -> usize {
        self.payload_begin() + i * slot_size
    }

    /// Record `slot` as free in its bitmap, when this build validates against the bitmap.
    pub fn mark_free(&self, slot: usize) {
        if cfg!(feature = "freeslot-bitmap") {
            unsafe { free_slot_bitmap_mark_slot_as_free(slot) };
        }
    }
}

impl Default for TestSuperPage {
    fn default() -> Self {
        Self::new()
    }
}

struct FakeState {
    next_address: usize,
    usable_sizes: HashMap<usize, usize>,
    free_counts: HashMap<usize, usize>,
    freed_bytes: usize,
}

/// An allocator that hands out addresses it never maps and counts the frees it receives.
/// Objects must never be dereferenced.
pub struct FakeAllocatorRoot {
    state: SpinMutex<FakeState>,
}

impl FakeAllocatorRoot {
    pub fn new() -> Self {
        Self {
            state: SpinMutex::new(FakeState {
                next_address: 0x1000_0000,
                usable_sizes: HashMap::default(),
                free_counts: HashMap::default(),
                freed_bytes: 0,
            }),
        }
    }

    /// A fresh fake object with `usable_size` usable bytes.
    pub fn alloc(&self, usable_size: usize) -> *mut u8 {
        let mut state = self.state.lock();
        let address = state.next_address;
        state.next_address += usable_size.next_multiple_of(16).max(16);
        state.usable_sizes.insert(address, usable_size);
        std::ptr::without_provenance_mut(address)
    }

    pub fn free_count(&self, object: *mut u8) -> usize {
        self.state.lock().free_counts.get(&object.addr()).copied().unwrap_or(0)
    }

    pub fn total_frees(&self) -> usize {
        self.state.lock().free_counts.values().sum()
    }

    /// The most times any one object was freed. Anything above 1 is a double free.
    pub fn max_free_count(&self) -> usize {
        self.state.lock().free_counts.values().copied().max().unwrap_or(0)
    }

    pub fn freed_bytes(&self) -> usize {
        self.state.lock().freed_bytes
    }
}

impl Default for FakeAllocatorRoot {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocatorRoot for FakeAllocatorRoot {
    // The object's own address.
    type SlotSpan = usize;

    fn get_slot_usable_size(&self, slot_span: usize) -> usize {
        match self.state.lock().usable_sizes.get(&slot_span) {
            Some(&size) => size,
            None => panic!("{slot_span:#x} was not allocated here"),
        }
    }

    unsafe fn free_no_hooks_immediate(&self, object: *mut u8, slot_span: usize, slot_start: usize) {
        assert_eq!(object.addr(), slot_span);
        assert_eq!(object.addr(), slot_start);

        let mut state = self.state.lock();
        let Some(&size) = state.usable_sizes.get(&slot_start) else {
            panic!("{slot_start:#x} was not allocated here");
        };
        state.freed_bytes += size;
        *state.free_counts.entry(slot_start).or_insert(0) += 1;
    }

    fn object_to_slot_start(&self, object: *mut u8) -> usize {
        object.addr()
    }

    fn slot_span_from_object(&self, object: *mut u8) -> usize {
        object.addr()
    }
}

/// A one-span allocator over real memory, so quarantined objects go back on a real freelist.
pub struct SlotSpanRoot {
    span: SpinMutex<SlotSpan>,
    slot_size: usize,
}

impl SlotSpanRoot {
    pub fn new(span: SlotSpan) -> Self {
        let slot_size = span.slot_size();
        Self { span: SpinMutex::new(span), slot_size }
    }

    pub fn alloc(&self) -> Option<*mut u8> {
        self.span.lock().alloc_slot().map(|s| s as *mut u8)
    }

    pub fn num_allocated_slots(&self) -> usize {
        self.span.lock().num_allocated_slots()
    }

    pub fn check_free_list(&self) -> usize {
        self.span.lock().check_free_list()
    }
}

impl AllocatorRoot for SlotSpanRoot {
    type SlotSpan = ();

    fn get_slot_usable_size(&self, _slot_span: ()) -> usize {
        self.slot_size
    }

    unsafe fn free_no_hooks_immediate(&self, _object: *mut u8, _slot_span: (), slot_start: usize) {
        unsafe { self.span.lock().free_slot(slot_start) };
    }

    fn object_to_slot_start(&self, object: *mut u8) -> usize {
        self.span.lock().object_to_slot_start(object.addr())
    }

    fn slot_span_from_object(&self, object: *mut u8) {
        debug_assert!(self.span.lock().contains(object.addr()));
    }
}
