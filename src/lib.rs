#![cfg_attr(nightly, feature(likely_unlikely))]

// Table of contents of this file:
//
// * Modules
// * Fixed constants chosen for the design
//   + Page and super page geometry
//   + Allocation granularity
//   + Pool sizes
// * Constants determined by the constants above
// * Super page layout
// * Reference count co-located with slots
// * Branch hints

#[cfg(not(target_pointer_width = "64"))]
compile_error!("partalloc needs a 64-bit address space for its pools");


// --- Modules ---

pub mod address_pool_manager;
pub mod address_space;
pub mod allocation_guard;
pub mod bits;
pub mod config;
pub mod freelist;
pub mod freeslot_bitmap;
pub mod lightweight_quarantine;
pub mod oom;
pub mod platformalloc;
pub mod slot_span;
pub mod sync;

#[doc(hidden)]
pub mod testing;

pub use address_pool_manager::{
    AddressPoolManager, PoolHandle, PoolInfo, BRP_POOL_HANDLE, CONFIGURABLE_POOL_HANDLE,
    NON_BRP_POOL_HANDLE, NULL_POOL_HANDLE,
};
pub use address_space::{address_space, calculate_giga_cage_properties, GigaCageProperties, PartitionAddressSpace};
pub use config::{ConfigError, GigaCageConfig};
pub use freelist::{freelist_corruption_detected, FreelistEntry, PartitionFreelistEntry};
pub use lightweight_quarantine::{
    AllocatorRoot, LightweightQuarantineBranch, LightweightQuarantineRoot, LightweightQuarantineStats,
    SharedLightweightQuarantineBranch, DEFAULT_QUARANTINE_CAPACITY_IN_BYTES,
};
pub use slot_span::SlotSpan;

use bits::align_up;
use std::sync::atomic::AtomicU32;


// --- Fixed constants chosen for the design ---

// ---- Page and super page geometry ----

#[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
pub const SYSTEM_PAGE_SHIFT: usize = 14; // 16 KiB
#[cfg(not(all(target_vendor = "apple", target_arch = "aarch64")))]
pub const SYSTEM_PAGE_SHIFT: usize = 12; // 4 KiB

// A partition page is the unit slot spans are carved in, and the unit metadata regions are
// protected in.
pub const NUM_SYSTEM_PAGES_PER_PARTITION_PAGE_SHIFT: usize = 2;

pub const SUPER_PAGE_SHIFT: usize = 21; // 2 MiB

// ---- Allocation granularity ----

pub const ALIGNMENT: usize = 16;

// ---- Pool sizes ----

pub const GIB: usize = 1 << 30;

pub const NON_BRP_POOL_SIZE: usize = 8 * GIB;
pub const BRP_POOL_SIZE: usize = 8 * GIB;
pub const CONFIGURABLE_POOL_SIZE: usize = 4 * GIB;


// --- Constants determined by the constants above ---

pub const SYSTEM_PAGE_SIZE: usize = 1 << SYSTEM_PAGE_SHIFT;
pub const SYSTEM_PAGE_OFFSET_MASK: usize = SYSTEM_PAGE_SIZE - 1;

pub const PARTITION_PAGE_SHIFT: usize = SYSTEM_PAGE_SHIFT + NUM_SYSTEM_PAGES_PER_PARTITION_PAGE_SHIFT;
pub const PARTITION_PAGE_SIZE: usize = 1 << PARTITION_PAGE_SHIFT;

pub const SUPER_PAGE_SIZE: usize = 1 << SUPER_PAGE_SHIFT;
pub const SUPER_PAGE_OFFSET_MASK: usize = SUPER_PAGE_SIZE - 1;
pub const SUPER_PAGE_BASE_MASK: usize = !SUPER_PAGE_OFFSET_MASK;

pub const NUM_PARTITION_PAGES_PER_SUPER_PAGE: usize = SUPER_PAGE_SIZE / PARTITION_PAGE_SIZE;

// No pool may be larger than the largest default one; pool bookkeeping is sized from it.
pub const MAX_POOL_SIZE: usize = {
    let m = if NON_BRP_POOL_SIZE > BRP_POOL_SIZE { NON_BRP_POOL_SIZE } else { BRP_POOL_SIZE };
    if m > CONFIGURABLE_POOL_SIZE { m } else { CONFIGURABLE_POOL_SIZE }
};
pub const MAX_SUPER_PAGES_IN_POOL: usize = MAX_POOL_SIZE / SUPER_PAGE_SIZE;

// Every slot is at least this big, so every slot can hold a freelist entry.
pub const SMALLEST_BUCKET: usize = ALIGNMENT;

const _: () = assert!(bits::is_power_of_two(NON_BRP_POOL_SIZE) && bits::is_power_of_two(BRP_POOL_SIZE));
const _: () = assert!(bits::is_power_of_two(CONFIGURABLE_POOL_SIZE));
const _: () = assert!(NUM_PARTITION_PAGES_PER_SUPER_PAGE >= 4);


// --- Super page layout ---
//
// +-----------------------+ super_page
// | metadata              |   one partition page; never holds slots
// +-----------------------+ super_page + PARTITION_PAGE_SIZE
// | free-slot bitmap      |   only with the `freeslot-bitmap` feature
// +-----------------------+ super_page_payload_begin()
// | slot spans            |
// |                       |
// +-----------------------+ super_page_payload_end()
// | guard                 |   one partition page
// +-----------------------+ super_page + SUPER_PAGE_SIZE

#[inline(always)]
pub const fn super_page_payload_begin(super_page: usize) -> usize {
    debug_assert!(super_page & SUPER_PAGE_OFFSET_MASK == 0);
    super_page + PARTITION_PAGE_SIZE + freeslot_bitmap::reserved_free_slot_bitmap_size()
}

#[inline(always)]
pub const fn super_page_payload_end(super_page: usize) -> usize {
    debug_assert!(super_page & SUPER_PAGE_OFFSET_MASK == 0);
    super_page + SUPER_PAGE_SIZE - PARTITION_PAGE_SIZE
}


// --- Reference count co-located with slots ---

/// A 32-bit reference count. With `ref-count-in-previous-slot` it sits at the tail of the
/// preceding slot, so the smallest used bucket has to fit one next to a freelist entry. Only its
/// layout matters here.
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct PartitionRefCount {
    pub count: AtomicU32,
}

/// The smallest bucket actually handed out when a ref-count shares the slot.
pub const SMALLEST_USED_BUCKET: usize = if cfg!(feature = "ref-count-in-previous-slot") {
    align_up(1 + size_of::<PartitionRefCount>(), SMALLEST_BUCKET)
} else {
    SMALLEST_BUCKET
};


// --- Branch hints ---

#[cfg(nightly)]
pub(crate) use std::hint::{likely, unlikely};

#[cfg(not(nightly))]
#[inline(always)]
pub(crate) fn likely(b: bool) -> bool {
    b
}

#[cfg(not(nightly))]
#[inline(always)]
pub(crate) fn unlikely(b: bool) -> bool {
    b
}

#[cfg(test)]
mod tests;
