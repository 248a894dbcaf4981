// Intrusive singly-linked freelist overlaid on freed slots.
//
// Two encodings exist and exactly one is the `PartitionFreelistEntry` of a build:
//
// * `EncodedNextFreelistEntry` stores the next pointer byte-swapped (inverted on big-endian).
// * `PoolOffsetFreelistEntry` stores the next entry's offset from the pool base, transformed the
//   same way.
//
// With the shadow (the `freelist-shadow` feature, unless ref-counts share the slot) each entry
// also keeps the bitwise inverse of its encoded link, which a stray write is unlikely to keep in
// sync.
//
// This module is the only place slot memory is reinterpreted as a header. Every decoded link goes
// through `is_well_formed` before anyone can follow it.

mod encoded;
mod pool_offset;

pub use encoded::EncodedNextFreelistEntry;
pub use pool_offset::PoolOffsetFreelistEntry;

use crate::address_pool_manager::PoolInfo;
use crate::freeslot_bitmap::free_slot_bitmap_slot_is_used;
use crate::{PartitionRefCount, PARTITION_PAGE_SIZE, SMALLEST_BUCKET, SMALLEST_USED_BUCKET, SUPER_PAGE_BASE_MASK, SUPER_PAGE_OFFSET_MASK};

use std::fmt;
use std::ptr::NonNull;

#[cfg(not(feature = "freelist-pool-offsets"))]
pub type PartitionFreelistEntry = EncodedNextFreelistEntry;
#[cfg(feature = "freelist-pool-offsets")]
pub type PartitionFreelistEntry = PoolOffsetFreelistEntry;

const _: () = assert!(SMALLEST_BUCKET >= size_of::<EncodedNextFreelistEntry>());
const _: () = assert!(SMALLEST_BUCKET >= size_of::<PoolOffsetFreelistEntry>());

#[cfg(feature = "ref-count-in-previous-slot")]
const _: () = assert!(SMALLEST_USED_BUCKET >= size_of::<PartitionFreelistEntry>() + size_of::<PartitionRefCount>());
#[cfg(not(feature = "ref-count-in-previous-slot"))]
const _: () = assert!(SMALLEST_USED_BUCKET >= size_of::<PartitionFreelistEntry>() && size_of::<PartitionRefCount>() == 4);

/// A decoded link that fails validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreelistCorruption {
    pub entry: usize,
    pub next: usize,
}

impl std::error::Error for FreelistCorruption {}

impl fmt::Display for FreelistCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "freelist entry {:#x} links to invalid address {:#x}", self.entry, self.next)
    }
}

/// Terminate the process. Corruption means a use-after-free or an attack, so there is nothing to
/// recover.
#[cold]
#[inline(never)]
pub fn freelist_corruption_detected(slot_size: usize) -> ! {
    // Keep it in a register for crash dumps.
    let slot_size = std::hint::black_box(slot_size);
    atomic_dbg::eprintln!("partalloc: freelist corruption detected (slot size {})", slot_size);
    std::process::abort()
}

/// One freelist encoding.
///
/// Entries live in freed slot memory. They are only created through the `emplace_*` functions on
/// slot starts inside a super page of `pool`, and `pool` must be the pool holding the list for
/// every call on that list.
pub trait FreelistEntry: Sized {
    /// Overlay a null entry on the slot at `slot_start`.
    ///
    /// # Safety
    ///
    /// `slot_start` must be a free, writable slot at least `size_of::<Self>()` bytes long, aligned
    /// for `Self`.
    unsafe fn emplace_and_init_null(slot_start: usize) -> NonNull<Self>;

    /// Overlay an entry linking to `next`. When `make_shadow_match` is false the shadow is left
    /// inconsistent, as a stray write would leave it.
    ///
    /// # Safety
    ///
    /// As for `emplace_and_init_null`.
    unsafe fn emplace_and_init_for_test(
        slot_start: usize,
        next: Option<NonNull<Self>>,
        make_shadow_match: bool,
        pool: &PoolInfo,
    ) -> NonNull<Self>;

    /// Link this entry to `entry`. The only writes to a live list go through here, from the list
    /// head when freeing.
    fn set_next(&mut self, entry: Option<NonNull<Self>>, pool: &PoolInfo);

    /// Decode and validate the link without terminating on failure.
    fn decode_next(&self, pool: &PoolInfo) -> Result<Option<NonNull<Self>>, FreelistCorruption>;

    /// Return the entry to a plain slot: zero the header and return the slot start.
    fn clear_for_allocation(&mut self) -> usize;

    fn is_encoded_next_ptr_zero(&self) -> bool;

    /// Overwrite the raw encoded link.
    fn corrupt_next_for_testing(&mut self, v: usize);

    /// The validated next entry. Corruption never returns.
    #[inline(always)]
    fn get_next(&self, slot_size: usize, pool: &PoolInfo) -> Option<NonNull<Self>> {
        match self.decode_next(pool) {
            Ok(next) => next,
            Err(_) => freelist_corruption_detected(slot_size),
        }
    }

    /// Walk and validate the whole list starting here. Returns its length.
    fn check_free_list(&self, slot_size: usize, pool: &PoolInfo) -> usize {
        let mut len = 1;
        let mut entry = self.get_next(slot_size, pool);
        while let Some(e) = entry {
            len += 1;
            entry = unsafe { e.as_ref() }.get_next(slot_size, pool);
        }
        len
    }

    #[inline(always)]
    fn slot_start(&self) -> usize {
        (self as *const Self).addr()
    }
}

/// Checks a decoded link `here -> next` before it may be followed: the shadow agrees, `next` is
/// aligned for an `E`, in the same super page and pool but outside the metadata partition page,
/// and, when the free-slot bitmap is on, `next` is marked free.
#[inline(always)]
pub(crate) fn is_well_formed<E>(here: usize, next: usize, shadow_ok: bool, pool: &PoolInfo) -> bool {
    debug_assert!(pool.contains(here));

    let aligned = next % align_of::<E>() == 0;
    let same_super_page = (here & SUPER_PAGE_BASE_MASK) == (next & SUPER_PAGE_BASE_MASK);
    let not_in_metadata = (next & SUPER_PAGE_OFFSET_MASK) >= PARTITION_PAGE_SIZE;
    let in_pool = pool.contains(next);

    if !(shadow_ok & aligned & same_super_page & not_in_metadata & in_pool) {
        return false;
    }

    // Only now is it safe to touch `next`'s super page.
    if cfg!(feature = "freeslot-bitmap") {
        return unsafe { !free_slot_bitmap_slot_is_used(next) };
    }

    true
}

/// Byte swap on little-endian, inversion on big-endian. Its own inverse.
#[inline(always)]
pub(crate) const fn transform(v: usize) -> usize {
    if cfg!(target_endian = "big") { !v } else { v.swap_bytes() }
}
