// Per-super-page bitmap of free slots, one bit per `SMALLEST_BUCKET` of the super page.
//
// A set bit means the slot starting there is free. Freshly committed memory is zero, so every slot
// starts out "used" and only becomes free when it is actually freed. The bitmap sits right after
// the metadata partition page and is only reserved when the `freeslot-bitmap` feature is on, but
// the operations here work on any super page whose bitmap area is committed.

use crate::bits::align_up;
use crate::{PARTITION_PAGE_SIZE, SMALLEST_BUCKET, SUPER_PAGE_BASE_MASK, SUPER_PAGE_OFFSET_MASK, SUPER_PAGE_SIZE};

pub type FreeSlotBitmapCellType = u64;

pub const FREE_SLOT_BITMAP_BITS_PER_CELL: usize = FreeSlotBitmapCellType::BITS as usize;
pub const FREE_SLOT_BITMAP_OFFSET_MASK: usize = FREE_SLOT_BITMAP_BITS_PER_CELL - 1;

// Bytes needed for one bit per smallest-bucket-sized unit of a super page.
pub const FREE_SLOT_BITMAP_SIZE: usize = (SUPER_PAGE_SIZE / SMALLEST_BUCKET) / u8::BITS as usize;

const _: () = assert!(FREE_SLOT_BITMAP_SIZE % size_of::<FreeSlotBitmapCellType>() == 0);

/// Bytes set aside for the bitmap in each super page: whole partition pages, or nothing when the
/// feature is off.
#[inline(always)]
pub const fn reserved_free_slot_bitmap_size() -> usize {
    if cfg!(feature = "freeslot-bitmap") {
        align_up(FREE_SLOT_BITMAP_SIZE, PARTITION_PAGE_SIZE)
    } else {
        0
    }
}

#[inline(always)]
pub const fn num_partition_pages_per_free_slot_bitmap() -> usize {
    reserved_free_slot_bitmap_size() / PARTITION_PAGE_SIZE
}

#[inline(always)]
pub const fn super_page_free_slot_bitmap_addr(super_page: usize) -> usize {
    debug_assert!(super_page & SUPER_PAGE_OFFSET_MASK == 0);
    super_page + PARTITION_PAGE_SIZE
}

#[inline(always)]
fn cell_ptr_and_bit_index(slot_start: usize) -> (*mut FreeSlotBitmapCellType, usize) {
    let super_page = slot_start & SUPER_PAGE_BASE_MASK;
    let unit = (slot_start & SUPER_PAGE_OFFSET_MASK) / SMALLEST_BUCKET;
    let cell_addr = super_page_free_slot_bitmap_addr(super_page)
        + (unit / FREE_SLOT_BITMAP_BITS_PER_CELL) * size_of::<FreeSlotBitmapCellType>();

    (cell_addr as *mut FreeSlotBitmapCellType, unit & FREE_SLOT_BITMAP_OFFSET_MASK)
}

#[inline(always)]
const fn cell_with_a_one(n: usize) -> FreeSlotBitmapCellType {
    1 << n
}

/// True if the slot at `slot_start` is in use (its bit is 0).
///
/// # Safety
///
/// The bitmap area of `slot_start`'s super page must be committed.
#[inline(always)]
pub unsafe fn free_slot_bitmap_slot_is_used(slot_start: usize) -> bool {
    let (cell, bit_index) = cell_ptr_and_bit_index(slot_start);
    unsafe { *cell & cell_with_a_one(bit_index) == 0 }
}

/// # Safety
///
/// As for `free_slot_bitmap_slot_is_used`.
#[inline(always)]
pub unsafe fn free_slot_bitmap_mark_slot_as_used(slot_start: usize) {
    debug_assert!(unsafe { !free_slot_bitmap_slot_is_used(slot_start) });
    let (cell, bit_index) = cell_ptr_and_bit_index(slot_start);
    unsafe { *cell &= !cell_with_a_one(bit_index) };
}

/// # Safety
///
/// As for `free_slot_bitmap_slot_is_used`.
#[inline(always)]
pub unsafe fn free_slot_bitmap_mark_slot_as_free(slot_start: usize) {
    debug_assert!(unsafe { free_slot_bitmap_slot_is_used(slot_start) });
    let (cell, bit_index) = cell_ptr_and_bit_index(slot_start);
    unsafe { *cell |= cell_with_a_one(bit_index) };
}

/// Mark every slot starting in `[begin, end)` as used. `begin` must be a slot start; `end` only has
/// to be `SMALLEST_BUCKET`-aligned.
///
/// # Safety
///
/// As for `free_slot_bitmap_slot_is_used`.
pub unsafe fn free_slot_bitmap_reset(begin: usize, end: usize, slot_size: usize) {
    debug_assert!(begin <= end);
    debug_assert!(end & (SMALLEST_BUCKET - 1) == 0);
    debug_assert!(slot_size > 0);

    let mut slot_start = begin;
    while slot_start < end {
        let (cell, bit_index) = cell_ptr_and_bit_index(slot_start);
        unsafe { *cell &= !cell_with_a_one(bit_index) };
        slot_start += slot_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSuperPage;

    const _: () = assert!(FREE_SLOT_BITMAP_SIZE == 16 * 1024);

    #[test]
    fn sizes() {
        if cfg!(feature = "freeslot-bitmap") {
            assert!(reserved_free_slot_bitmap_size() >= FREE_SLOT_BITMAP_SIZE);
            assert_eq!(reserved_free_slot_bitmap_size() % PARTITION_PAGE_SIZE, 0);
            assert!(num_partition_pages_per_free_slot_bitmap() >= 1);
        } else {
            assert_eq!(reserved_free_slot_bitmap_size(), 0);
            assert_eq!(num_partition_pages_per_free_slot_bitmap(), 0);
        }
    }

    #[test]
    fn fresh_memory_is_all_used() {
        let sp = TestSuperPage::new();
        let begin = sp.payload_begin();
        for slot in (begin..begin + 64 * SMALLEST_BUCKET).step_by(SMALLEST_BUCKET) {
            assert!(unsafe { free_slot_bitmap_slot_is_used(slot) });
        }
    }

    #[test]
    fn mark_free_and_used() {
        let sp = TestSuperPage::new();
        let begin = sp.payload_begin();

        // Straddle a cell boundary.
        let slots: Vec<usize> = (60..70).map(|i| begin + i * SMALLEST_BUCKET).collect();
        for &s in &slots {
            unsafe { free_slot_bitmap_mark_slot_as_free(s) };
        }
        for &s in &slots {
            assert!(unsafe { !free_slot_bitmap_slot_is_used(s) });
        }
        // Neighbors are untouched.
        assert!(unsafe { free_slot_bitmap_slot_is_used(begin + 59 * SMALLEST_BUCKET) });
        assert!(unsafe { free_slot_bitmap_slot_is_used(begin + 70 * SMALLEST_BUCKET) });

        unsafe { free_slot_bitmap_mark_slot_as_used(slots[3]) };
        assert!(unsafe { free_slot_bitmap_slot_is_used(slots[3]) });
        assert!(unsafe { !free_slot_bitmap_slot_is_used(slots[4]) });
    }

    #[test]
    fn reset_range() {
        let sp = TestSuperPage::new();
        let begin = sp.payload_begin();
        const SLOT_SIZE: usize = 3 * SMALLEST_BUCKET;

        for i in 0..100 {
            unsafe { free_slot_bitmap_mark_slot_as_free(begin + i * SLOT_SIZE) };
        }

        // Half a slot past slot 49 still counts slot 49 as starting in range.
        let end = begin + 49 * SLOT_SIZE + SMALLEST_BUCKET;
        unsafe { free_slot_bitmap_reset(begin, end, SLOT_SIZE) };

        for i in 0..50 {
            assert!(unsafe { free_slot_bitmap_slot_is_used(begin + i * SLOT_SIZE) }, "{i}");
        }
        for i in 50..100 {
            assert!(unsafe { !free_slot_bitmap_slot_is_used(begin + i * SLOT_SIZE) }, "{i}");
        }
    }
}
