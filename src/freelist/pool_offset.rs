use super::{is_well_formed, transform, FreelistCorruption, FreelistEntry};
use crate::address_pool_manager::PoolInfo;
use crate::{freelist_corruption_detected, unlikely, SUPER_PAGE_BASE_MASK};

use std::ptr::NonNull;

/// Links by transformed offset from the pool base. Offset 0 is the pool base, which is always
/// metadata, so it doubles as null. A forged link can at worst point somewhere inside the pool.
#[repr(C)]
pub struct PoolOffsetFreelistEntry {
    encoded_offset: usize,
    #[cfg(freelist_shadow)]
    shadow: usize,
}

#[inline(always)]
fn encode(next: Option<NonNull<PoolOffsetFreelistEntry>>, pool: &PoolInfo) -> usize {
    match next {
        Some(p) => {
            let offset = pool.offset_of(p.as_ptr().addr());
            debug_assert!(offset != 0);
            transform(offset)
        }
        None => 0,
    }
}

impl PoolOffsetFreelistEntry {
    #[inline(always)]
    fn shadow_ok(&self) -> bool {
        #[cfg(freelist_shadow)]
        {
            !self.encoded_offset == self.shadow
        }
        #[cfg(not(freelist_shadow))]
        {
            true
        }
    }

    #[inline(always)]
    unsafe fn write_at(slot_start: usize, encoded_offset: usize, shadow: usize) -> NonNull<Self> {
        debug_assert!(slot_start != 0);
        debug_assert!(slot_start % align_of::<Self>() == 0);

        #[cfg(not(freelist_shadow))]
        let _ = shadow;

        let p = slot_start as *mut Self;
        unsafe {
            p.write(Self {
                encoded_offset,
                #[cfg(freelist_shadow)]
                shadow,
            });
            NonNull::new_unchecked(p)
        }
    }
}

impl FreelistEntry for PoolOffsetFreelistEntry {
    unsafe fn emplace_and_init_null(slot_start: usize) -> NonNull<Self> {
        unsafe { Self::write_at(slot_start, 0, !0) }
    }

    unsafe fn emplace_and_init_for_test(
        slot_start: usize,
        next: Option<NonNull<Self>>,
        make_shadow_match: bool,
        pool: &PoolInfo,
    ) -> NonNull<Self> {
        let encoded_offset = encode(next, pool);
        let shadow = if make_shadow_match { !encoded_offset } else { 12345 };
        unsafe { Self::write_at(slot_start, encoded_offset, shadow) }
    }

    #[inline(always)]
    fn set_next(&mut self, entry: Option<NonNull<Self>>, pool: &PoolInfo) {
        if cfg!(debug_assertions) {
            if let Some(e) = entry {
                if unlikely((self.slot_start() & SUPER_PAGE_BASE_MASK) != (e.as_ptr().addr() & SUPER_PAGE_BASE_MASK)) {
                    freelist_corruption_detected(0);
                }
            }
        }

        self.encoded_offset = encode(entry, pool);
        #[cfg(freelist_shadow)]
        {
            self.shadow = !self.encoded_offset;
        }
    }

    #[inline(always)]
    fn decode_next(&self, pool: &PoolInfo) -> Result<Option<NonNull<Self>>, FreelistCorruption> {
        if self.is_encoded_next_ptr_zero() {
            return Ok(None);
        }

        let here = self.slot_start();
        // Garbage offsets can overflow; `is_well_formed` rejects whatever comes out.
        let next = pool.base.wrapping_add(transform(self.encoded_offset));
        if unlikely(!is_well_formed::<Self>(here, next, self.shadow_ok(), pool)) {
            return Err(FreelistCorruption { entry: here, next });
        }

        Ok(NonNull::new(next as *mut Self))
    }

    #[inline(always)]
    fn clear_for_allocation(&mut self) -> usize {
        self.encoded_offset = 0;
        #[cfg(freelist_shadow)]
        {
            self.shadow = 0;
        }
        self.slot_start()
    }

    #[inline(always)]
    fn is_encoded_next_ptr_zero(&self) -> bool {
        self.encoded_offset == 0
    }

    fn corrupt_next_for_testing(&mut self, v: usize) {
        self.encoded_offset = v;
    }
}
