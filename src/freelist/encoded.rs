use super::{is_well_formed, transform, FreelistCorruption, FreelistEntry};
use crate::address_pool_manager::PoolInfo;
use crate::{freelist_corruption_detected, unlikely, SUPER_PAGE_BASE_MASK};

use std::ptr::NonNull;

// The transformed address of the next entry. Null is stored as 0 rather than `transform(0)`, so
// "no next entry" is the same bit pattern on every platform.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct EncodedFreelistPtr {
    encoded: usize,
}

impl EncodedFreelistPtr {
    const NULL: Self = Self { encoded: 0 };

    #[inline(always)]
    fn new<T>(ptr: Option<NonNull<T>>) -> Self {
        match ptr {
            Some(p) => Self { encoded: transform(p.as_ptr().addr()) },
            None => Self::NULL,
        }
    }

    #[inline(always)]
    fn decode(self) -> usize {
        transform(self.encoded)
    }

    #[inline(always)]
    fn inverted(self) -> usize {
        !self.encoded
    }
}

#[repr(C)]
pub struct EncodedNextFreelistEntry {
    encoded_next: EncodedFreelistPtr,
    #[cfg(freelist_shadow)]
    shadow: usize,
}

impl EncodedNextFreelistEntry {
    #[inline(always)]
    fn shadow_ok(&self) -> bool {
        #[cfg(freelist_shadow)]
        {
            self.encoded_next.inverted() == self.shadow
        }
        #[cfg(not(freelist_shadow))]
        {
            true
        }
    }

    #[inline(always)]
    unsafe fn write_at(slot_start: usize, encoded_next: EncodedFreelistPtr, shadow: usize) -> NonNull<Self> {
        debug_assert!(slot_start != 0);
        debug_assert!(slot_start % align_of::<Self>() == 0);

        #[cfg(not(freelist_shadow))]
        let _ = shadow;

        let p = slot_start as *mut Self;
        unsafe {
            p.write(Self {
                encoded_next,
                #[cfg(freelist_shadow)]
                shadow,
            });
            NonNull::new_unchecked(p)
        }
    }
}

impl FreelistEntry for EncodedNextFreelistEntry {
    unsafe fn emplace_and_init_null(slot_start: usize) -> NonNull<Self> {
        let encoded_next = EncodedFreelistPtr::NULL;
        unsafe { Self::write_at(slot_start, encoded_next, encoded_next.inverted()) }
    }

    unsafe fn emplace_and_init_for_test(
        slot_start: usize,
        next: Option<NonNull<Self>>,
        make_shadow_match: bool,
        _pool: &PoolInfo,
    ) -> NonNull<Self> {
        let encoded_next = EncodedFreelistPtr::new(next);
        let shadow = if make_shadow_match { encoded_next.inverted() } else { 12345 };
        unsafe { Self::write_at(slot_start, encoded_next, shadow) }
    }

    #[inline(always)]
    fn set_next(&mut self, entry: Option<NonNull<Self>>, _pool: &PoolInfo) {
        // Lists never span super pages; this firing is an allocator bug.
        if cfg!(debug_assertions) {
            if let Some(e) = entry {
                if unlikely((self.slot_start() & SUPER_PAGE_BASE_MASK) != (e.as_ptr().addr() & SUPER_PAGE_BASE_MASK)) {
                    freelist_corruption_detected(0);
                }
            }
        }

        self.encoded_next = EncodedFreelistPtr::new(entry);
        #[cfg(freelist_shadow)]
        {
            self.shadow = self.encoded_next.inverted();
        }
    }

    #[inline(always)]
    fn decode_next(&self, pool: &PoolInfo) -> Result<Option<NonNull<Self>>, FreelistCorruption> {
        if self.is_encoded_next_ptr_zero() {
            return Ok(None);
        }

        let here = self.slot_start();
        let next = self.encoded_next.decode();
        if unlikely(!is_well_formed::<Self>(here, next, self.shadow_ok(), pool)) {
            return Err(FreelistCorruption { entry: here, next });
        }

        Ok(NonNull::new(next as *mut Self))
    }

    #[inline(always)]
    fn clear_for_allocation(&mut self) -> usize {
        self.encoded_next = EncodedFreelistPtr::NULL;
        #[cfg(freelist_shadow)]
        {
            self.shadow = 0;
        }
        self.slot_start()
    }

    #[inline(always)]
    fn is_encoded_next_ptr_zero(&self) -> bool {
        self.encoded_next == EncodedFreelistPtr::NULL
    }

    fn corrupt_next_for_testing(&mut self, v: usize) {
        self.encoded_next = EncodedFreelistPtr { encoded: v };
    }
}
