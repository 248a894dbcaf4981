// Per-thread "no allocations in this scope" guard.
//
// `ScopedDisallowAllocations` nests. `ScopedAllowAllocations` lifts every enclosing disallow until
// it is dropped, which the OOM path needs because crash machinery on some platforms allocates.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static DISALLOW_DEPTH: Cell<u32> = const { Cell::new(0) };
}

#[inline(always)]
pub fn allocations_allowed() -> bool {
    DISALLOW_DEPTH.get() == 0
}

pub struct ScopedDisallowAllocations {
    // Tied to the thread whose counter it bumped.
    _not_send: PhantomData<*const ()>,
}

impl ScopedDisallowAllocations {
    #[must_use]
    pub fn new() -> Self {
        DISALLOW_DEPTH.set(DISALLOW_DEPTH.get() + 1);
        Self { _not_send: PhantomData }
    }
}

impl Default for ScopedDisallowAllocations {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedDisallowAllocations {
    fn drop(&mut self) {
        let depth = DISALLOW_DEPTH.get();
        debug_assert!(depth > 0);
        DISALLOW_DEPTH.set(depth - 1);
    }
}

pub struct ScopedAllowAllocations {
    saved_depth: u32,
    _not_send: PhantomData<*const ()>,
}

impl ScopedAllowAllocations {
    #[must_use]
    pub fn new() -> Self {
        let saved_depth = DISALLOW_DEPTH.replace(0);
        Self { saved_depth, _not_send: PhantomData }
    }
}

impl Default for ScopedAllowAllocations {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedAllowAllocations {
    fn drop(&mut self) {
        DISALLOW_DEPTH.set(self.saved_depth);
    }
}
