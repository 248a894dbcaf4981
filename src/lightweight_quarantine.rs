// Lightweight quarantine: freed objects are held back for a while before their memory is really
// freed, so a use-after-free touches dead-but-unreused memory instead of someone else's object.
//
// A `LightweightQuarantineRoot` holds the byte budget and the shared counters. Any number of
// `LightweightQuarantineBranch`es draw from it; each owns its own list of held objects. A branch
// created without a lock is `!Sync` and so stays on one thread; one created with a lock can be
// turned into a `SharedLightweightQuarantineBranch` and used from many.
//
// Eviction order is random. Each insert swaps the new entry with a random one and eviction pops
// from the back, which gives a cheap approximate shuffle.
//
// The budget is soft. The fits-at-all check reads the root's counters relaxed, and racing branches
// can overshoot briefly.

use crate::sync::MaybeSpinLock;
use crate::{likely, unlikely};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

pub const DEFAULT_QUARANTINE_CAPACITY_IN_BYTES: usize = 1 << 20;

/// The allocator a quarantine sits in front of.
pub trait AllocatorRoot {
    /// Whatever the allocator needs to find an object's slot again.
    type SlotSpan: Copy;

    fn get_slot_usable_size(&self, slot_span: Self::SlotSpan) -> usize;

    /// Really free `object`, skipping any free hooks (which could send it straight back here).
    ///
    /// # Safety
    ///
    /// `object` must be a live allocation of this allocator in `slot_span`, starting at
    /// `slot_start`, with no other outstanding access.
    unsafe fn free_no_hooks_immediate(&self, object: *mut u8, slot_span: Self::SlotSpan, slot_start: usize);

    fn object_to_slot_start(&self, object: *mut u8) -> usize;

    fn slot_span_from_object(&self, object: *mut u8) -> Self::SlotSpan;
}

impl<T: AllocatorRoot + ?Sized> AllocatorRoot for &T {
    type SlotSpan = T::SlotSpan;

    fn get_slot_usable_size(&self, slot_span: Self::SlotSpan) -> usize {
        (**self).get_slot_usable_size(slot_span)
    }

    unsafe fn free_no_hooks_immediate(&self, object: *mut u8, slot_span: Self::SlotSpan, slot_start: usize) {
        unsafe { (**self).free_no_hooks_immediate(object, slot_span, slot_start) }
    }

    fn object_to_slot_start(&self, object: *mut u8) -> usize {
        (**self).object_to_slot_start(object)
    }

    fn slot_span_from_object(&self, object: *mut u8) -> Self::SlotSpan {
        (**self).slot_span_from_object(object)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LightweightQuarantineStats {
    pub count: usize,
    pub size_in_bytes: usize,
    pub cumulative_count: usize,
    pub cumulative_size_in_bytes: usize,
    pub quarantine_miss_count: usize,
}

pub struct LightweightQuarantineRoot<R: AllocatorRoot> {
    allocator_root: R,

    capacity_in_bytes: AtomicUsize,

    // Live totals across every branch.
    size_in_bytes: AtomicUsize,
    count: AtomicUsize,

    // Never decrease.
    cumulative_count: AtomicUsize,
    cumulative_size_in_bytes: AtomicUsize,
    quarantine_miss_count: AtomicUsize,
}

impl<R: AllocatorRoot> LightweightQuarantineRoot<R> {
    pub fn new(allocator_root: R, capacity_in_bytes: usize) -> Self {
        Self {
            allocator_root,
            capacity_in_bytes: AtomicUsize::new(capacity_in_bytes),
            size_in_bytes: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            cumulative_count: AtomicUsize::new(0),
            cumulative_size_in_bytes: AtomicUsize::new(0),
            quarantine_miss_count: AtomicUsize::new(0),
        }
    }

    pub fn create_branch(&self, lock_required: bool) -> LightweightQuarantineBranch<'_, R> {
        LightweightQuarantineBranch::new(self, lock_required, StdRng::from_os_rng())
    }

    /// Like `create_branch`, with a fixed eviction order.
    pub fn create_branch_with_seed(&self, lock_required: bool, seed: u64) -> LightweightQuarantineBranch<'_, R> {
        LightweightQuarantineBranch::new(self, lock_required, StdRng::seed_from_u64(seed))
    }

    pub fn allocator_root(&self) -> &R {
        &self.allocator_root
    }

    pub fn capacity_in_bytes(&self) -> usize {
        self.capacity_in_bytes.load(Relaxed)
    }

    /// Takes effect on the next quarantine; nothing is evicted eagerly.
    pub fn set_capacity_in_bytes(&self, capacity_in_bytes: usize) {
        self.capacity_in_bytes.store(capacity_in_bytes, Relaxed);
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size_in_bytes.load(Acquire)
    }

    pub fn count(&self) -> usize {
        self.count.load(Relaxed)
    }

    pub fn quarantine_miss_count(&self) -> usize {
        self.quarantine_miss_count.load(Relaxed)
    }

    pub fn accumulate_stats(&self, stats: &mut LightweightQuarantineStats) {
        stats.count += self.count.load(Relaxed);
        stats.size_in_bytes += self.size_in_bytes.load(Relaxed);
        stats.cumulative_count += self.cumulative_count.load(Relaxed);
        stats.cumulative_size_in_bytes += self.cumulative_size_in_bytes.load(Relaxed);
        stats.quarantine_miss_count += self.quarantine_miss_count.load(Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct QuarantineSlot {
    object: *mut u8,
    usable_size: usize,
}

struct BranchState {
    slots: Vec<QuarantineSlot>,
    branch_size_in_bytes: usize,
    random: StdRng,
}

pub struct LightweightQuarantineBranch<'a, R: AllocatorRoot> {
    root: &'a LightweightQuarantineRoot<R>,
    lock: MaybeSpinLock,
    // Only touched under `lock`, or from the one thread an unlocked branch is confined to.
    state: UnsafeCell<BranchState>,
}

// The held objects are owned by the branch until it frees them, so the branch can move between
// threads whenever the root can be shared. `UnsafeCell` keeps it `!Sync`.
unsafe impl<R: AllocatorRoot + Sync> Send for LightweightQuarantineBranch<'_, R> {}

impl<'a, R: AllocatorRoot> LightweightQuarantineBranch<'a, R> {
    fn new(root: &'a LightweightQuarantineRoot<R>, lock_required: bool, random: StdRng) -> Self {
        Self {
            root,
            lock: MaybeSpinLock::new(lock_required),
            state: UnsafeCell::new(BranchState { slots: Vec::new(), branch_size_in_bytes: 0, random }),
        }
    }

    pub fn root(&self) -> &'a LightweightQuarantineRoot<R> {
        self.root
    }

    pub fn lock_required(&self) -> bool {
        self.lock.is_enabled()
    }

    /// Hold `object` instead of freeing it. Returns false if it could not fit even with this
    /// branch emptied, in which case it has already been freed for real.
    ///
    /// # Safety
    ///
    /// Same contract as `AllocatorRoot::free_no_hooks_immediate`: `object` is a live allocation in
    /// `slot_span` at `slot_start`, and the caller hands over ownership of it.
    pub unsafe fn quarantine(&self, object: *mut u8, slot_span: R::SlotSpan, slot_start: usize) -> bool {
        let allocator_root = &self.root.allocator_root;
        let usable_size = allocator_root.get_slot_usable_size(slot_span);

        let capacity_in_bytes = self.root.capacity_in_bytes.load(Relaxed);

        {
            let _guard = self.lock.lock();
            let state = unsafe { &mut *self.state.get() };

            let size_in_bytes_held_by_others =
                self.root.size_in_bytes.load(Relaxed).saturating_sub(state.branch_size_in_bytes);
            if unlikely(capacity_in_bytes < size_in_bytes_held_by_others.saturating_add(usable_size)) {
                // Doesn't fit even if this branch dequarantines everything it holds.
                unsafe { allocator_root.free_no_hooks_immediate(object, slot_span, slot_start) };
                self.root.quarantine_miss_count.fetch_add(1, Relaxed);
                return false;
            }

            // Make room.
            self.purge_internal(state, capacity_in_bytes - usable_size);

            state.branch_size_in_bytes += usable_size;
            debug_assert!(state.branch_size_in_bytes <= capacity_in_bytes);

            state.slots.push(QuarantineSlot { object, usable_size });

            // Swap with a random entry so the list stays shuffled. Not uniform, but random enough.
            let random_index = state.random.random::<u32>() as usize % state.slots.len();
            let last = state.slots.len() - 1;
            state.slots.swap(random_index, last);

            // Under the lock: the root total never lags what this branch holds.
            self.root.count.fetch_add(1, Relaxed);
            self.root.size_in_bytes.fetch_add(usable_size, Relaxed);
        }

        self.root.cumulative_count.fetch_add(1, Relaxed);
        self.root.cumulative_size_in_bytes.fetch_add(usable_size, Relaxed);

        true
    }

    /// Free everything this branch holds.
    pub fn purge(&self) {
        let _guard = self.lock.lock();
        let state = unsafe { &mut *self.state.get() };
        self.purge_internal(state, 0);
    }

    // Evict from the back until the root's live total is at most `target_size_in_bytes` or this
    // branch is empty. Caller holds the lock.
    fn purge_internal(&self, state: &mut BranchState, target_size_in_bytes: usize) {
        let allocator_root = &self.root.allocator_root;

        let mut freed_count = 0;
        let mut freed_size_in_bytes = 0;

        let mut size_in_bytes = self.root.size_in_bytes.load(Acquire);
        while target_size_in_bytes < size_in_bytes {
            let Some(to_free) = state.slots.pop() else {
                break;
            };

            let slot_span = allocator_root.slot_span_from_object(to_free.object);
            let slot_start = allocator_root.object_to_slot_start(to_free.object);
            unsafe { allocator_root.free_no_hooks_immediate(to_free.object, slot_span, slot_start) };

            freed_count += 1;
            freed_size_in_bytes += to_free.usable_size;
            size_in_bytes = size_in_bytes.saturating_sub(to_free.usable_size);
        }

        if likely(freed_count > 0) {
            self.root.count.fetch_sub(freed_count, Relaxed);
            // Release: whoever sees the smaller total also sees the memory as freed.
            self.root.size_in_bytes.fetch_sub(freed_size_in_bytes, Release);
            state.branch_size_in_bytes -= freed_size_in_bytes;
        }
    }

    pub fn is_quarantined_for_testing(&self, object: *mut u8) -> bool {
        let _guard = self.lock.lock();
        let state = unsafe { &*self.state.get() };
        state.slots.iter().any(|s| s.object == object)
    }

    /// Bytes held by this branch alone.
    pub fn size_in_bytes(&self) -> usize {
        let _guard = self.lock.lock();
        unsafe { &*self.state.get() }.branch_size_in_bytes
    }

    pub fn slot_count(&self) -> usize {
        let _guard = self.lock.lock();
        unsafe { &*self.state.get() }.slots.len()
    }

    /// Share a locking branch across threads.
    pub fn into_shared(self) -> SharedLightweightQuarantineBranch<'a, R> {
        assert!(self.lock_required(), "only a branch created with a lock can be shared");
        SharedLightweightQuarantineBranch { branch: self }
    }
}

impl<R: AllocatorRoot> Drop for LightweightQuarantineBranch<'_, R> {
    fn drop(&mut self) {
        self.purge();
        self.state.get_mut().slots.clear();
    }
}

/// A locking branch usable from several threads at once.
pub struct SharedLightweightQuarantineBranch<'a, R: AllocatorRoot> {
    branch: LightweightQuarantineBranch<'a, R>,
}

// Every access to the branch state goes through its (enabled) lock.
unsafe impl<R: AllocatorRoot + Sync> Sync for SharedLightweightQuarantineBranch<'_, R> {}

impl<'a, R: AllocatorRoot> Deref for SharedLightweightQuarantineBranch<'a, R> {
    type Target = LightweightQuarantineBranch<'a, R>;

    fn deref(&self) -> &Self::Target {
        &self.branch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeAllocatorRoot;

    #[test]
    fn fits_without_eviction() {
        let fake = FakeAllocatorRoot::new();
        let root = LightweightQuarantineRoot::new(&fake, 100);
        let branch = root.create_branch(false);

        for _ in 0..4 {
            let o = fake.alloc(25);
            assert!(unsafe { branch.quarantine(o, fake.slot_span_from_object(o), o.addr()) });
            assert!(branch.is_quarantined_for_testing(o));
        }

        assert_eq!(fake.total_frees(), 0);
        assert_eq!(root.size_in_bytes(), 100);
        assert_eq!(root.count(), 4);
        assert_eq!(branch.size_in_bytes(), 100);
        assert_eq!(branch.slot_count(), 4);
    }

    #[test]
    fn miss_frees_immediately() {
        let fake = FakeAllocatorRoot::new();
        let root = LightweightQuarantineRoot::new(&fake, 100);
        let branch = root.create_branch(false);

        let o = fake.alloc(101);
        assert!(!unsafe { branch.quarantine(o, fake.slot_span_from_object(o), o.addr()) });
        assert!(!branch.is_quarantined_for_testing(o));
        assert_eq!(fake.free_count(o), 1);
        assert_eq!(root.quarantine_miss_count(), 1);
        assert_eq!(root.size_in_bytes(), 0);
        assert_eq!(root.count(), 0);
    }

    #[test]
    fn miss_when_other_branches_hold_the_budget() {
        let fake = FakeAllocatorRoot::new();
        let root = LightweightQuarantineRoot::new(&fake, 100);
        let a = root.create_branch(false);
        let b = root.create_branch(false);

        let o1 = fake.alloc(80);
        assert!(unsafe { a.quarantine(o1, fake.slot_span_from_object(o1), o1.addr()) });

        // b can only evict its own entries, and it holds nothing.
        let o2 = fake.alloc(30);
        assert!(!unsafe { b.quarantine(o2, fake.slot_span_from_object(o2), o2.addr()) });
        assert_eq!(fake.free_count(o2), 1);
        assert_eq!(fake.free_count(o1), 0);
        assert!(a.is_quarantined_for_testing(o1));
    }

    #[test]
    fn eviction_respects_capacity() {
        let fake = FakeAllocatorRoot::new();
        let root = LightweightQuarantineRoot::new(&fake, 1000);
        let branch = root.create_branch_with_seed(false, 7);

        let mut total_in = 0;
        for i in 0..500 {
            let size = 16 + (i * 37) % 200;
            let o = fake.alloc(size);
            assert!(unsafe { branch.quarantine(o, fake.slot_span_from_object(o), o.addr()) });
            total_in += size;

            assert!(root.size_in_bytes() <= 1000);
            assert_eq!(root.size_in_bytes(), branch.size_in_bytes());
            assert_eq!(root.count(), branch.slot_count());
            assert!(branch.is_quarantined_for_testing(o));
        }

        // Everything not held was freed exactly once.
        assert_eq!(fake.total_frees() + branch.slot_count(), 500);
        assert_eq!(fake.freed_bytes() + root.size_in_bytes(), total_in);
        assert_eq!(fake.max_free_count(), 1);
    }

    #[test]
    fn eviction_is_not_fifo() {
        // With FIFO the first object in would always be the first one out.
        let mut first_out_was_first_in = 0;
        for seed in 0..20 {
            let fake = FakeAllocatorRoot::new();
            let root = LightweightQuarantineRoot::new(&fake, 100);
            let branch = root.create_branch_with_seed(false, seed);

            let objects: Vec<*mut u8> = (0..11).map(|_| fake.alloc(10)).collect();
            for &o in &objects {
                assert!(unsafe { branch.quarantine(o, fake.slot_span_from_object(o), o.addr()) });
            }
            assert_eq!(fake.total_frees(), 1);
            if fake.free_count(objects[0]) == 1 {
                first_out_was_first_in += 1;
            }
        }
        assert!(first_out_was_first_in < 20);
    }

    #[test]
    fn purge_empties_the_branch_only() {
        let fake = FakeAllocatorRoot::new();
        let root = LightweightQuarantineRoot::new(&fake, 1000);
        let a = root.create_branch(false);
        let b = root.create_branch(true);

        let oa = fake.alloc(100);
        let ob = fake.alloc(200);
        unsafe {
            assert!(a.quarantine(oa, fake.slot_span_from_object(oa), oa.addr()));
            assert!(b.quarantine(ob, fake.slot_span_from_object(ob), ob.addr()));
        }

        a.purge();
        assert_eq!(fake.free_count(oa), 1);
        assert_eq!(fake.free_count(ob), 0);
        assert_eq!(a.slot_count(), 0);
        assert_eq!(a.size_in_bytes(), 0);
        assert_eq!(root.size_in_bytes(), 200);
        assert_eq!(root.count(), 1);
    }

    #[test]
    fn stats_accumulate() {
        let fake = FakeAllocatorRoot::new();
        let root = LightweightQuarantineRoot::new(&fake, 50);
        {
            let branch = root.create_branch(false);
            for size in [20, 20, 20, 60] {
                let o = fake.alloc(size);
                unsafe { branch.quarantine(o, fake.slot_span_from_object(o), o.addr()) };
            }
        }

        let mut stats = LightweightQuarantineStats::default();
        root.accumulate_stats(&mut stats);
        assert_eq!(
            stats,
            LightweightQuarantineStats {
                count: 0,
                size_in_bytes: 0,
                cumulative_count: 3,
                cumulative_size_in_bytes: 60,
                quarantine_miss_count: 1,
            }
        );

        // Accumulates, doesn't overwrite.
        root.accumulate_stats(&mut stats);
        assert_eq!(stats.cumulative_count, 6);
    }

    #[test]
    fn capacity_change_applies_on_next_quarantine() {
        let fake = FakeAllocatorRoot::new();
        let root = LightweightQuarantineRoot::new(&fake, 100);
        let branch = root.create_branch(false);

        for _ in 0..5 {
            let o = fake.alloc(20);
            unsafe { branch.quarantine(o, fake.slot_span_from_object(o), o.addr()) };
        }
        assert_eq!(root.size_in_bytes(), 100);

        root.set_capacity_in_bytes(40);
        assert_eq!(root.capacity_in_bytes(), 40);
        assert_eq!(root.size_in_bytes(), 100);

        let o = fake.alloc(20);
        assert!(unsafe { branch.quarantine(o, fake.slot_span_from_object(o), o.addr()) });
        assert_eq!(root.size_in_bytes(), 40);
        assert_eq!(fake.total_frees(), 4);
    }

    #[test]
    #[should_panic(expected = "only a branch created with a lock")]
    fn unlocked_branch_cannot_be_shared() {
        let fake = FakeAllocatorRoot::new();
        let root = LightweightQuarantineRoot::new(&fake, 100);
        let _ = root.create_branch(false).into_shared();
    }
}
