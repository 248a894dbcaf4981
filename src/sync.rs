// Short-held spin locks. These never allocate and never park the thread, so they can be taken on
// allocation paths.

use std::cell::UnsafeCell;
use std::hint::spin_loop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self { locked: AtomicBool::new(false) }
    }

    #[inline(always)]
    pub fn lock(&self) {
        loop {
            if self.locked.compare_exchange_weak(false, true, Acquire, Relaxed).is_ok() {
                break;
            }

            // Spin on a plain load so contending threads don't bounce the cache line.
            while self.locked.load(Relaxed) {
                spin_loop();
            }
        }
    }

    #[inline(always)]
    pub fn try_lock(&self) -> bool {
        self.locked.compare_exchange(false, true, Acquire, Relaxed).is_ok()
    }

    #[inline(always)]
    pub fn unlock(&self) {
        debug_assert!(self.locked.load(Relaxed));
        self.locked.store(false, Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Relaxed)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A spin lock that only locks when it was constructed as required. Lets one type serve both a
/// thread-local owner and a shared one.
pub struct MaybeSpinLock {
    lock: SpinLock,
    enabled: bool,
}

impl MaybeSpinLock {
    pub const fn new(enabled: bool) -> Self {
        Self { lock: SpinLock::new(), enabled }
    }

    #[inline(always)]
    pub fn lock(&self) -> MaybeSpinLockGuard<'_> {
        if self.enabled {
            self.lock.lock();
        }
        MaybeSpinLockGuard { lock: self }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

pub struct MaybeSpinLockGuard<'a> {
    lock: &'a MaybeSpinLock,
}

impl Drop for MaybeSpinLockGuard<'_> {
    #[inline(always)]
    fn drop(&mut self) {
        if self.lock.enabled {
            self.lock.lock.unlock();
        }
    }
}

pub struct SpinMutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(data: T) -> Self {
        Self { lock: SpinLock::new(), data: UnsafeCell::new(data) }
    }

    #[inline(always)]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.lock();
        SpinMutexGuard { mutex: self }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline(always)]
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::AssertUnwindSafe;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn spin_lock_excludes() {
        let l = SpinLock::new();
        l.lock();
        assert!(l.is_locked());
        assert!(!l.try_lock());
        l.unlock();
        assert!(l.try_lock());
        l.unlock();
        assert!(!l.is_locked());
    }

    #[test]
    fn disabled_maybe_lock_never_locks() {
        let l = MaybeSpinLock::new(false);
        let _g1 = l.lock();
        // Would deadlock if it actually locked.
        let _g2 = l.lock();
        assert!(!l.lock.is_locked());
    }

    #[test]
    fn enabled_maybe_lock_locks() {
        let l = MaybeSpinLock::new(true);
        {
            let _g = l.lock();
            assert!(l.lock.is_locked());
        }
        assert!(!l.lock.is_locked());
    }

    #[test]
    fn spin_mutex_unlocks_when_holder_panics() {
        let m = SpinMutex::new(());
        let r = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _g = m.lock();
            panic!("while holding the lock");
        }));
        assert!(r.is_err());
        assert!(!m.lock.is_locked());
        drop(m.lock());
    }

    #[test]
    fn spin_mutex_counts_across_threads() {
        const NUM_THREADS: usize = 8;
        const NUM_INCRS: usize = 10_000;

        let m = Arc::new(SpinMutex::new(0usize));
        let handles: Vec<_> = (0..NUM_THREADS)
            .map(|_| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..NUM_INCRS {
                        *m.lock() += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(*m.lock(), NUM_THREADS * NUM_INCRS);
    }
}
