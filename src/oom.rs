// Out-of-memory termination.
//
// `on_no_memory` is the one frame crash classification keys on, so it must stay a real call: never
// inlined and never returning. Nothing on this path allocates; the message goes out through
// `atomic_dbg`, which formats on the stack and writes straight to fd 2.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::Relaxed;

/// Size of the allocation that ran us out of memory, kept for crash dumps.
pub static OOM_SIZE: AtomicUsize = AtomicUsize::new(0);

#[cold]
#[inline(never)]
pub fn on_no_memory(size: usize) -> ! {
    OOM_SIZE.store(size, Relaxed);
    atomic_dbg::eprintln!("partalloc: out of memory: failed to allocate {} bytes", size);
    std::process::abort()
}

/// Entry point for callers that have exhausted every way of satisfying an allocation.
#[cold]
#[inline(never)]
pub fn terminate_because_out_of_memory(size: usize) -> ! {
    on_no_memory(size)
}

/// Crash with an OOM for `size` bytes, lifting any allocation ban on this thread first.
#[macro_export]
macro_rules! oom_crash {
    ($size:expr) => {{
        let _allow = $crate::allocation_guard::ScopedAllowAllocations::new();
        $crate::oom::on_no_memory($size)
    }};
}
