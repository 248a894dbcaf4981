// The GigaCage: one up-front reservation holding every pool, laid out so that each pool starts at a
// multiple of its own size. Pool membership is then a single mask-and-compare.
//
// +----------------+ reserved_base_address (aligned to the larger pool size)
// |    non-BRP     |     == non_brp_pool_base_address
// |      pool      |
// +----------------+ reserved_base_address + non_brp_pool_size
// |      BRP       |     == brp_pool_base_address
// |      pool      |
// +----------------+ reserved_base_address + non_brp_pool_size + brp_pool_size
//
// The non-BRP pool has to come first: a pointer one past the end of some unrelated mapping that
// happened to sit just below the cage must not land in the BRP pool.
//
// The configurable pool is caller-provided memory, registered after the fixed pools.

use crate::address_pool_manager::{
    AddressPoolManager, PoolHandle, PoolInfo, BRP_POOL_HANDLE, CONFIGURABLE_POOL_HANDLE, NON_BRP_POOL_HANDLE,
    NULL_POOL_HANDLE,
};
use crate::bits::is_power_of_two;
use crate::config::GigaCageConfig;
use crate::platformalloc::{
    alloc_pages_with_align_offset, decommit_system_pages, free_pages, set_system_pages_access, PageAccessibility,
    PageTag,
};
use crate::sync::SpinMutex;
use crate::{oom_crash, unlikely, MAX_POOL_SIZE, SUPER_PAGE_OFFSET_MASK, SUPER_PAGE_SIZE};

use lazy_static::lazy_static;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicU8, AtomicUsize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GigaCageProperties {
    pub size: usize,
    pub alignment: usize,
    pub alignment_offset: usize,
}

/// Find a reservation size, alignment, and offset within that alignment such that laying the pools
/// out back to back puts each one at a multiple of its own size. The largest pool (the first one,
/// on ties) anchors the alignment; the pools before it determine the offset.
pub fn calculate_giga_cage_properties(pool_sizes: &[usize]) -> GigaCageProperties {
    let mut size_sum: usize = 0;
    let mut alignment: usize = 0;
    let mut alignment_offset: usize = 0;

    for &pool_size in pool_sizes {
        assert!(is_power_of_two(pool_size));
        if pool_size > alignment {
            alignment = pool_size;
            // May underflow; masking brings it back into [0, alignment).
            alignment_offset = alignment.wrapping_sub(size_sum) & (alignment - 1);
        }
        size_sum += pool_size;
    }

    // If the layout can't work no alignment exists, so this is a hard check. Any sample address
    // with `address % alignment == alignment_offset` will do.
    let mut sample_address = alignment_offset + 7 * alignment;
    for &pool_size in pool_sizes {
        assert!(sample_address & (pool_size - 1) == 0, "pool of size {pool_size:#x} can't be self-aligned");
        sample_address += pool_size;
    }

    GigaCageProperties { size: size_sum, alignment, alignment_offset }
}

/// A process's pool reservations. `address_space()` is the process-wide one; tests construct their
/// own with small pools.
///
/// State only moves `uninitialized -> initialized`, plus the one-time configurable pool on top.
/// Everything is written at init and only read afterwards, so queries are plain loads.
pub struct PartitionAddressSpace {
    config: GigaCageConfig,

    reserved_base_address: AtomicUsize,
    non_brp_pool_base_address: AtomicUsize,
    brp_pool_base_address: AtomicUsize,
    configurable_pool_base_address: AtomicUsize,

    non_brp_pool: AtomicU8,
    brp_pool: AtomicU8,
    configurable_pool: AtomicU8,

    initlock: SpinMutex<()>,
    pool_manager: AddressPoolManager,
}

/// Terminate the process on a broken pool layout.
#[cold]
#[inline(never)]
fn init_failed(what: &'static str) -> ! {
    atomic_dbg::eprintln!("partalloc: GigaCage init failed: {}", what);
    std::process::abort()
}

#[inline(always)]
fn check_init(ok: bool, what: &'static str) {
    if unlikely(!ok) {
        init_failed(what);
    }
}

lazy_static! {
    static ref ADDRESS_SPACE: PartitionAddressSpace = PartitionAddressSpace::new(GigaCageConfig::default());
}

/// The process-wide address space, with the default pool sizes. Not reserved until `init()`.
pub fn address_space() -> &'static PartitionAddressSpace {
    &ADDRESS_SPACE
}

impl PartitionAddressSpace {
    pub fn new(config: GigaCageConfig) -> Self {
        for size in [config.non_brp_pool_size, config.brp_pool_size, config.configurable_pool_size] {
            assert!(is_power_of_two(size) && (SUPER_PAGE_SIZE..=MAX_POOL_SIZE).contains(&size));
        }

        // Uninitialized bases are the offset masks, which no masked address can equal.
        Self {
            config,
            reserved_base_address: AtomicUsize::new(0),
            non_brp_pool_base_address: AtomicUsize::new(config.non_brp_pool_size - 1),
            brp_pool_base_address: AtomicUsize::new(config.brp_pool_size - 1),
            configurable_pool_base_address: AtomicUsize::new(config.configurable_pool_size - 1),
            non_brp_pool: AtomicU8::new(NULL_POOL_HANDLE),
            brp_pool: AtomicU8::new(NULL_POOL_HANDLE),
            configurable_pool: AtomicU8::new(NULL_POOL_HANDLE),
            initlock: SpinMutex::new(()),
            pool_manager: AddressPoolManager::new(),
        }
    }

    pub fn config(&self) -> &GigaCageConfig {
        &self.config
    }

    pub fn pool_manager(&self) -> &AddressPoolManager {
        &self.pool_manager
    }

    // ---- Lifecycle ----

    /// Reserve the GigaCage. Idempotent: later calls return without doing anything.
    pub fn init(&self) {
        if self.is_initialized() {
            return;
        }

        let _guard = self.initlock.lock();
        if !self.is_initialized() {
            self.init_locked();
        }
    }

    fn init_locked(&self) {
        let properties = calculate_giga_cage_properties(&self.config.pool_sizes());

        let reserved_base = match alloc_pages_with_align_offset(
            0,
            properties.size,
            properties.alignment,
            properties.alignment_offset,
            PageAccessibility::Inaccessible,
            PageTag::PartitionAlloc,
        ) {
            Ok(p) => p,
            Err(_) => oom_crash!(properties.size),
        };
        check_init(reserved_base != 0, "reservation returned a null base");

        let mut current = reserved_base;

        let non_brp_pool_size = self.config.non_brp_pool_size;
        self.non_brp_pool_base_address.store(current, Relaxed);
        debug_assert!(current & (non_brp_pool_size - 1) == 0);
        let non_brp_pool = self.pool_manager.add(current, non_brp_pool_size);
        check_init(non_brp_pool == NON_BRP_POOL_HANDLE, "non-BRP pool registered with an unexpected handle");
        self.non_brp_pool.store(non_brp_pool, Relaxed);
        debug_assert!(!self.is_in_non_brp_pool(current - 1));
        debug_assert!(self.is_in_non_brp_pool(current));
        current += non_brp_pool_size;
        debug_assert!(self.is_in_non_brp_pool(current - 1));
        debug_assert!(!self.is_in_non_brp_pool(current));

        let brp_pool_size = self.config.brp_pool_size;
        self.brp_pool_base_address.store(current, Relaxed);
        debug_assert!(current & (brp_pool_size - 1) == 0);
        let brp_pool = self.pool_manager.add(current, brp_pool_size);
        check_init(brp_pool == BRP_POOL_HANDLE, "BRP pool registered with an unexpected handle");
        self.brp_pool.store(brp_pool, Relaxed);
        debug_assert!(!self.is_in_brp_pool(current - 1));
        debug_assert!(self.is_in_brp_pool(current));
        current += brp_pool_size;
        debug_assert!(self.is_in_brp_pool(current - 1));
        debug_assert!(!self.is_in_brp_pool(current));

        if self.config.reserve_card_table {
            // The quarantine card table has to be the very first super page of the non-BRP pool.
            let requested_address = reserved_base;
            let actual_address = self.pool_manager.reserve(non_brp_pool, Some(requested_address), SUPER_PAGE_SIZE);
            check_init(
                actual_address == Some(requested_address),
                "card table not reserved at the start of the non-BRP pool",
            );
        }

        check_init(reserved_base + properties.size == current, "pools do not fill the reservation");

        // Publishing the base is what makes `is_initialized()` true.
        self.reserved_base_address.store(reserved_base, Release);
    }

    pub fn is_initialized(&self) -> bool {
        if self.reserved_base_address.load(Acquire) != 0 {
            debug_assert!(self.non_brp_pool.load(Relaxed) != NULL_POOL_HANDLE);
            debug_assert!(self.brp_pool.load(Relaxed) != NULL_POOL_HANDLE);
            return true;
        }

        false
    }

    /// Register caller-provided memory as the configurable pool. At most once; initializes the
    /// fixed pools first if needed. `size` must be the configured configurable pool size and
    /// `address` must be aligned to it.
    pub fn init_configurable_pool(&self, address: usize, size: usize) {
        assert!(!self.is_configurable_pool_initialized(), "the configurable pool is already initialized");

        self.init();

        assert!(address != 0);
        assert_eq!(size, self.config.configurable_pool_size);
        assert!(is_power_of_two(size));
        assert!(address % size == 0);

        self.configurable_pool_base_address.store(address, Release);

        let handle = self.pool_manager.add(address, size);
        check_init(handle == CONFIGURABLE_POOL_HANDLE, "configurable pool registered with an unexpected handle");
        self.configurable_pool.store(handle, Release);
    }

    pub fn is_configurable_pool_initialized(&self) -> bool {
        self.configurable_pool_base_address.load(Acquire) != self.configurable_pool_offset_mask()
    }

    /// Release the reservation and go back to uninitialized. Must not race with anything else using
    /// this address space.
    pub fn uninit_for_testing(&self) {
        let reserved_base = self.reserved_base_address.load(Acquire);
        if reserved_base != 0 {
            let properties = calculate_giga_cage_properties(&self.config.pool_sizes());
            free_pages(reserved_base, properties.size);
        }

        self.reserved_base_address.store(0, Release);
        self.non_brp_pool_base_address.store(self.non_brp_pool_offset_mask(), Relaxed);
        self.brp_pool_base_address.store(self.brp_pool_offset_mask(), Relaxed);
        self.configurable_pool_base_address.store(self.configurable_pool_offset_mask(), Relaxed);
        self.non_brp_pool.store(NULL_POOL_HANDLE, Relaxed);
        self.brp_pool.store(NULL_POOL_HANDLE, Relaxed);
        self.configurable_pool.store(NULL_POOL_HANDLE, Relaxed);
        self.pool_manager.reset_for_testing();
    }

    /// Unregister just the configurable pool. The memory stays with the caller.
    pub fn uninit_configurable_pool_for_testing(&self) {
        let handle = self.configurable_pool.load(Acquire);
        if handle != NULL_POOL_HANDLE {
            self.pool_manager.remove(handle);
        }
        self.configurable_pool_base_address.store(self.configurable_pool_offset_mask(), Release);
        self.configurable_pool.store(NULL_POOL_HANDLE, Release);
    }

    // ---- Membership ----

    /// False for null, and for everything before `init()`.
    #[inline(always)]
    pub fn is_in_non_brp_pool(&self, address: usize) -> bool {
        (address & !self.non_brp_pool_offset_mask()) == self.non_brp_pool_base_address.load(Relaxed)
    }

    #[inline(always)]
    pub fn is_in_brp_pool(&self, address: usize) -> bool {
        (address & !self.brp_pool_offset_mask()) == self.brp_pool_base_address.load(Relaxed)
    }

    #[inline(always)]
    pub fn is_in_configurable_pool(&self, address: usize) -> bool {
        (address & !self.configurable_pool_offset_mask()) == self.configurable_pool_base_address.load(Relaxed)
    }

    /// Whether any pool owns `address`.
    #[inline(always)]
    pub fn is_managed_by_partition_alloc(&self, address: usize) -> bool {
        self.is_in_non_brp_pool(address) || self.is_in_brp_pool(address) || self.is_in_configurable_pool(address)
    }

    /// The handle of the pool owning `address`, or `NULL_POOL_HANDLE`.
    pub fn pool_of(&self, address: usize) -> PoolHandle {
        if self.is_in_brp_pool(address) {
            self.brp_pool.load(Relaxed)
        } else if self.is_in_non_brp_pool(address) {
            self.non_brp_pool.load(Relaxed)
        } else if self.is_in_configurable_pool(address) {
            self.configurable_pool.load(Relaxed)
        } else {
            NULL_POOL_HANDLE
        }
    }

    /// Base, size, and handle of the pool owning `address`.
    pub fn pool_info_of(&self, address: usize) -> Option<PoolInfo> {
        let handle = self.pool_of(address);
        if handle == NULL_POOL_HANDLE { None } else { self.pool_info(handle) }
    }

    pub fn pool_info(&self, handle: PoolHandle) -> Option<PoolInfo> {
        let (base, size) = match handle {
            NON_BRP_POOL_HANDLE => (self.non_brp_pool_base_address.load(Relaxed), self.config.non_brp_pool_size),
            BRP_POOL_HANDLE => (self.brp_pool_base_address.load(Relaxed), self.config.brp_pool_size),
            CONFIGURABLE_POOL_HANDLE => {
                (self.configurable_pool_base_address.load(Relaxed), self.config.configurable_pool_size)
            }
            _ => return None,
        };
        if unlikely(base == size - 1) {
            // Still the uninitialized sentinel.
            return None;
        }

        Some(PoolInfo { handle, base, size })
    }

    // ---- Accessors ----

    pub fn non_brp_pool(&self) -> PoolHandle {
        self.non_brp_pool.load(Relaxed)
    }

    pub fn brp_pool(&self) -> PoolHandle {
        self.brp_pool.load(Relaxed)
    }

    pub fn configurable_pool(&self) -> PoolHandle {
        self.configurable_pool.load(Relaxed)
    }

    pub fn reserved_base_address(&self) -> usize {
        self.reserved_base_address.load(Acquire)
    }

    pub fn non_brp_pool_base(&self) -> usize {
        self.non_brp_pool_base_address.load(Relaxed)
    }

    pub fn brp_pool_base(&self) -> usize {
        self.brp_pool_base_address.load(Relaxed)
    }

    pub fn brp_pool_end(&self) -> usize {
        self.brp_pool_base() + self.config.brp_pool_size
    }

    pub fn configurable_pool_base(&self) -> usize {
        self.configurable_pool_base_address.load(Relaxed)
    }

    pub fn brp_pool_base_mask(&self) -> usize {
        !self.brp_pool_offset_mask()
    }

    pub fn giga_cage_offset(&self, address: usize) -> usize {
        debug_assert!(self.is_in_non_brp_pool(address) || self.is_in_brp_pool(address));
        address - self.reserved_base_address.load(Relaxed)
    }

    #[inline(always)]
    fn non_brp_pool_offset_mask(&self) -> usize {
        self.config.non_brp_pool_size - 1
    }

    #[inline(always)]
    fn brp_pool_offset_mask(&self) -> usize {
        self.config.brp_pool_size - 1
    }

    #[inline(always)]
    fn configurable_pool_offset_mask(&self) -> usize {
        self.config.configurable_pool_size - 1
    }

    // ---- Super pages ----

    /// Take one super page from the pool and make it read-write. Running the pool dry is an OOM.
    pub fn alloc_super_page(&self, handle: PoolHandle) -> usize {
        let Some(super_page) = self.pool_manager.reserve(handle, None, SUPER_PAGE_SIZE) else {
            oom_crash!(SUPER_PAGE_SIZE)
        };
        debug_assert!(super_page & SUPER_PAGE_OFFSET_MASK == 0);

        if set_system_pages_access(super_page, SUPER_PAGE_SIZE, PageAccessibility::ReadWrite).is_err() {
            oom_crash!(SUPER_PAGE_SIZE);
        }

        super_page
    }

    /// Decommit a super page from `alloc_super_page()` and return it to its pool.
    pub fn free_super_page(&self, handle: PoolHandle, super_page: usize) {
        assert!(super_page & SUPER_PAGE_OFFSET_MASK == 0);
        debug_assert_eq!(self.pool_of(super_page), handle);

        // Failing to decommit only costs memory; the range is still returned to the pool.
        decommit_system_pages(super_page, SUPER_PAGE_SIZE).ok();
        self.pool_manager.unreserve(handle, super_page, SUPER_PAGE_SIZE);
    }
}

impl Drop for PartitionAddressSpace {
    fn drop(&mut self) {
        let reserved_base = *self.reserved_base_address.get_mut();
        if reserved_base != 0 {
            let properties = calculate_giga_cage_properties(&self.config.pool_sizes());
            free_pages(reserved_base, properties.size);
        }
    }
}
