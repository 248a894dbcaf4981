// Registry of the address pools and super-page-granular bookkeeping of what is reserved inside
// each one.
//
// A pool handle is its slot index + 1, so handles are handed out in registration order and the
// GigaCage can assert the well-known value for each pool it registers. Handle 0 is never valid.

use crate::sync::SpinMutex;
use crate::{MAX_POOL_SIZE, MAX_SUPER_PAGES_IN_POOL, SUPER_PAGE_OFFSET_MASK, SUPER_PAGE_SHIFT, SUPER_PAGE_SIZE};

pub type PoolHandle = u8;

pub const NULL_POOL_HANDLE: PoolHandle = 0;
pub const NON_BRP_POOL_HANDLE: PoolHandle = 1;
pub const BRP_POOL_HANDLE: PoolHandle = 2;
pub const CONFIGURABLE_POOL_HANDLE: PoolHandle = 3;

pub const NUM_POOLS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolInfo {
    pub handle: PoolHandle,
    pub base: usize,
    pub size: usize,
}

impl PoolInfo {
    #[inline(always)]
    pub const fn offset_mask(&self) -> usize {
        self.size - 1
    }

    #[inline(always)]
    pub const fn base_mask(&self) -> usize {
        !self.offset_mask()
    }

    #[inline(always)]
    pub const fn end(&self) -> usize {
        self.base + self.size
    }

    #[inline(always)]
    pub const fn contains(&self, address: usize) -> bool {
        (address & self.base_mask()) == self.base
    }

    #[inline(always)]
    pub const fn offset_of(&self, address: usize) -> usize {
        debug_assert!(self.contains(address));
        address - self.base
    }
}

const BITS_PER_WORD: usize = u64::BITS as usize;
const BITSET_WORDS: usize = MAX_SUPER_PAGES_IN_POOL.div_ceil(BITS_PER_WORD);

struct Pool {
    base: usize,
    size: usize,
    // One bit per super page; set means reserved. Bits past `total_bits` stay clear.
    alloc_bitset: [u64; BITSET_WORDS],
    // No free super page below this index.
    bit_hint: usize,
    total_bits: usize,
}

impl Pool {
    fn new(base: usize, size: usize) -> Self {
        let total_bits = size >> SUPER_PAGE_SHIFT;
        Self {
            base,
            size,
            alloc_bitset: [0; BITSET_WORDS],
            bit_hint: 0,
            total_bits,
        }
    }

    #[inline(always)]
    fn is_set(&self, i: usize) -> bool {
        self.alloc_bitset[i / BITS_PER_WORD] & (1 << (i % BITS_PER_WORD)) != 0
    }

    fn set_range(&mut self, begin: usize, end: usize, value: bool) {
        for i in begin..end {
            let word = &mut self.alloc_bitset[i / BITS_PER_WORD];
            if value {
                *word |= 1 << (i % BITS_PER_WORD);
            } else {
                *word &= !(1 << (i % BITS_PER_WORD));
            }
        }
    }

    fn range_is_clear(&self, begin: usize, end: usize) -> bool {
        (begin..end).all(|i| !self.is_set(i))
    }

    /// First fit, starting from the hint.
    fn find_chunk(&mut self, requested_size: usize) -> Option<usize> {
        let need_bits = requested_size >> SUPER_PAGE_SHIFT;

        let mut beg_bit = self.bit_hint;
        let mut curr_bit = self.bit_hint;
        loop {
            let end_bit = beg_bit + need_bits;
            if end_bit > self.total_bits {
                return None;
            }

            let mut found = true;
            while curr_bit < end_bit {
                if self.is_set(curr_bit) {
                    // Restart just past the conflict.
                    beg_bit = curr_bit + 1;
                    found = false;
                    if self.bit_hint == curr_bit {
                        self.bit_hint += 1;
                    }
                }
                curr_bit += 1;
                if !found {
                    break;
                }
            }

            if found {
                self.set_range(beg_bit, end_bit, true);
                if self.bit_hint == beg_bit {
                    self.bit_hint = end_bit;
                }
                return Some(self.base + (beg_bit << SUPER_PAGE_SHIFT));
            }
        }
    }

    fn try_reserve_chunk(&mut self, address: usize, requested_size: usize) -> bool {
        if address < self.base || address - self.base >= self.size {
            return false;
        }
        let begin_bit = (address - self.base) >> SUPER_PAGE_SHIFT;
        let end_bit = begin_bit + (requested_size >> SUPER_PAGE_SHIFT);
        if end_bit > self.total_bits || !self.range_is_clear(begin_bit, end_bit) {
            return false;
        }

        self.set_range(begin_bit, end_bit, true);
        if self.bit_hint == begin_bit {
            self.bit_hint = end_bit;
        }
        true
    }

    fn free_chunk(&mut self, address: usize, free_size: usize) {
        assert!(address >= self.base && address + free_size <= self.base + self.size);
        let begin_bit = (address - self.base) >> SUPER_PAGE_SHIFT;
        let end_bit = begin_bit + (free_size >> SUPER_PAGE_SHIFT);
        debug_assert!((begin_bit..end_bit).all(|i| self.is_set(i)), "double unreserve");

        self.set_range(begin_bit, end_bit, false);
        self.bit_hint = self.bit_hint.min(begin_bit);
    }

    fn used_bytes(&self) -> usize {
        let bits: u32 = self.alloc_bitset.iter().map(|w| w.count_ones()).sum();
        (bits as usize) << SUPER_PAGE_SHIFT
    }
}

pub struct AddressPoolManager {
    pools: SpinMutex<[Option<Pool>; NUM_POOLS]>,
}

impl AddressPoolManager {
    pub const fn new() -> Self {
        Self { pools: SpinMutex::new([const { None }; NUM_POOLS]) }
    }

    /// Register `[base, base + size)` and return its handle.
    pub fn add(&self, base: usize, size: usize) -> PoolHandle {
        assert!(base & SUPER_PAGE_OFFSET_MASK == 0);
        assert!(size & SUPER_PAGE_OFFSET_MASK == 0);
        assert!(size > 0);
        assert!(size <= MAX_POOL_SIZE, "pool at {base:#x} is larger than {MAX_POOL_SIZE:#x}");

        let mut pools = self.pools.lock();
        let Some(i) = pools.iter().position(Option::is_none) else {
            panic!("no free pool slot for pool at {base:#x}");
        };
        pools[i] = Some(Pool::new(base, size));

        (i + 1) as PoolHandle
    }

    pub fn remove(&self, handle: PoolHandle) {
        let mut pools = self.pools.lock();
        let slot = &mut pools[Self::index_of(handle)];
        assert!(slot.is_some(), "removing unregistered pool {handle}");
        *slot = None;
    }

    /// Reserve `length` bytes of super pages in the pool. `requested_address` is honored if that
    /// range is free; otherwise the first free fit is returned. None when the pool is full.
    pub fn reserve(&self, handle: PoolHandle, requested_address: Option<usize>, length: usize) -> Option<usize> {
        assert!(length > 0);
        assert!(length & SUPER_PAGE_OFFSET_MASK == 0);

        let mut pools = self.pools.lock();
        let pool = pools[Self::index_of(handle)].as_mut()?;

        if let Some(address) = requested_address {
            debug_assert!(address & SUPER_PAGE_OFFSET_MASK == 0);
            if pool.try_reserve_chunk(address, length) {
                return Some(address);
            }
        }

        pool.find_chunk(length)
    }

    pub fn unreserve(&self, handle: PoolHandle, address: usize, length: usize) {
        assert!(address & SUPER_PAGE_OFFSET_MASK == 0);
        assert!(length & SUPER_PAGE_OFFSET_MASK == 0);

        let mut pools = self.pools.lock();
        let Some(pool) = pools[Self::index_of(handle)].as_mut() else {
            panic!("unreserving from unregistered pool {handle}");
        };
        pool.free_chunk(address, length);
    }

    pub fn pool_info(&self, handle: PoolHandle) -> Option<PoolInfo> {
        let pools = self.pools.lock();
        pools[Self::index_of(handle)].as_ref().map(|p| PoolInfo { handle, base: p.base, size: p.size })
    }

    pub fn used_bytes(&self, handle: PoolHandle) -> usize {
        let pools = self.pools.lock();
        pools[Self::index_of(handle)].as_ref().map_or(0, Pool::used_bytes)
    }

    pub fn reset_for_testing(&self) {
        let mut pools = self.pools.lock();
        for p in pools.iter_mut() {
            *p = None;
        }
    }

    fn index_of(handle: PoolHandle) -> usize {
        assert!(handle != NULL_POOL_HANDLE && (handle as usize) <= NUM_POOLS, "bad pool handle {handle}");
        handle as usize - 1
    }
}

impl Default for AddressPoolManager {
    fn default() -> Self {
        Self::new()
    }
}
