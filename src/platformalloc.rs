// Abstract over system virtual memory functions

use crate::bits::{align_up, is_power_of_two};
use crate::SYSTEM_PAGE_SIZE;

#[derive(Debug)]
pub struct AllocFailed;

impl std::error::Error for AllocFailed {}

use std::fmt;
impl fmt::Display for AllocFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Alloc failed")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAccessibility {
    Inaccessible,
    ReadWrite,
}

/// Who a mapping belongs to, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTag {
    PartitionAlloc,
    ConfigurablePool,
    Test,
}

impl PageTag {
    pub fn name(self) -> &'static str {
        match self {
            PageTag::PartitionAlloc => "partition_alloc",
            PageTag::ConfigurablePool => "configurable_pool",
            PageTag::Test => "test",
        }
    }
}

/// Map `size` bytes such that `result % alignment == alignment_offset`. `address_hint` is tried
/// first; if the OS puts the mapping elsewhere we fall back to over-reserving by `alignment` and
/// trimming the slack off both ends.
pub fn alloc_pages_with_align_offset(
    address_hint: usize,
    size: usize,
    alignment: usize,
    alignment_offset: usize,
    accessibility: PageAccessibility,
    tag: PageTag,
) -> Result<usize, AllocFailed> {
    assert!(size > 0);
    assert!(size % SYSTEM_PAGE_SIZE == 0);
    assert!(is_power_of_two(alignment));
    assert!(alignment >= SYSTEM_PAGE_SIZE);
    assert!(alignment_offset < alignment);
    assert!(alignment_offset % SYSTEM_PAGE_SIZE == 0);
    debug_assert!(address_hint % alignment == alignment_offset || address_hint == 0);

    let offset_mask = alignment - 1;

    if address_hint != 0 {
        let p = vendor::sys_reserve(address_hint, size, accessibility)?;
        if p & offset_mask == alignment_offset {
            return Ok(p);
        }
        vendor::sys_release(p, size);
    }

    let padded_size = size.checked_add(alignment - SYSTEM_PAGE_SIZE).ok_or(AllocFailed)?;
    let base = match vendor::sys_reserve(0, padded_size, accessibility) {
        Ok(p) => p,
        Err(e) => {
            atomic_dbg::eprintln!("partalloc: failed to reserve {} bytes for {}", padded_size, tag.name());
            return Err(e);
        }
    };

    // First address >= base that sits at `alignment_offset` within an `alignment` block.
    let aligned = align_up(base.wrapping_sub(alignment_offset), alignment).wrapping_add(alignment_offset);
    debug_assert!(aligned >= base);
    debug_assert!(aligned + size <= base + padded_size);

    let pre_slack = aligned - base;
    let post_slack = base + padded_size - (aligned + size);
    if pre_slack > 0 {
        vendor::sys_release(base, pre_slack);
    }
    if post_slack > 0 {
        vendor::sys_release(aligned + size, post_slack);
    }

    debug_assert!(aligned & offset_mask == alignment_offset);
    Ok(aligned)
}

pub fn free_pages(address: usize, size: usize) {
    debug_assert!(address % SYSTEM_PAGE_SIZE == 0);
    debug_assert!(size % SYSTEM_PAGE_SIZE == 0);

    vendor::sys_release(address, size)
}

pub fn set_system_pages_access(address: usize, size: usize, accessibility: PageAccessibility) -> Result<(), AllocFailed> {
    debug_assert!(address % SYSTEM_PAGE_SIZE == 0);
    debug_assert!(size % SYSTEM_PAGE_SIZE == 0);

    vendor::sys_protect(address, size, accessibility)
}

/// Release the physical memory behind a range while keeping the address space reserved. The pages
/// read back as zero once recommitted.
pub fn decommit_system_pages(address: usize, size: usize) -> Result<(), AllocFailed> {
    debug_assert!(address % SYSTEM_PAGE_SIZE == 0);
    debug_assert!(size % SYSTEM_PAGE_SIZE == 0);

    vendor::sys_decommit(address, size)?;
    vendor::sys_protect(address, size, PageAccessibility::Inaccessible)
}

#[cfg(not(any(target_os = "linux", target_vendor = "apple")))]
compile_error!("partalloc supports Linux and Apple platforms only");

#[cfg(target_os = "linux")]
pub mod vendor {
    use super::{AllocFailed, PageAccessibility};
    use rustix::mm::{Advice, MapFlags, MprotectFlags, ProtFlags, madvise, mmap_anonymous, mprotect, munmap};
    use std::ffi::c_void;

    pub fn sys_reserve(hint: usize, size: usize, accessibility: PageAccessibility) -> Result<usize, AllocFailed> {
        let prot = match accessibility {
            PageAccessibility::Inaccessible => ProtFlags::empty(),
            PageAccessibility::ReadWrite => ProtFlags::READ | ProtFlags::WRITE,
        };

        match unsafe {
            mmap_anonymous(
                hint as *mut c_void,
                size,
                prot,
                MapFlags::PRIVATE | MapFlags::NORESERVE,
            )
        } {
            Ok(p) => Ok(p.addr()),
            Err(_) => Err(AllocFailed),
        }
    }

    pub fn sys_release(address: usize, size: usize) {
        unsafe {
            munmap(address as *mut c_void, size).ok();
        }
    }

    pub fn sys_protect(address: usize, size: usize, accessibility: PageAccessibility) -> Result<(), AllocFailed> {
        let flags = match accessibility {
            PageAccessibility::Inaccessible => MprotectFlags::empty(),
            PageAccessibility::ReadWrite => MprotectFlags::READ | MprotectFlags::WRITE,
        };

        unsafe { mprotect(address as *mut c_void, size, flags) }.map_err(|_| AllocFailed)
    }

    pub fn sys_decommit(address: usize, size: usize) -> Result<(), AllocFailed> {
        // Anonymous private pages come back zero-filled after MADV_DONTNEED.
        unsafe { madvise(address as *mut c_void, size, Advice::LinuxDontNeed) }.map_err(|_| AllocFailed)
    }
}

#[cfg(target_vendor = "apple")]
pub mod vendor {
    use super::{AllocFailed, PageAccessibility};
    use mach_sys::kern_return::KERN_SUCCESS;
    use mach_sys::port::mach_port_t;
    use mach_sys::traps::mach_task_self;
    use mach_sys::vm::{mach_vm_allocate, mach_vm_deallocate, mach_vm_protect};
    use mach_sys::vm_prot::{VM_PROT_NONE, VM_PROT_READ, VM_PROT_WRITE, vm_prot_t};
    use mach_sys::vm_statistics::{VM_FLAGS_ANYWHERE, VM_FLAGS_FIXED, VM_FLAGS_OVERWRITE};
    use mach_sys::vm_types::{mach_vm_address_t, mach_vm_size_t};

    fn prot_of(accessibility: PageAccessibility) -> vm_prot_t {
        match accessibility {
            PageAccessibility::Inaccessible => VM_PROT_NONE,
            PageAccessibility::ReadWrite => VM_PROT_READ | VM_PROT_WRITE,
        }
    }

    pub fn sys_reserve(hint: usize, size: usize, accessibility: PageAccessibility) -> Result<usize, AllocFailed> {
        let task: mach_port_t = unsafe { mach_task_self() };
        let mut address: mach_vm_address_t = hint as mach_vm_address_t;
        let size: mach_vm_size_t = size as mach_vm_size_t;

        let retval = unsafe { mach_vm_allocate(task, &mut address, size, VM_FLAGS_ANYWHERE) };
        if retval != KERN_SUCCESS {
            return Err(AllocFailed);
        }

        if accessibility == PageAccessibility::Inaccessible {
            let retval = unsafe { mach_vm_protect(task, address, size, 0, prot_of(accessibility)) };
            if retval != KERN_SUCCESS {
                unsafe { mach_vm_deallocate(task, address, size) };
                return Err(AllocFailed);
            }
        }

        Ok(address as usize)
    }

    pub fn sys_release(address: usize, size: usize) {
        unsafe {
            let retval = mach_vm_deallocate(mach_task_self(), address as u64, size as u64);
            debug_assert!(retval == KERN_SUCCESS);
        }
    }

    pub fn sys_protect(address: usize, size: usize, accessibility: PageAccessibility) -> Result<(), AllocFailed> {
        let retval = unsafe {
            mach_vm_protect(mach_task_self(), address as u64, size as u64, 0, prot_of(accessibility))
        };
        if retval == KERN_SUCCESS { Ok(()) } else { Err(AllocFailed) }
    }

    pub fn sys_decommit(address: usize, size: usize) -> Result<(), AllocFailed> {
        // Overwriting the range in place swaps in fresh zero-fill pages.
        let mut addr: mach_vm_address_t = address as mach_vm_address_t;
        let retval = unsafe {
            mach_vm_allocate(mach_task_self(), &mut addr, size as u64, VM_FLAGS_FIXED | VM_FLAGS_OVERWRITE)
        };
        if retval == KERN_SUCCESS { Ok(()) } else { Err(AllocFailed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_offset_is_honored() {
        const ALIGN: usize = 1 << 24;
        for offset in [0, SYSTEM_PAGE_SIZE, ALIGN / 2, ALIGN - SYSTEM_PAGE_SIZE] {
            let size = 4 * SYSTEM_PAGE_SIZE;
            let p = alloc_pages_with_align_offset(0, size, ALIGN, offset, PageAccessibility::ReadWrite, PageTag::Test).unwrap();
            assert_eq!(p % ALIGN, offset);

            // The whole range is usable.
            unsafe {
                std::ptr::write_bytes(p as *mut u8, 0xab, size);
                assert_eq!(*((p + size - 1) as *const u8), 0xab);
            }

            free_pages(p, size);
        }
    }

    #[test]
    fn commit_write_decommit_reads_zero() {
        let size = 2 * SYSTEM_PAGE_SIZE;
        let p = alloc_pages_with_align_offset(0, size, SYSTEM_PAGE_SIZE, 0, PageAccessibility::Inaccessible, PageTag::Test).unwrap();

        set_system_pages_access(p, size, PageAccessibility::ReadWrite).unwrap();
        unsafe { *(p as *mut u64) = 0xdead_beef };
        decommit_system_pages(p, size).unwrap();
        set_system_pages_access(p, size, PageAccessibility::ReadWrite).unwrap();
        assert_eq!(unsafe { *(p as *const u64) }, 0);

        free_pages(p, size);
    }

    #[test]
    fn tag_names() {
        assert_eq!(PageTag::PartitionAlloc.name(), "partition_alloc");
        assert_eq!(format!("{}", AllocFailed), "Alloc failed");
    }
}
