//! Page-by-page mapping of contiguous runs.

use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::kwarn;
use kestrel_core::paging::Size4KiB;

use crate::cpu::Cpu;
use crate::flags::MmuFlags;
use crate::tables::PageTables;
use crate::{FrameAllocator, FrameDeallocator, MmuError, PAGE_SIZE};

/// A request to map `size` bytes of physical memory at `paddr` to `vaddr`.
///
/// The length is rounded up to whole 4 KiB pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRange {
    /// First virtual address; must be page aligned.
    pub vaddr: VirtAddr,
    /// First physical address; must be page aligned.
    pub paddr: PhysAddr,
    /// Length in bytes.
    pub size: u64,
}

impl MapRange {
    /// Creates a request covering `size` bytes.
    pub const fn new(vaddr: VirtAddr, paddr: PhysAddr, size: u64) -> Self {
        Self { vaddr, paddr, size }
    }

    /// Creates a request covering `count` pages, or `None` if the byte
    /// length overflows.
    pub const fn pages(vaddr: VirtAddr, paddr: PhysAddr, count: u64) -> Option<Self> {
        match count.checked_mul(PAGE_SIZE) {
            Some(size) => Some(Self::new(vaddr, paddr, size)),
            None => None,
        }
    }

    /// Number of 4 KiB pages the request covers.
    pub const fn page_count(&self) -> u64 {
        self.size.div_ceil(PAGE_SIZE)
    }
}

impl<C, A> PageTables<'_, C, A>
where
    C: Cpu,
    A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    /// Installs every page of `range`, or none of them.
    ///
    /// # Errors
    ///
    /// - [`MmuError::InvalidArgs`] if either run fails validation, including
    ///   a virtual run that leaves its canonical half or wraps. Nothing is
    ///   installed in that case.
    /// - The first error from [`install`](Self::install). Pages installed by
    ///   this call before the failure are unmapped again first.
    ///
    /// # Safety
    ///
    /// As [`install`](Self::install).
    pub unsafe fn map_range(
        &mut self,
        root: PhysAddr,
        range: &MapRange,
        flags: MmuFlags,
    ) -> Result<(), MmuError> {
        let count = range.page_count();
        if !self.widths.check_vrange(range.vaddr, count)
            || !self.widths.check_prange(range.paddr, count)
        {
            return Err(MmuError::InvalidArgs);
        }
        for i in 0..count {
            let offset = i * PAGE_SIZE;
            // SAFETY: Forwarded caller contract.
            let result =
                unsafe { self.install(root, range.paddr + offset, range.vaddr + offset, flags) };
            if let Err(err) = result {
                kwarn!(
                    "mmu: mapping {} pages at {} failed at page {}: {}",
                    count,
                    range.vaddr,
                    i,
                    err
                );
                // SAFETY: Exactly the `i` pages installed above.
                unsafe { self.unmap_pages(root, range.vaddr, i) };
                return Err(err);
            }
        }
        Ok(())
    }

    /// Unmaps `count` pages from `vaddr`, which is already validated.
    unsafe fn unmap_pages(&mut self, root: PhysAddr, vaddr: VirtAddr, count: u64) {
        for i in 0..count {
            // SAFETY: Forwarded caller contract.
            unsafe { self.unmap_one(root, vaddr + i * PAGE_SIZE) };
        }
    }
}
