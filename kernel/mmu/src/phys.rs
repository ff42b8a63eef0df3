//! Kernel window onto physical memory.
//!
//! Table entries hold physical addresses. The kernel reaches the tables they
//! name through a fixed-offset mapping of all physical memory, and every
//! table dereference in this crate goes through [`PhysMap::table_at`].

use kestrel_core::addr::{PhysAddr, VirtAddr};

use crate::arch::x86_64::paging::PageTable;

/// Fixed-offset mapping of physical memory into the kernel's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysMap {
    offset: u64,
}

impl PhysMap {
    /// Creates a window where physical address `p` is visible at
    /// `offset + p`.
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Returns the window's base offset.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the kernel virtual address through which `phys` is visible.
    #[inline]
    pub const fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(self.offset.wrapping_add(phys.as_u64()))
    }

    /// Returns the physical address behind a kernel virtual address inside
    /// the window.
    #[inline]
    pub const fn virt_to_phys(&self, virt: VirtAddr) -> PhysAddr {
        PhysAddr::new(virt.as_u64().wrapping_sub(self.offset))
    }

    /// Returns the [`PageTable`] stored in the frame at `phys`.
    ///
    /// # Safety
    ///
    /// `phys` must be a 4 KiB-aligned frame, visible through this window,
    /// that holds a page table. The caller must not hold another reference
    /// to the same table while the returned one is alive.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        let ptr = self.phys_to_virt(phys).as_u64() as *mut PageTable;
        // SAFETY: Caller guarantees `phys` holds a page table reachable
        // through the window and that no other reference aliases it.
        unsafe { &mut *ptr }
    }

    /// Clears every entry of the table frame at `phys`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`table_at`](Self::table_at). The frame must not
    /// be linked into a live hierarchy.
    #[inline]
    pub(crate) unsafe fn zero_table(&self, phys: PhysAddr) {
        // SAFETY: Forwarded caller contract.
        unsafe { self.table_at(phys) }.zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_translation() {
        let map = PhysMap::new(0xFFFF_8000_0000_0000);
        let virt = map.phys_to_virt(PhysAddr::new(0x1234_5000));
        assert_eq!(virt.as_u64(), 0xFFFF_8000_1234_5000);
        assert_eq!(map.virt_to_phys(virt).as_u64(), 0x1234_5000);
    }

    #[test]
    fn identity_window() {
        let map = PhysMap::new(0);
        assert_eq!(map.phys_to_virt(PhysAddr::new(0x7000)).as_u64(), 0x7000);
        assert_eq!(map.offset(), 0);
    }
}
