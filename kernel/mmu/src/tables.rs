//! Borrowed view of everything a table operation needs.
//!
//! [`PageTables`] bundles the CPU seam, the physical window, the measured
//! widths and the frame allocator for the duration of one operation. The
//! walker, installer, reclaimer and range operator are implemented as
//! methods on it in their own modules.

use kestrel_core::addr::PhysAddr;

use crate::arch::x86_64::paging::PageTableEntry;
use crate::cpu::Cpu;
use crate::phys::PhysMap;
use crate::validate::AddressWidths;

/// Root-parameterized access to page-table hierarchies.
pub struct PageTables<'a, C, A> {
    pub(crate) cpu: &'a C,
    pub(crate) phys: PhysMap,
    pub(crate) widths: AddressWidths,
    pub(crate) frames: &'a mut A,
}

impl<'a, C: Cpu, A> PageTables<'a, C, A> {
    /// Creates a view over `frames` using the given window and widths.
    pub fn new(cpu: &'a C, phys: PhysMap, widths: AddressWidths, frames: &'a mut A) -> Self {
        Self {
            cpu,
            phys,
            widths,
            frames,
        }
    }

    /// Returns the address widths used for validation.
    pub fn widths(&self) -> AddressWidths {
        self.widths
    }

    /// Returns the physical window used to reach tables.
    pub fn phys_map(&self) -> PhysMap {
        self.phys
    }

    /// Reads entry `index` of the table at `table`.
    ///
    /// # Safety
    ///
    /// `table` must hold a page table visible through the window.
    #[inline]
    pub(crate) unsafe fn entry(&self, table: PhysAddr, index: usize) -> PageTableEntry {
        // SAFETY: Forwarded caller contract; the reference does not escape.
        unsafe { self.phys.table_at(table) }.entries[index]
    }

    /// Overwrites entry `index` of the table at `table`.
    ///
    /// # Safety
    ///
    /// `table` must hold a page table visible through the window.
    #[inline]
    pub(crate) unsafe fn set_entry(&self, table: PhysAddr, index: usize, entry: PageTableEntry) {
        // SAFETY: Forwarded caller contract; the reference does not escape.
        unsafe { self.phys.table_at(table) }.entries[index] = entry;
    }

    /// Clears the PRESENT bit of entry `index` with interrupts disabled, so
    /// a handler on this core never sees a half-written entry.
    ///
    /// # Safety
    ///
    /// `table` must hold a page table visible through the window.
    pub(crate) unsafe fn clear_present(&self, table: PhysAddr, index: usize) {
        self.cpu.without_interrupts(|| {
            // SAFETY: Forwarded caller contract.
            let current = unsafe { self.entry(table, index) };
            // SAFETY: Forwarded caller contract.
            unsafe { self.set_entry(table, index, current.without_present()) };
        });
    }

    /// Returns `true` if the table at `table` has no present entry.
    ///
    /// # Safety
    ///
    /// `table` must hold a page table visible through the window.
    pub(crate) unsafe fn is_unused(&self, table: PhysAddr) -> bool {
        // SAFETY: Forwarded caller contract; the reference does not escape.
        unsafe { self.phys.table_at(table) }.is_unused()
    }
}
