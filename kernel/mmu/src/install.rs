//! Installing single leaf mappings.
//!
//! Missing tables along the path are allocated, zeroed and linked on
//! demand. A failed install unlinks and frees every table it created before
//! returning, so no half-built path survives an error.

use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::kdebug;
#[cfg(kestrel_mmu_trace)]
use kestrel_core::ktrace;
use kestrel_core::paging::{PageSize, PhysFrame, Size2MiB, Size4KiB};
use planck_noalloc::vec::ArrayVec;

use crate::arch::x86_64::paging::{Level, PageTableEntry, PageTableFlags};
use crate::cpu::Cpu;
use crate::flags::{self, MmuFlags};
use crate::tables::PageTables;
use crate::{FrameAllocator, FrameDeallocator, MmuError};

/// A table created by the current install, and where it was linked.
#[derive(Clone, Copy)]
struct CreatedTable {
    parent: PhysAddr,
    index: usize,
    table: PhysAddr,
}

/// At most one table per level above the leaf.
type Created = ArrayVec<CreatedTable, 3>;

impl<C, A> PageTables<'_, C, A>
where
    C: Cpu,
    A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    /// Maps the 4 KiB page at `vaddr` to the frame at `paddr`.
    ///
    /// Re-installing an existing mapping overwrites the leaf and flushes its
    /// TLB entry.
    ///
    /// # Errors
    ///
    /// - [`MmuError::InvalidArgs`] if either address fails validation.
    /// - [`MmuError::NoMemory`] if a table could not be allocated.
    /// - [`MmuError::SizeMismatch`] if a large page covers `vaddr`.
    ///
    /// # Safety
    ///
    /// `root` must be a valid PML4 reachable through this view's window.
    /// The caller is responsible for the contents of the mapped frame.
    pub unsafe fn install(
        &mut self,
        root: PhysAddr,
        paddr: PhysAddr,
        vaddr: VirtAddr,
        flags: MmuFlags,
    ) -> Result<(), MmuError> {
        if !self.widths.check_paddr(paddr) || !self.widths.check_vaddr(vaddr) {
            return Err(MmuError::InvalidArgs);
        }
        let leaf = flags::leaf_flags(flags::to_hardware(flags));
        // SAFETY: Forwarded caller contract.
        unsafe { self.install_leaf(root, paddr, vaddr, Level::Pt, leaf) }
    }

    /// Maps the 2 MiB page at `vaddr` to the 2 MiB frame at `paddr`.
    ///
    /// # Errors
    ///
    /// As [`install`](Self::install). Addresses that are not 2 MiB aligned
    /// are [`MmuError::InvalidArgs`], and an existing page table at the PD
    /// slot is [`MmuError::SizeMismatch`].
    ///
    /// # Safety
    ///
    /// As [`install`](Self::install).
    pub unsafe fn install_large(
        &mut self,
        root: PhysAddr,
        paddr: PhysAddr,
        vaddr: VirtAddr,
        flags: MmuFlags,
    ) -> Result<(), MmuError> {
        if !self.widths.check_paddr(paddr)
            || !self.widths.check_vaddr(vaddr)
            || PhysFrame::<Size2MiB>::from_start_address(paddr).is_err()
            || !vaddr.is_aligned(Size2MiB::SIZE)
        {
            return Err(MmuError::InvalidArgs);
        }
        let leaf = flags::to_large(flags::leaf_flags(flags::to_hardware(flags)));
        // SAFETY: Forwarded caller contract.
        unsafe { self.install_leaf(root, paddr, vaddr, Level::Pd, leaf) }
    }

    /// Builds the path from `root` down to `leaf_level` and writes the leaf.
    unsafe fn install_leaf(
        &mut self,
        root: PhysAddr,
        paddr: PhysAddr,
        vaddr: VirtAddr,
        leaf_level: Level,
        leaf: PageTableFlags,
    ) -> Result<(), MmuError> {
        let link = flags::table_link_flags(leaf);
        let mut created = Created::new();
        let mut table = root;
        // A freshly zeroed table has no present entries to look at.
        let mut fresh = false;

        for &level in leaf_level.ancestors() {
            let index = level.index_of(vaddr);
            // SAFETY: `table` is the root or a table reached through it.
            let entry = if fresh {
                PageTableEntry::empty()
            } else {
                unsafe { self.entry(table, index) }
            };

            if entry.is_present() {
                if level.is_leaf(entry) {
                    // SAFETY: Every entry in `created` was linked by this call.
                    unsafe { self.roll_back(&mut created) };
                    return Err(MmuError::SizeMismatch);
                }
                table = entry.address();
                continue;
            }

            let Some(frame) = self.frames.allocate_frame() else {
                // SAFETY: Every entry in `created` was linked by this call.
                unsafe { self.roll_back(&mut created) };
                return Err(MmuError::NoMemory);
            };
            let child = frame.start_address();
            // SAFETY: The frame is ours and not yet linked anywhere.
            unsafe { self.phys.zero_table(child) };
            // SAFETY: `table` is reachable; `child` is a zeroed table.
            unsafe { self.set_entry(table, index, PageTableEntry::new(child, link)) };
            #[cfg(kestrel_mmu_trace)]
            ktrace!("install {}: new {} table at {}", vaddr, level, child);
            created.push(CreatedTable {
                parent: table,
                index,
                table: child,
            });
            table = child;
            fresh = true;
        }

        let index = leaf_level.index_of(vaddr);
        // SAFETY: `table` is the leaf-level table on the path to `vaddr`.
        let old = unsafe { self.entry(table, index) };
        if old.is_present() && !leaf_level.is_leaf(old) {
            // A 2 MiB leaf cannot replace a page table that may hold mappings.
            // SAFETY: Every entry in `created` was linked by this call.
            unsafe { self.roll_back(&mut created) };
            return Err(MmuError::SizeMismatch);
        }
        // SAFETY: As above.
        unsafe { self.set_entry(table, index, PageTableEntry::new(paddr, leaf)) };
        if old.is_present() {
            self.cpu.flush_page(vaddr);
        }
        Ok(())
    }

    /// Unlinks and frees the tables in `created`, newest first.
    ///
    /// # Safety
    ///
    /// Every record must describe a table linked by the current install and
    /// not yet referenced by anything else.
    unsafe fn roll_back(&mut self, created: &mut Created) {
        if created.len() == 0 {
            return;
        }
        kdebug!("mmu: rolling back {} new table(s)", created.len());
        while let Some(record) = created.pop() {
            // SAFETY: `record.parent` is reachable; the entry was set by us.
            unsafe { self.clear_present(record.parent, record.index) };
            // SAFETY: Now unlinked, and allocated by this call.
            unsafe {
                self.frames
                    .deallocate_frame(PhysFrame::containing_address(record.table));
            }
        }
    }
}
