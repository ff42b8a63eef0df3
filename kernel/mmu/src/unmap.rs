//! Removing mappings and reclaiming emptied tables.
//!
//! Unmapping clears the leaf, then walks back up the path: any table left
//! with no present entry is unlinked from its parent and returned to the
//! frame allocator. The root table is never freed.

use kestrel_core::addr::{PhysAddr, VirtAddr};
#[cfg(kestrel_mmu_trace)]
use kestrel_core::ktrace;
use kestrel_core::paging::{Page, PhysFrame, Size4KiB};

use crate::arch::x86_64::paging::Level;
use crate::cpu::Cpu;
use crate::tables::PageTables;
use crate::{FrameDeallocator, MmuError};

impl<C, A> PageTables<'_, C, A>
where
    C: Cpu,
    A: FrameDeallocator<Size4KiB>,
{
    /// Removes whatever leaf maps `vaddr`. Unmapped addresses are a no-op.
    ///
    /// A 2 MiB or 1 GiB leaf covering `vaddr` is removed whole.
    ///
    /// # Safety
    ///
    /// `root` must be a valid PML4 reachable through this view's window, and
    /// nothing may still rely on the mapping being removed.
    pub unsafe fn unmap_one(&mut self, root: PhysAddr, vaddr: VirtAddr) {
        // SAFETY: Forwarded caller contract.
        unsafe { self.unmap_entry(Level::Pml4, root, vaddr) };
    }

    /// Removes `count` consecutive 4 KiB pages starting at `vaddr`.
    ///
    /// # Errors
    ///
    /// [`MmuError::InvalidArgs`] if `vaddr` fails validation or the run
    /// leaves its canonical half. Nothing is touched in that case.
    ///
    /// # Safety
    ///
    /// As [`unmap_one`](Self::unmap_one).
    pub unsafe fn unmap_range(
        &mut self,
        root: PhysAddr,
        vaddr: VirtAddr,
        count: usize,
    ) -> Result<(), MmuError> {
        let count = count as u64;
        if !self.widths.check_vrange(vaddr, count) {
            return Err(MmuError::InvalidArgs);
        }
        for page in Page::<Size4KiB>::containing_address(vaddr).run(count) {
            // SAFETY: Forwarded caller contract.
            unsafe { self.unmap_one(root, page.start_address()) };
        }
        Ok(())
    }

    /// Unmaps `vaddr` below `table`, which sits at `level`.
    unsafe fn unmap_entry(&mut self, level: Level, table: PhysAddr, vaddr: VirtAddr) {
        let index = level.index_of(vaddr);
        // SAFETY: `table` is the root or was reached through a present entry.
        let entry = unsafe { self.entry(table, index) };
        if !entry.is_present() {
            return;
        }

        let next = match level.next() {
            Some(next) if !level.is_leaf(entry) => next,
            _ => {
                // SAFETY: As above.
                unsafe { self.clear_present(table, index) };
                self.cpu.flush_page(vaddr);
                return;
            }
        };

        let child = entry.address();
        // SAFETY: `child` is a table linked at `table[index]`.
        unsafe { self.unmap_entry(next, child, vaddr) };
        // SAFETY: As above.
        if unsafe { self.is_unused(child) } {
            // Unlink before freeing so no walk can reach a recycled frame.
            // SAFETY: As above.
            unsafe { self.clear_present(table, index) };
            #[cfg(kestrel_mmu_trace)]
            ktrace!("unmap {}: freeing {} table at {}", vaddr, next, child);
            // SAFETY: Unlinked above and owned by this hierarchy.
            unsafe {
                self.frames
                    .deallocate_frame(PhysFrame::containing_address(child));
            }
        }
    }
}
