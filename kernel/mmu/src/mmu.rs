//! The MMU context and the VM-facing API.
//!
//! [`Mmu::init_early`] programs the protection bits, measures the address
//! widths and drops the boot identity mapping. The resulting context is then
//! handed to the VM layer, which maps, unmaps and queries through it.
//! Those calls always act on the root currently loaded in CR3.

use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::kdebug;
use kestrel_core::paging::Size4KiB;

use crate::address_space::{ArchAddressSpace, AspaceFlags};
use crate::arch::x86_64::paging::{ENTRY_COUNT, PageTableEntry};
use crate::arch::x86_64::registers::{Cr0Flags, Cr4Flags, EferFlags};
use crate::cpu::{Cpu, CpuFeatures};
use crate::flags::MmuFlags;
use crate::phys::PhysMap;
use crate::range::MapRange;
use crate::tables::PageTables;
use crate::validate::AddressWidths;
use crate::walk;
use crate::{FrameAllocator, FrameDeallocator, MmuError};

/// PML4 slot that holds the kernel image and is shared by every root.
const KERNEL_IMAGE_SLOT: usize = ENTRY_COUNT - 1;

/// PML4 slot of the boot-time identity mapping of low memory.
const BOOT_IDENTITY_SLOT: usize = 0;

/// Owner of the kernel hierarchy and everything needed to change it.
pub struct Mmu<C, A> {
    cpu: C,
    frames: A,
    phys: PhysMap,
    widths: AddressWidths,
    kernel_root: PhysAddr,
}

impl<C, A> Mmu<C, A>
where
    C: Cpu,
    A: FrameAllocator<Size4KiB> + FrameDeallocator<Size4KiB>,
{
    /// One-time early setup on the boot processor.
    ///
    /// Sets CR0.WP, sets CR4.SMEP and CR4.SMAP when the processor reports
    /// them, and sets EFER.NXE. Measures the address widths, clears the
    /// identity mapping in PML4 slot 0 and reloads CR3 to flush it.
    ///
    /// # Safety
    ///
    /// Must run once, in long mode, with `phys` covering all memory that
    /// page tables live in. Nothing may still execute from or reference
    /// the low identity mapping.
    pub unsafe fn init_early(cpu: C, frames: A, phys: PhysMap) -> Self {
        let cr0 = cpu.read_cr0() | Cr0Flags::WRITE_PROTECT;
        // SAFETY: WP only makes supervisor writes honour read-only pages.
        unsafe { cpu.write_cr0(cr0) };

        let features = CpuFeatures::detect(&cpu);
        let mut cr4 = cpu.read_cr4();
        if features.smep {
            cr4 |= Cr4Flags::SMEP;
        }
        if features.smap {
            cr4 |= Cr4Flags::SMAP;
        }
        // SAFETY: Only bits reported by CPUID are added.
        unsafe { cpu.write_cr4(cr4) };

        let efer = cpu.read_efer() | EferFlags::NO_EXECUTE_ENABLE;
        // SAFETY: NXE exists on every long-mode processor.
        unsafe { cpu.write_efer(efer) };

        let widths = AddressWidths::detect(&cpu);
        kdebug!(
            "mmu: {}-bit virtual, {}-bit physical, smep={} smap={}",
            widths.virt_bits(),
            widths.phys_bits(),
            features.smep,
            features.smap
        );

        let root = cpu.read_cr3();
        // SAFETY: CR3 names the live PML4, visible through the window.
        unsafe { phys.table_at(root) }.entries[BOOT_IDENTITY_SLOT] = PageTableEntry::empty();
        // SAFETY: Same root, so the running code stays mapped.
        unsafe { cpu.write_cr3(root) };
        kdebug!("mmu: kernel root at {}", root);

        Self {
            cpu,
            frames,
            phys,
            widths,
            kernel_root: root,
        }
    }

    /// Second-stage setup. Nothing to do on this architecture.
    pub fn init(&mut self) {}

    /// Borrows the root-parameterized engine.
    pub fn tables(&mut self) -> PageTables<'_, C, A> {
        PageTables::new(&self.cpu, self.phys, self.widths, &mut self.frames)
    }

    fn current_root(&self) -> PhysAddr {
        self.cpu.read_cr3()
    }

    /// Maps `count` pages from `paddr` at `vaddr` in the current hierarchy.
    ///
    /// `aspace` is accepted for the VM layer's sake; the root comes from
    /// CR3.
    ///
    /// # Errors
    ///
    /// - [`MmuError::InvalidArgs`] for a bad address or a byte length that
    ///   overflows.
    /// - Any error from [`PageTables::map_range`]; nothing stays mapped.
    ///
    /// # Safety
    ///
    /// The caller owns the frames being mapped and must not create aliases
    /// that break memory safety.
    pub unsafe fn map(
        &mut self,
        _aspace: &ArchAddressSpace,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        count: usize,
        flags: MmuFlags,
    ) -> Result<(), MmuError> {
        if !self.widths.check_paddr(paddr) || !self.widths.check_vaddr(vaddr) {
            return Err(MmuError::InvalidArgs);
        }
        if count == 0 {
            return Ok(());
        }
        let range = MapRange::pages(vaddr, paddr, count as u64).ok_or(MmuError::InvalidArgs)?;
        let root = self.current_root();
        // SAFETY: CR3 holds a valid root; the mapping itself is the caller's.
        unsafe { self.tables().map_range(root, &range, flags) }
    }

    /// Unmaps `count` pages from `vaddr` in the current hierarchy.
    ///
    /// # Errors
    ///
    /// [`MmuError::InvalidArgs`] if `vaddr` fails validation or the run
    /// leaves its canonical half.
    ///
    /// # Safety
    ///
    /// Nothing may still access the pages being unmapped.
    pub unsafe fn unmap(
        &mut self,
        _aspace: &ArchAddressSpace,
        vaddr: VirtAddr,
        count: usize,
    ) -> Result<(), MmuError> {
        let root = self.current_root();
        // SAFETY: CR3 holds a valid root; liveness is the caller's.
        unsafe { self.tables().unmap_range(root, vaddr, count) }
    }

    /// Returns where `vaddr` maps to in the current hierarchy.
    ///
    /// `vaddr` need not be page aligned; the in-page offset carries through
    /// to the returned address.
    ///
    /// # Errors
    ///
    /// - [`MmuError::InvalidArgs`] if `vaddr` is not canonical.
    /// - [`MmuError::NotFound`] if nothing maps it.
    pub fn query(
        &self,
        _aspace: &ArchAddressSpace,
        vaddr: VirtAddr,
    ) -> Result<(PhysAddr, MmuFlags), MmuError> {
        if !self.widths.is_canonical(vaddr) {
            return Err(MmuError::InvalidArgs);
        }
        // SAFETY: CR3 holds a valid root whose tables the window covers,
        // as required by `init_early`.
        unsafe { walk::walk(&self.phys, self.current_root(), vaddr) }
            .resolved()
            .ok_or(MmuError::NotFound)
    }

    /// Allocates a fresh root sharing only the kernel-image slot with the
    /// kernel root.
    ///
    /// # Errors
    ///
    /// [`MmuError::NoMemory`] if no frame is available.
    pub fn create_root_table(&mut self) -> Result<PhysAddr, MmuError> {
        let root = self
            .frames
            .allocate_frame()
            .ok_or(MmuError::NoMemory)?
            .start_address();
        // SAFETY: The frame is new and unlinked; the kernel root is live.
        unsafe {
            self.phys.zero_table(root);
            let image = self.phys.table_at(self.kernel_root).entries[KERNEL_IMAGE_SLOT];
            self.phys.table_at(root).entries[KERNEL_IMAGE_SLOT] = image;
        }
        kdebug!("mmu: new root table at {}", root);
        Ok(root)
    }

    /// Records a new address space. Nothing is allocated.
    ///
    /// # Errors
    ///
    /// None on this architecture.
    #[allow(clippy::unnecessary_wraps, clippy::unused_self)]
    pub fn create_space(
        &mut self,
        base: VirtAddr,
        size: u64,
        flags: AspaceFlags,
    ) -> Result<ArchAddressSpace, MmuError> {
        let space = ArchAddressSpace::new(base, size, flags);
        kdebug!(
            "mmu: address space at {} ({:#x} bytes, kernel={})",
            space.base(),
            space.size(),
            space.is_kernel()
        );
        Ok(space)
    }

    /// Releases an address space. Nothing is freed.
    ///
    /// # Errors
    ///
    /// None on this architecture.
    #[allow(clippy::unnecessary_wraps, clippy::unused_self, clippy::needless_pass_by_value)]
    pub fn destroy_space(&mut self, _aspace: ArchAddressSpace) -> Result<(), MmuError> {
        Ok(())
    }

    /// Switches to `aspace`, or to the kernel's when `None`. CR3 is left
    /// alone since every space shares the kernel hierarchy.
    #[allow(clippy::unused_self)]
    pub fn switch_space(&mut self, _aspace: Option<&ArchAddressSpace>) {}

    /// Physical address of the kernel root recorded at early init.
    pub fn kernel_root(&self) -> PhysAddr {
        self.kernel_root
    }

    /// Measured address widths.
    pub fn widths(&self) -> AddressWidths {
        self.widths
    }

    /// Physical-memory window used to reach tables.
    pub fn phys_map(&self) -> PhysMap {
        self.phys
    }

    /// The processor seam.
    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    /// The frame allocator backing intermediate tables.
    pub fn frames(&self) -> &A {
        &self.frames
    }

    /// Mutable access to the frame allocator.
    pub fn frames_mut(&mut self) -> &mut A {
        &mut self.frames
    }
}
