//! Host fixtures: heap-backed frames and a scripted processor.
//!
//! Frames are real 4 KiB-aligned heap pages, so with a zero-offset
//! [`PhysMap`](crate::PhysMap) a "physical" address is simply the page's
//! host address.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};

use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::paging::{PhysFrame, Size4KiB};

use crate::arch::x86_64::paging::{PageTable, PageTableEntry, PageTableFlags};
use crate::arch::x86_64::registers::{Cr0Flags, Cr4Flags, EferFlags};
use crate::cpu::{Cpu, CpuidResult};
use crate::validate::AddressWidths;
use crate::{FrameAllocator, FrameDeallocator};

/// Widths used by table-level tests.
pub const WIDTHS: AddressWidths = AddressWidths::new(48, 46);

const PAGE: Layout = match Layout::from_size_align(4096, 4096) {
    Ok(layout) => layout,
    Err(_) => panic!("bad page layout"),
};

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// Heap-backed frame allocator that tracks every frame it hands out.
#[derive(Default)]
pub struct HostFrames {
    live: BTreeSet<u64>,
    pinned: Vec<u64>,
    freed: Vec<PhysAddr>,
    budget: Option<usize>,
}

impl HostFrames {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows `n` more allocations; `None` removes the limit.
    pub fn set_budget(&mut self, budget: Option<usize>) {
        self.budget = budget;
    }

    /// Returns a zeroed table that lives until `self` is dropped and is not
    /// counted as outstanding.
    pub fn pinned_table(&mut self) -> PhysAddr {
        let addr = Self::alloc_page(0);
        self.pinned.push(addr);
        PhysAddr::new(addr)
    }

    /// Number of allocated frames not yet returned.
    pub fn outstanding(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, addr: PhysAddr) -> bool {
        self.live.contains(&addr.as_u64())
    }

    /// Frames returned so far, oldest first.
    pub fn freed(&self) -> &[PhysAddr] {
        &self.freed
    }

    fn alloc_page(fill: u8) -> u64 {
        // SAFETY: PAGE has non-zero size.
        let ptr = unsafe { alloc::alloc(PAGE) };
        assert!(!ptr.is_null(), "host allocation failed");
        // SAFETY: `ptr` points to a fresh 4 KiB block.
        unsafe { ptr.write_bytes(fill, PAGE.size()) };
        ptr as u64
    }
}

// SAFETY: Every page is a distinct, page-aligned heap block.
unsafe impl FrameAllocator<Size4KiB> for HostFrames {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        if let Some(budget) = self.budget.as_mut() {
            if *budget == 0 {
                return None;
            }
            *budget -= 1;
        }
        // Garbage, so that a missing zeroing step is caught.
        let addr = Self::alloc_page(0xFF);
        self.live.insert(addr);
        Some(PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

// SAFETY: Accepts exactly the frames handed out above.
unsafe impl FrameDeallocator<Size4KiB> for HostFrames {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        let addr = frame.start_address().as_u64();
        assert!(self.live.remove(&addr), "freeing unknown frame {addr:#x}");
        self.freed.push(frame.start_address());
        // SAFETY: Allocated by `alloc_page` with PAGE and now forgotten.
        unsafe { alloc::dealloc(addr as *mut u8, PAGE) };
    }
}

impl Drop for HostFrames {
    fn drop(&mut self) {
        for &addr in self.live.iter().chain(&self.pinned) {
            // SAFETY: Allocated by `alloc_page` with PAGE.
            unsafe { alloc::dealloc(addr as *mut u8, PAGE) };
        }
    }
}

/// Allocates a zeroed table from `frames` and links it at `parent[index]`.
pub fn link_table(frames: &mut HostFrames, parent: PhysAddr, index: usize) -> PhysAddr {
    let child = frames
        .allocate_frame()
        .expect("test budget exhausted")
        .start_address();
    // SAFETY: Both frames are live host pages.
    unsafe {
        (*(child.as_u64() as *mut PageTable)).zero();
        (*(parent.as_u64() as *mut PageTable)).entries[index] = PageTableEntry::new(
            child,
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );
    }
    child
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

/// Scripted [`Cpu`] that records what the MMU does to it.
pub struct MockCpu {
    cpuid: RefCell<BTreeMap<u32, CpuidResult>>,
    cr0: Cell<Cr0Flags>,
    cr4: Cell<Cr4Flags>,
    efer: Cell<EferFlags>,
    cr3: Cell<PhysAddr>,
    cr3_writes: Cell<usize>,
    flushed: RefCell<Vec<VirtAddr>>,
    critical_sections: Cell<usize>,
    depth: Cell<usize>,
}

impl MockCpu {
    /// A processor in long mode reporting leaf 0xD, 48-bit widths and no
    /// SMEP or SMAP.
    pub fn new() -> Self {
        let mut cpuid = BTreeMap::new();
        cpuid.insert(0, CpuidResult { eax: 0xD, ..Default::default() });
        cpuid.insert(0x8000_0000, CpuidResult { eax: 0x8000_0008, ..Default::default() });
        cpuid.insert(0x8000_0008, CpuidResult { eax: 0x3030, ..Default::default() });
        Self {
            cpuid: RefCell::new(cpuid),
            cr0: Cell::new(Cr0Flags::PROTECTED_MODE | Cr0Flags::PAGING),
            cr4: Cell::new(Cr4Flags::PAE | Cr4Flags::PGE),
            efer: Cell::new(EferFlags::SYSTEM_CALL_ENABLE | EferFlags::LONG_MODE_ENABLE),
            cr3: Cell::new(PhysAddr::zero()),
            cr3_writes: Cell::new(0),
            flushed: RefCell::new(Vec::new()),
            critical_sections: Cell::new(0),
            depth: Cell::new(0),
        }
    }

    pub fn set_cpuid(&self, leaf: u32, result: CpuidResult) {
        self.cpuid.borrow_mut().insert(leaf, result);
    }

    /// Sets CR3 without counting it as a write.
    pub fn set_cr3(&self, root: PhysAddr) {
        self.cr3.set(root);
    }

    pub fn cr0(&self) -> Cr0Flags {
        self.cr0.get()
    }

    pub fn cr4(&self) -> Cr4Flags {
        self.cr4.get()
    }

    pub fn efer(&self) -> EferFlags {
        self.efer.get()
    }

    pub fn cr3_writes(&self) -> usize {
        self.cr3_writes.get()
    }

    /// Addresses passed to `flush_page`, in order.
    pub fn flushed(&self) -> Vec<VirtAddr> {
        self.flushed.borrow().clone()
    }

    pub fn critical_sections(&self) -> usize {
        self.critical_sections.get()
    }
}

impl Cpu for MockCpu {
    fn cpuid(&self, leaf: u32, _subleaf: u32) -> CpuidResult {
        self.cpuid.borrow().get(&leaf).copied().unwrap_or_default()
    }

    fn read_cr0(&self) -> Cr0Flags {
        self.cr0.get()
    }

    unsafe fn write_cr0(&self, value: Cr0Flags) {
        self.cr0.set(value);
    }

    fn read_cr4(&self) -> Cr4Flags {
        self.cr4.get()
    }

    unsafe fn write_cr4(&self, value: Cr4Flags) {
        self.cr4.set(value);
    }

    fn read_efer(&self) -> EferFlags {
        self.efer.get()
    }

    unsafe fn write_efer(&self, value: EferFlags) {
        self.efer.set(value);
    }

    fn read_cr3(&self) -> PhysAddr {
        self.cr3.get()
    }

    unsafe fn write_cr3(&self, root: PhysAddr) {
        self.cr3.set(root);
        self.cr3_writes.set(self.cr3_writes.get() + 1);
    }

    fn flush_page(&self, addr: VirtAddr) {
        self.flushed.borrow_mut().push(addr);
    }

    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        assert_eq!(self.depth.get(), 0, "nested critical section");
        self.critical_sections.set(self.critical_sections.get() + 1);
        self.depth.set(1);
        let result = f();
        self.depth.set(0);
        result
    }
}
