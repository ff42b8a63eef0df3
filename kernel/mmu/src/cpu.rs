//! Processor control seam.
//!
//! Everything the MMU needs from the processor goes through [`Cpu`]:
//! capability queries, the control registers it programs during early init,
//! single-page TLB invalidation and the interrupt-disabled critical section
//! used when clearing entries. [`X86Cpu`] is the bare-metal implementation.

use kestrel_core::addr::{PhysAddr, VirtAddr};

use crate::arch::x86_64::registers::{Cr0Flags, Cr4Flags, EferFlags};
use crate::validate::AddressWidths;

/// Register outputs of one CPUID invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuidResult {
    /// EAX output.
    pub eax: u32,
    /// EBX output.
    pub ebx: u32,
    /// ECX output.
    pub ecx: u32,
    /// EDX output.
    pub edx: u32,
}

/// Processor operations used by the MMU.
///
/// All methods act on the executing core only. Nothing here synchronizes
/// with other cores.
pub trait Cpu {
    /// Executes CPUID for `leaf`/`subleaf`.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    /// Reads CR0.
    fn read_cr0(&self) -> Cr0Flags;

    /// Writes CR0.
    ///
    /// # Safety
    ///
    /// The new value must keep the processor in long mode with paging on.
    unsafe fn write_cr0(&self, value: Cr0Flags);

    /// Reads CR4.
    fn read_cr4(&self) -> Cr4Flags;

    /// Writes CR4.
    ///
    /// # Safety
    ///
    /// Only bits the processor reports as supported may be set.
    unsafe fn write_cr4(&self, value: Cr4Flags);

    /// Reads IA32_EFER.
    fn read_efer(&self) -> EferFlags;

    /// Writes IA32_EFER.
    ///
    /// # Safety
    ///
    /// Long mode must stay enabled.
    unsafe fn write_efer(&self, value: EferFlags);

    /// Returns the physical address of the root table in CR3.
    fn read_cr3(&self) -> PhysAddr;

    /// Loads `root` into CR3, flushing all non-global TLB entries.
    ///
    /// # Safety
    ///
    /// `root` must be a valid PML4 that maps the currently executing code.
    unsafe fn write_cr3(&self, root: PhysAddr);

    /// Invalidates this core's TLB entry for `addr`.
    fn flush_page(&self, addr: VirtAddr);

    /// Runs `f` with interrupts disabled on this core.
    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R;
}

// ---------------------------------------------------------------------------
// Capability decoding
// ---------------------------------------------------------------------------

/// Basic leaf reporting the highest supported basic leaf.
const LEAF_MAX_BASIC: u32 = 0x0;
/// Structured extended feature flags.
const LEAF_EXTENDED_FEATURES: u32 = 0x7;
/// Extended leaf reporting the highest supported extended leaf.
const LEAF_MAX_EXTENDED: u32 = 0x8000_0000;
/// Virtual and physical address sizes.
const LEAF_ADDRESS_SIZES: u32 = 0x8000_0008;

/// CPUID.(EAX=7,ECX=0):EBX.SMEP.
const EBX_SMEP: u32 = 1 << 7;
/// CPUID.(EAX=7,ECX=0):EBX.SMAP.
const EBX_SMAP: u32 = 1 << 20;

/// Supervisor protection features reported by CPUID leaf 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuFeatures {
    /// Supervisor Mode Execution Prevention.
    pub smep: bool,
    /// Supervisor Mode Access Prevention.
    pub smap: bool,
}

impl CpuFeatures {
    /// Queries leaf 7. A processor without that leaf reports neither feature.
    pub fn detect(cpu: &impl Cpu) -> Self {
        if cpu.cpuid(LEAF_MAX_BASIC, 0).eax < LEAF_EXTENDED_FEATURES {
            return Self::default();
        }
        let ebx = cpu.cpuid(LEAF_EXTENDED_FEATURES, 0).ebx;
        Self {
            smep: ebx & EBX_SMEP != 0,
            smap: ebx & EBX_SMAP != 0,
        }
    }
}

impl AddressWidths {
    /// Measures the implemented address widths with CPUID leaf
    /// `0x8000_0008`, falling back to [`AddressWidths::FALLBACK`] when the
    /// leaf is missing.
    pub fn detect(cpu: &impl Cpu) -> Self {
        if cpu.cpuid(LEAF_MAX_EXTENDED, 0).eax < LEAF_ADDRESS_SIZES {
            return Self::FALLBACK;
        }
        Self::from_address_sizes(cpu.cpuid(LEAF_ADDRESS_SIZES, 0).eax)
    }
}

// ---------------------------------------------------------------------------
// Bare-metal implementation
// ---------------------------------------------------------------------------

/// The executing x86_64 processor.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct X86Cpu;

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
impl Cpu for X86Cpu {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        crate::arch::x86_64::instructions::cpuid(leaf, subleaf)
    }

    fn read_cr0(&self) -> Cr0Flags {
        crate::arch::x86_64::registers::read_cr0()
    }

    unsafe fn write_cr0(&self, value: Cr0Flags) {
        // SAFETY: Forwarded caller contract.
        unsafe { crate::arch::x86_64::registers::write_cr0(value) }
    }

    fn read_cr4(&self) -> Cr4Flags {
        crate::arch::x86_64::registers::read_cr4()
    }

    unsafe fn write_cr4(&self, value: Cr4Flags) {
        // SAFETY: Forwarded caller contract.
        unsafe { crate::arch::x86_64::registers::write_cr4(value) }
    }

    fn read_efer(&self) -> EferFlags {
        use crate::arch::x86_64::registers::{IA32_EFER, rdmsr};
        // SAFETY: IA32_EFER exists on every long-mode processor.
        EferFlags::from_bits_retain(unsafe { rdmsr(IA32_EFER) })
    }

    unsafe fn write_efer(&self, value: EferFlags) {
        use crate::arch::x86_64::registers::{IA32_EFER, wrmsr};
        // SAFETY: Forwarded caller contract.
        unsafe { wrmsr(IA32_EFER, value.bits()) }
    }

    fn read_cr3(&self) -> PhysAddr {
        crate::arch::x86_64::registers::read_cr3()
    }

    unsafe fn write_cr3(&self, root: PhysAddr) {
        // SAFETY: Forwarded caller contract.
        unsafe { crate::arch::x86_64::registers::write_cr3(root) }
    }

    fn flush_page(&self, addr: VirtAddr) {
        crate::arch::x86_64::instructions::flush(addr);
    }

    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        crate::arch::x86_64::instructions::without_interrupts(f)
    }
}
