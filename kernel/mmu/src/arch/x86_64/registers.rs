//! Control registers and the EFER model-specific register.
//!
//! The flag types are available on every target so that host tests can
//! model register state. Reads and writes only exist on bare metal.

bitflags::bitflags! {
    /// CR0 register flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0Flags: u64 {
        /// Protected mode enable.
        const PROTECTED_MODE = 1 << 0;
        /// Supervisor writes honor read-only pages.
        const WRITE_PROTECT  = 1 << 16;
        /// Paging enable.
        const PAGING         = 1 << 31;
    }
}

bitflags::bitflags! {
    /// CR4 register flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4Flags: u64 {
        /// Physical Address Extension.
        const PAE  = 1 << 5;
        /// Page Global Enable.
        const PGE  = 1 << 7;
        /// Supervisor Mode Execution Prevention.
        const SMEP = 1 << 20;
        /// Supervisor Mode Access Prevention.
        const SMAP = 1 << 21;
    }
}

bitflags::bitflags! {
    /// IA32_EFER register flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EferFlags: u64 {
        /// System Call Extensions (SYSCALL/SYSRET).
        const SYSTEM_CALL_ENABLE = 1 << 0;
        /// Long Mode Enable.
        const LONG_MODE_ENABLE   = 1 << 8;
        /// No-Execute Enable.
        const NO_EXECUTE_ENABLE  = 1 << 11;
    }
}

/// A Model Specific Register, identified by its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msr(u32);

/// IA32_EFER MSR address.
pub const IA32_EFER: Msr = Msr(0xC000_0080);

impl Msr {
    /// Returns the MSR address.
    #[inline]
    pub const fn address(self) -> u32 {
        self.0
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
mod hw {
    use kestrel_core::addr::PhysAddr;

    use super::{Cr0Flags, Cr4Flags, Msr};

    /// Reads CR0. Unknown bits are kept so a write-back preserves them.
    #[inline]
    pub fn read_cr0() -> Cr0Flags {
        let val: u64;
        // SAFETY: Reading CR0 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) val, options(nomem, nostack, preserves_flags));
        }
        Cr0Flags::from_bits_retain(val)
    }

    /// Writes CR0.
    ///
    /// # Safety
    ///
    /// Changing CR0 flags can affect CPU operation mode.
    #[inline]
    pub unsafe fn write_cr0(flags: Cr0Flags) {
        // SAFETY: Caller guarantees the new flags keep the CPU in a valid mode.
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) flags.bits(), options(nostack, preserves_flags));
        }
    }

    /// Reads the page table root from CR3.
    #[inline]
    pub fn read_cr3() -> PhysAddr {
        let val: u64;
        // SAFETY: Reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) val, options(nomem, nostack, preserves_flags));
        }
        PhysAddr::new(val & crate::arch::x86_64::paging::ADDR_MASK)
    }

    /// Loads a new page table root into CR3.
    ///
    /// # Safety
    ///
    /// `root` must be a valid PML4 that maps the currently executing code.
    #[inline]
    pub unsafe fn write_cr3(root: PhysAddr) {
        // SAFETY: Caller guarantees `root` maps the running code.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
        }
    }

    /// Reads CR4. Unknown bits are kept so a write-back preserves them.
    #[inline]
    pub fn read_cr4() -> Cr4Flags {
        let val: u64;
        // SAFETY: Reading CR4 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) val, options(nomem, nostack, preserves_flags));
        }
        Cr4Flags::from_bits_retain(val)
    }

    /// Writes CR4.
    ///
    /// # Safety
    ///
    /// Setting a bit the CPU does not support raises #GP.
    #[inline]
    pub unsafe fn write_cr4(flags: Cr4Flags) {
        // SAFETY: Caller guarantees every set bit is supported.
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) flags.bits(), options(nostack, preserves_flags));
        }
    }

    /// Reads the 64-bit value of `msr`.
    ///
    /// # Safety
    ///
    /// The MSR must exist on this CPU.
    #[inline]
    pub unsafe fn rdmsr(msr: Msr) -> u64 {
        let (low, high): (u32, u32);
        // SAFETY: Caller guarantees the MSR exists.
        unsafe {
            core::arch::asm!(
                "rdmsr",
                in("ecx") msr.address(),
                out("eax") low,
                out("edx") high,
                options(nomem, nostack, preserves_flags),
            );
        }
        u64::from(high) << 32 | u64::from(low)
    }

    /// Writes a 64-bit value to `msr`.
    ///
    /// # Safety
    ///
    /// The MSR must exist on this CPU and accept `value`.
    #[inline]
    pub unsafe fn wrmsr(msr: Msr, value: u64) {
        #[allow(clippy::cast_possible_truncation)]
        let (low, high) = (value as u32, (value >> 32) as u32);
        // SAFETY: Caller guarantees the MSR exists and accepts `value`.
        unsafe {
            core::arch::asm!(
                "wrmsr",
                in("ecx") msr.address(),
                in("eax") low,
                in("edx") high,
                options(nomem, nostack, preserves_flags),
            );
        }
    }
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub use hw::*;
