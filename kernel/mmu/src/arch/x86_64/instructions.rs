//! CPUID, interrupt masking and TLB invalidation.
//!
//! Bare-metal only; host builds go through the [`Cpu`](crate::cpu::Cpu)
//! trait with a test double instead.

use kestrel_core::addr::VirtAddr;

use crate::cpu::CpuidResult;

/// Executes CPUID for `leaf`/`subleaf`.
#[inline]
pub fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    // SAFETY: CPUID is available on every x86_64 processor and only writes
    // the four output registers.
    #[allow(unused_unsafe)]
    let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
    CpuidResult {
        eax: r.eax,
        ebx: r.ebx,
        ecx: r.ecx,
        edx: r.edx,
    }
}

/// RFLAGS.IF.
const INTERRUPT_FLAG: u64 = 1 << 9;

/// Returns `true` if maskable interrupts are enabled on this core.
#[inline]
pub fn interrupts_enabled() -> bool {
    let rflags: u64;
    // SAFETY: pushfq/pop only touch the stack slot they allocate.
    unsafe {
        core::arch::asm!("pushfq", "pop {}", out(reg) rflags, options(nomem, preserves_flags));
    }
    rflags & INTERRUPT_FLAG != 0
}

/// Runs `f` with interrupts disabled, restoring the previous state after.
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let was_enabled = interrupts_enabled();
    if was_enabled {
        // SAFETY: CLI only masks maskable interrupts.
        unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
    }
    let result = f();
    if was_enabled {
        // SAFETY: Interrupts were enabled on entry, so re-enabling them
        // restores the caller's state.
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
    }
    result
}

/// Invalidates the local TLB entry for `addr` (INVLPG).
#[inline]
pub fn flush(addr: VirtAddr) {
    // SAFETY: INVLPG only invalidates a single TLB entry.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) addr.as_u64(), options(nostack, preserves_flags));
    }
}
