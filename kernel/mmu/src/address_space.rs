//! Address-space handles.
//!
//! This architecture runs a single, kernel-only address space: every
//! operation acts on the root currently loaded in CR3. An
//! [`ArchAddressSpace`] only records what the VM layer asked for when it
//! created the space, and the [`Mmu`](crate::Mmu) lifecycle calls on it are
//! accepted without touching any page table.

use bitflags::bitflags;
use kestrel_core::addr::VirtAddr;

bitflags! {
    /// Creation flags passed by the VM layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AspaceFlags: u32 {
        /// The space covers kernel addresses.
        const KERNEL = 1 << 0;
    }
}

/// Architecture half of a VM address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchAddressSpace {
    base: VirtAddr,
    size: u64,
    flags: AspaceFlags,
}

impl ArchAddressSpace {
    /// Records a space spanning `size` bytes from `base`.
    pub const fn new(base: VirtAddr, size: u64, flags: AspaceFlags) -> Self {
        Self { base, size, flags }
    }

    /// First address of the space.
    pub const fn base(&self) -> VirtAddr {
        self.base
    }

    /// Length of the space in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns `true` for the kernel's space.
    pub const fn is_kernel(&self) -> bool {
        self.flags.contains(AspaceFlags::KERNEL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_creation_arguments() {
        let base = VirtAddr::new(0xFFFF_FF80_0000_0000);
        let space = ArchAddressSpace::new(base, 0x80_0000_0000, AspaceFlags::KERNEL);
        assert!(space.is_kernel());
        assert_eq!(space.base(), base);
        assert_eq!(space.size(), 0x80_0000_0000);
    }

    #[test]
    fn user_space_is_not_kernel() {
        let space = ArchAddressSpace::new(VirtAddr::new(0x1000), 0x1000, AspaceFlags::empty());
        assert!(!space.is_kernel());
    }
}
