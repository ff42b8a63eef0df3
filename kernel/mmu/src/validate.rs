//! Address validation against the processor's implemented widths.
//!
//! Every public MMU operation checks its addresses here before any table is
//! read or allocated.

use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::paging::{PageSize, Size4KiB};

/// Implemented linear and physical address widths, in bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressWidths {
    virt_bits: u8,
    phys_bits: u8,
}

impl AddressWidths {
    /// Widths assumed when the processor does not report them.
    pub const FALLBACK: Self = Self {
        virt_bits: 48,
        phys_bits: 36,
    };

    /// Creates a width pair. Out-of-range values (zero or above 64) are
    /// replaced by the corresponding [`FALLBACK`](Self::FALLBACK) width.
    pub const fn new(virt_bits: u8, phys_bits: u8) -> Self {
        let virt_bits = if virt_bits == 0 || virt_bits > 64 {
            Self::FALLBACK.virt_bits
        } else {
            virt_bits
        };
        let phys_bits = if phys_bits == 0 || phys_bits > 64 {
            Self::FALLBACK.phys_bits
        } else {
            phys_bits
        };
        Self {
            virt_bits,
            phys_bits,
        }
    }

    /// Decodes EAX of CPUID leaf `0x8000_0008`: bits 7:0 hold the physical
    /// width, bits 15:8 the linear width.
    pub const fn from_address_sizes(eax: u32) -> Self {
        Self::new(((eax >> 8) & 0xFF) as u8, (eax & 0xFF) as u8)
    }

    /// Number of implemented linear address bits.
    pub const fn virt_bits(self) -> u8 {
        self.virt_bits
    }

    /// Number of implemented physical address bits.
    pub const fn phys_bits(self) -> u8 {
        self.phys_bits
    }

    /// Highest address of the lower canonical half.
    pub const fn max_low_half(self) -> u64 {
        (1u64 << (self.virt_bits - 1)) - 1
    }

    /// Lowest address of the upper canonical half.
    pub const fn min_high_half(self) -> u64 {
        !self.max_low_half()
    }

    /// Highest addressable physical byte.
    pub const fn max_phys(self) -> u64 {
        if self.phys_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.phys_bits) - 1
        }
    }

    /// Returns `true` if `vaddr` lies in either canonical half. Alignment is
    /// not considered.
    pub const fn is_canonical(self, vaddr: VirtAddr) -> bool {
        let v = vaddr.as_u64();
        v <= self.max_low_half() || v >= self.min_high_half()
    }

    /// Returns `true` if `vaddr` is page aligned and canonical.
    pub const fn check_vaddr(self, vaddr: VirtAddr) -> bool {
        vaddr.is_aligned(Size4KiB::SIZE) && self.is_canonical(vaddr)
    }

    /// Returns `true` if `paddr` is page aligned and within the physical
    /// width.
    pub const fn check_paddr(self, paddr: PhysAddr) -> bool {
        paddr.is_aligned(Size4KiB::SIZE) && paddr.as_u64() <= self.max_phys()
    }

    /// Returns `true` if `pages` 4 KiB pages from `vaddr` all pass
    /// [`check_vaddr`](Self::check_vaddr) and stay in the canonical half
    /// that `vaddr` lies in.
    pub const fn check_vrange(self, vaddr: VirtAddr, pages: u64) -> bool {
        if !self.check_vaddr(vaddr) {
            return false;
        }
        let Some(last) = last_page(vaddr.as_u64(), pages) else {
            return false;
        };
        if vaddr.as_u64() <= self.max_low_half() {
            last <= self.max_low_half()
        } else {
            true
        }
    }

    /// Returns `true` if `pages` 4 KiB frames from `paddr` all pass
    /// [`check_paddr`](Self::check_paddr).
    pub const fn check_prange(self, paddr: PhysAddr, pages: u64) -> bool {
        if !self.check_paddr(paddr) {
            return false;
        }
        match last_page(paddr.as_u64(), pages) {
            Some(last) => last <= self.max_phys(),
            None => false,
        }
    }
}

/// Start of the last page of a run, or `None` if the run wraps past the top
/// of the address space. An empty run ends where it starts.
const fn last_page(start: u64, pages: u64) -> Option<u64> {
    if pages == 0 {
        return Some(start);
    }
    match (pages - 1).checked_mul(Size4KiB::SIZE) {
        Some(span) => start.checked_add(span),
        None => None,
    }
}

impl Default for AddressWidths {
    fn default() -> Self {
        Self::FALLBACK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W48: AddressWidths = AddressWidths::new(48, 39);

    #[test]
    fn canonical_boundaries_48() {
        assert!(W48.is_canonical(VirtAddr::new(0x0000_7FFF_FFFF_FFFF)));
        assert!(!W48.is_canonical(VirtAddr::new(0x0000_8000_0000_0000)));
        assert!(!W48.is_canonical(VirtAddr::new(0xFFFF_7FFF_FFFF_F000)));
        assert!(W48.is_canonical(VirtAddr::new(0xFFFF_8000_0000_0000)));
        assert!(W48.is_canonical(VirtAddr::new(u64::MAX)));
    }

    #[test]
    fn check_vaddr_requires_alignment() {
        assert!(W48.check_vaddr(VirtAddr::new(0x0000_7FFF_FFFF_F000)));
        assert!(!W48.check_vaddr(VirtAddr::new(0x0000_7FFF_FFFF_FFFF)));
        assert!(W48.check_vaddr(VirtAddr::new(0xFFFF_8000_0000_0000)));
        assert!(!W48.check_vaddr(VirtAddr::new(0x0000_8000_0000_0000)));
    }

    #[test]
    fn canonical_boundaries_57() {
        let w = AddressWidths::new(57, 52);
        assert!(w.check_vaddr(VirtAddr::new(0x00FF_FFFF_FFFF_F000)));
        assert!(!w.check_vaddr(VirtAddr::new(0x0100_0000_0000_0000)));
        assert!(w.check_vaddr(VirtAddr::new(0xFF00_0000_0000_0000)));
    }

    #[test]
    fn check_paddr_width() {
        assert!(W48.check_paddr(PhysAddr::new(0x7F_FFFF_F000)));
        assert!(!W48.check_paddr(PhysAddr::new(0x80_0000_0000)));
        assert!(!W48.check_paddr(PhysAddr::new(0x1001)));
        assert!(W48.check_paddr(PhysAddr::zero()));
    }

    #[test]
    fn runs_stay_in_their_half() {
        let top_low = VirtAddr::new(0x0000_7FFF_FFFF_F000);
        assert!(W48.check_vrange(top_low, 1));
        assert!(!W48.check_vrange(top_low, 2));
        assert!(W48.check_vrange(VirtAddr::new(0x0000_7FFF_FFFF_E000), 2));
        assert!(W48.check_vrange(VirtAddr::new(0xFFFF_8000_0000_0000), 0x100));

        let top = VirtAddr::new(0xFFFF_FFFF_FFFF_F000);
        assert!(W48.check_vrange(top, 1));
        assert!(!W48.check_vrange(top, 2));
        assert!(!W48.check_vrange(VirtAddr::new(0x1000), u64::MAX));
        assert!(W48.check_vrange(VirtAddr::new(0x1000), 0));
        assert!(!W48.check_vrange(VirtAddr::new(0x1008), 0));
    }

    #[test]
    fn frame_runs_stay_below_phys_width() {
        let last = PhysAddr::new(0x7F_FFFF_F000);
        assert!(W48.check_prange(last, 1));
        assert!(!W48.check_prange(last, 2));
        assert!(W48.check_prange(PhysAddr::new(0x7F_FFFF_E000), 2));
        assert!(!W48.check_prange(PhysAddr::new(0x1000), u64::MAX));
    }

    #[test]
    fn decode_address_sizes() {
        let w = AddressWidths::from_address_sizes(0x0000_3027);
        assert_eq!((w.virt_bits(), w.phys_bits()), (48, 39));
    }

    #[test]
    fn bogus_widths_fall_back() {
        assert_eq!(AddressWidths::new(0, 0), AddressWidths::FALLBACK);
        assert_eq!(AddressWidths::new(70, 40).virt_bits(), 48);
        assert_eq!(AddressWidths::new(64, 64).max_phys(), u64::MAX);
    }
}
