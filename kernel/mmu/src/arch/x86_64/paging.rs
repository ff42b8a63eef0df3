//! x86_64 page table structures.
//!
//! Types for the 4-level hierarchy (PML4 -> PDPT -> PD -> PT). The entry
//! encoding is fixed by the architecture.

use core::fmt;

use kestrel_core::addr::{PhysAddr, VirtAddr};
use kestrel_core::paging::{PageSize, Size1GiB, Size2MiB, Size4KiB};

/// Physical address mask: bits 12..51 of a page table entry.
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Number of entries in every table.
pub const ENTRY_COUNT: usize = 512;

bitflags::bitflags! {
    /// Page table entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageTableFlags: u64 {
        /// Entry is present / valid.
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode (ring 3).
        const USER          = 1 << 2;
        /// Write-through caching (PWT).
        const WRITE_THROUGH = 1 << 3;
        /// Cache disabled (PCD).
        const CACHE_DISABLE = 1 << 4;
        /// Set by the CPU on any access.
        const ACCESSED      = 1 << 5;
        /// Set by the CPU on a write to a leaf.
        const DIRTY         = 1 << 6;
        /// PS bit: 2 MiB page in a PD entry, 1 GiB page in a PDPT entry.
        const HUGE_PAGE     = 1 << 7;
        /// PAT selector of a 4 KiB leaf. Shares bit 7 with `HUGE_PAGE`.
        const PAT           = 1 << 7;
        /// Global page (kept across CR3 reloads when CR4.PGE is set).
        const GLOBAL        = 1 << 8;
        /// PAT selector of a 2 MiB or 1 GiB leaf.
        const PAT_LARGE     = 1 << 12;
        /// No-execute bit (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

/// A single page table entry (64 bits).
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// An empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates an entry pointing to `phys_addr` with the given `flags`.
    pub const fn new(phys_addr: PhysAddr, flags: PageTableFlags) -> Self {
        Self((phys_addr.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Returns the raw 64-bit encoding.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns `true` if the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & PageTableFlags::PRESENT.bits() != 0
    }

    /// Returns `true` if the PS bit is set.
    pub const fn is_huge(self) -> bool {
        self.0 & PageTableFlags::HUGE_PAGE.bits() != 0
    }

    /// Returns the physical address stored in this entry.
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Returns the physical address masked to the frame size of a large
    /// leaf, which drops the relocated PAT bit.
    pub const fn large_address(self, size: u64) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK & !(size - 1))
    }

    /// Returns the flags portion of this entry.
    pub const fn flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    /// Returns the flags of a 2 MiB or 1 GiB leaf, including
    /// [`PageTableFlags::PAT_LARGE`] which lives inside the address field.
    pub const fn large_flags(self) -> PageTableFlags {
        PageTableFlags::from_bits_truncate(self.0 & (!ADDR_MASK | PageTableFlags::PAT_LARGE.bits()))
    }

    /// Returns this entry with the PRESENT bit cleared and everything else
    /// kept.
    pub const fn without_present(self) -> Self {
        Self(self.0 & !PageTableFlags::PRESENT.bits())
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("address", &self.address())
            .field("flags", &self.flags())
            .finish()
    }
}

/// A 4 KiB-aligned page table containing 512 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 512 entries of this page table.
    pub entries: [PageTableEntry; ENTRY_COUNT],
}

impl PageTable {
    /// An all-empty table.
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); ENTRY_COUNT],
        }
    }

    /// Zero-initializes all entries.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }

    /// Returns `true` if no entry is present.
    pub fn is_unused(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

/// One of the four levels of the hierarchy, root first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Root table, selected by CR3.
    Pml4 = 0,
    /// Page directory pointer table.
    Pdpt = 1,
    /// Page directory.
    Pd = 2,
    /// Page table (4 KiB leaves).
    Pt = 3,
}

impl Level {
    /// All levels from root to leaf.
    pub const ALL: [Level; 4] = [Level::Pml4, Level::Pdpt, Level::Pd, Level::Pt];

    /// Bit position of this level's 9-bit index within a virtual address.
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Returns the index of `vaddr`'s entry in a table at this level.
    pub const fn index_of(self, vaddr: VirtAddr) -> usize {
        vaddr.table_index(self.shift())
    }

    /// Returns the level below this one, or `None` for the leaf level.
    pub const fn next(self) -> Option<Level> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    /// Size of the region mapped by a leaf entry at this level, if leaves
    /// are allowed here.
    pub const fn page_size(self) -> Option<u64> {
        match self {
            Self::Pml4 => None,
            Self::Pdpt => Some(Size1GiB::SIZE),
            Self::Pd => Some(Size2MiB::SIZE),
            Self::Pt => Some(Size4KiB::SIZE),
        }
    }

    /// Returns `true` if `entry`, read at this level, maps memory directly
    /// rather than pointing at another table.
    pub const fn is_leaf(self, entry: PageTableEntry) -> bool {
        match self {
            Self::Pml4 => false,
            Self::Pdpt | Self::Pd => entry.is_huge(),
            Self::Pt => true,
        }
    }

    /// The levels whose tables must exist above a leaf at this level.
    pub fn ancestors(self) -> &'static [Level] {
        &LEVELS[..self as usize]
    }
}

static LEVELS: [Level; 4] = Level::ALL;

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entry_not_present() {
        let entry = PageTableEntry::empty();
        assert!(!entry.is_present());
        assert_eq!(entry.address().as_u64(), 0);
    }

    #[test]
    fn address_and_flags_do_not_leak() {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE;
        let entry = PageTableEntry::new(PhysAddr::new(0x000F_FFFF_FFFF_F000), flags);
        assert_eq!(entry.address().as_u64(), 0x000F_FFFF_FFFF_F000);
        assert_eq!(entry.flags(), flags);
        assert_eq!(entry.flags().bits() & ADDR_MASK, 0);
    }

    #[test]
    fn without_present_keeps_other_bits() {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::GLOBAL;
        let entry = PageTableEntry::new(PhysAddr::new(0x5000), flags).without_present();
        assert!(!entry.is_present());
        assert_eq!(entry.address().as_u64(), 0x5000);
        assert!(entry.flags().contains(PageTableFlags::WRITABLE | PageTableFlags::GLOBAL));
    }

    #[test]
    fn large_address_drops_pat_bit() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x20_0000),
            PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE | PageTableFlags::PAT_LARGE,
        );
        assert_eq!(entry.address().as_u64(), 0x20_1000);
        assert_eq!(entry.large_address(Size2MiB::SIZE).as_u64(), 0x20_0000);
        assert!(!entry.flags().contains(PageTableFlags::PAT_LARGE));
        assert!(entry.large_flags().contains(PageTableFlags::PAT_LARGE | PageTableFlags::HUGE_PAGE));
    }

    #[test]
    fn pat_shares_bit_with_huge_page() {
        assert_eq!(PageTableFlags::PAT.bits(), PageTableFlags::HUGE_PAGE.bits());
    }

    #[test]
    fn unused_table() {
        let mut table = PageTable::new();
        assert!(table.is_unused());
        table.entries[17] = PageTableEntry::new(PhysAddr::new(0x1000), PageTableFlags::PRESENT);
        assert!(!table.is_unused());
        table.entries[17] = table.entries[17].without_present();
        assert!(table.is_unused());
        table.zero();
        assert_eq!(table.entries[17].bits(), 0);
    }

    #[test]
    fn level_indices() {
        let vaddr = VirtAddr::new(0xFFFF_8000_4020_3000);
        let indices: Vec<usize> = Level::ALL.iter().map(|l| l.index_of(vaddr)).collect();
        assert_eq!(indices, [256, 1, 1, 3]);
    }

    #[test]
    fn level_leaf_rules() {
        let table = PageTableEntry::new(PhysAddr::new(0x1000), PageTableFlags::PRESENT);
        let huge = PageTableEntry::new(
            PhysAddr::new(0x20_0000),
            PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE,
        );
        assert!(!Level::Pml4.is_leaf(huge));
        assert!(Level::Pdpt.is_leaf(huge));
        assert!(!Level::Pd.is_leaf(table));
        assert!(Level::Pt.is_leaf(table));
        assert_eq!(Level::Pd.ancestors(), [Level::Pml4, Level::Pdpt]);
        assert_eq!(Level::Pt.next(), None);
        assert_eq!(Level::Pd.page_size(), Some(0x20_0000));
    }
}
