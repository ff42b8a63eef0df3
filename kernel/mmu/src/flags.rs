//! Translation between portable mapping flags and x86_64 entry bits.
//!
//! [`MmuFlags`] is what the VM layer speaks. [`to_hardware`] and
//! [`to_generic`] convert to and from [`PageTableFlags`]. Only bits with a
//! portable meaning survive [`to_generic`], so the round trip is lossy for
//! everything else.

use crate::arch::x86_64::paging::PageTableFlags;

bitflags::bitflags! {
    /// Architecture-independent mapping flags.
    ///
    /// The default (no bits) is a cached, writable, executable, kernel-only
    /// mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MmuFlags: u32 {
        /// Uncached memory.
        const UNCACHED        = 1 << 0;
        /// Uncached device memory.
        const UNCACHED_DEVICE = 1 << 1;
        /// Accessible from user mode.
        const USER            = 1 << 2;
        /// Not writable.
        const READ_ONLY       = 1 << 3;
        /// Not executable.
        const NO_EXECUTE      = 1 << 4;
        /// Both cache-selection bits.
        const CACHE_MASK      = Self::UNCACHED.bits() | Self::UNCACHED_DEVICE.bits();
    }
}

/// Cache policy selected by the [`MmuFlags::CACHE_MASK`] bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Write-back (neither cache bit).
    Cached,
    /// Uncacheable ([`MmuFlags::UNCACHED`] alone).
    Uncached,
    /// Any other combination. No caching bits are written.
    Unspecified,
}

impl MmuFlags {
    /// Returns the cache policy requested by these flags.
    pub const fn cache_mode(self) -> CacheMode {
        let cache = self.bits() & Self::CACHE_MASK.bits();
        if cache == 0 {
            CacheMode::Cached
        } else if cache == Self::UNCACHED.bits() {
            CacheMode::Uncached
        } else {
            CacheMode::Unspecified
        }
    }
}

/// PCD | PWT with PAT clear selects PAT entry 3, uncacheable.
const UNCACHED_BITS: PageTableFlags =
    PageTableFlags::CACHE_DISABLE.union(PageTableFlags::WRITE_THROUGH);

/// Bits compared by `check_mapping`: everything the CPU does not update on
/// its own, plus no-execute.
pub const COMPARE_MASK: PageTableFlags = PageTableFlags::from_bits_truncate(0xF9F)
    .union(PageTableFlags::NO_EXECUTE);

/// Converts portable flags into the permission and caching bits of a leaf.
///
/// PRESENT and GLOBAL are not part of the result, see [`leaf_flags`].
pub fn to_hardware(flags: MmuFlags) -> PageTableFlags {
    let mut hw = PageTableFlags::empty();
    match flags.cache_mode() {
        CacheMode::Cached => {
            hw.remove(PageTableFlags::PAT | UNCACHED_BITS);
        }
        CacheMode::Uncached => {
            hw.remove(PageTableFlags::PAT);
            hw.insert(UNCACHED_BITS);
        }
        CacheMode::Unspecified => {}
    }
    if !flags.contains(MmuFlags::READ_ONLY) {
        hw |= PageTableFlags::WRITABLE;
    }
    if flags.contains(MmuFlags::USER) {
        hw |= PageTableFlags::USER;
    }
    if flags.contains(MmuFlags::NO_EXECUTE) {
        hw |= PageTableFlags::NO_EXECUTE;
    }
    hw
}

/// Recovers portable flags from the bits of a 4 KiB leaf.
pub fn to_generic(hw: PageTableFlags) -> MmuFlags {
    let mut flags = MmuFlags::empty();
    if !hw.contains(PageTableFlags::WRITABLE) {
        flags |= MmuFlags::READ_ONLY;
    }
    if hw.contains(PageTableFlags::USER) {
        flags |= MmuFlags::USER;
    }
    if hw.contains(UNCACHED_BITS) && !hw.contains(PageTableFlags::PAT) {
        flags |= MmuFlags::UNCACHED;
    }
    if hw.contains(PageTableFlags::NO_EXECUTE) {
        flags |= MmuFlags::NO_EXECUTE;
    }
    flags
}

/// Rewrites 4 KiB leaf bits for a 2 MiB or 1 GiB leaf: the PAT selector
/// moves from bit 7 to bit 12 and bit 7 becomes the page-size bit.
pub fn to_large(hw: PageTableFlags) -> PageTableFlags {
    let mut large = hw;
    if large.contains(PageTableFlags::PAT) {
        large.insert(PageTableFlags::PAT_LARGE);
    }
    large | PageTableFlags::HUGE_PAGE
}

/// Inverse of [`to_large`]: returns the bits a 4 KiB leaf with the same
/// attributes would carry.
pub fn from_large(hw: PageTableFlags) -> PageTableFlags {
    let mut small = hw - PageTableFlags::HUGE_PAGE - PageTableFlags::PAT_LARGE;
    if hw.contains(PageTableFlags::PAT_LARGE) {
        small.insert(PageTableFlags::PAT);
    }
    small
}

/// Final bits of a leaf entry: present, and global unless user-accessible.
pub fn leaf_flags(hw: PageTableFlags) -> PageTableFlags {
    let mut leaf = hw | PageTableFlags::PRESENT;
    if !hw.contains(PageTableFlags::USER) {
        leaf |= PageTableFlags::GLOBAL;
    }
    leaf
}

/// Bits of a table-pointer entry created above a leaf with bits `leaf`.
///
/// Always present and writable. Access is restricted only at the leaf, so
/// a later sibling mapping under the same table is never hidden.
pub fn table_link_flags(leaf: PageTableFlags) -> PageTableFlags {
    let mut link = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
    if leaf.contains(PageTableFlags::USER) {
        link |= PageTableFlags::USER;
    } else {
        link |= PageTableFlags::GLOBAL;
    }
    link
}
