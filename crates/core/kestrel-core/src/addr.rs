//! Typed virtual and physical address wrappers.
//!
//! [`VirtAddr`] and [`PhysAddr`] keep the two address spaces apart at the
//! type level. Neither type enforces an architectural width: the number of
//! implemented virtual and physical bits is a property of the running CPU
//! and is checked by the MMU layer against the measured widths.

use core::fmt;
use core::ops::{Add, Sub};

/// A 64-bit virtual address.
///
/// The raw value is kept as-is. Whether it is canonical depends on the
/// linear-address width reported by the processor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

/// A 64-bit physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

/// Mask for the 12-bit page offset (bits 0..11).
const PAGE_OFFSET_MASK: u64 = 0xFFF;

/// Mask for a 9-bit page table index (used by all paging levels).
const PAGE_TABLE_INDEX_MASK: u64 = 0x1FF;

impl VirtAddr {
    /// Wraps a raw virtual address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if the address is aligned to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0 & !(align - 1))
    }

    /// Returns the offset of this address within a region of `align` bytes.
    #[inline]
    pub const fn offset_in(self, align: u64) -> u64 {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1)
    }

    /// Returns the 4 KiB page offset (bits 0..11).
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    /// Returns the 9-bit table index selected by the bits starting at `shift`.
    #[inline]
    pub const fn table_index(self, shift: u32) -> usize {
        ((self.0 >> shift) & PAGE_TABLE_INDEX_MASK) as usize
    }

    /// Returns the PML4 table index (bits 39..47).
    #[inline]
    pub const fn pml4_index(self) -> usize {
        self.table_index(39)
    }

    /// Returns the Page Directory Pointer Table index (bits 30..38).
    #[inline]
    pub const fn pdpt_index(self) -> usize {
        self.table_index(30)
    }

    /// Returns the Page Directory index (bits 21..29).
    #[inline]
    pub const fn pd_index(self) -> usize {
        self.table_index(21)
    }

    /// Returns the Page Table index (bits 12..20).
    #[inline]
    pub const fn pt_index(self) -> usize {
        self.table_index(12)
    }
}

impl Add<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for VirtAddr {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: u64) -> Self {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: VirtAddr) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// PhysAddr
// ---------------------------------------------------------------------------

impl PhysAddr {
    /// Wraps a raw physical address.
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the zero address.
    #[inline]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the raw `u64` value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns `true` if the address is aligned to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to `align`.
    ///
    /// `align` must be a power of two.
    #[inline]
    pub const fn align_down(self, align: u64) -> Self {
        debug_assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0 & !(align - 1))
    }
}

impl Add<u64> for PhysAddr {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<PhysAddr> for PhysAddr {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: PhysAddr) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
