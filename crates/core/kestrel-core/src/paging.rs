//! Page size traits and typed page/frame abstractions.
//!
//! [`Page<S>`] and [`PhysFrame<S>`] are parameterised over a [`PageSize`] so
//! that a 2 MiB frame cannot be handed to code expecting a 4 KiB one.

use core::fmt;
use core::iter::FusedIterator;
use core::marker::PhantomData;

use crate::addr::{PhysAddr, VirtAddr};

/// Trait for page sizes (4 KiB, 2 MiB, 1 GiB).
pub trait PageSize: Copy + Eq + PartialOrd + Ord {
    /// The size in bytes.
    const SIZE: u64;
    /// Human-readable size string for debug output.
    const SIZE_AS_DEBUG_STR: &'static str;
}

/// 4 KiB page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size4KiB;

impl PageSize for Size4KiB {
    const SIZE: u64 = 0x1000;
    const SIZE_AS_DEBUG_STR: &'static str = "4KiB";
}

/// 2 MiB page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size2MiB;

impl PageSize for Size2MiB {
    const SIZE: u64 = 0x20_0000;
    const SIZE_AS_DEBUG_STR: &'static str = "2MiB";
}

/// 1 GiB page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Size1GiB;

impl PageSize for Size1GiB {
    const SIZE: u64 = 0x4000_0000;
    const SIZE_AS_DEBUG_STR: &'static str = "1GiB";
}

/// Error type returned when an address is not aligned to the page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressNotAligned;

impl fmt::Display for AddressNotAligned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("address is not aligned to the page size")
    }
}

// ---------------------------------------------------------------------------
// Page<S>
// ---------------------------------------------------------------------------

/// A virtual memory page of size `S`.
///
/// The start address is always aligned to `S::SIZE`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Page<S: PageSize> {
    start: VirtAddr,
    _marker: PhantomData<S>,
}

impl<S: PageSize> Page<S> {
    /// Returns the page that contains `addr`.
    #[inline]
    pub fn containing_address(addr: VirtAddr) -> Self {
        Self {
            start: addr.align_down(S::SIZE),
            _marker: PhantomData,
        }
    }

    /// Creates a page from an already-aligned start address.
    #[inline]
    pub fn from_start_address(addr: VirtAddr) -> Result<Self, AddressNotAligned> {
        if !addr.is_aligned(S::SIZE) {
            return Err(AddressNotAligned);
        }
        Ok(Self {
            start: addr,
            _marker: PhantomData,
        })
    }

    /// Returns the start address of this page.
    #[inline]
    pub const fn start_address(&self) -> VirtAddr {
        self.start
    }

    /// Returns `count` consecutive pages beginning with `self`.
    ///
    /// The run wraps at the top of the 64-bit space the same way address
    /// arithmetic does.
    #[inline]
    pub fn run(self, count: u64) -> PageRun<S> {
        PageRun {
            next: self,
            remaining: count,
        }
    }
}

impl<S: PageSize> fmt::Debug for Page<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Page[{}]({:#x})", S::SIZE_AS_DEBUG_STR, self.start.as_u64())
    }
}

/// Iterator over a run of consecutive pages, see [`Page::run`].
#[derive(Clone)]
pub struct PageRun<S: PageSize> {
    next: Page<S>,
    remaining: u64,
}

impl<S: PageSize> Iterator for PageRun<S> {
    type Item = Page<S>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let page = self.next;
        self.remaining -= 1;
        self.next = Page {
            start: page.start + S::SIZE,
            _marker: PhantomData,
        };
        Some(page)
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (n, usize::try_from(self.remaining).ok())
    }
}

impl<S: PageSize> FusedIterator for PageRun<S> {}

// ---------------------------------------------------------------------------
// PhysFrame<S>
// ---------------------------------------------------------------------------

/// A physical memory frame of size `S`.
///
/// The start address is always aligned to `S::SIZE`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame<S: PageSize> {
    start: PhysAddr,
    _marker: PhantomData<S>,
}

impl<S: PageSize> PhysFrame<S> {
    /// Returns the frame that contains `addr`.
    #[inline]
    pub fn containing_address(addr: PhysAddr) -> Self {
        Self {
            start: addr.align_down(S::SIZE),
            _marker: PhantomData,
        }
    }

    /// Creates a frame from an already-aligned start address.
    #[inline]
    pub fn from_start_address(addr: PhysAddr) -> Result<Self, AddressNotAligned> {
        if !addr.is_aligned(S::SIZE) {
            return Err(AddressNotAligned);
        }
        Ok(Self {
            start: addr,
            _marker: PhantomData,
        })
    }

    /// Returns the start address of this frame.
    #[inline]
    pub const fn start_address(&self) -> PhysAddr {
        self.start
    }

    /// Returns the frame size in bytes.
    #[inline]
    pub const fn size(&self) -> u64 {
        S::SIZE
    }
}

impl<S: PageSize> fmt::Debug for PhysFrame<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysFrame[{}]({:#x})",
            S::SIZE_AS_DEBUG_STR,
            self.start.as_u64()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_containing_address_aligns_down() {
        let page = Page::<Size4KiB>::containing_address(VirtAddr::new(0x1234));
        assert_eq!(page.start_address().as_u64(), 0x1000);
    }

    #[test]
    fn page_from_unaligned_start_rejected() {
        assert_eq!(
            Page::<Size2MiB>::from_start_address(VirtAddr::new(0x1000)),
            Err(AddressNotAligned)
        );
        assert!(Page::<Size2MiB>::from_start_address(VirtAddr::new(0x40_0000)).is_ok());
    }

    #[test]
    fn run_yields_consecutive_pages() {
        let start = Page::<Size4KiB>::containing_address(VirtAddr::new(0x10_0000));
        let starts: Vec<u64> = start.run(3).map(|p| p.start_address().as_u64()).collect();
        assert_eq!(starts, [0x10_0000, 0x10_1000, 0x10_2000]);
    }

    #[test]
    fn empty_run() {
        let start = Page::<Size4KiB>::containing_address(VirtAddr::new(0));
        assert_eq!(start.run(0).count(), 0);
    }

    #[test]
    fn frame_alignment_and_size() {
        let frame = PhysFrame::<Size2MiB>::containing_address(PhysAddr::new(0x21_2345));
        assert_eq!(frame.start_address().as_u64(), 0x20_0000);
        assert_eq!(frame.size(), 0x20_0000);
        assert!(PhysFrame::<Size4KiB>::from_start_address(PhysAddr::new(0x1001)).is_err());
    }

    #[test]
    fn debug_names_size() {
        let frame = PhysFrame::<Size1GiB>::containing_address(PhysAddr::new(0x4000_0000));
        assert_eq!(format!("{frame:?}"), "PhysFrame[1GiB](0x40000000)");
    }
}
