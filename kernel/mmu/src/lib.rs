//! x86_64 virtual-memory core for the Kestrel kernel.
//!
//! Builds, queries and tears down the 4-level page-table hierarchy. The
//! [`Mmu`] context is created once by [`Mmu::init_early`] and owns the
//! measured address widths, the kernel root table and the frame allocator.
//! Root-parameterized operations live on [`PageTables`].
//!
//! Structural changes are serialized by `&mut` borrows only. Callers that
//! share one [`Mmu`] between cores must wrap it in their own lock and deliver
//! any cross-core TLB shootdown themselves; this crate only invalidates the
//! local TLB.

#![cfg_attr(not(test), no_std)]

pub mod address_space;
pub mod arch;
pub mod cpu;
pub mod flags;
pub mod install;
pub mod mmu;
pub mod phys;
pub mod range;
pub mod tables;
pub mod unmap;
pub mod validate;
pub mod walk;

#[cfg(test)]
pub(crate) mod testing;

use core::fmt;

use kestrel_core::paging::{PageSize, PhysFrame};

pub use address_space::{ArchAddressSpace, AspaceFlags};
pub use flags::MmuFlags;
pub use mmu::Mmu;
pub use phys::PhysMap;
pub use range::MapRange;
pub use tables::PageTables;
pub use validate::AddressWidths;
pub use walk::{CheckError, Walk};

/// Standard 4 KiB page size.
pub const PAGE_SIZE: u64 = 4096;

/// Source of zero-or-garbage physical frames for page tables.
///
/// # Safety
///
/// Implementations must return unique, properly-aligned frames that are not
/// in use elsewhere and are visible through the kernel's [`PhysMap`].
pub unsafe trait FrameAllocator<S: PageSize> {
    /// Allocates a single physical frame, returning `None` if out of memory.
    fn allocate_frame(&mut self) -> Option<PhysFrame<S>>;
}

/// Sink for frames released by the MMU.
///
/// # Safety
///
/// Implementations must accept every frame previously handed out by the
/// paired [`FrameAllocator`].
pub unsafe trait FrameDeallocator<S: PageSize> {
    /// Returns a physical frame to the allocator.
    ///
    /// # Safety
    ///
    /// `frame` must have come from the paired allocator and must no longer
    /// be referenced by any page table.
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<S>);
}

/// MMU operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// Misaligned, non-canonical or out-of-range address.
    InvalidArgs,
    /// The walk stopped early, or resolved to something other than expected.
    NotFound,
    /// The frame allocator ran out while creating a table.
    NoMemory,
    /// A large page sits where a table is needed, or the reverse.
    SizeMismatch,
}

impl fmt::Display for MmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgs => write!(f, "invalid address argument"),
            Self::NotFound => write!(f, "mapping not found"),
            Self::NoMemory => write!(f, "out of memory for page tables"),
            Self::SizeMismatch => write!(f, "page size mismatch"),
        }
    }
}

impl core::error::Error for MmuError {}
