//! Read-only translation of a virtual address through a hierarchy.

use core::fmt;

use kestrel_core::addr::{PhysAddr, VirtAddr};
#[cfg(kestrel_mmu_trace)]
use kestrel_core::ktrace;

use crate::arch::x86_64::paging::{Level, PageTableEntry, PageTableFlags};
use crate::cpu::Cpu;
use crate::flags::{self, MmuFlags};
use crate::phys::PhysMap;
use crate::tables::PageTables;
use crate::MmuError;

/// Outcome of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// The address is mapped.
    Resolved {
        /// Translated address, including the offset within the page.
        phys: PhysAddr,
        /// Portable flags of the leaf.
        flags: MmuFlags,
        /// Level holding the leaf: `Pt` for 4 KiB, `Pd` for 2 MiB, `Pdpt`
        /// for 1 GiB.
        level: Level,
    },
    /// The entry at `level` is not present.
    Stopped {
        /// Level whose entry is missing.
        level: Level,
        /// The table at that level, i.e. where a new table would be linked.
        table: PhysAddr,
    },
}

impl Walk {
    /// Returns the translated address and flags, if resolved.
    pub fn resolved(self) -> Option<(PhysAddr, MmuFlags)> {
        match self {
            Self::Resolved { phys, flags, .. } => Some((phys, flags)),
            Self::Stopped { .. } => None,
        }
    }
}

/// Walks the hierarchy rooted at `root` for `vaddr`.
///
/// Never fails: a missing entry is reported as [`Walk::Stopped`].
///
/// # Safety
///
/// `root` must be a valid PML4 visible through `phys`, and every present
/// table entry beneath it must name a table visible through `phys`.
pub unsafe fn walk(phys: &PhysMap, root: PhysAddr, vaddr: VirtAddr) -> Walk {
    let mut level = Level::Pml4;
    let mut table = root;
    loop {
        // SAFETY: Caller guarantees `table` is a reachable page table.
        let entry = unsafe { phys.table_at(table) }.entries[level.index_of(vaddr)];
        #[cfg(kestrel_mmu_trace)]
        ktrace!("walk {} {}: {:?}", vaddr, level, entry);
        if !entry.is_present() {
            return Walk::Stopped { level, table };
        }
        match level.next() {
            Some(next) if !level.is_leaf(entry) => {
                table = entry.address();
                level = next;
            }
            _ => return resolve(level, entry, vaddr),
        }
    }
}

fn resolve(level: Level, entry: PageTableEntry, vaddr: VirtAddr) -> Walk {
    let (phys, hw) = match level.page_size() {
        Some(size) if level != Level::Pt => (
            entry.large_address(size) + vaddr.offset_in(size),
            flags::from_large(entry.large_flags()),
        ),
        _ => (entry.address() + vaddr.page_offset(), entry.flags()),
    };
    Walk::Resolved {
        phys,
        flags: flags::to_generic(hw),
        level,
    }
}

// ---------------------------------------------------------------------------
// Mapping checks
// ---------------------------------------------------------------------------

/// Why [`PageTables::check_mapping`] rejected a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// An address failed validation.
    InvalidArgs,
    /// The walk stopped at `level`.
    NotMapped {
        /// Level whose entry is missing.
        level: Level,
    },
    /// The address is mapped to a different frame.
    AddressMismatch {
        /// Address the walk resolved to.
        found: PhysAddr,
    },
    /// The address is mapped to the expected frame with different flags.
    FlagsMismatch {
        /// Hardware bits that differ.
        differing: PageTableFlags,
    },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgs => write!(f, "invalid address argument"),
            Self::NotMapped { level } => write!(f, "not mapped: {level} entry missing"),
            Self::AddressMismatch { found } => write!(f, "mapped to {found}"),
            Self::FlagsMismatch { differing } => {
                write!(f, "flags differ: {:#x}", differing.bits())
            }
        }
    }
}

impl From<CheckError> for MmuError {
    fn from(err: CheckError) -> Self {
        match err {
            CheckError::InvalidArgs => MmuError::InvalidArgs,
            _ => MmuError::NotFound,
        }
    }
}

impl<C: Cpu, A> PageTables<'_, C, A> {
    /// Walks the hierarchy rooted at `root` for `vaddr`.
    ///
    /// # Safety
    ///
    /// `root` must be a valid PML4 reachable through this view's window.
    pub unsafe fn walk(&self, root: PhysAddr, vaddr: VirtAddr) -> Walk {
        // SAFETY: Forwarded caller contract.
        unsafe { walk(&self.phys, root, vaddr) }
    }

    /// Succeeds only if `vaddr` maps exactly `paddr` with `expected` flags.
    ///
    /// Flags are compared in their hardware encoding, ignoring the bits the
    /// processor sets on its own.
    ///
    /// # Safety
    ///
    /// `root` must be a valid PML4 reachable through this view's window.
    pub unsafe fn check_mapping(
        &self,
        root: PhysAddr,
        paddr: PhysAddr,
        vaddr: VirtAddr,
        expected: MmuFlags,
    ) -> Result<(), CheckError> {
        if !self.widths.check_vaddr(vaddr) || !self.widths.check_paddr(paddr) {
            return Err(CheckError::InvalidArgs);
        }
        // SAFETY: Forwarded caller contract.
        let (found, actual) = match unsafe { self.walk(root, vaddr) } {
            Walk::Resolved { phys, flags, .. } => (phys, flags),
            Walk::Stopped { level, .. } => return Err(CheckError::NotMapped { level }),
        };
        if found != paddr {
            return Err(CheckError::AddressMismatch { found });
        }
        let differing =
            (flags::to_hardware(expected) ^ flags::to_hardware(actual)) & flags::COMPARE_MASK;
        if differing.is_empty() {
            Ok(())
        } else {
            Err(CheckError::FlagsMismatch { differing })
        }
    }
}
