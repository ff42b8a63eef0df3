//! x86_64 paging structures, registers and instructions.

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub mod instructions;
pub mod paging;
pub mod registers;
