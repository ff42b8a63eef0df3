//! Core types for the Kestrel kernel: typed addresses, page/frame sizes and
//! the kernel logging macros.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod log;
pub mod paging;
