//! # Virtual Memory Support
//!
//! x86-64 paging building blocks for the kernel's virtual memory manager.
//!
//! ## What you get
//! - [`PageEntryBits`]: the raw 64-bit entry as a bitfield.
//! - [`PageTable`]: a 4 KiB-aligned table of 512 entries.
//! - [`crawl`] and [`table_of`]: the recursive-mapping arithmetic that turns
//!   any virtual address into the virtual addresses of its page tables.
//! - [`MemoryWindow`]: the seam through which tables and mapped bytes are
//!   reached, with the hardware implementation [`DirectWindow`].
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Each field indexes one level of 512-entry tables. The memory core maps
//! 4 KiB pages only, so every successful walk ends at a PT entry.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod page_entry_bits;
mod page_table;
mod recursive;
mod window;

pub use crate::page_entry_bits::{LeafAttributes, PageEntryBits};
pub use crate::page_table::{ENTRIES_PER_TABLE, PageTable, TableIndex};
pub use crate::recursive::{
    Crawl, PagingLevel, RECURSIVE_INDEX, ROOT_TABLE_ADDRESS, crawl, in_recursive_window, table_of,
};
pub use crate::window::{DirectWindow, MemoryWindow, invalidate_tlb_page};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Align `x` down to the nearest multiple of `a` (a power of two).
///
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a` (a power of two).
///
/// `x + a - 1` must not overflow.
///
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}
