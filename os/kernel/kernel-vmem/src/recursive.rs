//! # Recursive Page-Table Mapping
//!
//! Root slot [`RECURSIVE_INDEX`] points back at the root table. Any walk that
//! enters through that slot stops one level early, so the page tables
//! themselves become ordinary pages at fixed virtual addresses:
//!
//! ```text
//! address of the PT for va    = [510][pml4][pdpt][pd] << 12
//! address of the PD for va    = [510][510][pml4][pdpt] << 12
//! address of the PDPT for va  = [510][510][510][pml4] << 12
//! address of the PML4         = [510][510][510][510] << 12 = 0xFFFF_FF7F_BFDF_E000
//! ```
//!
//! Each step is the same shift-and-mask, so one function ([`table_of`])
//! derives every level from the one below it. [`crawl`] applies it for all
//! levels at once.

use crate::page_table::TableIndex;
use kernel_info::memory::{RECURSIVE_WINDOW_BASE, ROOT_SLOT_SPAN};
use kernel_memory_addresses::VirtualAddress;

pub use kernel_info::memory::RECURSIVE_INDEX;

/// Bits of a shifted address that survive into a table address.
const TABLE_ADDRESS_MASK: u64 = 0x0000_007F_FFFF_F000;

/// Virtual address of the root table through the recursive slot.
pub const ROOT_TABLE_ADDRESS: VirtualAddress = VirtualAddress::new(0xFFFF_FF7F_BFDF_E000);

/// Position in the translation hierarchy.
///
/// `Page` is the mapped page itself; the other levels name the table that
/// holds the entry for the level below.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PagingLevel {
    Page = 0,
    Pt = 1,
    Pd = 2,
    Pdpt = 3,
    Pml4 = 4,
}

impl PagingLevel {
    /// All levels from the page up to the root.
    pub const ALL: [Self; 5] = [Self::Page, Self::Pt, Self::Pd, Self::Pdpt, Self::Pml4];

    /// Table levels from the root down to the leaf table.
    pub const TABLES_TOP_DOWN: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    /// Bit position of this level's 9-bit index inside a virtual address.
    #[inline]
    #[must_use]
    pub const fn index_shift(self) -> u32 {
        match self {
            Self::Page => 0,
            Self::Pt => 12,
            Self::Pd => 21,
            Self::Pdpt => 30,
            Self::Pml4 => 39,
        }
    }

    /// Index into this level's table used when translating `va`.
    ///
    /// The page level has no table; its index is always zero.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        match self {
            Self::Page => TableIndex::from_bits(0),
            _ => TableIndex::from_bits(va.as_u64() >> self.index_shift()),
        }
    }

    /// The next level towards the leaf, if any.
    #[inline]
    #[must_use]
    pub const fn below(self) -> Option<Self> {
        match self {
            Self::Page => None,
            Self::Pt => Some(Self::Page),
            Self::Pd => Some(Self::Pt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pml4 => Some(Self::Pdpt),
        }
    }

    /// The level whose table holds the entry pointing at this one.
    #[inline]
    #[must_use]
    pub const fn above(self) -> Option<Self> {
        match self {
            Self::Page => Some(Self::Pt),
            Self::Pt => Some(Self::Pd),
            Self::Pd => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pml4),
            Self::Pml4 => None,
        }
    }
}

/// Virtual address of the table whose entries map `va`, one level up.
///
/// Applied to a data address this yields its PT; applied to a PT address it
/// yields the PD, and so on.
#[inline]
#[must_use]
pub const fn table_of(va: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(RECURSIVE_WINDOW_BASE | ((va.as_u64() >> 9) & TABLE_ADDRESS_MASK))
}

/// Whether `va` lies inside the recursive window.
#[inline]
#[must_use]
pub const fn in_recursive_window(va: VirtualAddress) -> bool {
    let a = va.as_u64();
    a >= RECURSIVE_WINDOW_BASE && a < RECURSIVE_WINDOW_BASE + ROOT_SLOT_SPAN
}

/// Per-level table addresses and indices for one virtual address.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Crawl {
    pub address: VirtualAddress,
    pub canonical: bool,
    tables: [VirtualAddress; 5],
    indices: [TableIndex; 5],
}

impl Crawl {
    /// Recursive address of the table at `level` (the page base for [`PagingLevel::Page`]).
    #[inline]
    #[must_use]
    pub const fn table(&self, level: PagingLevel) -> VirtualAddress {
        self.tables[level.as_usize()]
    }

    /// Entry index used at `level`.
    #[inline]
    #[must_use]
    pub const fn index(&self, level: PagingLevel) -> TableIndex {
        self.indices[level.as_usize()]
    }
}

/// Computes every level's table address and index for `address`.
#[must_use]
pub const fn crawl(address: VirtualAddress) -> Crawl {
    let page = VirtualAddress::new(address.as_u64() & !0xFFF);
    let pt = table_of(address);
    let pd = table_of(pt);
    let pdpt = table_of(pd);
    let pml4 = table_of(pdpt);

    Crawl {
        address,
        canonical: address.is_canonical(),
        tables: [page, pt, pd, pdpt, pml4],
        indices: [
            PagingLevel::Page.index_of(address),
            PagingLevel::Pt.index_of(address),
            PagingLevel::Pd.index_of(address),
            PagingLevel::Pdpt.index_of(address),
            PagingLevel::Pml4.index_of(address),
        ],
    }
}
