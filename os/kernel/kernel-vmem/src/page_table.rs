//! # Memory Page Table

use crate::page_entry_bits::PageEntryBits;

/// Entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Index of an entry inside one table (`0..512`).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Builds an index from the low 9 bits of `raw`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_bits(raw: u64) -> Self {
        Self((raw & 0x1FF) as u16)
    }

    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Option<Self> {
        if index < ENTRIES_PER_TABLE {
            Some(Self::from_bits(index as u64))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// One 4 KiB page-table at any level of the hierarchy.
#[repr(C, align(4096))]
#[derive(Clone)]
pub struct PageTable {
    entries: [PageEntryBits; ENTRIES_PER_TABLE],
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl PageTable {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntryBits::new(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntryBits::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: TableIndex) -> PageEntryBits {
        self.entries[index.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, index: TableIndex, entry: PageEntryBits) {
        self.entries[index.as_usize()] = entry;
    }

    #[inline]
    pub const fn clear(&mut self, index: TableIndex) {
        self.set(index, PageEntryBits::new());
    }

    /// True when no entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.entries.iter().any(PageEntryBits::present)
    }

    /// Present entries with their indices.
    pub fn present_entries(&self) -> impl Iterator<Item = (TableIndex, PageEntryBits)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.present())
            .map(|(i, e)| (TableIndex::from_bits(i as u64), *e))
    }
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};
