use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// A raw 64-bit x86-64 page-table entry.
///
/// The same layout is used at every level (PML4E, PDPTE, PDE, PTE); the
/// memory core only ever writes 4 KiB leaves and next-level links, and treats
/// a set `large_page` bit on the walk path as foreign.
///
/// | Bits  | Field            |
/// |-------|------------------|
/// | 0     | present          |
/// | 1     | writable         |
/// | 2     | user_access      |
/// | 3     | write_through    |
/// | 4     | cache_disabled   |
/// | 5     | accessed         |
/// | 6     | dirty            |
/// | 7     | large_page (PS)  |
/// | 8     | global           |
/// | 9–11  | OS available     |
/// | 12–51 | frame address    |
/// | 52–58 | OS available     |
/// | 59–62 | protection key   |
/// | 63    | no_execute       |
///
/// ```rust
/// # use kernel_memory_addresses::PhysicalAddress;
/// # use kernel_vmem::PageEntryBits;
/// let e = PageEntryBits::table_link(PhysicalAddress::new(0x7000).page());
/// assert!(e.present() && e.writable());
/// assert_eq!(e.physical_address().as_u64(), 0x7000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    /// Set by the CPU on access.
    pub accessed: bool,
    /// Set by the CPU on write (leaf only).
    pub dirty: bool,
    /// PS: the entry maps a 2 MiB or 1 GiB page instead of pointing at a table.
    pub large_page: bool,
    pub global_translation: bool,
    #[bits(3)]
    pub os_available_low: u8,
    /// Physical address bits [51:12].
    #[bits(40)]
    phys_addr_bits_51_12: u64,
    #[bits(7)]
    pub os_available_high: u8,
    #[bits(4)]
    pub protection_key: u8,
    pub no_execute: bool,
}

/// Attributes a leaf mapping may carry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct LeafAttributes {
    pub writable: bool,
    pub cache_disabled: bool,
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage<Size4K> {
        self.physical_address().page::<Size4K>()
    }

    /// Link to a next-level table. Permissions are decided at the leaf.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalPage<Size4K>) -> Self {
        let mut e = Self::new().with_present(true).with_writable(true);
        e.set_physical_address(table.base());
        e
    }

    /// Leaf mapping of one 4 KiB frame.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage<Size4K>, attributes: LeafAttributes) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(attributes.writable)
            .with_cache_disabled(attributes.cache_disabled)
            .with_no_execute(attributes.no_execute);
        e.set_physical_address(frame.base());
        e
    }

    #[inline]
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }
}
