//! # Kernel Boot Information
//!
//! What the boot stage hands to the memory core: a physical memory map and a
//! set of facts about where it placed the kernel and its page tables.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Type tag of a [`MemoryMapEntry`].
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionType {
    /// RAM free for the kernel to use.
    Usable = 1,
    Reserved = 2,
    AcpiReclaimable = 3,
    AcpiNvs = 4,
    /// Defective RAM.
    Bad = 5,
    /// Synthetic gap-filler between reported ranges.
    Hole = 10,
}

impl RegionType {
    /// Decodes a raw tag; unknown values yield `None`.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Usable),
            2 => Some(Self::Reserved),
            3 => Some(Self::AcpiReclaimable),
            4 => Some(Self::AcpiNvs),
            5 => Some(Self::Bad),
            10 => Some(Self::Hole),
            _ => None,
        }
    }
}

/// One record of the physical memory map.
///
/// Keep this `#[repr(C)]`; the loader writes an array of these.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub region_type: u32,
    pub extended_attributes: u32,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, region_type: RegionType) -> Self {
        Self {
            base,
            length,
            region_type: region_type as u32,
            extended_attributes: 0,
        }
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn region(&self) -> Option<RegionType> {
        RegionType::from_raw(self.region_type)
    }

    /// Only [`RegionType::Usable`] memory may be handed out; unknown tags are not usable.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.region(), Some(RegionType::Usable))
    }
}

/// A physical byte range `[base, base + length)`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PhysicalRange {
    pub base: PhysicalAddress,
    pub length: u64,
}

impl PhysicalRange {
    #[must_use]
    pub const fn new(base: u64, length: u64) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            length,
        }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.as_u64() + self.length
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Facts about the running kernel that the loader established.
///
/// The lower half of the kernel image is identity mapped; the higher half is
/// mapped at [`higher_half_virtual`](Self::higher_half_virtual). Everything
/// below [`identity_map_end`](Self::identity_map_end) is identity mapped with
/// 4 KiB pages by the boot page tables rooted at
/// [`root_table`](Self::root_table).
#[derive(Copy, Clone, Debug)]
pub struct KernelLayout<'a> {
    /// Physical address of the active root (PML4) table.
    pub root_table: PhysicalAddress,
    /// Maximum linear address width reported by the CPU.
    pub linear_address_bits: u8,
    /// Maximum physical address width reported by the CPU.
    pub physical_address_bits: u8,
    /// Physical extent of the kernel's identity-mapped lower half.
    pub lower_half: PhysicalRange,
    /// Physical extent of the kernel's higher half.
    pub higher_half: PhysicalRange,
    /// Virtual base the higher half runs at.
    pub higher_half_virtual: VirtualAddress,
    /// End of the boot identity map.
    pub identity_map_end: u64,
    /// Low-memory window that stays identity mapped for real-mode helpers.
    pub scratch_window: PhysicalRange,
    /// First physical byte free for the allocator's own bookkeeping.
    pub usable_memory_start: PhysicalAddress,
    /// Regions the boot stage still occupies (stacks, loader data).
    pub bootstrap_regions: &'a [PhysicalRange],
    /// Constructors to run once the heap exists.
    pub global_constructors: &'a [fn()],
}
