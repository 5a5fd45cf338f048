//! # Memory Windows
//!
//! The page-table code never dereferences raw addresses itself. It asks a
//! [`MemoryWindow`] for the table or byte range it needs, which lets the same
//! code run against the live MMU ([`DirectWindow`]) and against a simulated
//! one in tests.

use crate::page_table::PageTable;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress, VirtualPage};

/// Access to page tables and mapped memory in the current address space.
pub trait MemoryWindow {
    /// Table stored in physical frame `frame`, reached through the boot
    /// identity map.
    ///
    /// # Safety
    /// `frame` must hold a page table and be identity mapped. The caller must
    /// not create a second live reference to the same table.
    unsafe fn table_at_physical<'a>(&self, frame: PhysicalPage<Size4K>) -> &'a mut PageTable;

    /// Table mapped at virtual address `table`, typically a recursive-window
    /// address.
    ///
    /// # Safety
    /// `table` must be mapped and refer to a page table; no other live
    /// reference to it may exist.
    unsafe fn table_at_virtual<'a>(&self, table: VirtualAddress) -> &'a mut PageTable;

    /// `len` mapped, writable bytes starting at `start`.
    ///
    /// # Safety
    /// The whole range must be mapped writable and not aliased.
    unsafe fn bytes_at_virtual<'a>(&self, start: VirtualAddress, len: usize) -> &'a mut [u8];

    /// Drops any cached translation for `page`.
    fn invalidate(&self, page: VirtualPage<Size4K>);
}

/// The hardware window: addresses are dereferenced as-is.
#[derive(Copy, Clone, Debug, Default)]
pub struct DirectWindow;

impl MemoryWindow for DirectWindow {
    unsafe fn table_at_physical<'a>(&self, frame: PhysicalPage<Size4K>) -> &'a mut PageTable {
        let ptr = frame.base().as_u64() as *mut PageTable;
        // SAFETY: identity mapped per the caller contract.
        unsafe { &mut *ptr }
    }

    unsafe fn table_at_virtual<'a>(&self, table: VirtualAddress) -> &'a mut PageTable {
        // SAFETY: mapped per the caller contract.
        unsafe { &mut *table.as_mut_ptr::<PageTable>() }
    }

    unsafe fn bytes_at_virtual<'a>(&self, start: VirtualAddress, len: usize) -> &'a mut [u8] {
        // SAFETY: mapped and writable per the caller contract.
        unsafe { core::slice::from_raw_parts_mut(start.as_mut_ptr::<u8>(), len) }
    }

    #[inline]
    fn invalidate(&self, page: VirtualPage<Size4K>) {
        invalidate_tlb_page(page);
    }
}

/// Invalidate the TLB entry for `page` on this CPU.
#[cfg(target_arch = "x86_64")]
#[inline]
pub fn invalidate_tlb_page(page: VirtualPage<Size4K>) {
    // SAFETY: invlpg only drops a cached translation.
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) page.base().as_u64(),
            options(nostack, preserves_flags)
        );
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
pub const fn invalidate_tlb_page(_page: VirtualPage<Size4K>) {}
