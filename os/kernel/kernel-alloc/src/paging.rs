//! # Page-Table Editing Through the Recursive Window
//!
//! Once root slot 510 points at the root table, every table of the active
//! address space is reachable at a fixed virtual address, so no physical
//! mapping of the tables is needed:
//!
//! ```text
//! map:   PML4 ─► PDPT ─► PD ─► PT ─► leaf
//!         │       │       │
//!         └───────┴───────┴─ missing links get a fresh, zeroed frame
//!
//! unmap: leaf cleared ─► PT empty? ─► PD empty? ─► PDPT empty?
//!                         free + unlink, stop at the first table still in use
//! ```

use crate::fatal::{Fatal, halt};
use crate::physical::PhysicalAllocator;
use crate::request::{PageFlags, PageState};
use kernel_info::memory::{PAGE_SIZE, RECURSIVE_WINDOW_BASE, ROOT_SLOT_SPAN};
use kernel_memory_addresses::{LOWER_HALF_END, PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{
    Crawl, MemoryWindow, PageEntryBits, PageTable, PagingLevel, RECURSIVE_INDEX,
    ROOT_TABLE_ADDRESS, TableIndex, crawl, in_recursive_window,
};
use log::trace;

/// Inspection result for one level of a translation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CrawlLevel {
    pub level: PagingLevel,
    /// Recursive address of the table at this level; the page base at level 0.
    pub table: VirtualAddress,
    /// Entry index used at this level.
    pub index: TableIndex,
    pub present: bool,
    /// Frame of this level's table, or the mapped frame at level 0.
    pub physical: Option<PhysicalAddress>,
    pub cache_disabled: bool,
}

/// Every level of the translation of [`address`](Self::address).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CrawlResult {
    pub address: VirtualAddress,
    pub canonical: bool,
    pub levels: [CrawlLevel; 5],
}

impl CrawlResult {
    #[inline]
    #[must_use]
    pub const fn level(&self, level: PagingLevel) -> &CrawlLevel {
        &self.levels[level.as_usize()]
    }

    /// Physical address `address` translates to, if mapped.
    #[must_use]
    pub fn translate(&self) -> Option<PhysicalAddress> {
        let page = self.level(PagingLevel::Page);
        if !page.present {
            return None;
        }
        page.physical.map(|pa| pa + self.address.offset::<Size4K>())
    }
}

/// Mutable view of the active page tables, paired with the frame allocator
/// that backs new tables.
pub struct PageTables<'a, W> {
    pub window: &'a W,
    pub physical: &'a mut PhysicalAllocator,
}

impl<W: MemoryWindow> PageTables<'_, W> {
    /// Maps `count` pages at `va` to consecutive frames starting at `pa`.
    ///
    /// Returns `false` without touching anything if an address is unaligned,
    /// the range is empty, wraps, leaves its canonical half, or the physical
    /// range overflows.
    pub fn map_pages(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: u64,
        flags: PageFlags,
    ) -> bool {
        let Some(last) = last_page(va, count) else {
            return false;
        };
        let pa_end = count
            .checked_mul(PAGE_SIZE)
            .and_then(|bytes| pa.as_u64().checked_add(bytes));
        if !pa.is_aligned::<Size4K>() || pa_end.is_none() {
            return false;
        }
        if touches_recursive_window(va, last) {
            halt(Fatal::RecursiveWindow(va));
        }

        let attributes = flags.leaf_attributes();
        for i in 0..count {
            let page = va + i * PAGE_SIZE;
            let frame = (pa + i * PAGE_SIZE).page::<Size4K>();
            let c = crawl(page);
            self.ensure_tables(&c);

            // SAFETY: ensure_tables made the PT present.
            let pt = unsafe { self.table(&c, PagingLevel::Pt) };
            pt.set(c.index(PagingLevel::Pt), PageEntryBits::leaf(frame, attributes));
            self.window.invalidate(page.page());
        }

        trace!("paging: mapped {count} pages {va} -> {pa}");
        true
    }

    /// Removes up to `count` mappings starting at `va`.
    ///
    /// Non-canonical and unmapped pages are skipped. With `free_physical` the
    /// mapped frames go back to the physical allocator. Tables left empty are
    /// freed bottom-up.
    pub fn unmap_pages(&mut self, va: VirtualAddress, count: u64, free_physical: bool) {
        for i in 0..count {
            let Some(page) = va.checked_add(i * PAGE_SIZE) else {
                break;
            };
            if !page.is_canonical() {
                continue;
            }
            if in_recursive_window(page) {
                halt(Fatal::RecursiveWindow(page));
            }

            let c = crawl(page);
            if !self.leaf_table_present(&c) {
                continue;
            }

            // SAFETY: the PT is present.
            let pt = unsafe { self.table(&c, PagingLevel::Pt) };
            let entry = pt.get(c.index(PagingLevel::Pt));
            if !entry.present() {
                continue;
            }
            pt.clear(c.index(PagingLevel::Pt));
            self.window.invalidate(page.page());
            if free_physical {
                self.physical
                    .mark_pages(entry.physical_address(), 1, PageState::Free);
            }

            self.reclaim(&c);
        }
    }

    /// Reports every level of the translation of `address`.
    ///
    /// Levels below the first non-present one are not dereferenced.
    #[must_use]
    pub fn crawl_result(&self, address: VirtualAddress) -> CrawlResult {
        let c = crawl(address);
        let mut levels = PagingLevel::ALL.map(|level| CrawlLevel {
            level,
            table: c.table(level),
            index: c.index(level),
            present: false,
            physical: None,
            cache_disabled: false,
        });

        if c.canonical {
            // SAFETY: the root is always mapped through the recursive slot.
            let root = unsafe { self.window.table_at_virtual(ROOT_TABLE_ADDRESS) };
            let own = root.get(recursive_index());
            levels[PagingLevel::Pml4.as_usize()].present = true;
            levels[PagingLevel::Pml4.as_usize()].physical = Some(own.physical_address());
            levels[PagingLevel::Pml4.as_usize()].cache_disabled = own.cache_disabled();

            for level in PagingLevel::TABLES_TOP_DOWN {
                // SAFETY: `level` was reported present by its parent.
                let table = unsafe { self.table(&c, level) };
                let entry = table.get(c.index(level));
                if !entry.present() || (level != PagingLevel::Pt && entry.large_page()) {
                    break;
                }
                let Some(below) = level.below() else { break };
                let slot = &mut levels[below.as_usize()];
                slot.present = true;
                slot.physical = Some(entry.physical_address());
                slot.cache_disabled = entry.cache_disabled();
            }
        }

        CrawlResult {
            address,
            canonical: c.canonical,
            levels,
        }
    }

    /// Creates the PDPT, PD and PT on the way to `c.address` as needed.
    fn ensure_tables(&mut self, c: &Crawl) {
        for level in [PagingLevel::Pml4, PagingLevel::Pdpt, PagingLevel::Pd] {
            // SAFETY: the root is always present; lower tables were just ensured.
            let table = unsafe { self.table(c, level) };
            let index = c.index(level);
            let entry = table.get(index);

            if entry.present() {
                if entry.large_page() {
                    halt(Fatal::LargePage(c.address));
                }
                continue;
            }

            let Some(frame) = self.physical.request_pages(1, PageFlags::new()) else {
                halt(Fatal::TableAllocation(c.address));
            };
            table.set(index, PageEntryBits::table_link(frame.address.page()));

            let Some(child) = level.below() else { continue };
            let child_va = c.table(child);
            self.window.invalidate(child_va.page());
            // SAFETY: the link above maps the new frame at its recursive address.
            unsafe { self.window.table_at_virtual(child_va) }.zero();
            trace!(
                "paging: new {child:?} at {} for {}",
                frame.address, c.address
            );
        }
    }

    /// Whether PML4, PDPT and PD entries on the way to the PT are present.
    fn leaf_table_present(&self, c: &Crawl) -> bool {
        for level in [PagingLevel::Pml4, PagingLevel::Pdpt, PagingLevel::Pd] {
            // SAFETY: checked top-down, each level only after its parent.
            let entry = unsafe { self.table(c, level) }.get(c.index(level));
            if !entry.present() {
                return false;
            }
            if entry.large_page() {
                halt(Fatal::LargePage(c.address));
            }
        }
        true
    }

    /// Frees every table on the path to `c.address` that no longer maps
    /// anything, stopping at the first one still in use.
    fn reclaim(&mut self, c: &Crawl) {
        for level in [PagingLevel::Pt, PagingLevel::Pd, PagingLevel::Pdpt] {
            // SAFETY: present, since nothing below it was reclaimed yet.
            if !unsafe { self.table(c, level) }.is_empty() {
                return;
            }
            let Some(parent) = level.above() else { return };
            // SAFETY: the parent of a present table is present.
            let parent_table = unsafe { self.table(c, parent) };
            let index = c.index(parent);
            let link = parent_table.get(index);
            parent_table.clear(index);
            self.window.invalidate(c.table(level).page());
            self.physical
                .mark_pages(link.physical_address(), 1, PageState::Free);
            trace!("paging: reclaimed {level:?} at {}", link.physical_address());
        }
    }

    /// The table at `level` on the path to `c.address`.
    ///
    /// # Safety
    /// That table must be present.
    unsafe fn table<'t>(&self, c: &Crawl, level: PagingLevel) -> &'t mut PageTable {
        // SAFETY: forwarded to the caller.
        unsafe { self.window.table_at_virtual(c.table(level)) }
    }
}

#[inline]
const fn recursive_index() -> TableIndex {
    TableIndex::from_bits(RECURSIVE_INDEX as u64)
}

/// Last page of `count` pages at `va`, if the range is non-empty, aligned,
/// and stays inside one canonical half.
#[must_use]
pub fn last_page(va: VirtualAddress, count: u64) -> Option<VirtualAddress> {
    if count == 0 || !va.is_aligned::<Size4K>() || !va.is_canonical() {
        return None;
    }
    let last = va.checked_add((count - 1).checked_mul(PAGE_SIZE)?)?;
    let same_half = (va.as_u64() < LOWER_HALF_END) == (last.as_u64() < LOWER_HALF_END);
    (last.is_canonical() && same_half).then_some(last)
}

const fn touches_recursive_window(first: VirtualAddress, last: VirtualAddress) -> bool {
    first.as_u64() < RECURSIVE_WINDOW_BASE + ROOT_SLOT_SPAN && last.as_u64() >= RECURSIVE_WINDOW_BASE
}

/// Installs the recursive slot in `root`.
pub fn install_recursive_slot(root: &mut PageTable, root_frame: PhysicalAddress) {
    root.set(
        recursive_index(),
        PageEntryBits::table_link(root_frame.page()).with_no_execute(true),
    );
}
