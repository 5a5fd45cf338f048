//! # Virtual Memory Manager
//!
//! Owns the physical allocator, the active page tables (through a
//! [`MemoryWindow`]) and the two virtual address domains:
//!
//! ```text
//! general  0x0000_0000_0000_0000 ─ 0x0000_7FFF_FFFF_FFFF   lower canonical half
//! kernel   0xFFFF_8000_0000_0000 ─ 0xFFFF_FFFF_FFFF_FFFF   upper canonical half
//!          └ 0xFFFF_FF00_0000_0000 ─ 0xFFFF_FF7F_FFFF_FFFF recursive window (slot 510)
//! ```
//!
//! Boot leaves the kernel running on the loader's tables. [`initialize`]
//! takes them over, installs the recursive slot, moves the allocator's
//! bitmaps into kernel space, drops the identity mappings that are no longer
//! needed and creates the first heap region.
//!
//! [`initialize`]: VirtualMemoryManager::initialize

#![allow(clippy::cast_possible_truncation)]

use crate::address_space_list::AddressSpaceList;
use crate::fatal::{Fatal, halt};
use crate::heap::{ENTRY_TABLE_PAGES, Heap};
use crate::paging::{CrawlResult, PageTables, install_recursive_slot, last_page};
use crate::physical::PhysicalAllocator;
use crate::request::{Allocation, PageFlags, PageState};
use kernel_info::boot::KernelLayout;
use kernel_info::memory::{
    GENERAL_DOMAIN_BASE, GENERAL_DOMAIN_PAGES, HEAP_REGION_PAGES, HEAP_REGION_SIZE,
    KERNEL_DOMAIN_BASE, KERNEL_DOMAIN_PAGES, LOW_MEMORY_END, MAX_BUDDY_PAGES, PAGE_SIZE,
    RECURSIVE_WINDOW_BASE, REQUIRED_LINEAR_ADDRESS_BITS, ROOT_SLOT_SPAN,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::Service;
use kernel_vmem::{
    MemoryWindow, PageTable, RECURSIVE_INDEX, ROOT_TABLE_ADDRESS, align_down, align_up,
};
use log::{debug, info};

/// Flags for the kernel's own bookkeeping memory.
#[must_use]
pub const fn kernel_data_flags() -> PageFlags {
    PageFlags::new()
        .with_virtual_contiguous(true)
        .with_allocate_physical(true)
        .with_kernel_space(true)
        .with_writable(true)
        .with_execute_disable(true)
}

pub struct VirtualMemoryManager<W> {
    window: W,
    physical: PhysicalAllocator,
    kernel: AddressSpaceList,
    general: AddressSpaceList,
}

impl<W: MemoryWindow> VirtualMemoryManager<W> {
    /// Takes over the boot page tables.
    ///
    /// `usable_kernel_space_start` is the first kernel address free for the
    /// relocated bitmaps and the first heap region. The heap is installed
    /// into `heap` before the layout's global constructors run.
    pub fn initialize(
        window: W,
        mut physical: PhysicalAllocator,
        layout: &KernelLayout<'_>,
        usable_kernel_space_start: VirtualAddress,
        heap: &Service<Heap>,
    ) -> Self {
        if layout.linear_address_bits != REQUIRED_LINEAR_ADDRESS_BITS {
            halt(Fatal::UnsupportedAddressWidth(layout.linear_address_bits));
        }

        let root = layout.root_table.page::<Size4K>();
        let boot_tables = mark_boot_tables(&window, &mut physical, root);
        // SAFETY: the boot root is identity mapped.
        install_recursive_slot(unsafe { window.table_at_physical(root) }, root.base());
        window.invalidate(ROOT_TABLE_ADDRESS.page());
        info!(
            "vmm: {boot_tables} boot tables, root {} recursive at slot {RECURSIVE_INDEX}",
            root.base()
        );

        let kernel_start = VirtualAddress::new(align_up(usable_kernel_space_start.as_u64(), PAGE_SIZE));
        let mut cursor = kernel_start;
        let mut tables = PageTables {
            window: &window,
            physical: &mut physical,
        };

        // bitmaps
        let bitmap_pages = tables.physical.bitmap_page_count();
        let bitmap_base = tables.physical.bitmap_base();
        if !tables.map_pages(cursor, bitmap_base, bitmap_pages, kernel_data_flags()) {
            halt(Fatal::BootLayout("usable kernel space start is not mappable"));
        }
        // SAFETY: just mapped, and nothing else refers to these pages.
        let storage = unsafe { window.bytes_at_virtual(cursor, (bitmap_pages * PAGE_SIZE) as usize) };
        tables.physical.relocate_bitmaps(storage);
        info!("vmm: bitmaps ({bitmap_pages} pages) moved to {cursor}");
        cursor += bitmap_pages * PAGE_SIZE;

        unmap_boot_identity(&mut tables, layout);

        // first heap region
        back_with_physical(&mut tables, cursor, heap_pages(), kernel_data_flags());
        let mut first = Heap::new();
        // SAFETY: just backed and mapped.
        let (region, table) = unsafe { region_storage(&window, cursor) };
        first.create(region, table);
        if let Err(e) = heap.install(first) {
            halt(e.into());
        }
        cursor += heap_pages() * PAGE_SIZE;

        for constructor in layout.global_constructors {
            constructor();
        }
        if !layout.global_constructors.is_empty() {
            info!("vmm: ran {} global constructors", layout.global_constructors.len());
        }

        let general = general_space(layout);
        let kernel = kernel_space(layout, kernel_start, cursor);
        info!(
            "vmm: kernel space {} pages free, general space {} pages free, {} physical pages free",
            kernel.available_pages(),
            general.available_pages(),
            physical.available_pages()
        );

        Self {
            window,
            physical,
            kernel,
            general,
        }
    }

    /// Reserves `count` consecutive pages in the domain chosen by
    /// `kernel_space`, backing them with frames when `allocate_physical` is
    /// set.
    ///
    /// Returns `None` for zero pages or when no interval fits. Requests
    /// without `virtual_contiguous` and running out of frames are fatal.
    pub fn request_pages(&mut self, count: u64, flags: PageFlags) -> Option<Allocation<VirtualAddress>> {
        if !flags.virtual_contiguous() {
            halt(Fatal::NonContiguousVirtual);
        }
        if count == 0 {
            return None;
        }

        let list = if flags.kernel_space() {
            &mut self.kernel
        } else {
            &mut self.general
        };
        let address = list.reserve(count)?;

        if flags.allocate_physical() {
            let mut tables = self.tables();
            back_with_physical(&mut tables, address, count, flags);
        }

        debug!("vmm: {count} pages at {address}");
        Some(Allocation { address, count })
    }

    /// Returns `count` pages at `address` to their domain and unmaps them.
    ///
    /// Returns `false` for an empty, misaligned or non-canonical range. The
    /// range must have been reserved as one piece; anything else is fatal.
    pub fn free_pages(&mut self, address: VirtualAddress, count: u64, flags: PageFlags) -> bool {
        if last_page(address, count).is_none() {
            return false;
        }

        if self.kernel.contains(address) {
            self.kernel.release(address, count);
        } else {
            self.general.release(address, count);
        }
        self.tables()
            .unmap_pages(address, count, flags.allocate_physical());

        debug!("vmm: freed {count} pages at {address}");
        true
    }

    /// Maps `count` pages at `va` onto the frames at `pa`.
    pub fn map_pages(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: u64,
        flags: PageFlags,
    ) -> bool {
        self.tables().map_pages(va, pa, count, flags)
    }

    pub fn unmap_pages(&mut self, va: VirtualAddress, count: u64, free_physical: bool) {
        self.tables().unmap_pages(va, count, free_physical);
    }

    #[inline]
    #[must_use]
    pub const fn is_canonical(address: VirtualAddress) -> bool {
        address.is_canonical()
    }

    #[must_use]
    pub fn crawl_result(&mut self, address: VirtualAddress) -> CrawlResult {
        self.tables().crawl_result(address)
    }

    /// Adds a region to `heap`, backed by fresh kernel pages.
    ///
    /// The pages are reserved and mapped before `heap` is borrowed, since the
    /// interval lists allocate through the global allocator. Must not be
    /// called while `heap` is borrowed. Returns `false` when kernel space has
    /// no room for a region.
    pub fn create_heap_region(&mut self, heap: &Service<Heap>) -> bool {
        let Some(pages) = self.request_pages(heap_pages(), kernel_data_flags()) else {
            return false;
        };
        // SAFETY: freshly reserved, backed and mapped.
        let (region, table) = unsafe { region_storage(&self.window, pages.address) };
        if let Err(e) = heap.with(|h| h.create(region, table)) {
            halt(e.into());
        }
        true
    }

    #[inline]
    #[must_use]
    pub const fn physical(&self) -> &PhysicalAllocator {
        &self.physical
    }

    #[inline]
    pub const fn physical_mut(&mut self) -> &mut PhysicalAllocator {
        &mut self.physical
    }

    #[inline]
    #[must_use]
    pub const fn kernel_space(&self) -> &AddressSpaceList {
        &self.kernel
    }

    #[inline]
    #[must_use]
    pub const fn general_space(&self) -> &AddressSpaceList {
        &self.general
    }

    #[inline]
    #[must_use]
    pub const fn window(&self) -> &W {
        &self.window
    }

    fn tables(&mut self) -> PageTables<'_, W> {
        PageTables {
            window: &self.window,
            physical: &mut self.physical,
        }
    }
}

/// Pages behind one heap region plus its entry table.
const fn heap_pages() -> u64 {
    HEAP_REGION_PAGES + ENTRY_TABLE_PAGES
}

/// The region bytes and the entry table bytes of the mapped range at `va`.
///
/// # Safety
/// `heap_pages()` pages at `va` must be mapped writable and unused.
unsafe fn region_storage<W: MemoryWindow>(
    window: &W,
    va: VirtualAddress,
) -> (&'static mut [u8], &'static mut [u8]) {
    let table_va = va + HEAP_REGION_SIZE;
    let table_len = (ENTRY_TABLE_PAGES * PAGE_SIZE) as usize;
    // SAFETY: forwarded to the caller.
    unsafe {
        (
            window.bytes_at_virtual(va, HEAP_REGION_SIZE as usize),
            window.bytes_at_virtual(table_va, table_len),
        )
    }
}

/// Maps `count` pages at `va` onto frames drawn from the physical allocator.
///
/// Buddy mode serves at most 512 pages per call and may serve fewer, so
/// this loops until the range is covered.
fn back_with_physical<W: MemoryWindow>(
    tables: &mut PageTables<'_, W>,
    va: VirtualAddress,
    count: u64,
    flags: PageFlags,
) {
    let mut done = 0;
    while done < count {
        let chunk_va = va + done * PAGE_SIZE;
        let want = if flags.physical_contiguous() {
            count - done
        } else {
            (count - done).min(MAX_BUDDY_PAGES)
        };
        let Some(chunk) = tables.physical.request_pages(want, flags) else {
            halt(Fatal::PhysicalExhausted(chunk_va));
        };
        if !tables.map_pages(chunk_va, chunk.address, chunk.count, flags) {
            halt(Fatal::BootLayout("reserved range is not mappable"));
        }
        done += chunk.count;
    }
}

/// Marks the root and every table reachable from it as used.
fn mark_boot_tables<W: MemoryWindow>(
    window: &W,
    physical: &mut PhysicalAllocator,
    root: PhysicalPage<Size4K>,
) -> u64 {
    let mut count = 0;
    let mut mark = |frame: PhysicalPage<Size4K>| {
        physical.mark_pages(frame.base(), 1, PageState::Used);
        count += 1;
    };

    mark(root);
    // SAFETY: boot tables are identity mapped.
    let pml4: &PageTable = unsafe { window.table_at_physical(root) };
    for (index, e4) in pml4.present_entries() {
        if index.as_usize() == RECURSIVE_INDEX {
            continue;
        }
        mark(e4.frame());
        // SAFETY: as above.
        let pdpt: &PageTable = unsafe { window.table_at_physical(e4.frame()) };
        for (_, e3) in pdpt.present_entries().filter(|(_, e)| !e.large_page()) {
            mark(e3.frame());
            // SAFETY: as above.
            let pd: &PageTable = unsafe { window.table_at_physical(e3.frame()) };
            for (_, e2) in pd.present_entries().filter(|(_, e)| !e.large_page()) {
                mark(e2.frame());
            }
        }
    }

    count
}

/// Drops the identity mapping of low memory, except the scratch window, and
/// of the kernel's lower half. Page 0 goes as well.
fn unmap_boot_identity<W: MemoryWindow>(tables: &mut PageTables<'_, W>, layout: &KernelLayout<'_>) {
    let scratch_start = align_down(layout.scratch_window.base.as_u64(), PAGE_SIZE);
    let scratch_end = align_up(layout.scratch_window.end(), PAGE_SIZE);

    let mut unmap = |start: u64, end: u64| {
        if end > start {
            tables.unmap_pages(VirtualAddress::new(start), (end - start) / PAGE_SIZE, false);
        }
    };
    unmap(PAGE_SIZE, scratch_start.clamp(PAGE_SIZE, LOW_MEMORY_END));
    unmap(scratch_end.clamp(PAGE_SIZE, LOW_MEMORY_END), LOW_MEMORY_END);
    unmap(
        align_down(layout.lower_half.base.as_u64(), PAGE_SIZE),
        align_up(layout.lower_half.end(), PAGE_SIZE),
    );
    unmap(0, PAGE_SIZE);

    debug!("vmm: identity map below {LOW_MEMORY_END:#x} and the lower half removed");
}

/// Reserves `[start, end)` in `list`; boot reservations must not fail.
fn reserve_boot_range(list: &mut AddressSpaceList, start: u64, end: u64) {
    let start = align_down(start, PAGE_SIZE);
    let end = align_up(end, PAGE_SIZE);
    if end > start && !list.reserve_at(VirtualAddress::new(start), (end - start) / PAGE_SIZE) {
        halt(Fatal::BootLayout("boot reservations overlap"));
    }
}

/// Page 0, the scratch window and what stays of the identity map.
fn general_space(layout: &KernelLayout<'_>) -> AddressSpaceList {
    let mut list = AddressSpaceList::new(VirtualAddress::new(GENERAL_DOMAIN_BASE), GENERAL_DOMAIN_PAGES);
    reserve_boot_range(&mut list, 0, PAGE_SIZE);
    reserve_boot_range(
        &mut list,
        layout.scratch_window.base.as_u64(),
        layout.scratch_window.end(),
    );

    let identity_end = layout.identity_map_end;
    let lower_start = layout.lower_half.base.as_u64().clamp(LOW_MEMORY_END, identity_end);
    let lower_end = layout.lower_half.end().clamp(LOW_MEMORY_END, identity_end);
    reserve_boot_range(&mut list, LOW_MEMORY_END, lower_start);
    reserve_boot_range(&mut list, lower_end.max(LOW_MEMORY_END), identity_end);
    list
}

/// The recursive window, the higher half and everything carved out during boot.
fn kernel_space(layout: &KernelLayout<'_>, start: VirtualAddress, cursor: VirtualAddress) -> AddressSpaceList {
    let mut list = AddressSpaceList::new(VirtualAddress::new(KERNEL_DOMAIN_BASE), KERNEL_DOMAIN_PAGES);
    reserve_boot_range(
        &mut list,
        RECURSIVE_WINDOW_BASE,
        RECURSIVE_WINDOW_BASE + ROOT_SLOT_SPAN,
    );
    let higher = layout.higher_half_virtual.as_u64();
    reserve_boot_range(&mut list, higher, higher + layout.higher_half.length);
    reserve_boot_range(&mut list, start.as_u64(), cursor.as_u64());
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space_list::AddressSpaceNode;
    use crate::testing::{
        BOOTSTRAP, SoftMmu, USABLE_KERNEL_SPACE_START, allocations_while_busy, leaked_bytes,
        simple_layout, sixty_four_mib,
    };
    use core::sync::atomic::{AtomicBool, Ordering};
    use kernel_vmem::PagingLevel;

    fn boot_with(layout: &KernelLayout<'_>, heap: &Service<Heap>) -> (VirtualMemoryManager<SoftMmu>, u64) {
        let (mmu, frames) = SoftMmu::boot(layout);
        let physical =
            PhysicalAllocator::initialize(&sixty_four_mib(), layout, |_, len| leaked_bytes(len));
        let vmm = VirtualMemoryManager::initialize(mmu, physical, layout, USABLE_KERNEL_SPACE_START, heap);
        (vmm, frames)
    }

    fn boot() -> (VirtualMemoryManager<SoftMmu>, &'static Service<Heap>) {
        let heap = Box::leak(Box::new(Service::new()));
        let (vmm, _) = boot_with(&simple_layout(&BOOTSTRAP), heap);
        (vmm, heap)
    }

    fn va(raw: u64) -> VirtualAddress {
        VirtualAddress::new(raw)
    }

    fn nodes(list: &AddressSpaceList) -> Vec<(bool, u64, u64)> {
        list.nodes()
            .map(|AddressSpaceNode { available, base, page_count }| (available, base.as_u64(), page_count))
            .collect()
    }

    #[test]
    fn boot_tables_are_claimed_and_the_root_is_recursive() {
        let heap = Service::new();
        let (mut vmm, frames) = boot_with(&simple_layout(&BOOTSTRAP), &heap);
        assert_eq!(frames, 10);
        assert!(vmm.physical().are_buddies_of_type(
            PhysicalAddress::new(0x70_0000),
            0,
            frames,
            PageState::Used
        ));

        let root = vmm.crawl_result(ROOT_TABLE_ADDRESS);
        assert_eq!(root.translate(), Some(PhysicalAddress::new(0x70_0000)));
        assert_eq!(
            root.level(PagingLevel::Pml4).physical,
            Some(PhysicalAddress::new(0x70_0000))
        );
    }

    #[test]
    fn low_identity_map_is_trimmed() {
        let (mut vmm, _) = boot();
        let mmu = vmm.window();
        assert_eq!(mmu.translate(va(0)), None);
        assert_eq!(mmu.translate(va(0x1000)), None);
        assert_eq!(mmu.translate(va(0x8000)), Some(PhysicalAddress::new(0x8000)));
        assert_eq!(mmu.translate(va(0x9FFF)), Some(PhysicalAddress::new(0x9FFF)));
        assert_eq!(mmu.translate(va(0xA000)), None);
        // lower half
        assert_eq!(mmu.translate(va(0x10_0000)), None);
        assert_eq!(mmu.translate(va(0x12_0000)), Some(PhysicalAddress::new(0x12_0000)));
        assert!(!vmm.crawl_result(va(0x50)).level(PagingLevel::Page).present);
    }

    #[test]
    fn bitmaps_live_in_kernel_space() {
        let (vmm, _) = boot();
        assert_eq!(
            vmm.window().translate(USABLE_KERNEL_SPACE_START),
            Some(vmm.physical().bitmap_base())
        );
    }

    #[test]
    fn general_space_reserves_what_boot_left_mapped() {
        let (vmm, _) = boot();
        let lower_available = (0x10_0000 - 0xA000) / 4096 + 0x20;
        assert_eq!(
            nodes(vmm.general_space()),
            vec![
                (false, 0, 1),
                (true, 0x1000, 7),
                (false, 0x8000, 2),
                (true, 0xA000, lower_available),
                (false, 0x12_0000, (0x80_0000 - 0x12_0000) / 4096),
                (true, 0x80_0000, GENERAL_DOMAIN_PAGES - 0x800),
            ]
        );
    }

    #[test]
    fn kernel_space_reserves_window_image_and_boot_carveouts() {
        let (vmm, _) = boot();
        let carved = 1 + heap_pages();
        let end = USABLE_KERNEL_SPACE_START.as_u64() + carved * 4096;
        let shape = nodes(vmm.kernel_space());
        assert_eq!(
            shape,
            vec![
                (true, KERNEL_DOMAIN_BASE, (RECURSIVE_WINDOW_BASE - KERNEL_DOMAIN_BASE) / 4096),
                (false, RECURSIVE_WINDOW_BASE, ROOT_SLOT_SPAN / 4096),
                (
                    true,
                    RECURSIVE_WINDOW_BASE + ROOT_SLOT_SPAN,
                    (0xFFFF_FFFF_8000_0000 - RECURSIVE_WINDOW_BASE - ROOT_SLOT_SPAN) / 4096
                ),
                (false, 0xFFFF_FFFF_8000_0000, 0x100),
                (true, 0xFFFF_FFFF_8010_0000, (0x9000_0000 - 0x8010_0000) / 4096),
                (false, USABLE_KERNEL_SPACE_START.as_u64(), carved),
                (true, end, end.wrapping_neg() / 4096),
            ]
        );
    }

    #[test]
    fn heap_is_ready_after_boot() {
        let (_vmm, heap) = boot();
        let p = heap.with(|h| h.allocate(32)).unwrap();
        heap.with(|h| {
            h.free(p);
            assert_eq!(h.region_count(), 1);
        })
        .unwrap();
    }

    #[test]
    fn request_and_free_round_trip() {
        let (mut vmm, _) = boot();
        let physical_before = vmm.physical().available_pages();
        let kernel_before = vmm.kernel_space().available_pages();

        let got = vmm.request_pages(4, kernel_data_flags()).unwrap();
        // best fit: the gap between the kernel image and the boot carve-outs
        assert_eq!(got.address.as_u64(), 0xFFFF_FFFF_8010_0000);
        assert_eq!(got.count, 4);
        assert_eq!(vmm.physical().available_pages(), physical_before - 4);
        assert!(vmm.window().translate(got.address + 3 * 4096).is_some());

        assert!(vmm.free_pages(got.address, 4, kernel_data_flags()));
        assert_eq!(vmm.physical().available_pages(), physical_before);
        assert_eq!(vmm.kernel_space().available_pages(), kernel_before);
        assert_eq!(vmm.window().translate(got.address), None);
    }

    #[test]
    fn general_requests_without_backing_only_reserve() {
        let (mut vmm, _) = boot();
        let physical_before = vmm.physical().available_pages();
        let flags = PageFlags::new().with_virtual_contiguous(true);
        let got = vmm.request_pages(2, flags).unwrap();
        assert!(got.address.as_u64() < 0x0000_8000_0000_0000);
        assert_eq!(vmm.physical().available_pages(), physical_before);
        assert_eq!(vmm.window().translate(got.address), None);
        assert!(vmm.free_pages(got.address, 2, flags));
    }

    fn assert_tiled(list: &AddressSpaceList) {
        let nodes: Vec<_> = list.nodes().collect();
        assert_eq!(nodes[0].base, list.origin());
        for pair in nodes.windows(2) {
            assert_eq!(pair[0].base + pair[0].page_count * 4096, pair[1].base);
            assert_ne!(pair[0].available, pair[1].available);
        }
        let available: u64 = nodes.iter().filter(|n| n.available).map(|n| n.page_count).sum();
        assert_eq!(available, list.available_pages());
    }

    #[test]
    fn mixed_requests_and_frees_keep_both_domains_tiled() {
        let (mut vmm, _) = boot();
        let general = PageFlags::new().with_virtual_contiguous(true);
        let kernel = kernel_data_flags();
        let physical_before = vmm.physical().available_pages();
        let kernel_before = vmm.kernel_space().available_pages();
        let general_before = vmm.general_space().available_pages();

        let mut live = Vec::new();
        for (i, count) in [3, 40, 1, 17, 512, 9, 2, 130].into_iter().enumerate() {
            let flags = if i % 2 == 0 { kernel } else { general };
            let got = vmm.request_pages(count, flags).unwrap();
            live.push((got, flags));
            assert_tiled(vmm.kernel_space());
            assert_tiled(vmm.general_space());

            if i % 3 == 2 {
                let (old, flags) = live.remove(i / 3);
                assert!(vmm.free_pages(old.address, old.count, flags));
                assert_tiled(vmm.kernel_space());
                assert_tiled(vmm.general_space());
            }
        }

        for (got, flags) in live.into_iter().rev() {
            assert!(vmm.free_pages(got.address, got.count, flags));
            assert_tiled(vmm.kernel_space());
            assert_tiled(vmm.general_space());
        }
        assert_eq!(vmm.kernel_space().available_pages(), kernel_before);
        assert_eq!(vmm.general_space().available_pages(), general_before);
        assert_eq!(vmm.physical().available_pages(), physical_before);
    }

    #[test]
    fn contiguous_backing_is_physically_contiguous() {
        let (mut vmm, _) = boot();
        let flags = kernel_data_flags().with_physical_contiguous(true);
        let got = vmm.request_pages(600, flags).unwrap();
        let base = vmm.window().translate(got.address).unwrap();
        for i in [1, 511, 512, 599] {
            assert_eq!(vmm.window().translate(got.address + i * 4096), Some(base + i * 4096));
        }
    }

    #[test]
    fn large_buddy_backed_requests_are_fully_mapped() {
        let (mut vmm, _) = boot();
        let got = vmm.request_pages(1000, kernel_data_flags()).unwrap();
        for i in 0..1000 {
            assert!(vmm.window().translate(got.address + i * 4096).is_some());
        }
    }

    #[test]
    fn free_rejects_bad_ranges() {
        let (mut vmm, _) = boot();
        assert!(!vmm.free_pages(va(0x1000), 0, kernel_data_flags()));
        assert!(!vmm.free_pages(va(0x1234), 1, kernel_data_flags()));
        assert!(!vmm.free_pages(va(0x0000_8000_0000_0000), 1, kernel_data_flags()));
    }

    #[test]
    fn extra_heap_regions_extend_the_heap() {
        let (mut vmm, heap) = boot();
        assert!(vmm.create_heap_region(heap));
        heap.with(|h| {
            assert_eq!(h.region_count(), 2);
            assert!(h.regions().all(|r| h.valid(r)));
        })
        .unwrap();
    }

    #[test]
    fn growing_the_heap_never_allocates_while_it_is_borrowed() {
        let (mut vmm, heap) = boot();

        // the watch itself sees reentry
        let reentered = allocations_while_busy(heap, || {
            heap.with(|_| {
                let _ = vmm.request_pages(heap_pages(), kernel_data_flags());
            })
            .unwrap();
        });
        assert!(reentered > 0);

        let reentered = allocations_while_busy(heap, || {
            assert!(vmm.create_heap_region(heap));
            assert!(vmm.create_heap_region(heap));
        });
        assert_eq!(reentered, 0);
        assert_eq!(heap.with(|h| h.region_count()).unwrap(), 3);
    }

    #[test]
    #[should_panic(expected = "service re-entered while in use")]
    fn growing_a_borrowed_heap_is_fatal() {
        let (mut vmm, heap) = boot();
        let _ = heap.with(|_| vmm.create_heap_region(heap));
    }

    #[test]
    fn canonical_boundaries() {
        type Vmm = VirtualMemoryManager<SoftMmu>;
        assert!(Vmm::is_canonical(va(0x0000_7FFF_FFFF_FFFF)));
        assert!(!Vmm::is_canonical(va(0x0000_8000_0000_0000)));
        assert!(!Vmm::is_canonical(va(0xFFFF_7FFF_FFFF_FFFF)));
        assert!(Vmm::is_canonical(va(0xFFFF_8000_0000_0000)));
    }

    static CONSTRUCTOR_HEAP: Service<Heap> = Service::new();
    static CONSTRUCTOR_SAW_HEAP: AtomicBool = AtomicBool::new(false);

    fn constructor() {
        let ready = CONSTRUCTOR_HEAP.with(|h| h.region_count() == 1).unwrap_or(false);
        CONSTRUCTOR_SAW_HEAP.store(ready, Ordering::SeqCst);
    }

    #[test]
    fn global_constructors_run_after_the_heap_exists() {
        let constructors: [fn(); 1] = [constructor];
        let mut layout = simple_layout(&BOOTSTRAP);
        layout.global_constructors = &constructors;
        let _ = boot_with(&layout, &CONSTRUCTOR_HEAP);
        assert!(CONSTRUCTOR_SAW_HEAP.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "linear address width of 57 bits")]
    fn five_level_paging_is_fatal() {
        let mut layout = simple_layout(&BOOTSTRAP);
        layout.linear_address_bits = 57;
        let _ = boot_with(&layout, &Service::new());
    }

    #[test]
    #[should_panic(expected = "non-contiguous virtual requests")]
    fn non_contiguous_requests_are_fatal() {
        let (mut vmm, _) = boot();
        let _ = vmm.request_pages(1, PageFlags::new().with_kernel_space(true));
    }

    #[test]
    #[should_panic(expected = "are not owned")]
    fn freeing_unreserved_pages_is_fatal() {
        let (mut vmm, _) = boot();
        vmm.free_pages(va(0x4000_0000_0000), 1, PageFlags::new());
    }

    #[test]
    #[should_panic(expected = "allocator service unavailable: service installed twice")]
    fn heap_slot_must_be_empty() {
        let heap = Service::new();
        heap.install(Heap::new()).unwrap();
        let _ = boot_with(&simple_layout(&BOOTSTRAP), &heap);
    }
}
