//! Host-side stand-ins for the MMU and the boot environment.

use alloc::collections::BTreeMap;
use core::cell::{Cell, RefCell};
use kernel_info::boot::{KernelLayout, MemoryMapEntry, PhysicalRange, RegionType};
use kernel_memory_addresses::{
    PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage,
};
use crate::heap::Heap;
use core::ptr;
use kernel_sync::{Service, ServiceError};
use kernel_vmem::{MemoryWindow, PageEntryBits, PageTable, PagingLevel};
use std::alloc::{GlobalAlloc, Layout, System, alloc_zeroed};

/// The system allocator, plus a per-thread watch on one heap service.
///
/// On the target every allocation goes through the kernel heap. While a
/// watch is set, each allocation that finds the watched heap borrowed is
/// counted: on the target it would have re-entered the heap.
struct WatchingAllocator;

#[global_allocator]
static ALLOCATOR: WatchingAllocator = WatchingAllocator;

thread_local! {
    static WATCHED: Cell<*const Service<Heap>> = const { Cell::new(ptr::null()) };
    static BUSY_ALLOCATIONS: Cell<u64> = const { Cell::new(0) };
}

fn note_allocation() {
    let _ = WATCHED.try_with(|watched| {
        let heap = watched.get();
        // SAFETY: set only for the duration of `allocations_while_busy`,
        // which borrows the service.
        if !heap.is_null() && unsafe { (*heap).with(|_| ()) } == Err(ServiceError::Busy) {
            let _ = BUSY_ALLOCATIONS.try_with(|n| n.set(n.get() + 1));
        }
    });
}

unsafe impl GlobalAlloc for WatchingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        note_allocation();
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        note_allocation();
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        note_allocation();
        unsafe { System.realloc(ptr, layout, new_size) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }
}

/// Runs `f` and counts the allocations it made while `heap` was borrowed.
pub fn allocations_while_busy(heap: &Service<Heap>, f: impl FnOnce()) -> u64 {
    struct Unwatch;
    impl Drop for Unwatch {
        fn drop(&mut self) {
            WATCHED.with(|w| w.set(ptr::null()));
        }
    }

    BUSY_ALLOCATIONS.with(|n| n.set(0));
    WATCHED.with(|w| w.set(heap));
    let unwatch = Unwatch;
    f();
    drop(unwatch);
    BUSY_ALLOCATIONS.with(Cell::get)
}

/// Zeroed, page-aligned bytes that live for the rest of the test process.
pub fn leaked_bytes(len: usize) -> &'static mut [u8] {
    let layout = Layout::from_size_align(len.max(1), 4096).unwrap();
    // SAFETY: non-zero size; the allocation is never freed.
    unsafe {
        let ptr = alloc_zeroed(layout);
        assert!(!ptr.is_null());
        core::slice::from_raw_parts_mut(ptr, len)
    }
}

/// A software MMU.
///
/// Physical frames are boxed page tables created on first touch. Virtual
/// addresses are resolved by walking the simulated tables from the root, so
/// the recursive slot works exactly as it does in hardware. Byte ranges
/// handed out through [`MemoryWindow::bytes_at_virtual`] must be mapped but
/// are backed by separate host buffers keyed by their start address.
pub struct SoftMmu {
    root: PhysicalPage<Size4K>,
    frames: RefCell<BTreeMap<u64, *mut PageTable>>,
    shadows: RefCell<BTreeMap<u64, (*mut u8, usize)>>,
    invalidations: Cell<u64>,
}

impl SoftMmu {
    pub fn new(root: PhysicalAddress) -> Self {
        Self {
            root: root.page(),
            frames: RefCell::default(),
            shadows: RefCell::default(),
            invalidations: Cell::new(0),
        }
    }

    /// Boots a machine the way the loader would leave it: the root table at
    /// `layout.root_table`, everything below `identity_map_end` identity
    /// mapped with 4 KiB pages and the higher half mapped at its virtual
    /// base. Table frames are bump-allocated right after the root.
    ///
    /// Returns the MMU and the number of table frames in use.
    pub fn boot(layout: &KernelLayout<'_>) -> (Self, u64) {
        let mmu = Self::new(layout.root_table);
        let mut bump = BumpFrames {
            next: layout.root_table.as_u64() + 4096,
        };

        for pa in (0..layout.identity_map_end).step_by(4096) {
            mmu.boot_map(&mut bump, VirtualAddress::new(pa), PhysicalAddress::new(pa));
        }
        for offset in (0..layout.higher_half.length).step_by(4096) {
            mmu.boot_map(
                &mut bump,
                layout.higher_half_virtual + offset,
                layout.higher_half.base + offset,
            );
        }

        let frames = (bump.next - layout.root_table.as_u64()) / 4096;
        (mmu, frames)
    }

    fn boot_map(&self, bump: &mut BumpFrames, va: VirtualAddress, pa: PhysicalAddress) {
        let mut table = self.frame(self.root);
        for level in [PagingLevel::Pml4, PagingLevel::Pdpt, PagingLevel::Pd] {
            let index = level.index_of(va);
            // SAFETY: test frames are leaked and never freed.
            let t = unsafe { &mut *table };
            if !t.get(index).present() {
                let frame = bump.next();
                t.set(index, PageEntryBits::table_link(frame));
            }
            table = self.frame(t.get(index).frame());
        }
        // SAFETY: as above.
        let pt = unsafe { &mut *table };
        pt.set(
            PagingLevel::Pt.index_of(va),
            PageEntryBits::leaf(pa.page(), kernel_vmem::LeafAttributes {
                writable: true,
                ..Default::default()
            }),
        );
    }

    /// The simulated frame, created zeroed on first use.
    pub fn frame(&self, frame: PhysicalPage<Size4K>) -> *mut PageTable {
        *self
            .frames
            .borrow_mut()
            .entry(frame.base().as_u64())
            .or_insert_with(|| Box::into_raw(Box::new(PageTable::zeroed())))
    }

    /// Resolves `va` by walking the simulated tables.
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !va.is_canonical() {
            return None;
        }
        let mut table = self.frame(self.root);
        for level in PagingLevel::TABLES_TOP_DOWN {
            // SAFETY: test frames are leaked and never freed.
            let entry = unsafe { &*table }.get(level.index_of(va));
            if !entry.present() {
                return None;
            }
            if level == PagingLevel::Pt {
                return Some(entry.physical_address() + va.offset::<Size4K>());
            }
            table = self.frame(entry.frame());
        }
        None
    }

    pub fn root(&self) -> &'static mut PageTable {
        // SAFETY: test frames are leaked and never freed.
        unsafe { &mut *self.frame(self.root) }
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.get()
    }
}

impl MemoryWindow for SoftMmu {
    unsafe fn table_at_physical<'a>(&self, frame: PhysicalPage<Size4K>) -> &'a mut PageTable {
        // SAFETY: test frames are leaked and never freed.
        unsafe { &mut *self.frame(frame) }
    }

    unsafe fn table_at_virtual<'a>(&self, table: VirtualAddress) -> &'a mut PageTable {
        let Some(pa) = self.translate(table) else {
            panic!("page fault reading table at {table}");
        };
        assert_eq!(pa.offset::<Size4K>(), 0, "unaligned table address {table}");
        // SAFETY: as above.
        unsafe { &mut *self.frame(pa.page()) }
    }

    unsafe fn bytes_at_virtual<'a>(&self, start: VirtualAddress, len: usize) -> &'a mut [u8] {
        for offset in (0..len as u64).step_by(4096) {
            let va = start + offset;
            assert!(self.translate(va).is_some(), "page fault at {va}");
        }

        let mut shadows = self.shadows.borrow_mut();
        let entry = shadows.entry(start.as_u64()).or_insert((core::ptr::null_mut(), 0));
        if entry.1 < len {
            *entry = (leaked_bytes(len).as_mut_ptr(), len);
        }
        // SAFETY: the shadow buffer holds at least `len` bytes and is leaked.
        unsafe { core::slice::from_raw_parts_mut(entry.0, len) }
    }

    fn invalidate(&self, _page: VirtualPage<Size4K>) {
        self.invalidations.set(self.invalidations.get() + 1);
    }
}

struct BumpFrames {
    next: u64,
}

impl BumpFrames {
    fn next(&mut self) -> PhysicalPage<Size4K> {
        let frame = PhysicalAddress::new(self.next).page();
        self.next += 4096;
        frame
    }
}

/// Low memory plus the kernel's identity-mapped lower half.
pub static BOOTSTRAP: [PhysicalRange; 2] = [
    PhysicalRange::new(0, 0x10_0000),
    PhysicalRange::new(0x10_0000, 0x2_0000),
];

/// First kernel-space address the virtual manager may carve from.
pub const USABLE_KERNEL_SPACE_START: VirtualAddress = VirtualAddress::new(0xFFFF_FFFF_9000_0000);

/// A loader-style layout.
///
/// ```text
/// 0x0000_8000..0x0000_A000  scratch window
/// 0x0010_0000..0x0012_0000  kernel lower half (identity mapped)
/// 0x0020_0000               allocator bitmaps
/// 0x0040_0000..0x0050_0000  kernel higher half at 0xFFFF_FFFF_8000_0000
/// 0x0070_0000               boot root table, other boot tables follow
/// ```
pub fn simple_layout(bootstrap: &[PhysicalRange]) -> KernelLayout<'_> {
    KernelLayout {
        root_table: PhysicalAddress::new(0x70_0000),
        linear_address_bits: 48,
        physical_address_bits: 40,
        lower_half: PhysicalRange::new(0x10_0000, 0x2_0000),
        higher_half: PhysicalRange::new(0x40_0000, 0x10_0000),
        higher_half_virtual: VirtualAddress::new(0xFFFF_FFFF_8000_0000),
        identity_map_end: 0x80_0000,
        scratch_window: PhysicalRange::new(0x8000, 0x2000),
        usable_memory_start: PhysicalAddress::new(0x20_0000),
        bootstrap_regions: bootstrap,
        global_constructors: &[],
    }
}

/// 64 MiB of RAM with the legacy BIOS hole reserved.
pub fn sixty_four_mib() -> [MemoryMapEntry; 3] {
    [
        MemoryMapEntry::new(0, 0x9_F000, RegionType::Usable),
        MemoryMapEntry::new(0x9_F000, 0x6_1000, RegionType::Reserved),
        MemoryMapEntry::new(0x10_0000, 0x3F0_0000, RegionType::Usable),
    ]
}
