//! # Memory Layout

/// Size of a base page frame.
pub const PAGE_SIZE: u64 = 4096;

/// Number of buddy orders; order `o` tracks blocks of `2^o` pages.
pub const MAX_ORDER: usize = 10;

/// Pages in the largest buddy block (order `MAX_ORDER - 1`, 2 MiB).
pub const MAX_BUDDY_PAGES: u64 = 1 << (MAX_ORDER - 1);

/// End of conventional low memory. Contiguous physical requests never return
/// pages below this mark.
pub const LOW_MEMORY_END: u64 = 0x10_0000; // 1 MiB

/// First frame considered by contiguous physical requests.
pub const CONTIGUOUS_SCAN_START: u64 = LOW_MEMORY_END;

/// Width of the linear address space the paging code is written for.
pub const REQUIRED_LINEAR_ADDRESS_BITS: u8 = 48;

/// Root-table slot that points back at the root table itself.
pub const RECURSIVE_INDEX: usize = 510;

/// Bytes covered by one root-table slot.
pub const ROOT_SLOT_SPAN: u64 = 1 << 39;

/// First virtual address of the recursive window (slot 510, sign-extended).
pub const RECURSIVE_WINDOW_BASE: u64 = 0xFFFF_0000_0000_0000 | ((RECURSIVE_INDEX as u64) << 39);

/// General-purpose domain: the lower canonical half.
pub const GENERAL_DOMAIN_BASE: u64 = 0;

/// Pages in the general-purpose domain.
pub const GENERAL_DOMAIN_PAGES: u64 = (1 << 47) / PAGE_SIZE;

/// Kernel domain: the upper canonical half.
pub const KERNEL_DOMAIN_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Pages in the kernel domain.
pub const KERNEL_DOMAIN_PAGES: u64 = (1 << 47) / PAGE_SIZE;

/// Size of one heap region.
pub const HEAP_REGION_SIZE: u64 = 2 * 1024 * 1024;

/// Pages backing one heap region.
pub const HEAP_REGION_PAGES: u64 = HEAP_REGION_SIZE / PAGE_SIZE;

/// Heap allocation granularity; every payload is a multiple of this.
pub const HEAP_MIN_BLOCK: u64 = 8;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(MAX_BUDDY_PAGES == 512);
    assert!(RECURSIVE_WINDOW_BASE == 0xFFFF_FF00_0000_0000);
    assert!(RECURSIVE_WINDOW_BASE >= KERNEL_DOMAIN_BASE);
    assert!(HEAP_REGION_PAGES == MAX_BUDDY_PAGES);
    assert!(HEAP_MIN_BLOCK.is_power_of_two());
    assert!(CONTIGUOUS_SCAN_START.is_multiple_of(PAGE_SIZE));
};
