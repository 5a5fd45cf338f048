//! # Fatal Conditions
//!
//! Exhaustion that a caller can work around is reported as `None` or `false`.
//! Everything else (corruption, misuse, exhaustion with no fallback) ends in
//! [`halt`], which never returns.

use kernel_memory_addresses::VirtualAddress;
use kernel_sync::ServiceError;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Fatal {
    #[error("memory map describes no memory")]
    EmptyMemoryMap,
    #[error("bitmap storage holds {actual} bytes, {required} required")]
    BitmapStorage { required: usize, actual: usize },
    #[error("linear address width of {0} bits is unsupported, 48 required")]
    UnsupportedAddressWidth(u8),
    #[error("boot layout unusable: {0}")]
    BootLayout(&'static str),
    #[error("non-contiguous virtual requests are not implemented")]
    NonContiguousVirtual,
    #[error("out of physical pages while backing {0}")]
    PhysicalExhausted(VirtualAddress),
    #[error("no physical page for a page table covering {0}")]
    TableAllocation(VirtualAddress),
    #[error("{count} pages at {address} are not owned")]
    FreeUnowned { address: VirtualAddress, count: u64 },
    #[error("address space list corrupt: {0}")]
    AddressSpaceCorrupt(&'static str),
    #[error("mapping touches the recursive window at {0}")]
    RecursiveWindow(VirtualAddress),
    #[error("large page on the walk to {0}")]
    LargePage(VirtualAddress),
    #[error("no heap region exists")]
    NoHeapRegion,
    #[error("zero-sized heap allocation")]
    ZeroSizedAllocation,
    #[error("heap allocation of {0} bytes exceeds a region")]
    OversizedAllocation(usize),
    #[error("heap exhausted serving {0} bytes")]
    HeapExhausted(usize),
    #[error("pointer {0:#x} was not allocated from the heap")]
    UnknownHeapPointer(usize),
    #[error("heap region {region:#x} corrupt: {reason}")]
    HeapCorrupt { region: usize, reason: &'static str },
    #[error("allocator service unavailable: {0}")]
    Service(#[from] ServiceError),
}

/// Stops the kernel. Logs `reason` at error level, then panics with it.
#[cold]
#[track_caller]
pub fn halt(reason: Fatal) -> ! {
    log::error!("fatal: {reason}");
    panic!("{reason}");
}
