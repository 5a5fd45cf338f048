//! # Memory Bring-Up
//!
//! ```text
//! memory map + KernelLayout
//!     ↓
//! PhysicalAllocator::initialize     bitmaps at usable_memory_start
//!     ↓
//! VirtualMemoryManager::initialize  recursive slot, first heap region
//!     ↓                             → heap slot
//! global constructors
//!     ↓
//! vmm slot
//! ```

use crate::fatal::{Fatal, halt};
use crate::heap::Heap;
use crate::physical::PhysicalAllocator;
use crate::vmm::VirtualMemoryManager;
use kernel_info::boot::{KernelLayout, MemoryMapEntry};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::Service;
use kernel_vmem::{DirectWindow, MemoryWindow};

/// The kernel heap, installed by [`bring_up`].
pub static KERNEL_HEAP: Service<Heap> = Service::new();

/// The kernel's virtual memory manager, installed by [`bring_up`].
pub static KERNEL_VMM: Service<VirtualMemoryManager<DirectWindow>> = Service::new();

/// Builds the whole memory core and installs it into `vmm_slot` and
/// `heap_slot`.
///
/// `bitmap_storage` turns the physical bitmap range into a slice while only
/// the boot identity map exists; [`identity_bytes`] does that on hardware.
pub fn bring_up<W: MemoryWindow>(
    map: &[MemoryMapEntry],
    layout: &KernelLayout<'_>,
    bitmap_storage: impl FnOnce(PhysicalAddress, usize) -> &'static mut [u8],
    window: W,
    usable_kernel_space_start: VirtualAddress,
    vmm_slot: &Service<VirtualMemoryManager<W>>,
    heap_slot: &Service<Heap>,
) {
    let physical = PhysicalAllocator::initialize(map, layout, bitmap_storage);
    let vmm = VirtualMemoryManager::initialize(
        window,
        physical,
        layout,
        usable_kernel_space_start,
        heap_slot,
    );
    if let Err(e) = vmm_slot.install(vmm) {
        halt(e.into());
    }
}

/// Identity-mapped physical bytes.
///
/// # Safety
/// `[base, base + len)` must be identity mapped, writable and otherwise unused
/// for the rest of the kernel's life.
#[must_use]
pub unsafe fn identity_bytes(base: PhysicalAddress, len: usize) -> &'static mut [u8] {
    // SAFETY: forwarded to the caller.
    unsafe { core::slice::from_raw_parts_mut(base.as_u64() as *mut u8, len) }
}

/// Runs `f` on the kernel's virtual memory manager.
pub fn kernel_vmm<R>(f: impl FnOnce(&mut VirtualMemoryManager<DirectWindow>) -> R) -> R {
    KERNEL_VMM.with(f).unwrap_or_else(|e| halt(Fatal::from(e)))
}

/// Runs `f` on the kernel heap.
pub fn kernel_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    KERNEL_HEAP.with(f).unwrap_or_else(|e| halt(Fatal::from(e)))
}
