//! # Global Allocator Adapter

use crate::fatal::halt;
use crate::heap::Heap;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use kernel_info::memory::HEAP_MIN_BLOCK;
use kernel_sync::Service;

/// Every heap payload is aligned to at least this.
#[allow(clippy::cast_possible_truncation)]
const NATURAL_ALIGN: usize = HEAP_MIN_BLOCK as usize;

/// `GlobalAlloc` over the kernel heap.
///
/// Alignments above 8 bytes over-allocate by `align` bytes. The pointer the
/// heap returned is stored in the word just below the aligned pointer handed
/// to the caller:
///
/// ```text
/// raw                     aligned
/// │ padding ... │ raw ptr │ payload (size) ... │
///               ^ aligned - 8
/// ```
///
/// ```rust,ignore
/// #[global_allocator]
/// static ALLOCATOR: KernelAllocator = KernelAllocator::new(&KERNEL_HEAP);
/// ```
pub struct KernelAllocator {
    heap: &'static Service<Heap>,
}

impl KernelAllocator {
    #[must_use]
    pub const fn new(heap: &'static Service<Heap>) -> Self {
        Self { heap }
    }

    fn with_heap<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> R {
        match self.heap.with(f) {
            Ok(r) => r,
            Err(e) => halt(e.into()),
        }
    }
}

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= NATURAL_ALIGN {
            return self.with_heap(|h| h.allocate(layout.size())).as_ptr();
        }

        let raw = self
            .with_heap(|h| h.allocate(layout.size() + layout.align()))
            .as_ptr();
        let offset = (raw as usize + size_of::<usize>()).next_multiple_of(layout.align()) - raw as usize;
        unsafe {
            let aligned = raw.add(offset);
            aligned.cast::<usize>().sub(1).write(raw as usize);
            aligned
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let raw = if layout.align() <= NATURAL_ALIGN {
            ptr
        } else {
            unsafe { ptr.cast::<usize>().sub(1).read() as *mut u8 }
        };
        if let Some(raw) = NonNull::new(raw) {
            self.with_heap(|h| h.free(raw));
        }
    }
}
