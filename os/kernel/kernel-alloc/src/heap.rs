//! # Kernel Heap
//!
//! The heap is a doubly linked list of fixed 2 MiB regions. Each region starts
//! with a header, followed by an address-ordered chain of entries that tile
//! the rest of the region:
//!
//! ```text
//! +---------------+----------+---------+----------+---------+-----
//! | RegionHeader  | Entry    | payload | Entry    | payload | ...
//! | (48 bytes)    | (16 B)   | (size)  | (16 B)   | (size)  |
//! +---------------+----------+---------+----------+---------+-----
//! ^ region                   ^ returned pointer
//! ```
//!
//! Live allocations are also recorded in a side table per region so that
//! [`Heap::free`] can tell a foreign pointer from one of its own before it
//! touches any header. Free entries are never merged.

#![allow(clippy::cast_possible_truncation)]

use crate::fatal::{Fatal, halt};
use core::marker::PhantomData;
use core::ptr::{self, NonNull, null_mut};
use kernel_info::memory::{HEAP_MIN_BLOCK, HEAP_REGION_SIZE};
use log::{debug, info};

const REGION_SIZE: usize = HEAP_REGION_SIZE as usize;
const MIN_BLOCK: usize = HEAP_MIN_BLOCK as usize;

/// `"FREEHEAP"`
const FREE_SIGNATURE: u64 = u64::from_be_bytes(*b"FREEHEAP");
/// `"USEDHEAP"`
const USED_SIGNATURE: u64 = u64::from_be_bytes(*b"USEDHEAP");

/// Start of every region.
#[repr(C)]
struct RegionHeader {
    /// Live allocations recorded in `entry_table`.
    entry_count: u64,
    entry_table: *mut usize,
    /// Bytes not handed out to callers.
    remaining: u64,
    size: u64,
    prev: *mut RegionHeader,
    next: *mut RegionHeader,
}

/// Precedes every payload.
#[repr(C)]
struct EntryHeader {
    signature: u64,
    /// Payload bytes following this header.
    size: u64,
}

pub const REGION_HEADER_SIZE: usize = size_of::<RegionHeader>();
pub const ENTRY_HEADER_SIZE: usize = size_of::<EntryHeader>();

/// Largest payload a region can serve, exclusive.
pub const MAX_ALLOCATION: usize = REGION_SIZE - REGION_HEADER_SIZE - ENTRY_HEADER_SIZE;

/// Live allocations one region can hold at most.
pub const ENTRY_TABLE_SLOTS: usize =
    (REGION_SIZE - REGION_HEADER_SIZE) / (ENTRY_HEADER_SIZE + MIN_BLOCK);

/// Pages needed for one region's side table.
pub const ENTRY_TABLE_PAGES: u64 = (ENTRY_TABLE_SLOTS * size_of::<usize>()).div_ceil(4096) as u64;

const _: () = {
    assert!(REGION_HEADER_SIZE == 48);
    assert!(ENTRY_HEADER_SIZE == 16);
    assert!(REGION_HEADER_SIZE.is_multiple_of(MIN_BLOCK));
    assert!(ENTRY_TABLE_PAGES == 171);
};

/// Region list plus the entry operations on it.
pub struct Heap {
    head: *mut RegionHeader,
    tail: *mut RegionHeader,
    regions: usize,
}

// Safety: the heap is only reachable through a `Service`, which hands out one
// `&mut Heap` at a time.
unsafe impl Send for Heap {}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// A heap without regions; every allocation fails until [`create`](Self::create).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: null_mut(),
            tail: null_mut(),
            regions: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn region_count(&self) -> usize {
        self.regions
    }

    /// Turns `region` into an empty heap region and appends it to the list.
    ///
    /// `region` must hold [`HEAP_REGION_SIZE`] bytes and `table` room for
    /// [`ENTRY_TABLE_SLOTS`] pointers; both must be 8-byte aligned.
    pub fn create(&mut self, region: &'static mut [u8], table: &'static mut [u8]) {
        let base = region.as_mut_ptr();
        if region.len() < REGION_SIZE || !base.cast::<RegionHeader>().is_aligned() {
            halt(Fatal::HeapCorrupt {
                region: base as usize,
                reason: "region storage too small or misaligned",
            });
        }
        let entry_table = table.as_mut_ptr().cast::<usize>();
        if table.len() < ENTRY_TABLE_SLOTS * size_of::<usize>() || !entry_table.is_aligned() {
            halt(Fatal::HeapCorrupt {
                region: base as usize,
                reason: "entry table too small or misaligned",
            });
        }

        let header = base.cast::<RegionHeader>();
        // SAFETY: `region` is ours for good, large enough and aligned for a
        // header followed by one entry header.
        unsafe {
            ptr::write(
                header,
                RegionHeader {
                    entry_count: 0,
                    entry_table,
                    remaining: MAX_ALLOCATION as u64,
                    size: REGION_SIZE as u64,
                    prev: self.tail,
                    next: null_mut(),
                },
            );
            ptr::write(
                entry_at(header, REGION_HEADER_SIZE),
                EntryHeader {
                    signature: FREE_SIGNATURE,
                    size: MAX_ALLOCATION as u64,
                },
            );
        }

        if self.tail.is_null() {
            self.head = header;
        } else {
            // SAFETY: the tail is a live region header.
            unsafe {
                (*self.tail).next = header;
            }
        }
        self.tail = header;
        self.regions += 1;

        info!(
            "heap: region {} at {:#x}, {} bytes usable",
            self.regions, base as usize, MAX_ALLOCATION
        );
    }

    /// Serves `size` bytes, 8-byte aligned.
    ///
    /// Fatal without a region, for zero or oversized requests and when no
    /// region has a large enough free entry.
    pub fn allocate(&mut self, size: usize) -> NonNull<u8> {
        if self.head.is_null() {
            halt(Fatal::NoHeapRegion);
        }
        if size == 0 {
            halt(Fatal::ZeroSizedAllocation);
        }
        if size >= MAX_ALLOCATION {
            halt(Fatal::OversizedAllocation(size));
        }
        let size = size.next_multiple_of(MIN_BLOCK);

        let mut region = self.head;
        while !region.is_null() {
            // SAFETY: every non-null link points at a live region header.
            unsafe {
                if (*region).remaining >= size as u64
                    && let Some(payload) = Self::allocate_in(region, size)
                {
                    self.validate_all();
                    return payload;
                }
                region = (*region).next;
            }
        }

        halt(Fatal::HeapExhausted(size));
    }

    /// First fit inside one region.
    ///
    /// # Safety
    /// `region` must be a live region header whose entry chain is valid.
    unsafe fn allocate_in(region: *mut RegionHeader, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: live header per the caller.
        let region_size = unsafe { (*region).size } as usize;
        let mut offset = REGION_HEADER_SIZE;

        while offset < region_size {
            // SAFETY: a valid chain only yields offsets of entry headers
            // inside the region.
            let entry = unsafe { entry_at(region, offset) };
            // SAFETY: as above.
            let (signature, entry_size) = unsafe { ((*entry).signature, (*entry).size as usize) };

            if signature == FREE_SIGNATURE && entry_size >= size {
                let rest = entry_size - size;
                // SAFETY: the split header lands inside this free entry's
                // payload, and the entry table has a slot for every possible
                // live entry.
                unsafe {
                    if rest >= ENTRY_HEADER_SIZE + MIN_BLOCK {
                        ptr::write(
                            entry_at(region, offset + ENTRY_HEADER_SIZE + size),
                            EntryHeader {
                                signature: FREE_SIGNATURE,
                                size: (rest - ENTRY_HEADER_SIZE) as u64,
                            },
                        );
                        (*entry).size = size as u64;
                        debug!("heap: split entry at +{offset:#x}, {size} + {rest} bytes");
                    }
                    (*entry).signature = USED_SIGNATURE;
                    (*region).remaining -= (*entry).size;

                    let payload = region.cast::<u8>().add(offset + ENTRY_HEADER_SIZE);
                    let slot = (*region).entry_count as usize;
                    *(*region).entry_table.add(slot) = payload as usize;
                    (*region).entry_count += 1;

                    return NonNull::new(payload);
                }
            }

            offset = offset.saturating_add(ENTRY_HEADER_SIZE).saturating_add(entry_size);
        }

        None
    }

    /// Returns the entry behind `pointer` to its region.
    ///
    /// Fatal when `pointer` was not handed out by [`allocate`](Self::allocate)
    /// or is already free.
    pub fn free(&mut self, pointer: NonNull<u8>) {
        let address = pointer.as_ptr() as usize;

        let mut region = self.head;
        while !region.is_null() {
            // SAFETY: live region headers; the entry table holds
            // `entry_count` initialised slots, and a pointer found there was
            // handed out by `allocate_in`, so a header precedes it.
            unsafe {
                let count = (*region).entry_count as usize;
                let table = core::slice::from_raw_parts_mut((*region).entry_table, count);
                if let Some(slot) = table.iter().position(|&p| p == address) {
                    table.swap(slot, count - 1);
                    (*region).entry_count -= 1;

                    let entry = pointer.as_ptr().sub(ENTRY_HEADER_SIZE).cast::<EntryHeader>();
                    if (*entry).signature != USED_SIGNATURE {
                        halt(Fatal::HeapCorrupt {
                            region: region as usize,
                            reason: "freed entry is not in use",
                        });
                    }
                    (*entry).signature = FREE_SIGNATURE;
                    (*region).remaining += (*entry).size;

                    self.validate_all();
                    return;
                }
                region = (*region).next;
            }
        }

        halt(Fatal::UnknownHeapPointer(address));
    }

    /// Walks the entry chain of `region`.
    ///
    /// Returns `true` for a consistent region; any inconsistency is fatal.
    pub fn valid(&self, region: HeapRegion<'_>) -> bool {
        // SAFETY: a `HeapRegion` only exists for live regions of this heap.
        unsafe { Self::check(region.header) };
        true
    }

    /// The regions in list order.
    pub fn regions(&self) -> impl Iterator<Item = HeapRegion<'_>> + '_ {
        let mut next = self.head;
        core::iter::from_fn(move || {
            let header = NonNull::new(next)?;
            // SAFETY: non-null links point at live region headers.
            next = unsafe { (*next).next };
            Some(HeapRegion {
                header: header.as_ptr(),
                _heap: PhantomData,
            })
        })
    }

    fn validate_all(&self) {
        for region in self.regions() {
            // SAFETY: as in `valid`.
            unsafe { Self::check(region.header) };
        }
    }

    /// Halts unless the entry chain of `region` tiles it exactly.
    ///
    /// # Safety
    /// `region` must be a live region header.
    unsafe fn check(region: *mut RegionHeader) {
        let corrupt = |reason| corrupt(region, reason);

        // SAFETY: live header per the caller.
        let size = unsafe { (*region).size } as usize;
        if size != REGION_SIZE {
            corrupt("region size changed");
        }

        let mut offset = REGION_HEADER_SIZE;
        while offset < size {
            if offset + ENTRY_HEADER_SIZE > size {
                corrupt("entry header crosses the region end");
            }
            // SAFETY: the header at `offset` lies inside the region, checked above.
            let entry = unsafe { entry_at(region, offset) };
            // SAFETY: as above.
            let (signature, entry_size) = unsafe { ((*entry).signature, (*entry).size as usize) };
            if signature != FREE_SIGNATURE && signature != USED_SIGNATURE {
                corrupt("bad entry signature");
            }
            if entry_size < MIN_BLOCK || !entry_size.is_multiple_of(MIN_BLOCK) {
                corrupt("entry size is not a positive multiple of the block size");
            }
            if entry_size > size - offset - ENTRY_HEADER_SIZE {
                corrupt("entry crosses the region end");
            }
            offset += ENTRY_HEADER_SIZE + entry_size;
        }

        if offset != size {
            corrupt("entries do not fill the region");
        }
    }
}

/// A region of a [`Heap`], for inspection.
#[derive(Copy, Clone)]
pub struct HeapRegion<'h> {
    header: *mut RegionHeader,
    _heap: PhantomData<&'h Heap>,
}

impl HeapRegion<'_> {
    #[must_use]
    pub fn base(&self) -> usize {
        self.header as usize
    }

    /// Bytes not handed out to callers.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        // SAFETY: the region outlives the borrow of its heap.
        unsafe { (*self.header).remaining }
    }

    /// Live allocations.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        // SAFETY: as above.
        unsafe { (*self.header).entry_count }
    }
}

#[cold]
fn corrupt(region: *mut RegionHeader, reason: &'static str) -> ! {
    halt(Fatal::HeapCorrupt {
        region: region as usize,
        reason,
    })
}

/// # Safety
/// `offset` must lie inside the region.
#[inline]
unsafe fn entry_at(region: *mut RegionHeader, offset: usize) -> *mut EntryHeader {
    // SAFETY: forwarded to the caller.
    unsafe { region.cast::<u8>().add(offset).cast::<EntryHeader>() }
}
