//! # Physical Page Allocator
//!
//! Buddy-style tracking of physical page frames with one bitmap per order.
//!
//! ```text
//! order 9  │ 1 bit  = 512 pages (2 MiB) │ derived
//!   ...    │                            │ derived
//! order 1  │ 1 bit  =   2 pages         │ derived
//! order 0  │ 1 bit  =   1 page  (4 KiB) │ ground truth, 1 = used
//! ```
//!
//! A higher-order bit is set as soon as either of its two children is used.
//! Derivation only ever sets bits: once a block was observed partially used
//! it stays marked at the higher orders even after all its pages return.
//! Buddy requests therefore drift towards smaller orders over time, while
//! order 0 always reflects the truth.
//!
//! All orders live back-to-back in one byte buffer. Bits past the last real
//! block of an order are padding and permanently set.

#![allow(clippy::cast_possible_truncation)]

use crate::fatal::{Fatal, halt};
use crate::request::{Allocation, PageFlags, PageState};
use core::ptr;
use kernel_info::boot::{KernelLayout, MemoryMapEntry};
use kernel_info::memory::{CONTIGUOUS_SCAN_START, MAX_BUDDY_PAGES, MAX_ORDER, PAGE_SIZE};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::{align_down, align_up};
use log::{debug, info, warn};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct OrderGeometry {
    /// Byte offset of this order's bitmap inside the buffer.
    offset: usize,
    /// Real blocks tracked at this order.
    blocks: u64,
    /// Bytes used by this order, padding included.
    bytes: usize,
}

/// Per-order layout and the total byte size for `total_pages` pages.
fn geometry(total_pages: u64) -> ([OrderGeometry; MAX_ORDER], usize) {
    let mut orders = [OrderGeometry::default(); MAX_ORDER];
    let mut offset = 0;
    for (order, g) in orders.iter_mut().enumerate() {
        let blocks = total_pages.div_ceil(1 << order);
        let bytes = blocks.div_ceil(8) as usize;
        *g = OrderGeometry {
            offset,
            blocks,
            bytes,
        };
        offset += bytes;
    }
    (orders, offset)
}

/// Page count implied by a memory map: the highest end address over all records.
#[must_use]
pub fn total_pages_of(map: &[MemoryMapEntry]) -> u64 {
    map.iter().map(MemoryMapEntry::end).max().unwrap_or(0) / PAGE_SIZE
}

/// Bytes of bitmap storage needed for `total_pages`, rounded up to whole pages.
#[must_use]
pub fn bitmap_bytes_for(total_pages: u64) -> usize {
    let (_, bytes) = geometry(total_pages);
    align_up(bytes as u64, PAGE_SIZE) as usize
}

pub struct PhysicalAllocator {
    bitmap: &'static mut [u8],
    bitmap_base: PhysicalAddress,
    bitmap_len: usize,
    total_pages: u64,
    available_pages: u64,
    orders: [OrderGeometry; MAX_ORDER],
}

impl PhysicalAllocator {
    /// Builds the allocator for `map`.
    ///
    /// The bitmaps are placed at the page-aligned `usable_memory_start`;
    /// `storage` turns that physical range into a writable slice. Marks used:
    /// the bootstrap regions, the higher-half kernel image, the bitmaps'
    /// own pages, every non-usable record and every range no record covers.
    pub fn initialize(
        map: &[MemoryMapEntry],
        layout: &KernelLayout<'_>,
        storage: impl FnOnce(PhysicalAddress, usize) -> &'static mut [u8],
    ) -> Self {
        let total_pages = total_pages_of(map);
        if total_pages == 0 {
            halt(Fatal::EmptyMemoryMap);
        }

        let (orders, _) = geometry(total_pages);
        let bitmap_len = bitmap_bytes_for(total_pages);
        let bitmap_base = PhysicalAddress::new(align_up(layout.usable_memory_start.as_u64(), PAGE_SIZE));

        let bitmap = storage(bitmap_base, bitmap_len);
        if bitmap.len() < bitmap_len {
            halt(Fatal::BitmapStorage {
                required: bitmap_len,
                actual: bitmap.len(),
            });
        }
        bitmap[..bitmap_len].fill(0);

        let mut this = Self {
            bitmap,
            bitmap_base,
            bitmap_len,
            total_pages,
            available_pages: total_pages,
            orders,
        };
        this.mark_padding();

        for region in layout.bootstrap_regions {
            this.mark_bytes(region.base.as_u64(), region.length, PageState::Used);
        }
        this.mark_bytes(
            layout.higher_half.base.as_u64(),
            layout.higher_half.length,
            PageState::Used,
        );
        this.mark_bytes(bitmap_base.as_u64(), bitmap_len as u64, PageState::Used);
        for entry in map.iter().filter(|e| !e.is_usable()) {
            this.mark_bytes(entry.base, entry.length, PageState::Used);
        }
        this.mark_unreported(map);

        info!(
            "physical: {} pages, {} available, bitmaps at {} ({} bytes)",
            this.total_pages, this.available_pages, this.bitmap_base, this.bitmap_len
        );
        this
    }

    #[inline]
    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }

    #[inline]
    #[must_use]
    pub const fn available_pages(&self) -> u64 {
        self.available_pages
    }

    #[inline]
    #[must_use]
    pub const fn used_pages(&self) -> u64 {
        self.total_pages - self.available_pages
    }

    /// Physical address of the bitmap pages.
    #[inline]
    #[must_use]
    pub const fn bitmap_base(&self) -> PhysicalAddress {
        self.bitmap_base
    }

    #[inline]
    #[must_use]
    pub const fn bitmap_page_count(&self) -> u64 {
        self.bitmap_len as u64 / PAGE_SIZE
    }

    /// Continues on `storage`, a new window onto the same bitmap pages.
    pub fn relocate_bitmaps(&mut self, storage: &'static mut [u8]) {
        if storage.len() < self.bitmap_len {
            halt(Fatal::BitmapStorage {
                required: self.bitmap_len,
                actual: storage.len(),
            });
        }
        // SAFETY: both slices hold at least `bitmap_len` bytes. On hardware they
        // are two windows onto the same frames, which `ptr::copy` tolerates.
        unsafe {
            ptr::copy(self.bitmap.as_ptr(), storage.as_mut_ptr(), self.bitmap_len);
        }
        self.bitmap = storage;
    }

    /// Serves `count` pages.
    ///
    /// With `physical_contiguous` the result is exactly `count` consecutive
    /// pages at or above 1 MiB. Otherwise the buddy search runs, which serves
    /// at most 512 pages and may return fewer than asked for.
    pub fn request_pages(&mut self, count: u64, flags: PageFlags) -> Option<Allocation<PhysicalAddress>> {
        if flags.physical_contiguous() {
            self.request_contiguous(count)
        } else {
            self.request_buddy(count)
        }
    }

    fn request_contiguous(&mut self, count: u64) -> Option<Allocation<PhysicalAddress>> {
        if count == 0 || count > self.available_pages {
            return None;
        }

        let mut run_start = CONTIGUOUS_SCAN_START / PAGE_SIZE;
        let mut page = run_start;
        while page < self.total_pages {
            // skip fully used bytes while no run is open
            if page == run_start && page % 8 == 0 && self.order_byte(0, page / 8) == 0xFF {
                page += 8;
                run_start = page;
                continue;
            }

            if self.bit(0, page) {
                run_start = page + 1;
            } else if page + 1 - run_start == count {
                let address = PhysicalAddress::from_frame_index(run_start);
                self.mark_pages(address, count, PageState::Used);
                debug!("physical: contiguous {count} pages at {address}");
                return Some(Allocation { address, count });
            }
            page += 1;
        }

        warn!("physical: no contiguous run of {count} pages");
        None
    }

    fn request_buddy(&mut self, count: u64) -> Option<Allocation<PhysicalAddress>> {
        if count == 0 || count > MAX_BUDDY_PAGES || self.available_pages == 0 {
            return None;
        }

        let mut order = count.next_power_of_two().trailing_zeros() as usize;
        if 1 << order != count && order >= 2 && count - (1 << (order - 1)) < (1 << (order - 2)) {
            order -= 1;
        }

        for o in (0..=order).rev() {
            if let Some(block) = self.first_free_block(o) {
                let pages = count.min(1 << o);
                let address = PhysicalAddress::from_frame_index(block << o);
                self.mark_pages(address, pages, PageState::Used);
                debug!("physical: order {o} block at {address}, {pages} of {count} pages");
                return Some(Allocation {
                    address,
                    count: pages,
                });
            }
        }

        warn!("physical: no free block for {count} pages");
        None
    }

    /// Sets the order-0 state of `count` pages from the page containing
    /// `address`, then re-derives the higher orders over that range.
    ///
    /// The available counter moves only for pages whose state changes.
    /// Pages past the tracked range are ignored.
    pub fn mark_pages(&mut self, address: PhysicalAddress, count: u64, state: PageState) {
        let first = address.frame_index();
        if count == 0 || first >= self.total_pages {
            return;
        }
        let end = first.saturating_add(count).min(self.total_pages);

        for page in first..end {
            let used = self.bit(0, page);
            match state {
                PageState::Used if !used => {
                    self.set_bit(0, page);
                    self.available_pages -= 1;
                }
                PageState::Free if used => {
                    self.clear_bit(0, page);
                    self.available_pages += 1;
                }
                _ => {}
            }
        }

        self.derive(first, end);
    }

    /// Whether `count` consecutive order-`order` blocks, starting with the
    /// one containing `address`, are all in `state`.
    #[must_use]
    pub fn are_buddies_of_type(
        &self,
        address: PhysicalAddress,
        order: usize,
        count: u64,
        state: PageState,
    ) -> bool {
        if order >= MAX_ORDER || count == 0 {
            return false;
        }
        let first = address.frame_index() >> order;
        let Some(end) = first.checked_add(count) else {
            return false;
        };
        if end > self.orders[order].blocks {
            return false;
        }
        let want_used = state == PageState::Used;
        (first..end).all(|block| self.bit(order, block) == want_used)
    }

    /// Marks the pages overlapping the byte range `[base, base + length)`.
    fn mark_bytes(&mut self, base: u64, length: u64, state: PageState) {
        if length == 0 {
            return;
        }
        let start = align_down(base, PAGE_SIZE);
        let end = align_up(base.saturating_add(length).min(u64::MAX - PAGE_SIZE), PAGE_SIZE);
        self.mark_pages(
            PhysicalAddress::new(start),
            (end - start) / PAGE_SIZE,
            state,
        );
    }

    /// Marks ranges below the top of memory that no record describes.
    fn mark_unreported(&mut self, map: &[MemoryMapEntry]) {
        let top = self.total_pages * PAGE_SIZE;
        let covered = |address: u64| map.iter().any(|e| e.base <= address && address < e.end());
        let starts = core::iter::once(0).chain(map.iter().map(MemoryMapEntry::end));

        for gap_start in starts.filter(|&a| a < top && !covered(a)) {
            let gap_end = map
                .iter()
                .map(|e| e.base)
                .filter(|&b| b > gap_start)
                .min()
                .unwrap_or(top);
            debug!("physical: unreported range {gap_start:#x}..{gap_end:#x}");
            self.mark_bytes(gap_start, gap_end - gap_start, PageState::Used);
        }
    }

    fn mark_padding(&mut self) {
        for order in 0..MAX_ORDER {
            let g = self.orders[order];
            let bits = g.bytes as u64 * 8;
            for block in g.blocks..bits {
                self.set_bit(order, block);
            }
        }
        // a partial last block inherits Used from its padding child
        self.derive(self.total_pages - 1, self.total_pages);
    }

    /// Sets every higher-order block overlapping pages `[first, end)` whose
    /// children are not both free. Never clears.
    fn derive(&mut self, first: u64, end: u64) {
        for order in 1..MAX_ORDER {
            let first_block = first >> order;
            let last_block = (end - 1) >> order;
            for block in first_block..=last_block {
                if self.bit(order - 1, 2 * block) || self.bit(order - 1, 2 * block + 1) {
                    self.set_bit(order, block);
                }
            }
        }
    }

    fn first_free_block(&self, order: usize) -> Option<u64> {
        let g = self.orders[order];
        let bytes = &self.bitmap[g.offset..g.offset + g.bytes];
        let (index, byte) = bytes.iter().enumerate().find(|(_, b)| **b != 0xFF)?;
        let block = index as u64 * 8 + u64::from(byte.trailing_ones());
        (block < g.blocks).then_some(block)
    }

    #[inline]
    fn order_byte(&self, order: usize, byte: u64) -> u8 {
        self.bitmap[self.orders[order].offset + byte as usize]
    }

    /// Out-of-range blocks read as used.
    #[inline]
    fn bit(&self, order: usize, block: u64) -> bool {
        let g = self.orders[order];
        if block >= g.bytes as u64 * 8 {
            return true;
        }
        self.bitmap[g.offset + (block / 8) as usize] & (1 << (block % 8)) != 0
    }

    #[inline]
    fn set_bit(&mut self, order: usize, block: u64) {
        let g = self.orders[order];
        if block < g.bytes as u64 * 8 {
            self.bitmap[g.offset + (block / 8) as usize] |= 1 << (block % 8);
        }
    }

    #[inline]
    fn clear_bit(&mut self, order: usize, block: u64) {
        let g = self.orders[order];
        if block < g.blocks {
            self.bitmap[g.offset + (block / 8) as usize] &= !(1 << (block % 8));
        }
    }
}
