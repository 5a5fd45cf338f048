//! # Address Space Lists
//!
//! One virtual address domain as an ordered list of page intervals, each
//! either available or reserved. The intervals tile the domain without gaps
//! or overlap:
//!
//! ```text
//! origin                                                   origin + total
//! │ reserved │       available        │ reserved │ available │
//! └──────────┴────────────────────────┴──────────┴───────────┘
//! ```
//!
//! Positions are kept as page offsets from the domain origin, so the upper
//! canonical half compares and sorts like any other range.

use crate::fatal::{Fatal, halt};
use alloc::vec;
use alloc::vec::Vec;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::VirtualAddress;
use log::trace;

/// One interval of a domain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressSpaceNode {
    pub available: bool,
    pub base: VirtualAddress,
    pub page_count: u64,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Span {
    available: bool,
    /// Page offset from the domain origin.
    start: u64,
    pages: u64,
}

impl Span {
    #[inline]
    const fn end(&self) -> u64 {
        self.start + self.pages
    }
}

#[derive(Debug)]
pub struct AddressSpaceList {
    origin: VirtualAddress,
    total_pages: u64,
    available_pages: u64,
    spans: Vec<Span>,
}

impl AddressSpaceList {
    /// A domain of `total_pages` pages starting at `origin`, all available.
    #[must_use]
    pub fn new(origin: VirtualAddress, total_pages: u64) -> Self {
        Self {
            origin,
            total_pages,
            available_pages: total_pages,
            spans: vec![Span {
                available: true,
                start: 0,
                pages: total_pages,
            }],
        }
    }

    #[inline]
    #[must_use]
    pub const fn origin(&self) -> VirtualAddress {
        self.origin
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

    /// The intervals in address order.
    pub fn nodes(&self) -> impl ExactSizeIterator<Item = AddressSpaceNode> + '_ {
        self.spans.iter().map(|s| AddressSpaceNode {
            available: s.available,
            base: self.address_of(s.start),
            page_count: s.pages,
        })
    }

    /// Whether `address` falls inside this domain.
    #[must_use]
    pub const fn contains(&self, address: VirtualAddress) -> bool {
        self.offset_of(address) < self.total_pages
    }

    /// Reserves `count` pages from the smallest available interval that fits.
    ///
    /// Returns `None` when `count` is zero or no interval is large enough.
    pub fn reserve(&mut self, count: u64) -> Option<VirtualAddress> {
        if count == 0 || count > self.available_pages {
            return None;
        }

        let (index, _) = self
            .spans
            .iter()
            .enumerate()
            .filter(|(_, s)| s.available && s.pages >= count)
            .min_by_key(|(_, s)| s.pages)?;

        let start = self.spans[index].start;
        self.split(index, start, count, false);
        self.available_pages -= count;
        self.defragment();

        let address = self.address_of(start);
        trace!("address space: reserved {count} pages at {address}");
        Some(address)
    }

    /// Reserves `[base, base + count pages)`, which must lie entirely inside
    /// one available interval. Returns `false` otherwise.
    pub fn reserve_at(&mut self, base: VirtualAddress, count: u64) -> bool {
        let Some((index, start)) = self.locate(base, count) else {
            return false;
        };
        if !self.spans[index].available {
            return false;
        }

        self.split(index, start, count, false);
        self.available_pages -= count;
        self.defragment();
        trace!("address space: reserved {count} pages at {base}");
        true
    }

    /// Returns `[base, base + count pages)` to the domain.
    ///
    /// The range must lie entirely inside one reserved interval; anything else
    /// is a fatal ownership violation.
    pub fn release(&mut self, base: VirtualAddress, count: u64) {
        let index = match self.locate(base, count) {
            Some((index, start)) if !self.spans[index].available => {
                self.split(index, start, count, true);
                index
            }
            _ => halt(Fatal::FreeUnowned {
                address: base,
                count,
            }),
        };

        self.available_pages += count;
        self.defragment();
        trace!("address space: released {count} pages at {base} (interval {index})");
    }

    /// Drops empty intervals, merges equal neighbours and checks the tiling.
    pub fn defragment(&mut self) {
        self.spans.retain(|s| s.pages != 0);
        self.spans.dedup_by(|next, prev| {
            if next.available == prev.available {
                prev.pages += next.pages;
                true
            } else {
                false
            }
        });
        self.check();
    }

    /// Index of the interval holding all of `[base, base + count)` and the
    /// page offset of `base`.
    fn locate(&self, base: VirtualAddress, count: u64) -> Option<(usize, u64)> {
        if count == 0 || base.as_u64() % PAGE_SIZE != 0 {
            return None;
        }
        let start = self.offset_of(base);
        let end = start.checked_add(count)?;
        if end > self.total_pages {
            return None;
        }

        let index = self.spans.partition_point(|s| s.end() <= start);
        let span = self.spans.get(index)?;
        (span.start <= start && end <= span.end()).then_some((index, start))
    }

    /// Carves `[start, start + pages)` out of interval `index` and gives it
    /// the `available` state. Leftovers stay on either side.
    fn split(&mut self, index: usize, start: u64, pages: u64, available: bool) {
        let span = self.spans[index];
        let before = Span {
            available: span.available,
            start: span.start,
            pages: start - span.start,
        };
        let middle = Span {
            available,
            start,
            pages,
        };
        let after = Span {
            available: span.available,
            start: start + pages,
            pages: span.end() - (start + pages),
        };
        self.spans.splice(index..=index, [before, middle, after]);
    }

    fn check(&self) {
        let Some(first) = self.spans.first() else {
            halt(Fatal::AddressSpaceCorrupt("no intervals"));
        };
        if first.start != 0 {
            halt(Fatal::AddressSpaceCorrupt("first interval is not at the origin"));
        }
        if self.spans.iter().any(|s| s.pages == 0) {
            halt(Fatal::AddressSpaceCorrupt("empty interval"));
        }
        if self.spans.windows(2).any(|w| w[0].end() != w[1].start) {
            halt(Fatal::AddressSpaceCorrupt("intervals overlap or leave a gap"));
        }
        if self.spans.windows(2).any(|w| w[0].available == w[1].available) {
            halt(Fatal::AddressSpaceCorrupt("neighbouring intervals share a state"));
        }
        if self.spans.iter().map(|s| s.pages).sum::<u64>() != self.total_pages {
            halt(Fatal::AddressSpaceCorrupt("intervals do not cover the domain"));
        }
        let available: u64 = self.spans.iter().filter(|s| s.available).map(|s| s.pages).sum();
        if available != self.available_pages {
            halt(Fatal::AddressSpaceCorrupt("available count drifted"));
        }
    }

    #[inline]
    const fn offset_of(&self, address: VirtualAddress) -> u64 {
        address.as_u64().wrapping_sub(self.origin.as_u64()) / PAGE_SIZE
    }

    #[inline]
    const fn address_of(&self, offset: u64) -> VirtualAddress {
        VirtualAddress::new(self.origin.as_u64().wrapping_add(offset * PAGE_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::memory::{KERNEL_DOMAIN_BASE, KERNEL_DOMAIN_PAGES};

    fn va(raw: u64) -> VirtualAddress {
        VirtualAddress::new(raw)
    }

    fn shape(list: &AddressSpaceList) -> Vec<(bool, u64, u64)> {
        list.nodes()
            .map(|n| (n.available, n.base.as_u64(), n.page_count))
            .collect()
    }

    /// Checks the tiling through the public view only.
    fn assert_well_formed(list: &AddressSpaceList) {
        let nodes: Vec<_> = list.nodes().collect();
        assert_eq!(nodes[0].base, list.origin());
        let mut next = list.origin();
        for pair in nodes.windows(2) {
            assert_ne!(pair[0].available, pair[1].available, "{nodes:?}");
        }
        for node in &nodes {
            assert!(node.page_count > 0);
            assert_eq!(node.base, next, "{nodes:?}");
            next = VirtualAddress::new(next.as_u64().wrapping_add(node.page_count * 4096));
        }
        assert_eq!(nodes.iter().map(|n| n.page_count).sum::<u64>(), list.total_pages());
        let available: u64 = nodes.iter().filter(|n| n.available).map(|n| n.page_count).sum();
        assert_eq!(available, list.available_pages());
    }

    #[test]
    fn interleaved_reserves_and_releases_keep_the_tiling() {
        let mut list = AddressSpaceList::new(va(0x4000_0000), 4096);
        let mut live: Vec<(VirtualAddress, u64)> = Vec::new();
        let mut seed = 0x2545_F491_u64;

        for step in 0..400 {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            let pick = seed >> 33;
            if live.is_empty() || pick % 3 != 0 {
                let count = 1 + pick % 97;
                if let Some(base) = list.reserve(count) {
                    live.push((base, count));
                }
            } else {
                let (base, count) = live.swap_remove(pick as usize % live.len());
                // every other release returns only the tail of the reservation
                if step % 2 == 0 && count > 1 {
                    let keep = count / 2;
                    list.release(base + keep * 4096, count - keep);
                    live.push((base, keep));
                } else {
                    list.release(base, count);
                }
            }
            assert_well_formed(&list);
        }

        for (base, count) in live {
            list.release(base, count);
            assert_well_formed(&list);
        }
        assert_eq!(shape(&list), vec![(true, 0x4000_0000, 4096)]);
    }

    #[test]
    fn reserve_splits_and_merges() {
        let mut list = AddressSpaceList::new(va(0), 100);
        assert!(list.reserve_at(va(10 * 4096), 10));
        assert!(list.reserve_at(va(25 * 4096), 5));
        assert_eq!(list.reserve(4), Some(va(20 * 4096)));
        assert_eq!(list.reserve(8), Some(va(0)));
        assert_eq!(
            shape(&list),
            vec![
                (false, 0, 8),
                (true, 8 * 4096, 2),
                (false, 10 * 4096, 14),
                (true, 24 * 4096, 1),
                (false, 25 * 4096, 5),
                (true, 30 * 4096, 70),
            ]
        );
        assert_eq!(list.available_pages(), 73);
    }

    #[test]
    fn release_restores_a_single_interval() {
        let mut list = AddressSpaceList::new(va(0), 64);
        let a = list.reserve(16).unwrap();
        let b = list.reserve(16).unwrap();
        list.release(a, 16);
        list.release(b, 16);
        assert_eq!(shape(&list), vec![(true, 0, 64)]);
        assert_eq!(list.available_pages(), 64);
    }

    #[test]
    fn release_from_the_middle_of_a_reservation() {
        let mut list = AddressSpaceList::new(va(0x1000_0000), 32);
        let base = list.reserve(32).unwrap();
        list.release(base + 8 * 4096, 4);
        assert_eq!(
            shape(&list),
            vec![
                (false, 0x1000_0000, 8),
                (true, 0x1000_8000, 4),
                (false, 0x1000_C000, 20),
            ]
        );
    }

    #[test]
    fn reserve_at_refuses_straddling_or_reserved_ranges() {
        let mut list = AddressSpaceList::new(va(0), 100);
        assert!(list.reserve_at(va(10 * 4096), 10));
        assert!(!list.reserve_at(va(5 * 4096), 10));
        assert!(!list.reserve_at(va(12 * 4096), 1));
        assert!(!list.reserve_at(va(99 * 4096), 2));
        assert!(!list.reserve_at(va(0x10), 1));
        assert!(!list.reserve_at(va(0), 0));
        assert_eq!(list.available_pages(), 90);
    }

    #[test]
    fn reserve_fails_cleanly() {
        let mut list = AddressSpaceList::new(va(0), 10);
        assert_eq!(list.reserve(0), None);
        assert_eq!(list.reserve(11), None);
        assert!(list.reserve_at(va(4 * 4096), 2));
        // 8 pages free, but no run of 5
        assert_eq!(list.reserve(5), None);
        assert_eq!(list.available_pages(), 8);
    }

    #[test]
    fn upper_half_domain_offsets() {
        let mut list = AddressSpaceList::new(va(KERNEL_DOMAIN_BASE), KERNEL_DOMAIN_PAGES);
        let top = va(0xFFFF_FFFF_FFFF_F000);
        assert!(list.contains(top));
        assert!(!list.contains(va(0x1000)));
        assert!(list.reserve_at(top, 1));
        assert!(!list.reserve_at(top, 2));
        assert_eq!(list.reserve(1), Some(va(KERNEL_DOMAIN_BASE)));
        let nodes: Vec<_> = list.nodes().collect();
        assert_eq!(nodes.last().unwrap().base, top);
        assert!(!nodes.last().unwrap().available);
    }

    #[test]
    #[should_panic(expected = "pages at 0x0000000000005000 are not owned")]
    fn releasing_available_pages_is_fatal() {
        let mut list = AddressSpaceList::new(va(0), 16);
        list.release(va(0x5000), 1);
    }

    #[test]
    #[should_panic(expected = "are not owned")]
    fn releasing_across_intervals_is_fatal() {
        let mut list = AddressSpaceList::new(va(0), 16);
        assert!(list.reserve_at(va(0), 4));
        list.release(va(0x2000), 4);
    }
}
