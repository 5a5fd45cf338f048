//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and page bases used by the
//! page allocators and the page-table code.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Addresses translated by the page tables. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Addresses of RAM page frames or MMIO. |
//!
//! The page wrappers carry their size as a marker type ([`Size4K`] or
//! [`Size2M`]) so that a 4 KiB frame cannot silently be used where a 2 MiB
//! region base is expected.
//!
//! ## Canonical addresses
//!
//! With 48-bit linear addressing only two windows of the 64-bit space are
//! valid, the lower half `[0, 2^47)` and the upper half
//! `[2^64 - 2^47, 2^64)`:
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌──────────────────────┐
//!                       │   lower half         │
//! 0x0000_7FFF_FFFF_FFFF ├──────────────────────┤
//!                       │   non-canonical hole │
//! 0xFFFF_8000_0000_0000 ├──────────────────────┤
//!                       │   upper half         │
//! 0xFFFF_FFFF_FFFF_FFFF └──────────────────────┘
//! ```
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! assert!(VirtualAddress::new(0x0000_7FFF_FFFF_F000).is_canonical());
//! assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
//! assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
//!
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! assert_eq!(va.page::<Size4K>().base().as_u64(), 0xFFFF_FFFF_8000_1000);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

use core::fmt;
use core::hash::Hash;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// First address past the lower canonical half.
pub const LOWER_HALF_END: u64 = 1 << 47;

/// First address of the upper canonical half.
pub const UPPER_HALF_START: u64 = 0u64.wrapping_sub(LOWER_HALF_END);

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

/// 4 KiB page (4096 bytes).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;

    fn as_str() -> &'static str {
        "4K"
    }
}

/// 2 MiB region (`2_097_152` bytes), the largest buddy block and the heap region size.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;
impl sealed::Sealed for Size2M {}
impl PageSize for Size2M {
    const SIZE: u64 = 2 * 1024 * 1024;
    const SHIFT: u32 = 21;

    fn as_str() -> &'static str {
        "2M"
    }
}

/// Virtual memory address.
///
/// Carries no invariant beyond "this is meant to be a virtual address"; use
/// [`is_canonical`](Self::is_canonical) before handing one to the MMU.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Whether the address lies in one of the two canonical halves of a
    /// 48-bit address space.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        self.0 < LOWER_HALF_END || self.0 >= UPPER_HALF_START
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage {
            value: self.0 & !(S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    /// Adds `bytes`, returning `None` when the result wraps past `2^64`.
    #[inline]
    #[must_use]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Physical memory address.
///
/// Page frames are numbered by [`frame_index`](Self::frame_index), which is
/// also the bit index used by the physical allocator's order-0 bitmap.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Address of the 4 KiB frame with index `index`.
    #[inline]
    #[must_use]
    pub const fn from_frame_index(index: u64) -> Self {
        Self(index << Size4K::SHIFT)
    }

    /// Index of the 4 KiB frame containing this address.
    #[inline]
    #[must_use]
    pub const fn frame_index(self) -> u64 {
        self.0 >> Size4K::SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & (S::SIZE - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage {
            value: self.0 & !(S::SIZE - 1),
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Base of a virtual page of size `S` (lower `S::SHIFT` bits are zero).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    value: u64,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: VirtualAddress) -> Self {
        addr.page::<S>()
    }

    /// Accepts `addr` only if it is already aligned to `S`.
    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: VirtualAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(addr.page::<S>())
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.value)
    }

    /// The page `n` pages further up, wrapping at `2^64`.
    #[inline]
    #[must_use]
    pub const fn forward(self, n: u64) -> Self {
        Self {
            value: self.value.wrapping_add(n << S::SHIFT),
            _phantom: PhantomData,
        }
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>(0x{:016X})", S::as_str(), self.value)
    }
}

impl<S: PageSize> From<VirtualPage<S>> for VirtualAddress {
    #[inline]
    fn from(value: VirtualPage<S>) -> Self {
        value.base()
    }
}

/// Base of a physical page frame of size `S`.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    value: u64,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: PhysicalAddress) -> Self {
        addr.page::<S>()
    }

    #[inline]
    #[must_use]
    pub const fn from_aligned(addr: PhysicalAddress) -> Option<Self> {
        if addr.is_aligned::<S>() {
            Some(addr.page::<S>())
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.value)
    }

    #[inline]
    #[must_use]
    pub const fn forward(self, n: u64) -> Self {
        Self {
            value: self.value + (n << S::SHIFT),
            _phantom: PhantomData,
        }
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:016X})", S::as_str(), self.value)
    }
}

impl<S: PageSize> From<PhysicalPage<S>> for PhysicalAddress {
    #[inline]
    fn from(value: PhysicalPage<S>) -> Self {
        value.base()
    }
}

/// Number of 4 KiB pages needed to hold `bytes` bytes.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(Size4K::SIZE)
}
