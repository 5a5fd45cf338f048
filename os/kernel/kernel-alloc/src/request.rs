use bitfield_struct::bitfield;
use kernel_vmem::LeafAttributes;

/// How a page request is served and how its pages are mapped.
///
/// ```rust
/// # use kernel_alloc::PageFlags;
/// let flags = PageFlags::new()
///     .with_virtual_contiguous(true)
///     .with_allocate_physical(true)
///     .with_kernel_space(true)
///     .with_writable(true);
/// assert!(!flags.leaf_attributes().no_execute);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFlags {
    /// Physical: one run of consecutive frames, scanned first-fit from 1 MiB.
    /// Virtual: back the range with a single physically contiguous run.
    pub physical_contiguous: bool,
    /// Virtual: hand out one run of consecutive pages. Required.
    pub virtual_contiguous: bool,
    /// Virtual: back (or, when freeing, release) the pages with physical frames.
    pub allocate_physical: bool,
    /// Virtual: serve from the kernel domain instead of the general one.
    pub kernel_space: bool,
    pub writable: bool,
    pub cache_disable: bool,
    pub execute_disable: bool,
    #[bits(25)]
    __: u32,
}

impl PageFlags {
    /// Leaf bits for pages mapped under these flags.
    #[inline]
    #[must_use]
    pub const fn leaf_attributes(self) -> LeafAttributes {
        LeafAttributes {
            writable: self.writable(),
            cache_disabled: self.cache_disable(),
            no_execute: self.execute_disable(),
        }
    }
}

/// A served page request: `count` pages starting at `address`.
///
/// Failure is `None` at the call site; there is no in-band sentinel.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Allocation<A> {
    pub address: A,
    pub count: u64,
}

/// Order-0 bit state of a physical page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageState {
    Free,
    Used,
}
