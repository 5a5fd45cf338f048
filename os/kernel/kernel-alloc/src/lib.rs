//! # Kernel Memory Core
//!
//! Physical page allocation, virtual memory management and the kernel heap,
//! brought up once from the loader's memory map and then shared as
//! singletons.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Heap ([`heap`])                     │
//! │    • fixed 2 MiB regions                            │
//! │    • first-fit entries, split in place, no merging  │
//! │    • GlobalAlloc adapter ([`KernelAllocator`])      │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ regions backed by
//! ┌─────────────────▼───────────────────────────────────┐
//! │         Virtual Memory Manager ([`vmm`])            │
//! │    • recursive page tables (slot 510)               │
//! │    • general and kernel address domains             │
//! │    • map, unmap, crawl                              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ frames from
//! ┌─────────────────▼───────────────────────────────────┐
//! │       Physical Allocator ([`physical`])             │
//! │    • one bitmap per buddy order, 0..=9              │
//! │    • contiguous first-fit scan from 1 MiB           │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Bring-up
//!
//! [`bring_up`] builds all three layers in order and installs them into
//! [`KERNEL_VMM`] and [`KERNEL_HEAP`]. Both are [`kernel_sync::Service`]
//! slots: using one before it is installed, or re-entering it from inside a
//! borrow, is fatal.
//!
//! ## Failure Model
//!
//! Requests that can fail for ordinary reasons return `None` or `false`.
//! Corruption and misuse end in [`halt`], which logs the [`Fatal`] reason and
//! panics.
//!
//! ## Page Table Access
//!
//! The active tables are reached through a [`kernel_vmem::MemoryWindow`].
//! On hardware that is [`kernel_vmem::DirectWindow`]; tests run the same code
//! on a software MMU.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod address_space_list;
pub mod boot;
pub mod fatal;
pub mod global;
pub mod heap;
pub mod paging;
pub mod physical;
pub mod request;
pub mod vmm;

#[cfg(test)]
mod testing;

pub use crate::address_space_list::{AddressSpaceList, AddressSpaceNode};
pub use crate::boot::{KERNEL_HEAP, KERNEL_VMM, bring_up, kernel_heap, kernel_vmm};
pub use crate::fatal::{Fatal, halt};
pub use crate::global::KernelAllocator;
pub use crate::heap::{ENTRY_TABLE_PAGES, Heap, HeapRegion, MAX_ALLOCATION};
pub use crate::paging::{CrawlLevel, CrawlResult, PageTables};
pub use crate::physical::PhysicalAllocator;
pub use crate::request::{Allocation, PageFlags, PageState};
pub use crate::vmm::{VirtualMemoryManager, kernel_data_flags};
