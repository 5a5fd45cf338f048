//! # Kernel Configuration and Boot Interface
//!
//! Shared facts between the boot stage and the memory core: the layout of the
//! hand-off data ([`boot`]) and the compile-time memory configuration
//! ([`memory`]).
//!
//! ## Boot hand-off ([`boot`])
//! * **Memory map**: `#[repr(C)]` records of physical ranges and their type
//! * **Kernel layout**: where the loader put the kernel halves, the boot page
//!   tables, the identity map and the scratch window
//!
//! ## Memory configuration ([`memory`])
//! * **Buddy geometry**: page size, number of orders, largest block
//! * **Address domains**: the general (lower half) and kernel (upper half)
//!   virtual ranges managed by the virtual memory manager
//! * **Recursive slot**: the root-table slot that maps the table onto itself
//! * **Heap geometry**: region size and minimum block granularity
//!
//! ```text
//! Virtual Address Space Layout (48-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │     general domain              │
//!                       │  (identity map, general pages)  │
//! 0x0000_8000_0000_0000 ├─────────────────────────────────┤
//!                       │     non-canonical hole          │
//! KERNEL_DOMAIN_BASE    ├─────────────────────────────────┤ 0xFFFF_8000_0000_0000
//!                       │     kernel domain               │
//! RECURSIVE_WINDOW_BASE ├─────────────────────────────────┤ 0xFFFF_FF00_0000_0000
//!                       │     page tables (slot 510)      │
//!                       ├─────────────────────────────────┤ 0xFFFF_FF80_0000_0000
//!                       │     kernel image, bitmaps, heap │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
