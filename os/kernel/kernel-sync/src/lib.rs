//! # Kernel synchronization primitives
//!
//! The memory core runs in a single execution context. Its process-wide state
//! lives in [`Service`] cells: empty until installed once during bring-up,
//! then handed out one exclusive borrow at a time.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod service;

pub use service::{Service, ServiceError};
