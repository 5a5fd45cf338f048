//! # Diagnostic Trace Output
//!
//! The memory core reports through the `log` facade only. This crate provides
//! where those records go: a [`TraceSink`] that accepts raw bytes, and a
//! [`SinkLogger`] that formats `log` records onto a sink without allocating.
//!
//! ## Output Mechanism
//! ```text
//! info!/debug!/error! in kernel code
//!     ↓
//! SinkLogger (log::Log)
//!     ↓  "[LEVEL] target: message\n"
//! TraceSink::write_bytes
//!     ↓
//! QemuDebugSink → I/O port 0x402 → `-debugcon stdio` on the host
//! ```
//!
//! ## Feature System
//!
//! ### `qemu` Feature (default)
//! Compiles [`QemuDebugSink`], which writes to QEMU's debug console port.
//! Without it only [`NullSink`] and user-provided sinks remain, which is what
//! host-side tests use.
//!
//! ## Usage
//! ```rust,ignore
//! use kernel_trace::{QemuDebugSink, SinkLogger};
//! use log::LevelFilter;
//!
//! static LOGGER: SinkLogger<QemuDebugSink> = SinkLogger::new(QemuDebugSink, LevelFilter::Debug);
//!
//! LOGGER.install().expect("logger installed once");
//! log::info!("memory core online");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::SinkLogger;

/// A byte-string output primitive used purely for diagnostics.
///
/// Implementations must not fault or allocate; output is best effort.
pub trait TraceSink: Send + Sync {
    fn write_bytes(&self, bytes: &[u8]);
}

impl<T: TraceSink + ?Sized> TraceSink for &T {
    #[inline]
    fn write_bytes(&self, bytes: &[u8]) {
        (**self).write_bytes(bytes);
    }
}

/// Discards everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullSink;

impl TraceSink for NullSink {
    #[inline]
    fn write_bytes(&self, _bytes: &[u8]) {}
}

#[cfg(all(feature = "qemu", target_arch = "x86_64"))]
pub use qemu::QemuDebugSink;

#[cfg(all(feature = "qemu", target_arch = "x86_64"))]
mod qemu {
    use crate::TraceSink;

    /// The port number for QEMU's debug port.
    const QEMU_DEBUG_PORT: u16 = 0x402;

    /// Writes to QEMU's debug console (`-debugcon`).
    ///
    /// Requires ring 0; on real hardware the port is usually unclaimed and
    /// the writes are dropped.
    #[derive(Copy, Clone, Debug, Default)]
    pub struct QemuDebugSink;

    impl TraceSink for QemuDebugSink {
        #[inline]
        fn write_bytes(&self, bytes: &[u8]) {
            for &b in bytes {
                // SAFETY: writing the debug port has no memory side effects.
                unsafe { outb(QEMU_DEBUG_PORT, b) }
            }
        }
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nomem, nostack, preserves_flags)
            );
        }
    }
}
