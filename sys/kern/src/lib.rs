// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minos kernel.
//!
//! This is the architecture-independent portion of the operating system: a
//! small capability-based microkernel. User space composes every abstraction
//! -- memory, threads, processes, communication endpoints -- out of typed
//! capabilities held in capability tables; the kernel supplies mechanism and
//! no policy.
//!
//! The code outside the `arch` module is *intended* to be portable to any
//! 32-bit MCU with an MPU, but it is only being actively developed and
//! tested for ARMv7-M-class parts, so some ARM-isms may have unintentionally
//! leaked into the portable parts.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled kernel, there are some basic ideas
//! that appear consistently.
//!
//! 1. Mechanism only. The kernel hands out typed authority and schedules
//!    whatever user space built with it; it has no notion of what a "driver"
//!    or a "server" is.
//! 2. Static configuration. The system takes a single shape specified at
//!    compile time; the kernel pool is the only runtime-sized resource.
//! 3. No waiting inside the kernel. Contention is a failure return, never a
//!    spin; the single suspension point is a blocking signal receive.
//! 4. A strong preference for safe code where reasonable, with the unsafe
//!    residue concentrated in object addressing and the `arch` layer.

#![cfg_attr(target_os = "none", no_std)]

/// Kernel-internal assertion. These guard invariants the kernel cannot
/// honor; failing one ends in the architecture reboot path via the panic
/// handler, not in an error return to user space.
macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("kernel invariant violated");
        }
    };
}

/// Kernel debug logging. Compiles to nothing unless the `klog` feature is
/// enabled, in which case lines go out through the port console.
#[cfg(feature = "klog")]
macro_rules! klog {
    ($s:expr) => { $crate::arch::klog_line(format_args!($s)) };
    ($s:expr, $($tt:tt)*) => { $crate::arch::klog_line(format_args!($s, $($tt)*)) };
}

#[cfg(not(feature = "klog"))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => { let _ = format_args!($s, $($tt)*); };
}

#[macro_use]
pub mod arch;

pub mod captbl;
pub mod config;
pub mod fail;
pub mod inv;
pub mod kfn;
pub mod kmem;
pub mod kot;
pub mod list;
pub mod pgtbl;
pub mod prc;
pub mod sig;
pub mod startup;
pub mod syscalls;
pub mod thd;
pub mod time;

#[cfg(test)]
pub(crate) mod testutil;

/// Process-wide kernel state: the kernel-object table over the pool.
///
/// There is exactly one of these per system, created at boot and never torn
/// down. It is passed by reference into every operation that can create or
/// destroy kernel objects, which keeps the hot paths free of it and makes
/// the whole kernel constructible in a test harness.
pub struct Kernel {
    pub kot: kot::Kot,
}
