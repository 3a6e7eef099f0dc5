// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pure-software port used for host-side testing.
//!
//! The register set is a plain struct, the "MPU" is a thread-local cell
//! recording the last activated page table, and kernel functions implement
//! a tiny id table the tests can observe. No interrupts, no user mode.

use abi::Error;

use crate::thd::{ArchState, Context, Iret};

/// Stand-in for the saved user register set. The syscall argument and
/// return slots are plain fields; `entry`/`stack`/`param` record the last
/// `init_entry` so tests can watch threads being launched.
#[derive(Clone, Debug, Default)]
pub struct SavedState {
    pub desc: usize,
    pub args: [usize; 3],
    pub retval: isize,
    pub inv_retval: isize,
    pub sp: usize,
    pub lr: usize,
    pub entry: usize,
    pub stack: usize,
    pub param: usize,
}

impl ArchState for SavedState {
    fn syscall_desc(&self) -> usize {
        self.desc
    }

    fn arg(&self, n: usize) -> usize {
        self.args[n]
    }

    fn set_retval(&mut self, v: isize) {
        self.retval = v;
    }

    fn set_inv_retval(&mut self, v: isize) {
        self.inv_retval = v;
    }

    fn init_entry(&mut self, entry: usize, stack: usize, param: usize) {
        self.entry = entry;
        self.stack = stack;
        self.param = param;
        self.sp = stack;
    }

    fn iret_save(&self) -> Iret {
        Iret {
            sp: self.sp,
            lr: self.lr,
        }
    }

    fn iret_restore(&mut self, ret: Iret) {
        self.sp = ret.sp;
        self.lr = ret.lr;
    }
}

/// No coprocessor on the fake port.
#[derive(Clone, Debug, Default)]
pub struct CopState;

/// Copies the live register set into a thread's save area.
pub fn context_save(live: &SavedState, into: &mut Context) {
    into.reg = live.clone();
}

/// Copies a thread's save area over the live register set.
pub fn context_restore(from: &Context, live: &mut SavedState) {
    *live = from.reg.clone();
}

std::thread_local! {
    static ACTIVE_PGT: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
}

/// Records the activated page table. Tests read it back with
/// [`active_pgt`]; each test thread sees its own value.
pub fn set_pgt(pgt_obj: usize) {
    ACTIVE_PGT.with(|c| c.set(pgt_obj));
}

pub fn active_pgt() -> usize {
    ACTIVE_PGT.with(|c| c.get())
}

/// Kernel-function table of the fake port:
///
/// - id 0, sub 0: returns `p1 + p2` (a pure probe for tests);
/// - id 1: prints `p1` as a character;
/// - everything else is unknown.
pub fn kern_func_handler(
    fid: usize,
    sub: usize,
    p1: usize,
    p2: usize,
) -> Result<usize, Error> {
    match (fid, sub) {
        (0, 0) => Ok(p1.wrapping_add(p2)),
        (1, _) => {
            putchar(p1 as u8);
            Ok(0)
        }
        _ => Err(Error::CapNull),
    }
}

pub fn putchar(c: u8) {
    use std::io::Write;
    let _ = std::io::stderr().write_all(&[c]);
}

#[cfg(feature = "klog")]
pub fn klog_line(args: core::fmt::Arguments<'_>) {
    eprintln!("kern: {args}");
}

pub fn reboot() -> ! {
    panic!("SYSTEM RESET");
}

pub fn set_tick_divisor(_cycles: usize) {}

pub fn start_first_thread(_cpu: &crate::thd::CpuLocal) -> ! {
    panic!("entering userland");
}
