// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel crash recording.
//!
//! A kernel invariant violation is never reported to user space; the kernel
//! writes a crash record and takes the architecture reboot path. SRAM
//! survives a core reset on the supported parts, so the record is still
//! there for the boot ROM, the supervisor image, or a debugger to pick up.
//!
//! The record is a group of `#[used]` statics with a fixed contract:
//!
//! - `CRASH_STATE`: 0 while the kernel is healthy, 1 while the record is
//!   being written, 2 once it is complete. Any other value means memory
//!   corruption on the way down.
//! - `CRASH_TICK`: the global timestamp at the moment of death.
//! - `CRASH_LEN` / `CRASH_TEXT`: the failure reason as UTF-8, truncated to
//!   the buffer.

use core::fmt::{Display, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

const STATE_RUNNING: usize = 0;
const STATE_WRITING: usize = 1;
const STATE_COMPLETE: usize = 2;

const TEXT_LEN: usize = 96;

#[used]
static CRASH_STATE: AtomicUsize = AtomicUsize::new(STATE_RUNNING);

#[used]
static CRASH_TICK: AtomicUsize = AtomicUsize::new(0);

#[used]
static CRASH_LEN: AtomicUsize = AtomicUsize::new(0);

#[used]
static mut CRASH_TEXT: [u8; TEXT_LEN] = [0; TEXT_LEN];

/// Records `reason` and reboots through the port hook.
///
/// A failure that arrives while a record is already being written is a
/// recursive panic; there is nothing trustworthy left to add, so the first
/// record is left as it stands and the reboot happens immediately.
pub fn abort(reason: impl Display) -> ! {
    abort_impl(&reason)
}

#[inline(never)]
fn abort_impl(reason: &dyn Display) -> ! {
    if CRASH_STATE
        .compare_exchange(
            STATE_RUNNING,
            STATE_WRITING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        crate::arch::reboot();
    }

    CRASH_TICK.store(crate::time::now(), Ordering::Relaxed);

    let mut text = Cursor { at: 0 };
    write!(text, "{reason}").ok();
    CRASH_LEN.store(text.at, Ordering::Relaxed);

    CRASH_STATE.store(STATE_COMPLETE, Ordering::Release);
    crate::arch::reboot()
}

/// Byte-at-a-time writer into the text buffer. Winning the state CAS above
/// is what makes the raw buffer access exclusive.
struct Cursor {
    at: usize,
}

impl Write for Cursor {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for &b in s.as_bytes() {
            if self.at == TEXT_LEN {
                break;
            }
            // Safety: only the CAS winner in `abort_impl` constructs a
            // Cursor, and `at` stays inside the buffer.
            unsafe {
                core::ptr::addr_of_mut!(CRASH_TEXT)
                    .cast::<u8>()
                    .add(self.at)
                    .write(b);
            }
            self.at += 1;
        }
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    abort(info)
}
