// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared host-test fixture: a booted kernel world on a heap pool.
//!
//! `world()` runs the real `boot_setup` against a leaked pool, which
//! gives every test the same starting point a port would have: root table,
//! kernel-memory and kernel-function capabilities, tick/vector endpoints,
//! identity page table, boot process and a running boot thread at priority
//! 0 with the INIT budget.
//!
//! The `live` register set stands in for the trap frame: tests write the
//! syscall words into it, call the dispatcher, and read results out of it.
//! After a context switch it holds the switched-to thread's registers,
//! exactly as the hardware frame would.

use abi::{param_pack, Cid, Sysnum};

use crate::arch::SavedState;
use crate::captbl::CptRef;
use crate::kot::tests::test_pool;
use crate::startup::{boot_setup, BootConfig, BOOT_KOM, BOOT_THD};
use crate::syscalls::svc_handler;
use crate::thd::{CpuLocal, Thread};
use crate::Kernel;

pub struct World {
    pub kernel: &'static Kernel,
    pub cpu: &'static CpuLocal,
    pub root: CptRef,
    pub live: SavedState,
}

pub fn world() -> World {
    let p = test_pool(1024 * 1024);
    let kernel: &'static Kernel = Box::leak(Box::new(Kernel { kot: p.kot }));
    let cpu: &'static CpuLocal = Box::leak(Box::new(CpuLocal::new()));
    cpu.init(0);

    let cfg = BootConfig {
        pool_base: 0,
        pool_size: 0,
        pgt_base: 0,
        pgt_size_order: 29,
        pgt_num_order: 3,
        pgt_pages: &[0, 1, 2, 3],
        entry: 0x100,
        stack: 0x2000,
        prio: 0,
    };
    let root = boot_setup(kernel, cpu, &cfg, p.base, p.base + p.size).unwrap();

    World {
        kernel,
        cpu,
        root,
        live: SavedState::default(),
    }
}

impl World {
    /// The boot thread (also the default scheduler parent in tests).
    pub fn boot_thd(&self) -> &'static Thread {
        let slot = self.root.slot(BOOT_THD).unwrap();
        // Safety: boot thread is alive for the life of the world.
        unsafe { Thread::deref(slot.object()) }
    }

    /// Issues a syscall through the real dispatcher, as the current
    /// thread. Returns the syscall return register of whichever register
    /// set is live afterwards.
    pub fn syscall(
        &mut self,
        op: Sysnum,
        capid: usize,
        extra: usize,
        p: [usize; 3],
    ) -> isize {
        self.live.desc = param_pack((op as usize) | (extra << 6), capid);
        self.live.args = p;
        svc_handler(self.kernel, self.cpu, &mut self.live);
        self.live.retval
    }

    /// Creates and binds a thread under the boot thread, returning it. The
    /// thread object is created from the boot kernel memory at `raddr`.
    pub fn spawn(
        &mut self,
        slot: usize,
        raddr: usize,
        prio: usize,
        tid: usize,
    ) -> &'static Thread {
        use crate::startup::{BOOT_CPT, BOOT_PRC};
        crate::thd::crt(
            self.kernel,
            self.cpu,
            self.root,
            Cid::one(BOOT_CPT),
            Cid::one(BOOT_KOM),
            slot,
            Cid::one(BOOT_PRC),
            crate::config::MAX_PREEMPT_PRIO - 1,
            raddr,
        )
        .unwrap();
        crate::thd::sched_bind(
            self.cpu,
            self.root,
            Cid::one(slot),
            Cid::one(BOOT_THD),
            Cid::NULL,
            tid,
            prio,
        )
        .unwrap();
        let s = self.root.slot(slot).unwrap();
        // Safety: just created and pinned by its capability.
        unsafe { Thread::deref(s.object()) }
    }
}
