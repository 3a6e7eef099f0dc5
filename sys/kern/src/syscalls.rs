// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall dispatch.
//!
//! The trap entry hands us the caller's saved register set. Four words come
//! in: a descriptor (opcode, extra bits, and a capability id packed into
//! one word) and three parameters; one word goes back out in the syscall
//! return register.
//!
//! Invocation return and activation dominate the call mix under synchronous
//! IPC workloads, so they are branched off first — return before even
//! resolving the caller's capability table, which it does not need.
//!
//! Everything else splits into two groups. Operations that may switch the
//! register set (sends, receives, time transfer, thread switch, priority
//! change, free, kernel functions) write their own return value into
//! whichever register set ends up live and return `Ok(())`; on `Err` the
//! dispatcher writes the error for them. Operations that never switch
//! return `Result<usize, Error>` and the dispatcher writes the outcome
//! unconditionally.

use core::convert::TryFrom;

use abi::{
    param_high, param_low, param_q0, param_q1, Cid, Error, PageFlags,
    RcvOpt, Sysnum, HALF_BITS,
};

use crate::arch;
use crate::captbl;
use crate::inv;
use crate::kfn;
use crate::pgtbl;
use crate::prc;
use crate::sig;
use crate::thd::{self, ArchState, CpuLocal};
use crate::Kernel;

/// Number of bits the opcode occupies in the descriptor's high half; the
/// bits above it are the `extra` field some calls use for small operands.
const OP_BITS: u32 = 6;

fn flat(r: Result<usize, Error>) -> isize {
    match r {
        Ok(v) => v.min(isize::MAX as usize) as isize,
        Err(e) => e.code(),
    }
}

/// Entry point reached from the port's trap handler with the caller's
/// saved register set.
pub fn svc_handler(kernel: &Kernel, cpu: &CpuLocal, reg: &mut arch::SavedState) {
    let desc = reg.syscall_desc();
    let op = param_high(desc) & ((1 << OP_BITS) - 1);
    let extra = param_high(desc) >> OP_BITS;
    let capid = param_low(desc);
    let p = [reg.arg(0), reg.arg(1), reg.arg(2)];

    // Fast path: invocation return touches no capability table at all.
    if op == Sysnum::InvRet as usize {
        if let Err(e) = inv::ret(reg, cpu, p[0] as isize, false) {
            reg.set_retval(e.code());
        }
        return;
    }

    // The capability table all further name resolution runs against: the
    // top invocation's process if we're inside a call, else home. No
    // freeze check is needed; a process pins its table.
    let cpt = cpu.cur_thd().cur_captbl();

    // Fast path: invocation activation.
    if op == Sysnum::InvAct as usize {
        if let Err(e) = inv::act(reg, cpu, cpt, Cid(capid), p[1]) {
            reg.set_retval(e.code());
        }
        return;
    }

    let op = match Sysnum::try_from(op) {
        Ok(op) => op,
        Err(()) => {
            reg.set_retval(Error::CapNull.code());
            return;
        }
    };

    // Operations that may land in a different register set. Each writes
    // its own success value; we only handle the failure side.
    let switching: Option<Result<(), Error>> = match op {
        Sysnum::SigSnd => Some(sig::snd(reg, cpu, cpt, Cid(p[0]))),
        Sysnum::SigRcv => Some(
            RcvOpt::try_from(p[1])
                .map_err(|()| Error::SivAct)
                .and_then(|o| sig::rcv(reg, cpu, cpt, Cid(p[0]), o)),
        ),
        Sysnum::Kfn => Some(kfn::act(
            reg,
            cpt,
            Cid(capid),
            param_high(p[0]),
            param_low(p[0]),
            p[1],
            p[2],
        )),
        Sysnum::ThdSchedPrio => {
            Some(thd::sched_prio(reg, cpu, cpt, Cid(p[0]), p[1]))
        }
        Sysnum::ThdSchedFree => Some(thd::sched_free(reg, cpu, cpt, Cid(p[0]))),
        Sysnum::ThdTimeXfer => {
            Some(thd::time_xfer(reg, cpu, cpt, Cid(p[0]), Cid(p[1]), p[2]))
        }
        Sysnum::ThdSwt => Some(thd::swt(reg, cpu, cpt, Cid(p[0]), p[1] != 0)),
        _ => None,
    };
    if let Some(res) = switching {
        if let Err(e) = res {
            reg.set_retval(e.code());
        }
        return;
    }

    // Everything below never switches; a single write-back suffices.
    let ret = match op {
        Sysnum::CptCrt => captbl::crt(
            kernel,
            cpt,
            Cid(capid),
            Cid(param_high(p[0])),
            param_low(p[0]),
            p[1],
            p[2],
        ),
        Sysnum::CptDel => captbl::del(kernel, cpt, Cid(capid), p[0]),
        Sysnum::CptFrz => captbl::frz(cpt, Cid(capid), p[0]),
        Sysnum::CptAdd => captbl::add(
            cpt,
            Cid(param_high(p[0])),
            param_low(p[0]),
            Cid(param_high(p[1])),
            param_low(p[1]),
            p[2],
            (extra << HALF_BITS) | capid,
        ),
        Sysnum::CptRem => captbl::rem(cpt, Cid(capid), p[0]),
        Sysnum::PgtCrt => pgtbl::crt(
            kernel,
            cpt,
            Cid(capid),
            Cid(param_high(p[0])),
            param_q1(p[0]),
            p[1],
            p[2] & !1,
            p[2] & 1 != 0,
            param_q0(p[0]) as u32,
            extra as u32,
        ),
        Sysnum::PgtDel => pgtbl::del(kernel, cpt, Cid(capid), p[0]),
        Sysnum::PgtAdd => pgtbl::add(
            cpt,
            Cid(param_high(p[0])),
            param_low(p[0]),
            PageFlags::from_bits_truncate(capid),
            Cid(param_high(p[1])),
            param_low(p[1]),
            p[2],
        ),
        Sysnum::PgtRem => pgtbl::rem(cpt, Cid(p[0]), p[1]),
        Sysnum::PgtCon => {
            pgtbl::con(cpt, Cid(param_high(p[0])), p[1], Cid(param_low(p[0])))
        }
        Sysnum::PgtDes => pgtbl::des(cpt, Cid(p[0]), p[1]),
        Sysnum::PrcCrt => prc::crt(
            kernel,
            cpt,
            Cid(capid),
            Cid(param_high(p[0])),
            param_low(p[0]),
            Cid(param_high(p[1])),
            Cid(param_low(p[1])),
            p[2],
        ),
        Sysnum::PrcDel => prc::del(kernel, cpt, Cid(capid), p[0]),
        Sysnum::PrcCpt => prc::cpt(cpt, Cid(p[0]), Cid(p[1])),
        Sysnum::PrcPgt => prc::pgt(cpt, Cid(p[0]), Cid(p[1])),
        Sysnum::ThdCrt => thd::crt(
            kernel,
            cpu,
            cpt,
            Cid(capid),
            Cid(param_high(p[0])),
            param_low(p[0]),
            Cid(param_high(p[1])),
            param_low(p[1]),
            p[2],
        ),
        Sysnum::ThdDel => thd::del(kernel, cpt, Cid(capid), p[0]),
        Sysnum::ThdExecSet => {
            thd::exec_set(cpu, cpt, Cid(capid), p[0], p[1], p[2])
        }
        Sysnum::ThdHypSet => thd::hyp_set(cpu, cpt, Cid(p[0]), p[1]),
        Sysnum::ThdSchedBind => thd::sched_bind(
            cpu,
            cpt,
            Cid(capid),
            Cid(param_high(p[0])),
            Cid(param_low(p[0])),
            p[1],
            p[2],
        ),
        Sysnum::ThdSchedRcv => thd::sched_rcv(reg, cpu, cpt, Cid(p[0])),
        Sysnum::SigCrt => {
            sig::crt(kernel, cpt, Cid(capid), Cid(p[0]), p[1], p[2])
        }
        Sysnum::SigDel => sig::del(kernel, cpt, Cid(capid), p[0]),
        Sysnum::InvCrt => inv::crt(
            kernel,
            cpt,
            Cid(capid),
            Cid(param_high(p[0])),
            param_low(p[0]),
            Cid(p[1]),
            p[2],
        ),
        Sysnum::InvDel => inv::del(kernel, cpt, Cid(capid), p[0]),
        Sysnum::InvSet => inv::set(
            cpt,
            Cid(param_low(p[0])),
            p[1],
            p[2],
            param_high(p[0]) != 0,
        ),
        // Handled above.
        Sysnum::InvRet
        | Sysnum::InvAct
        | Sysnum::SigSnd
        | Sysnum::SigRcv
        | Sysnum::Kfn
        | Sysnum::ThdSchedPrio
        | Sysnum::ThdSchedFree
        | Sysnum::ThdTimeXfer
        | Sysnum::ThdSwt => unreachable!(),
    };
    reg.set_retval(flat(ret));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::{BOOT_CPT, BOOT_KOM, BOOT_PRC, BOOT_THD};
    use crate::testutil::world;
    use abi::{param_pack, CapType};

    #[test]
    fn unknown_opcode_is_a_null_capability_error() {
        let mut w = world();
        w.live.desc = param_pack(35, 0);
        svc_handler(w.kernel, w.cpu, &mut w.live);
        assert_eq!(w.live.retval, Error::CapNull.code());
    }

    #[test]
    fn table_and_object_creation_through_the_trap_path() {
        let mut w = world();
        // cpt-crt: an 8-entry table in boot slot 9 from kernel memory.
        let r = w.syscall(
            Sysnum::CptCrt,
            BOOT_CPT,
            0,
            [param_pack(BOOT_KOM, 9), 0x40000, 8],
        );
        assert_eq!(r, 0);
        let (slot, _) = w.root.lookup(Cid::one(9), CapType::Cpt).unwrap();
        assert_eq!(slot.info0(), 8);

        // Boundary: zero entries is a range error.
        let r = w.syscall(
            Sysnum::CptCrt,
            BOOT_CPT,
            0,
            [param_pack(BOOT_KOM, 10), 0x50000, 0],
        );
        assert_eq!(r, Error::CapRange.code());

        // sig-crt then two sends through the trap path.
        let r = w.syscall(Sysnum::SigCrt, BOOT_CPT, 0, [BOOT_KOM, 10, 0x50000]);
        assert_eq!(r, 0);
        assert_eq!(w.syscall(Sysnum::SigSnd, 0, 0, [10, 0, 0]), 0);
        assert_eq!(w.syscall(Sysnum::SigSnd, 0, 0, [10, 0, 0]), 0);
        let (sig_slot, _) = w.root.lookup(Cid::one(10), CapType::Sig).unwrap();
        // Safety: pinned by capability.
        let sig =
            unsafe { crate::sig::SigEndpoint::deref(sig_slot.object()) };
        assert_eq!(sig.count(), 2);
    }

    #[test]
    fn thread_lifecycle_through_the_trap_path() {
        let mut w = world();
        // thd-crt with ceiling 5 under the boot process.
        let r = w.syscall(
            Sysnum::ThdCrt,
            BOOT_CPT,
            0,
            [param_pack(BOOT_KOM, 9), param_pack(BOOT_PRC, 5), 0],
        );
        assert_eq!(r, 0);

        // thd-sched-bind at priority 4 with TID 99, no endpoint.
        let r = w.syscall(
            Sysnum::ThdSchedBind,
            9,
            0,
            [param_pack(BOOT_THD, Cid::NULL.0), 99, 4],
        );
        assert_eq!(r, 0);

        // thd-time-xfer three slices from the boot thread; the child
        // preempts, so the live frame is now the child's.
        let r = w.syscall(Sysnum::ThdTimeXfer, 0, 0, [9, BOOT_THD, 3]);
        let (slot, _) = w.root.lookup(Cid::one(9), CapType::Thd).unwrap();
        // Safety: pinned by capability.
        let child = unsafe { crate::thd::Thread::deref(slot.object()) };
        assert_eq!(w.cpu.cur_thd().addr(), child.addr());
        // The child's fresh frame has no return value; the boot thread's
        // parked frame has the transfer result.
        let _ = r;
        // Safety: single-threaded test.
        assert_eq!(unsafe { &w.boot_thd().context_mut().reg }.retval, 3);

        // thd-swt back (kernel choice, full yield): the child surrenders
        // its budget and the boot thread resumes.
        let r = w.syscall(Sysnum::ThdSwt, 0, 0, [Cid::NULL.0, 1, 0]);
        assert_eq!(w.cpu.cur_thd().addr(), w.boot_thd().addr());
        assert_eq!(child.slices(), 0);
        let _ = r;

        // thd-sched-rcv reports the timeout.
        let r = w.syscall(Sysnum::ThdSchedRcv, 0, 0, [BOOT_THD, 0, 0]);
        assert_eq!(r, 99);
    }

    #[test]
    fn invocation_fast_paths_through_the_trap_path() {
        let mut w = world();
        // A callee process around the boot table and a fresh page table.
        let r = w.syscall(
            Sysnum::PgtCrt,
            BOOT_CPT,
            3, // num order
            [
                param_pack(BOOT_KOM, (11 << (abi::WORD_BITS / 4)) | 10),
                0x40000,
                0x4000_0000 | 1,
            ],
        );
        assert_eq!(r, 0);
        let r = w.syscall(
            Sysnum::PrcCrt,
            BOOT_CPT,
            0,
            [param_pack(BOOT_KOM, 12), param_pack(BOOT_CPT, 11), 0x41000],
        );
        assert_eq!(r, 0);
        let r = w.syscall(
            Sysnum::InvCrt,
            BOOT_CPT,
            0,
            [param_pack(BOOT_KOM, 13), 12, 0x42000],
        );
        assert_eq!(r, 0);
        let r = w.syscall(
            Sysnum::InvSet,
            0,
            0,
            [param_pack(1, 13), 0x4000_0100, 0x4000_0800],
        );
        assert_eq!(r, 0);

        // inv-act: the live frame lands at the callee entry.
        w.live.sp = 0x9999;
        let _ = w.syscall(Sysnum::InvAct, 13, 0, [0, 0x5555, 0]);
        assert_eq!(w.live.entry, 0x4000_0100);
        assert_eq!(w.live.param, 0x5555);

        // inv-ret: the caller resumes with both return registers set.
        let _ = w.syscall(Sysnum::InvRet, 0, 0, [0x1234, 0, 0]);
        assert_eq!(w.live.retval, 0);
        assert_eq!(w.live.inv_retval, 0x1234);
        assert_eq!(w.live.sp, 0x9999);

        // inv-ret on an empty stack fails with EMPTY.
        let r = w.syscall(Sysnum::InvRet, 0, 0, [0, 0, 0]);
        assert_eq!(r, Error::SivEmpty.code());
    }
}
