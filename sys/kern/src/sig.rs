// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signal endpoints: counting rendezvous with optional single-receiver
//! blocking.
//!
//! A send increments the pending counter unless a receiver is blocked on
//! the endpoint *and* on the sender's own CPU, in which case the receiver
//! is unblocked with return value 1 and scheduled if it outranks the
//! sender. At most one thread may block on an endpoint at a time; the
//! blocked slot is claimed by CAS so racing receivers fail cleanly.
//!
//! Kernel-originated sends (ticks, interrupts, fault paths) use the same
//! protocol but never preempt inside the handler; the handler runs the
//! pick-highest pass once on its way out, so a burst of sends costs one
//! context switch.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{CapType, Cid, CptFlags, Error, KomFlags, RcvOpt, SigFlags, SLICE_INIT};

use crate::captbl::CptRef;
use crate::config::{CAP_REFS_MAX, SIG_COUNT_MAX};
use crate::kmem;
use crate::kot;
use crate::thd::{self, ArchState, CpuLocal, ThdState, Thread};
use crate::Kernel;

/// Internal representation of a signal endpoint.
#[repr(C)]
pub struct SigEndpoint {
    /// Pending signal count.
    count: AtomicUsize,
    /// kaddr of the single blocked receiver, or 0.
    blocked: AtomicUsize,
    /// Schedulers wired to this endpoint at bind time.
    refcnt: AtomicUsize,
}

/// Pool footprint of a signal endpoint.
pub const SIG_SIZE: usize = kot::round_up(core::mem::size_of::<SigEndpoint>());

impl SigEndpoint {
    /// Reconstitutes an endpoint reference from a kernel address.
    ///
    /// # Safety
    ///
    /// `kaddr` must point at a live endpoint: one reached through a
    /// published capability, a blocked thread's record, or a scheduler
    /// binding (all of which pin it).
    pub unsafe fn deref<'a>(kaddr: usize) -> &'a SigEndpoint {
        unsafe { &*(kaddr as *const SigEndpoint) }
    }

    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn blocked(&self) -> usize {
        self.blocked.load(Ordering::Relaxed)
    }

    pub fn clear_blocked(&self) {
        self.blocked.store(0, Ordering::Relaxed);
    }

    pub fn ref_inc(&self) {
        let old = self.refcnt.fetch_add(1, Ordering::AcqRel);
        uassert!(old < CAP_REFS_MAX);
    }

    pub fn ref_dec(&self) {
        let old = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        uassert!(old != 0);
    }
}

fn init_object(vaddr: usize) {
    // Safety: callers hold the fresh KOT mark on this range.
    unsafe {
        core::ptr::write_bytes(vaddr as *mut u8, 0, SIG_SIZE);
    }
}

/// `sig-crt`: creates a signal endpoint.
pub fn crt(
    kernel: &Kernel,
    cpt: CptRef,
    cap_cpt: Cid,
    cap_kom: Cid,
    dst_slot: usize,
    raddr: usize,
) -> Result<usize, Error> {
    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::CRT.bits())?;
    let (kom, kom_head) = cpt.lookup(cap_kom, CapType::Kom)?;
    let vaddr = kmem::check(kom, kom_head, KomFlags::SIG, raddr, SIG_SIZE)?;

    let dst = CptRef::from_slot(op).slot(dst_slot)?;
    dst.occupy()?;
    if let Err(e) = kernel.kot.mark(vaddr, SIG_SIZE) {
        dst.abort();
        return Err(e);
    }

    init_object(vaddr);
    dst.fill(0, vaddr, SigFlags::all().bits(), 0, 0);
    dst.publish(CapType::Sig, 0);
    Ok(0)
}

/// Boot-time endpoint creation (tick and vector endpoints), published
/// pre-referenced.
pub fn boot_crt(
    kernel: &Kernel,
    cpt: CptRef,
    dst_slot: usize,
    vaddr: usize,
) -> Result<usize, Error> {
    let dst = cpt.slot(dst_slot)?;
    dst.occupy()?;
    if let Err(e) = kernel.kot.mark(vaddr, SIG_SIZE) {
        dst.abort();
        return Err(e);
    }

    init_object(vaddr);
    dst.fill(0, vaddr, SigFlags::all().bits(), 0, 0);
    dst.publish(CapType::Sig, 1);
    Ok(0)
}

/// `sig-del`: deletes an endpoint nobody is blocked on or wired to.
pub fn del(kernel: &Kernel, cpt: CptRef, cap_cpt: Cid, slot: usize) -> Result<usize, Error> {
    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::DEL.bits())?;
    let target = CptRef::from_slot(op).slot(slot)?;
    let head = target.delete_check(CapType::Sig)?;

    // Safety: delete_check proved the slot holds a live endpoint.
    let sig = unsafe { SigEndpoint::deref(target.object()) };
    if sig.blocked() != 0 {
        target.defrost();
        return Err(Error::SivAct);
    }
    if sig.refcnt.load(Ordering::Relaxed) != 0 {
        target.defrost();
        return Err(Error::SivConflict);
    }

    let object = target.object();
    target.clear(head)?;
    uassert!(kernel.kot.erase(object, SIG_SIZE).is_ok());
    Ok(0)
}

/// Kernel-originated send: from ticks, interrupts and fault handling. Never
/// switches; the interrupt exit path runs pick-highest once for all sends
/// made in the handler.
pub fn kern_snd(cpu: &CpuLocal, sig: &SigEndpoint) -> Result<(), Error> {
    let blocked = sig.blocked();
    let unblock = blocked != 0 && {
        // Safety: a blocked thread is pinned by the endpoint's record.
        let thd = unsafe { Thread::deref(blocked) };
        thd.is_on(cpu)
    };

    if unblock {
        // Safety: same as above; additionally the thread is on our CPU.
        let thd = unsafe { Thread::deref(blocked) };
        // The receiver always sees exactly one signal taken, even if it
        // asked for multi-receive: other senders may drain the counter
        // while it was parked.
        unsafe {
            thd.context_mut().reg.set_retval(1);
        }
        thd.set_block_sig(0);
        if thd.slices() != 0 {
            // Ready it and let the handler exit pick the winner; a burst
            // of sends then costs one context switch, not one each.
            thd.set_state(ThdState::Ready);
            thd::run_ins(thd);
        } else {
            // Its entire budget was delegated away while it was blocked.
            // The notification went out at transfer time; just park it.
            thd.set_state(ThdState::Timeout);
        }
        sig.clear_blocked();
        return Ok(());
    }

    // Receiver is remote or absent: count the signal.
    if sig.count.fetch_add(1, Ordering::AcqRel) >= SIG_COUNT_MAX {
        sig.count.fetch_sub(1, Ordering::AcqRel);
        return Err(Error::SivFull);
    }
    Ok(())
}

/// `sig-snd`: sends from user level, possibly preempting in-line when the
/// unblocked receiver outranks the sender.
pub fn snd(
    reg: &mut crate::arch::SavedState,
    cpu: &CpuLocal,
    cpt: CptRef,
    cap_sig: Cid,
) -> Result<(), Error> {
    let slot = cpt.get(cap_sig, CapType::Sig, SigFlags::SND.bits())?;
    // Safety: the capability pins the object.
    let sig = unsafe { SigEndpoint::deref(slot.object()) };

    let blocked = sig.blocked();
    let unblock = blocked != 0 && {
        // Safety: a blocked thread is pinned by the endpoint's record.
        let thd = unsafe { Thread::deref(blocked) };
        thd.is_on(cpu)
    };

    if !unblock {
        if sig.count.fetch_add(1, Ordering::AcqRel) >= SIG_COUNT_MAX {
            sig.count.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::SivFull);
        }
        reg.set_retval(0);
        return Ok(());
    }

    reg.set_retval(0);
    // Safety: as above, on our CPU.
    let thd = unsafe { Thread::deref(blocked) };
    unsafe {
        thd.context_mut().reg.set_retval(1);
    }
    thd.set_block_sig(0);
    if thd.slices() != 0 {
        let cur = cpu.cur_thd();
        if thd.prio() > cur.prio() {
            // The receiver outranks us; it runs before this send returns
            // to the caller.
            cur.set_state(ThdState::Ready);
            thd::run_ins(cur);
            thd.set_state(ThdState::Running);
            thd::run_swt(reg, cur, thd);
            cpu.set_cur_thd(thd);
        } else {
            thd.set_state(ThdState::Ready);
            thd::run_ins(thd);
        }
    } else {
        thd.set_state(ThdState::Timeout);
    }
    sig.clear_blocked();
    Ok(())
}

/// `sig-rcv`: receives in one of four modes. *Single* takes one pending
/// count, *multi* takes them all; the *blocking* variants suspend the
/// caller when nothing is pending. Boot threads may not block.
pub fn rcv(
    reg: &mut crate::arch::SavedState,
    cpu: &CpuLocal,
    cpt: CptRef,
    cap_sig: Cid,
    opt: RcvOpt,
) -> Result<(), Error> {
    let need = match opt {
        RcvOpt::BlockSingle => SigFlags::RCV_BS,
        RcvOpt::BlockMulti => SigFlags::RCV_BM,
        RcvOpt::PollSingle => SigFlags::RCV_NS,
        RcvOpt::PollMulti => SigFlags::RCV_NM,
    };
    let slot = cpt.get(cap_sig, CapType::Sig, need.bits())?;
    // Safety: the capability pins the object.
    let sig = unsafe { SigEndpoint::deref(slot.object()) };

    // One blocked receiver at a time; while somebody is parked here nobody
    // else may receive.
    if sig.blocked() != 0 {
        return Err(Error::SivAct);
    }

    let cur = cpu.cur_thd();
    uassert!(cur.slices() != 0);
    if cur.slices() == SLICE_INIT {
        // Boot threads are the scheduler of last resort; letting one block
        // could leave the CPU with nothing to run.
        return Err(Error::SivBoot);
    }

    let pending = sig.count();
    if pending > 0 {
        // Cannot fetch-sub blindly: another CPU may take the counter to
        // zero under us.
        match opt {
            RcvOpt::BlockSingle | RcvOpt::PollSingle => {
                if sig
                    .count
                    .compare_exchange(
                        pending,
                        pending - 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    return Err(Error::SivConflict);
                }
                reg.set_retval(1);
            }
            RcvOpt::BlockMulti | RcvOpt::PollMulti => {
                if sig
                    .count
                    .compare_exchange(pending, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return Err(Error::SivConflict);
                }
                reg.set_retval(pending.min(isize::MAX as usize) as isize);
            }
        }
        return Ok(());
    }

    match opt {
        RcvOpt::BlockSingle | RcvOpt::BlockMulti => {
            // Claim the blocked slot; a racing receiver or sender loses us
            // the claim and the caller simply retries.
            if sig
                .blocked
                .compare_exchange(0, cur.addr(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Err(Error::SivConflict);
            }

            // No return value yet; it is written by the send that wakes us.
            cur.set_state(ThdState::Blocked);
            cur.set_block_sig(sig.addr());
            let next = thd::run_high(cpu);
            uassert!(next.is_some());
            let next = next.unwrap_or_else(|| unreachable!());
            thd::run_del(next);
            next.set_state(ThdState::Running);
            thd::run_swt(reg, cur, next);
            cpu.set_cur_thd(next);
        }
        RcvOpt::PollSingle | RcvOpt::PollMulti => {
            // Nothing pending; success with zero signals and no state
            // change.
            reg.set_retval(0);
        }
    }
    Ok(())
}
