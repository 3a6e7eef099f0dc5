// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronous invocation: thread-migration IPC.
//!
//! An invocation capability names a callee process with an entry point and
//! stack. Activation rides the *caller's* thread into the callee's
//! protection domain: the minimal return state (SP, and LR where it selects
//! stack and mode) is parked in the port, the port is pushed on the
//! thread's invocation stack, the register set is rebuilt at the callee
//! entry, and the callee's page table goes live. Return unwinds exactly
//! that, delivering the callee's return value in the invocation-return
//! register.
//!
//! A port is single-use-at-a-time: `active` is claimed by CAS and re-entry
//! fails. Every element on a thread's invocation stack has `active == 1`,
//! and no port is on two stacks; deletion requires the port inactive.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{CapType, Cid, CptFlags, Error, InvFlags, KomFlags, PrcFlags};

use crate::arch;
use crate::captbl::CptRef;
use crate::kmem;
use crate::kot;
use crate::list::Node;
use crate::prc::Process;
use crate::thd::{ArchState, CpuLocal, Iret};
use crate::Kernel;

/// Internal representation of an invocation port.
#[repr(C)]
pub struct Invocation {
    /// Linkage on the owning thread's invocation stack while active.
    node: Node,
    /// kaddr of the callee process.
    prc: AtomicUsize,
    entry: AtomicUsize,
    stack: AtomicUsize,
    /// Whether a fault in the callee may force a return through this port.
    fault_ret: AtomicUsize,
    active: AtomicUsize,
    /// Caller state restored on return.
    iret_sp: AtomicUsize,
    iret_lr: AtomicUsize,
}

/// Pool footprint of an invocation port.
pub const INV_SIZE: usize = kot::round_up(core::mem::size_of::<Invocation>());

impl Invocation {
    /// Reconstitutes an invocation reference from a kernel address.
    ///
    /// # Safety
    ///
    /// `kaddr` must point at a live invocation port: one reached through a
    /// published capability or through a thread's invocation stack (stack
    /// membership implies `active`, and deletion requires inactive).
    pub unsafe fn deref<'a>(kaddr: usize) -> &'a Invocation {
        unsafe { &*(kaddr as *const Invocation) }
    }

    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// The callee process.
    pub fn process(&self) -> &'static Process {
        // Safety: the port's reference pins the process.
        unsafe { Process::deref(self.prc.load(Ordering::Relaxed)) }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire) != 0
    }

    /// Rips the port off a dead thread's stack during thread deletion.
    pub fn force_pop(&self) {
        self.node.remove();
        self.active.store(0, Ordering::Release);
    }
}

/// `inv-crt`: creates an invocation port into a process.
pub fn crt(
    kernel: &Kernel,
    cpt: CptRef,
    cap_cpt: Cid,
    cap_kom: Cid,
    dst_slot: usize,
    cap_prc: Cid,
    raddr: usize,
) -> Result<usize, Error> {
    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::CRT.bits())?;
    let prc_slot = cpt.get(cap_prc, CapType::Prc, PrcFlags::INV.bits())?;
    let (kom, kom_head) = cpt.lookup(cap_kom, CapType::Kom)?;
    let vaddr = kmem::check(kom, kom_head, KomFlags::INV, raddr, INV_SIZE)?;

    let dst = CptRef::from_slot(op).slot(dst_slot)?;
    dst.occupy()?;
    if let Err(e) = kernel.kot.mark(vaddr, INV_SIZE) {
        dst.abort();
        return Err(e);
    }

    // Safety: the KOT mark makes the range exclusively ours.
    let port = unsafe {
        core::ptr::write_bytes(vaddr as *mut u8, 0, INV_SIZE);
        Invocation::deref(vaddr)
    };
    port.node.reset(vaddr);
    port.prc.store(prc_slot.object(), Ordering::Relaxed);
    port.process().ref_inc();

    dst.fill(0, vaddr, InvFlags::all().bits(), 0, 0);
    dst.publish(CapType::Inv, 0);
    Ok(0)
}

/// `inv-del`: deletes an inactive invocation port.
pub fn del(kernel: &Kernel, cpt: CptRef, cap_cpt: Cid, slot: usize) -> Result<usize, Error> {
    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::DEL.bits())?;
    let target = CptRef::from_slot(op).slot(slot)?;
    let head = target.delete_check(CapType::Inv)?;

    // Safety: delete_check proved the slot holds a live port.
    let port = unsafe { Invocation::deref(target.object()) };
    if port.is_active() {
        target.defrost();
        return Err(Error::SivAct);
    }

    let object = target.object();
    target.clear(head)?;
    port.process().ref_dec();
    uassert!(kernel.kot.erase(object, INV_SIZE).is_ok());
    Ok(0)
}

/// `inv-set`: sets the port's entry, stack, and fault-return permission.
/// Deliberately indifferent to whether the port is currently active.
pub fn set(
    cpt: CptRef,
    cap_inv: Cid,
    entry: usize,
    stack: usize,
    fault_ret: bool,
) -> Result<usize, Error> {
    let slot = cpt.get(cap_inv, CapType::Inv, InvFlags::SET.bits())?;
    // Safety: the capability pins the object.
    let port = unsafe { Invocation::deref(slot.object()) };
    port.entry.store(entry, Ordering::Relaxed);
    port.stack.store(stack, Ordering::Relaxed);
    port.fault_ret
        .store(fault_ret as usize, Ordering::Relaxed);
    Ok(0)
}

/// `inv-act`: activates the port, migrating the current thread into the
/// callee process.
pub fn act(
    reg: &mut arch::SavedState,
    cpu: &CpuLocal,
    cpt: CptRef,
    cap_inv: Cid,
    param: usize,
) -> Result<(), Error> {
    let slot = cpt.get(cap_inv, CapType::Inv, InvFlags::ACT.bits())?;
    // Safety: the capability pins the object.
    let port = unsafe { Invocation::deref(slot.object()) };

    if port.is_active() {
        return Err(Error::SivAct);
    }
    if port
        .active
        .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(Error::SivAct);
    }

    // Park what return needs; everything else is caller-saved at user
    // level and the coprocessor state is consistent across the call.
    let saved = reg.iret_save();
    port.iret_sp.store(saved.sp, Ordering::Relaxed);
    port.iret_lr.store(saved.lr, Ordering::Relaxed);

    let thd = cpu.cur_thd();
    port.node.push_front(thd.inv_stack());

    reg.init_entry(
        port.entry.load(Ordering::Relaxed),
        port.stack.load(Ordering::Relaxed),
        param,
    );

    // Synchronous invocation exists to cross protection domains; switch
    // unconditionally rather than comparing tables.
    arch::set_pgt(port.process().pgt_obj());
    Ok(())
}

/// `inv-ret`: returns from the top invocation with `retval`. With `fault`
/// set this is the forced unwinding after a callee fault, permitted only if
/// the port opted in.
pub fn ret(
    reg: &mut arch::SavedState,
    cpu: &CpuLocal,
    retval: isize,
    fault: bool,
) -> Result<(), Error> {
    let thd = cpu.cur_thd();
    let port = match thd.inv_top() {
        None => return Err(Error::SivEmpty),
        Some(p) => p,
    };

    if fault && port.fault_ret.load(Ordering::Relaxed) == 0 {
        return Err(Error::SivFault);
    }

    port.node.remove();

    reg.iret_restore(Iret {
        sp: port.iret_sp.load(Ordering::Relaxed),
        lr: port.iret_lr.load(Ordering::Relaxed),
    });
    reg.set_inv_retval(retval);

    // The release pairs with the activation CAS: the port may be reentered
    // only after the return value has landed.
    port.active.store(0, Ordering::Release);

    reg.set_retval(if fault { Error::SivFault.code() } else { 0 });

    // Back to whichever domain is now on top, or home.
    arch::set_pgt(thd.cur_pgt());
    Ok(())
}
