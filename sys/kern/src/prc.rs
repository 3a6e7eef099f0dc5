// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Processes.
//!
//! A process is nothing but a protection domain: a capability table bound
//! to a page table. It holds references (by slot, not by copy) to the two
//! capabilities, pinning them against freeze for as long as it lives, and
//! carries an object reference count equal to the number of threads and
//! invocation ports naming it.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{CapType, Cid, CptFlags, Error, KomFlags, PgtFlags, PrcFlags};

use crate::captbl::{CptRef, Slot};
use crate::config::CAP_REFS_MAX;
use crate::kmem;
use crate::kot;
use crate::Kernel;

/// Internal representation of a process.
#[repr(C)]
pub struct Process {
    /// Threads plus invocation ports naming this process.
    refcnt: AtomicUsize,
    /// kaddr of the capability-table capability slot in use.
    cpt: AtomicUsize,
    /// kaddr of the page-table capability slot in use.
    pgt: AtomicUsize,
}

/// Pool footprint of a process object.
pub const PRC_SIZE: usize = kot::round_up(core::mem::size_of::<Process>());

impl Process {
    /// Reconstitutes a process reference from a kernel address.
    ///
    /// # Safety
    ///
    /// `kaddr` must point at a live process object: one reached through a
    /// published capability or pinned by a thread/invocation refcount.
    pub unsafe fn deref<'a>(kaddr: usize) -> &'a Process {
        unsafe { &*(kaddr as *const Process) }
    }

    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// The process's current capability table.
    pub fn captbl(&self) -> CptRef {
        // Safety: the slot is pinned by the reference this process holds.
        let slot = unsafe { Slot::deref(self.cpt.load(Ordering::Acquire)) };
        CptRef::from_slot(slot)
    }

    /// The object address of the process's current page table.
    pub fn pgt_obj(&self) -> usize {
        // Safety: as for `captbl`.
        unsafe { Slot::deref(self.pgt.load(Ordering::Acquire)) }.object()
    }

    pub fn refcnt(&self) -> usize {
        self.refcnt.load(Ordering::Relaxed)
    }

    /// Takes an object reference (a thread or invocation now names us).
    pub fn ref_inc(&self) {
        let old = self.refcnt.fetch_add(1, Ordering::AcqRel);
        uassert!(old < CAP_REFS_MAX);
    }

    pub fn ref_dec(&self) {
        let old = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        uassert!(old != 0);
    }
}

fn init_object(
    vaddr: usize,
    cpt_slot: &Slot,
    pgt_slot: &Slot,
) -> &'static Process {
    // Safety: callers hold the fresh KOT mark on this range.
    let prc = unsafe {
        core::ptr::write_bytes(vaddr as *mut u8, 0, PRC_SIZE);
        Process::deref(vaddr)
    };
    prc.cpt.store(cpt_slot.addr(), Ordering::Relaxed);
    prc.pgt.store(pgt_slot.addr(), Ordering::Relaxed);
    prc
}

/// `prc-crt`: creates a process from a capability table and a page table.
pub fn crt(
    kernel: &Kernel,
    cpt: CptRef,
    cap_cpt: Cid,
    cap_kom: Cid,
    dst_slot: usize,
    cap_cpt_new: Cid,
    cap_pgt_new: Cid,
    raddr: usize,
) -> Result<usize, Error> {
    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::CRT.bits())?;
    let cpt_slot = cpt.get(cap_cpt_new, CapType::Cpt, CptFlags::PRC_CRT.bits())?;
    let pgt_slot = cpt.get(cap_pgt_new, CapType::Pgt, PgtFlags::PRC_CRT.bits())?;
    let (kom, kom_head) = cpt.lookup(cap_kom, CapType::Kom)?;
    let vaddr = kmem::check(kom, kom_head, KomFlags::PRC, raddr, PRC_SIZE)?;

    let dst = CptRef::from_slot(op).slot(dst_slot)?;
    dst.occupy()?;
    if let Err(e) = kernel.kot.mark(vaddr, PRC_SIZE) {
        dst.abort();
        return Err(e);
    }

    // Pin the two capabilities for the lifetime of the process.
    if let Err(e) = cpt_slot.ref_inc() {
        uassert!(kernel.kot.erase(vaddr, PRC_SIZE).is_ok());
        dst.abort();
        return Err(e);
    }
    if let Err(e) = pgt_slot.ref_inc() {
        cpt_slot.ref_dec();
        uassert!(kernel.kot.erase(vaddr, PRC_SIZE).is_ok());
        dst.abort();
        return Err(e);
    }

    init_object(vaddr, cpt_slot, pgt_slot);

    dst.fill(0, vaddr, PrcFlags::all().bits(), 0, 0);
    dst.publish(CapType::Prc, 0);
    Ok(0)
}

/// Boot-time process creation: same shape, no kernel-memory capability,
/// published pre-referenced.
pub fn boot_crt(
    kernel: &Kernel,
    cpt: CptRef,
    dst_slot: usize,
    cap_cpt_new: Cid,
    cap_pgt_new: Cid,
    vaddr: usize,
) -> Result<usize, Error> {
    let cpt_slot = cpt.get(cap_cpt_new, CapType::Cpt, CptFlags::PRC_CRT.bits())?;
    let pgt_slot = cpt.get(cap_pgt_new, CapType::Pgt, PgtFlags::PRC_CRT.bits())?;

    let dst = cpt.slot(dst_slot)?;
    dst.occupy()?;
    if let Err(e) = kernel.kot.mark(vaddr, PRC_SIZE) {
        dst.abort();
        return Err(e);
    }

    cpt_slot.ref_inc().unwrap_or_else(|_| uassert!(false));
    pgt_slot.ref_inc().unwrap_or_else(|_| uassert!(false));

    init_object(vaddr, cpt_slot, pgt_slot);

    dst.fill(0, vaddr, PrcFlags::all().bits(), 0, 0);
    dst.publish(CapType::Prc, 1);
    Ok(0)
}

/// `prc-del`: deletes a process nothing names anymore.
pub fn del(kernel: &Kernel, cpt: CptRef, cap_cpt: Cid, slot: usize) -> Result<usize, Error> {
    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::DEL.bits())?;
    let target = CptRef::from_slot(op).slot(slot)?;
    let head = target.delete_check(CapType::Prc)?;

    // Safety: delete_check proved the slot holds a live process.
    let prc = unsafe { Process::deref(target.object()) };
    if prc.refcnt() != 0 {
        target.defrost();
        return Err(Error::ThdRefcnt);
    }

    let object = target.object();
    target.clear(head)?;

    // Release the pinned capability table and page table.
    // Safety: the stored slot addresses were pinned until this moment.
    unsafe {
        Slot::deref(prc.cpt.load(Ordering::Relaxed)).ref_dec();
        Slot::deref(prc.pgt.load(Ordering::Relaxed)).ref_dec();
    }
    uassert!(kernel.kot.erase(object, PRC_SIZE).is_ok());
    Ok(0)
}

/// `prc-cpt`: replaces the process's capability table.
pub fn cpt(cpt: CptRef, cap_prc: Cid, cap_cpt_new: Cid) -> Result<usize, Error> {
    let prc_slot = cpt.get(cap_prc, CapType::Prc, PrcFlags::CPT.bits())?;
    let new_slot = cpt.get(cap_cpt_new, CapType::Cpt, CptFlags::PRC_CPT.bits())?;

    // Reference the new table first; that way failure needs no undo on the
    // process itself.
    new_slot.ref_inc()?;

    // Safety: the capability pins the object.
    let prc = unsafe { Process::deref(prc_slot.object()) };
    let old = prc.cpt.load(Ordering::Acquire);
    if prc
        .cpt
        .compare_exchange(old, new_slot.addr(), Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        new_slot.ref_dec();
        return Err(Error::ThdConflict);
    }

    // Safety: `old` was pinned by the reference we now drop.
    unsafe { Slot::deref(old) }.ref_dec();
    Ok(0)
}

/// `prc-pgt`: replaces the process's page table.
pub fn pgt(cpt: CptRef, cap_prc: Cid, cap_pgt_new: Cid) -> Result<usize, Error> {
    let prc_slot = cpt.get(cap_prc, CapType::Prc, PrcFlags::PGT.bits())?;
    let new_slot = cpt.get(cap_pgt_new, CapType::Pgt, PgtFlags::PRC_PGT.bits())?;

    new_slot.ref_inc()?;

    // Safety: the capability pins the object.
    let prc = unsafe { Process::deref(prc_slot.object()) };
    let old = prc.pgt.load(Ordering::Acquire);
    if prc
        .pgt
        .compare_exchange(old, new_slot.addr(), Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        new_slot.ref_dec();
        return Err(Error::ThdConflict);
    }

    // Safety: `old` was pinned by the reference we now drop.
    unsafe { Slot::deref(old) }.ref_dec();
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captbl::head_refs;
    use crate::startup::{BOOT_CPT, BOOT_KOM, BOOT_PGT, BOOT_PRC};
    use crate::testutil::world;
    use abi::CapType;

    #[test]
    fn replacing_the_captbl_moves_slot_references() {
        let w = world();
        // A second capability table to switch the boot process onto.
        crate::captbl::crt(
            w.kernel,
            w.root,
            Cid::one(BOOT_CPT),
            Cid::one(BOOT_KOM),
            9,
            0x40000,
            8,
        )
        .unwrap();

        let (old_slot, old_head) =
            w.root.lookup(Cid::one(BOOT_CPT), CapType::Cpt).unwrap();
        let old_refs = head_refs(old_head);

        cpt(w.root, Cid::one(BOOT_PRC), Cid::one(9)).unwrap();

        let (new_slot, new_head) = w.root.lookup(Cid::one(9), CapType::Cpt).unwrap();
        assert_eq!(head_refs(new_head), 1);
        let (_, old_head_after) =
            w.root.lookup(Cid::one(BOOT_CPT), CapType::Cpt).unwrap();
        assert_eq!(head_refs(old_head_after), old_refs - 1);

        // The process now resolves names in the new table.
        let prc_slot = w.root.slot(BOOT_PRC).unwrap();
        // Safety: pinned by capability.
        let prc = unsafe { Process::deref(prc_slot.object()) };
        assert_eq!(prc.captbl().base(), new_slot.object());
        let _ = old_slot;
    }

    #[test]
    fn replacing_the_pgt_switches_the_protection_domain() {
        let w = world();
        crate::pgtbl::crt(
            w.kernel,
            w.root,
            Cid::one(BOOT_CPT),
            Cid::one(BOOT_KOM),
            9,
            0x40000,
            0x6000_0000,
            true,
            10,
            3,
        )
        .unwrap();

        pgt(w.root, Cid::one(BOOT_PRC), Cid::one(9)).unwrap();

        let prc_slot = w.root.slot(BOOT_PRC).unwrap();
        // Safety: pinned by capability.
        let prc = unsafe { Process::deref(prc_slot.object()) };
        assert_eq!(prc.pgt_obj(), w.root.slot(9).unwrap().object());

        // The displaced boot page table is unpinned again.
        let (_, head) = w.root.lookup(Cid::one(BOOT_PGT), CapType::Pgt).unwrap();
        assert_eq!(head_refs(head), 1, "only the boot reference remains");
    }
}
