// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability slots and capability-table operations.
//!
//! A capability table is a contiguous array of fixed-size slots; a slot is
//! empty or holds one typed capability. All concurrency safety funnels
//! through the slot's `head` word, which packs the type tag, the FROZEN bit
//! and the reference count:
//!
//! - **Occupy**: CAS empty → `{FROZEN, type 0}`. Only the winner may write
//!   the other slot words.
//! - **Publish**: release-store of the real type with FROZEN clear. From
//!   this point readers that acquire-load the head may dereference the
//!   object words.
//! - **Freeze**: CAS that sets FROZEN, refused while delegations are
//!   outstanding. While frozen, every use of the capability fails.
//! - **Delete/Remove**: CAS `{FROZEN, type, refs 0}` → empty, allowed only
//!   after a quiescence period has passed since the freeze, so no in-flight
//!   operation can still hold a pre-freeze reference.
//!
//! Any state transition passes through a FROZEN intermediate, and the type
//! is only ever published with release semantics after the object words are
//! written; together these rule out observing a half-built capability.

use abi::{
    param_high, param_low, CapType, Cid, CptFlags, Error, KomFlags,
    CPT_ENTRY_MAX,
};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::{CAP_REFS_MAX, KOM_SLOT_ORDER};
use crate::kmem;
use crate::kot;
use crate::time;
use crate::Kernel;

const TYPE_MASK: usize = 0x3F;
const FROZEN: usize = 0x40;
const REF_SHIFT: u32 = 7;
const REF_ONE: usize = 1 << REF_SHIFT;

/// Extracts the type tag of a head word.
pub fn head_type(head: usize) -> usize {
    head & TYPE_MASK
}

/// Extracts the reference count of a head word.
pub fn head_refs(head: usize) -> usize {
    head >> REF_SHIFT
}

/// Checks the FROZEN bit of a head word.
pub fn head_frozen(head: usize) -> bool {
    head & FROZEN != 0
}

/// One capability slot. Eight words; size is ABI (object layouts are
/// computed from it).
#[derive(Debug, Default)]
#[repr(C)]
pub struct Slot {
    head: AtomicUsize,
    parent: AtomicUsize,
    object: AtomicUsize,
    flags: AtomicUsize,
    info0: AtomicUsize,
    info1: AtomicUsize,
    timestamp: AtomicUsize,
    _pad: AtomicUsize,
}

pub const SLOT_SIZE: usize = core::mem::size_of::<Slot>();
const _: () = assert!(SLOT_SIZE == 8 * core::mem::size_of::<usize>());

/// Size of a capability table with `entries` slots, in pool granules.
pub const fn cpt_size(entries: usize) -> usize {
    kot::round_up(entries * SLOT_SIZE)
}

impl Slot {
    /// Reconstitutes a slot reference from a kernel address.
    ///
    /// # Safety
    ///
    /// `kaddr` must point at a slot inside a live capability table. Slots
    /// reached through `CptRef` lookups or recorded `parent` links satisfy
    /// this: the table's KOT marking outlives every published capability in
    /// it, and parents are pinned by the child's reference count.
    pub unsafe fn deref<'a>(kaddr: usize) -> &'a Slot {
        unsafe { &*(kaddr as *const Slot) }
    }

    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Acquire-loads the head word. Everything a caller reads from the slot
    /// afterwards is ordered after the matching publish.
    pub fn load_head(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    pub fn object(&self) -> usize {
        self.object.load(Ordering::Relaxed)
    }

    pub fn parent(&self) -> usize {
        self.parent.load(Ordering::Relaxed)
    }

    pub fn flags_word(&self) -> usize {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn info0(&self) -> usize {
        self.info0.load(Ordering::Relaxed)
    }

    pub fn info1(&self) -> usize {
        self.info1.load(Ordering::Relaxed)
    }

    /// Fills the slot body. Only legal between a successful `occupy` (or
    /// other claim of exclusivity) and the matching `publish`.
    pub fn fill(&self, parent: usize, object: usize, flags: usize, info0: usize, info1: usize) {
        self.parent.store(parent, Ordering::Relaxed);
        self.object.store(object, Ordering::Relaxed);
        self.flags.store(flags, Ordering::Relaxed);
        self.info0.store(info0, Ordering::Relaxed);
        self.info1.store(info1, Ordering::Relaxed);
        self.timestamp.store(0, Ordering::Relaxed);
    }

    /// Atomically takes an empty slot, leaving it in the FROZEN placeholder
    /// state. The winner initializes the slot; losers see `CapExist`.
    pub fn occupy(&self) -> Result<(), Error> {
        self.head
            .compare_exchange(0, FROZEN, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|_| Error::CapExist)
    }

    /// Publishes the capability: real type, FROZEN clear, given refcount.
    /// The release pairs with `load_head`'s acquire.
    pub fn publish(&self, ty: CapType, refs: usize) {
        self.head
            .store(ty as usize | (refs << REF_SHIFT), Ordering::Release);
    }

    /// Reverts a slot taken by `occupy` back to empty, after a failed
    /// creation.
    pub fn abort(&self) {
        self.head.store(0, Ordering::Release);
    }

    /// Freezes the capability in preparation for delete or remove.
    pub fn freeze(&self) -> Result<(), Error> {
        let head = self.load_head();
        if head_type(head) == 0 {
            return Err(Error::CapNull);
        }
        if head_refs(head) != 0 {
            return Err(Error::CapRefcnt);
        }
        if head_frozen(head) {
            return Err(Error::CapFrozen);
        }
        // Refuse to freeze a slot that has itself not yet quiesced from an
        // earlier freeze-defrost cycle.
        if !time::quiescent(self.timestamp.load(Ordering::Relaxed)) {
            return Err(Error::CapQuie);
        }
        self.timestamp.store(time::now(), Ordering::Relaxed);
        self.head
            .compare_exchange(head, head | FROZEN, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|_| Error::CapExist)
    }

    /// Clears FROZEN after a delete attempt failed a later check.
    pub fn defrost(&self) {
        self.head.fetch_and(!FROZEN, Ordering::Release);
    }

    /// Validates that a root capability of type `ty` may be deleted now:
    /// frozen, unreferenced, quiescent, and not a delegation. Returns the
    /// head snapshot for the final `clear`.
    pub fn delete_check(&self, ty: CapType) -> Result<usize, Error> {
        let head = self.load_head();
        if head_type(head) == 0 {
            return Err(Error::CapNull);
        }
        if head_type(head) != ty as usize {
            return Err(Error::CapType);
        }
        self.teardown_check(head)?;
        if self.parent() != 0 {
            // Delegations are removed, not deleted.
            return Err(Error::CapRoot);
        }
        Ok(head)
    }

    /// Validates that a delegated capability (of any type) may be removed
    /// now. Returns the head snapshot for the final `clear`.
    pub fn remove_check(&self) -> Result<usize, Error> {
        let head = self.load_head();
        if head_type(head) == 0 {
            return Err(Error::CapNull);
        }
        self.teardown_check(head)?;
        if self.parent() == 0 {
            // Roots are deleted, not removed.
            return Err(Error::CapRoot);
        }
        Ok(head)
    }

    fn teardown_check(&self, head: usize) -> Result<(), Error> {
        if !head_frozen(head) {
            return Err(Error::CapFrozen);
        }
        if head_refs(head) != 0 {
            return Err(Error::CapRefcnt);
        }
        if !time::quiescent(self.timestamp.load(Ordering::Relaxed)) {
            return Err(Error::CapQuie);
        }
        Ok(())
    }

    /// Finalizes a delete or remove by swapping the slot to empty. The slot
    /// body is left stale; the next occupy winner overwrites it before
    /// publishing. Losing the swap means a racing teardown got there first.
    pub fn clear(&self, expected_head: usize) -> Result<(), Error> {
        self.head
            .compare_exchange(expected_head, 0, Ordering::AcqRel, Ordering::Acquire)
            .map(drop)
            .map_err(|_| Error::CapNull)
    }

    /// Takes one reference on this capability (delegation, or an embedded
    /// use by a process). Fails if the slot is frozen or the count would
    /// overflow; on failure the count is restored.
    pub fn ref_inc(&self) -> Result<(), Error> {
        let old = self.head.fetch_add(REF_ONE, Ordering::AcqRel);
        if head_frozen(old) {
            self.head.fetch_sub(REF_ONE, Ordering::AcqRel);
            return Err(Error::CapFrozen);
        }
        if head_refs(old) >= CAP_REFS_MAX {
            self.head.fetch_sub(REF_ONE, Ordering::AcqRel);
            return Err(Error::CapRefcnt);
        }
        Ok(())
    }

    /// Releases one reference.
    pub fn ref_dec(&self) {
        let old = self.head.fetch_sub(REF_ONE, Ordering::AcqRel);
        uassert!(head_refs(old) != 0);
    }
}

/// Checks that an already-looked-up capability is usable for an operation
/// requiring `need` flag bits: not frozen, and all bits granted.
pub fn check_perm(head: usize, flags_word: usize, need: usize) -> Result<(), Error> {
    if head_frozen(head) {
        return Err(Error::CapFrozen);
    }
    if flags_word & need != need {
        return Err(Error::CapFlag);
    }
    Ok(())
}

/// A resolved capability table: the slot array and its length. Copies of
/// this are cheap and carry no authority by themselves.
#[derive(Copy, Clone, Debug)]
pub struct CptRef {
    base: usize,
    entries: usize,
}

impl CptRef {
    pub fn new(base: usize, entries: usize) -> Self {
        CptRef { base, entries }
    }

    /// The table described by an already-validated CPT capability slot.
    pub fn from_slot(slot: &Slot) -> Self {
        Self::new(slot.object(), slot.info0())
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Indexes a slot, range-checked.
    pub fn slot(&self, idx: usize) -> Result<&'static Slot, Error> {
        if idx >= self.entries {
            return Err(Error::CapRange);
        }
        // Safety: the table covers `entries` slots starting at `base`, and
        // tables are only reachable through live capabilities.
        Ok(unsafe { Slot::deref(self.base + idx * SLOT_SIZE) })
    }

    /// Resolves a possibly two-level capability id down to a slot, without
    /// inspecting what the final slot holds.
    pub fn locate(&self, cid: Cid) -> Result<&'static Slot, Error> {
        if !cid.is_valid() {
            return Err(Error::CapRange);
        }
        let tbl = if cid.is_two_level() {
            let outer = self.slot(cid.table())?;
            let head = outer.load_head();
            if head_type(head) == 0 {
                return Err(Error::CapNull);
            }
            if head_type(head) != CapType::Cpt as usize {
                return Err(Error::CapType);
            }
            CptRef::from_slot(outer)
        } else {
            *self
        };
        tbl.slot(cid.slot())
    }

    /// Resolves a capability id and checks that the slot holds a published
    /// capability of type `ty`. Returns the slot and its head snapshot.
    pub fn lookup(&self, cid: Cid, ty: CapType) -> Result<(&'static Slot, usize), Error> {
        let slot = self.locate(cid)?;
        let head = slot.load_head();
        if head_type(head) == 0 {
            return Err(Error::CapNull);
        }
        if head_type(head) != ty as usize {
            return Err(Error::CapType);
        }
        Ok((slot, head))
    }

    /// `lookup` plus the not-frozen/flag-bits check most operations want.
    pub fn get(&self, cid: Cid, ty: CapType, need: usize) -> Result<&'static Slot, Error> {
        let (slot, head) = self.lookup(cid, ty)?;
        check_perm(head, slot.flags_word(), need)?;
        Ok(slot)
    }
}

/// Creates the boot capability table: `entries` empty slots at `vaddr`,
/// with slot `self_slot` then published as the table's own capability. The
/// boot capability carries one artificial reference, which makes it (and
/// every other boot object) undeletable.
pub fn boot_init(
    kernel: &Kernel,
    vaddr: usize,
    self_slot: usize,
    entries: usize,
) -> Result<CptRef, Error> {
    if entries == 0 || entries > CPT_ENTRY_MAX || self_slot >= entries {
        return Err(Error::CapRange);
    }
    kernel.kot.mark(vaddr, cpt_size(entries))?;

    // Safety: the range was just marked ours; nothing else references it.
    unsafe {
        core::ptr::write_bytes(vaddr as *mut u8, 0, entries * SLOT_SIZE);
    }

    let tbl = CptRef::new(vaddr, entries);
    let slot = tbl.slot(self_slot)?;
    slot.occupy()?;
    slot.fill(0, vaddr, CptFlags::all().bits(), entries, 0);
    slot.publish(CapType::Cpt, 1);
    Ok(tbl)
}

/// `cpt-crt`: creates a capability table of `entries` slots from kernel
/// memory and publishes its capability in `dst_slot` of the table named by
/// `cap_cpt`.
pub fn crt(
    kernel: &Kernel,
    cpt: CptRef,
    cap_cpt: Cid,
    cap_kom: Cid,
    dst_slot: usize,
    raddr: usize,
    entries: usize,
) -> Result<usize, Error> {
    if entries == 0 || entries > CPT_ENTRY_MAX {
        return Err(Error::CapRange);
    }
    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::CRT.bits())?;
    let (kom, kom_head) = cpt.lookup(cap_kom, CapType::Kom)?;
    let size = cpt_size(entries);
    let vaddr = kmem::check(kom, kom_head, KomFlags::CPT, raddr, size)?;

    let dst = CptRef::from_slot(op).slot(dst_slot)?;
    dst.occupy()?;

    if let Err(e) = kernel.kot.mark(vaddr, size) {
        dst.abort();
        return Err(e);
    }

    // Safety: the KOT mark makes the range exclusively ours.
    unsafe {
        core::ptr::write_bytes(vaddr as *mut u8, 0, entries * SLOT_SIZE);
    }

    dst.fill(0, vaddr, CptFlags::all().bits(), entries, 0);
    dst.publish(CapType::Cpt, 0);
    Ok(0)
}

/// `cpt-del`: deletes an empty capability table, releasing its pool memory.
pub fn del(kernel: &Kernel, cpt: CptRef, cap_cpt: Cid, slot: usize) -> Result<usize, Error> {
    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::DEL.bits())?;
    let target = CptRef::from_slot(op).slot(slot)?;
    let head = target.delete_check(CapType::Cpt)?;

    // A table still holding capabilities cannot be destroyed. The scan is
    // bounded by the table size, which the creator chose.
    let victim = CptRef::from_slot(target);
    for i in 0..victim.entries() {
        if head_type(victim.slot(i)?.load_head()) != 0 {
            target.defrost();
            return Err(Error::CapExist);
        }
    }

    let object = target.object();
    let size = cpt_size(victim.entries());
    target.clear(head)?;
    uassert!(kernel.kot.erase(object, size).is_ok());
    Ok(0)
}

/// `cpt-frz`: freezes a capability, beginning its teardown.
pub fn frz(cpt: CptRef, cap_cpt: Cid, slot: usize) -> Result<usize, Error> {
    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::FRZ.bits())?;
    let target = CptRef::from_slot(op).slot(slot)?;
    target.freeze()?;
    Ok(0)
}

/// `cpt-rem`: removes a delegated capability, reverting the delegation.
pub fn rem(cpt: CptRef, cap_cpt: Cid, slot: usize) -> Result<usize, Error> {
    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::REM.bits())?;
    let target = CptRef::from_slot(op).slot(slot)?;
    let head = target.remove_check()?;
    let parent = target.parent();
    target.clear(head)?;

    // Safety: the parent slot was pinned by the reference we are releasing.
    unsafe { Slot::deref(parent) }.ref_dec();
    Ok(0)
}

/// `cpt-add`: delegates a capability from one table slot to another with
/// narrowed authority.
///
/// The narrowing rules are per-type: page tables narrow their position
/// range, kernel-function capabilities narrow their id range, kernel-memory
/// capabilities narrow both their byte range and their object-kind mask,
/// and everything else narrows its operation bitmask. Widening anything is
/// `CapFlag`.
pub fn add(
    cpt: CptRef,
    dst_cpt: Cid,
    dst_slot: usize,
    src_cpt: Cid,
    src_slot: usize,
    flags_word: usize,
    ext: usize,
) -> Result<usize, Error> {
    let dst_tbl = cpt.get(dst_cpt, CapType::Cpt, CptFlags::ADD_DST.bits())?;
    let src_tbl = cpt.get(src_cpt, CapType::Cpt, CptFlags::ADD_SRC.bits())?;

    let src = CptRef::from_slot(src_tbl).slot(src_slot)?;
    let shead = src.load_head();
    if head_frozen(shead) {
        return Err(Error::CapFrozen);
    }
    if head_type(shead) == 0 {
        return Err(Error::CapNull);
    }
    let ty = match CapType::from_tag(head_type(shead)) {
        Some(t) => t,
        None => return Err(Error::CapType),
    };

    // Work out the narrowed slot body before touching the destination.
    let (new_flags, new_info0, new_info1) = match ty {
        CapType::Pgt => {
            let sflags = src.flags_word();
            if abi::pgt_flags_high(flags_word) > abi::pgt_flags_high(sflags)
                || abi::pgt_flags_low(flags_word) < abi::pgt_flags_low(sflags)
                || abi::pgt_flags_high(flags_word) < abi::pgt_flags_low(flags_word)
            {
                return Err(Error::CapFlag);
            }
            let ops = abi::pgt_flags_ops(flags_word);
            if ops.is_empty() || !abi::pgt_flags_ops(sflags).contains(ops) {
                return Err(Error::CapFlag);
            }
            (flags_word, src.info0(), src.info1())
        }
        CapType::Kfn => {
            let sflags = src.flags_word();
            let (low, high) = (param_low(flags_word), param_high(flags_word));
            if high > param_high(sflags) || low < param_low(sflags) || high < low {
                return Err(Error::CapFlag);
            }
            (flags_word, src.info0(), src.info1())
        }
        CapType::Kom => {
            // The delegated range arrives granule-compressed: relative
            // start and exclusive end, both in granule units. Rounding to
            // the granule is therefore inherent in the encoding and happens
            // unconditionally.
            let rel_start = param_high(flags_word) << KOM_SLOT_ORDER;
            let rel_end = param_low(flags_word) << KOM_SLOT_ORDER;
            let kind = KomFlags::from_bits_truncate(ext);
            if rel_end <= rel_start {
                return Err(Error::CapFlag);
            }
            let src_start = src.info0();
            let src_end = src.info1();
            let start = src_start.checked_add(rel_start).ok_or(Error::CapFlag)?;
            let end = src_start.checked_add(rel_end).ok_or(Error::CapFlag)?;
            if end - 1 > src_end {
                return Err(Error::CapFlag);
            }
            if kind.is_empty() || src.flags_word() & kind.bits() != kind.bits() {
                return Err(Error::CapFlag);
            }
            (kind.bits(), start, end - 1)
        }
        _ => {
            if flags_word == 0 || flags_word & !src.flags_word() != 0 {
                return Err(Error::CapFlag);
            }
            (flags_word, src.info0(), src.info1())
        }
    };

    let dst = CptRef::from_slot(dst_tbl).slot(dst_slot)?;
    dst.occupy()?;
    dst.fill(src.addr(), src.object(), new_flags, new_info0, new_info1);

    if let Err(e) = src.ref_inc() {
        dst.abort();
        return Err(e);
    }

    dst.publish(ty, 0);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kot::tests::test_pool;
    use crate::Kernel;

    pub(crate) fn boot_kernel() -> (Kernel, CptRef, usize) {
        let p = test_pool(256 * 1024);
        let kernel = Kernel { kot: p.kot };
        let root = boot_init(&kernel, p.base, 0, 16).unwrap();
        // Boot kernel-memory capability over the remainder of the pool.
        kmem::boot_crt(
            root,
            1,
            p.base + cpt_size(16),
            p.base + p.size,
            KomFlags::all(),
        )
        .unwrap();
        (kernel, root, p.base)
    }

    const KOM: Cid = Cid::one(1);

    #[test]
    fn boot_table_holds_its_own_capability() {
        let (_kernel, root, base) = boot_kernel();
        let (slot, head) = root.lookup(Cid::one(0), CapType::Cpt).unwrap();
        assert_eq!(slot.object(), base);
        assert_eq!(slot.info0(), 16);
        assert_eq!(head_refs(head), 1);
    }

    #[test]
    fn create_rejects_bad_entry_counts() {
        let (kernel, root, _) = boot_kernel();
        assert_eq!(
            crt(&kernel, root, Cid::one(0), KOM, 2, 0, 0),
            Err(Error::CapRange)
        );
        assert_eq!(
            crt(&kernel, root, Cid::one(0), KOM, 2, 0, CPT_ENTRY_MAX + 1),
            Err(Error::CapRange)
        );
    }

    #[test]
    fn create_then_delete_restores_the_kot() {
        let (kernel, root, _) = boot_kernel();
        crt(&kernel, root, Cid::one(0), KOM, 2, 0, 8).unwrap();
        // Same region cannot be doubly allocated while the table lives.
        assert_eq!(
            crt(&kernel, root, Cid::one(0), KOM, 3, 0, 8),
            Err(Error::CapKot)
        );
        frz(root, Cid::one(0), 2).unwrap();
        del(&kernel, root, Cid::one(0), 2).unwrap();
        // And after deletion the region is free again.
        crt(&kernel, root, Cid::one(0), KOM, 3, 0, 8).unwrap();
    }

    #[test]
    fn delete_requires_freeze_first() {
        let (kernel, root, _) = boot_kernel();
        crt(&kernel, root, Cid::one(0), KOM, 2, 0, 8).unwrap();
        assert_eq!(
            del(&kernel, root, Cid::one(0), 2),
            Err(Error::CapFrozen)
        );
    }

    #[test]
    fn frozen_capability_refuses_use() {
        let (kernel, root, _) = boot_kernel();
        crt(&kernel, root, Cid::one(0), KOM, 2, 0, 8).unwrap();
        frz(root, Cid::one(0), 2).unwrap();
        // Using the frozen table as a create target must fail.
        assert_eq!(
            crt(&kernel, root, Cid::one(2), KOM, 0, cpt_size(8), 8),
            Err(Error::CapFrozen)
        );
        // Delegating it must fail too.
        assert_eq!(
            add(root, Cid::one(0), 3, Cid::one(0), 2, CptFlags::CRT.bits(), 0),
            Err(Error::CapFrozen)
        );
    }

    #[test]
    fn nonempty_table_cannot_be_deleted() {
        let (kernel, root, _) = boot_kernel();
        crt(&kernel, root, Cid::one(0), KOM, 2, 0, 8).unwrap();
        // Put something in it: create a second table whose capability lands
        // in slot 1 of the new table, named through a two-level id.
        crt(&kernel, root, Cid::one(2), KOM, 1, cpt_size(8), 8).unwrap();
        frz(root, Cid::one(0), 2).unwrap();
        assert_eq!(del(&kernel, root, Cid::one(0), 2), Err(Error::CapExist));
    }

    #[test]
    fn delegation_narrows_and_counts_references() {
        let (kernel, root, _) = boot_kernel();
        crt(&kernel, root, Cid::one(0), KOM, 2, 0, 8).unwrap();

        // Delegate the new table with only the CRT right.
        add(root, Cid::one(0), 3, Cid::one(2), 0, CptFlags::CRT.bits(), 0).unwrap();
        let (src, head) = root.lookup(Cid::one(2), CapType::Cpt).unwrap();
        assert_eq!(head_refs(head), 1);
        let (child, _) = root.lookup(Cid::one(3), CapType::Cpt).unwrap();
        assert_eq!(child.parent(), src.addr());
        assert_eq!(child.flags_word(), CptFlags::CRT.bits());

        // The source may not be frozen while the delegation lives.
        assert_eq!(frz(root, Cid::one(0), 2), Err(Error::CapRefcnt));

        // Widening from the narrowed child must fail.
        assert_eq!(
            add(
                root,
                Cid::one(0),
                4,
                Cid::one(0),
                3,
                (CptFlags::CRT | CptFlags::DEL).bits(),
                0
            ),
            Err(Error::CapFlag)
        );

        // Remove restores the source refcount and empties the slot.
        frz(root, Cid::one(0), 3).unwrap();
        rem(root, Cid::one(0), 3).unwrap();
        let (_, head) = root.lookup(Cid::one(2), CapType::Cpt).unwrap();
        assert_eq!(head_refs(head), 0);
        assert_eq!(
            root.lookup(Cid::one(3), CapType::Cpt).err(),
            Some(Error::CapNull)
        );
    }

    #[test]
    fn zero_or_widened_flags_are_rejected() {
        let (kernel, root, _) = boot_kernel();
        crt(&kernel, root, Cid::one(0), KOM, 2, 0, 8).unwrap();
        assert_eq!(
            add(root, Cid::one(0), 3, Cid::one(0), 2, 0, 0),
            Err(Error::CapFlag)
        );
    }

    #[test]
    fn root_and_delegation_teardown_paths_do_not_cross() {
        let (kernel, root, _) = boot_kernel();
        crt(&kernel, root, Cid::one(0), KOM, 2, 0, 8).unwrap();
        add(root, Cid::one(0), 3, Cid::one(2), 0, CptFlags::CRT.bits(), 0).unwrap();

        frz(root, Cid::one(0), 3).unwrap();
        // A delegation cannot be *deleted*.
        assert_eq!(del(&kernel, root, Cid::one(0), 3), Err(Error::CapRoot));
        rem(root, Cid::one(0), 3).unwrap();

        frz(root, Cid::one(0), 2).unwrap();
        // A root cannot be *removed*.
        assert_eq!(rem(root, Cid::one(0), 2), Err(Error::CapRoot));
        del(&kernel, root, Cid::one(0), 2).unwrap();
    }

    #[test]
    fn kmem_delegation_narrows_range_and_kind() {
        let (kernel, root, _) = boot_kernel();
        let (kom, _) = root.lookup(KOM, CapType::Kom).unwrap();
        let kom_base = kom.info0();

        // Narrow to [64K, 128K) relative, THD only.
        let word = abi::param_pack(
            (64 * 1024) >> KOM_SLOT_ORDER,
            (128 * 1024) >> KOM_SLOT_ORDER,
        );
        add(
            root,
            Cid::one(0),
            4,
            Cid::one(0),
            1,
            word,
            KomFlags::THD.bits(),
        )
        .unwrap();

        let (child, _) = root.lookup(Cid::one(4), CapType::Kom).unwrap();
        assert_eq!(child.info0(), kom_base + 64 * 1024);
        assert_eq!(child.info1(), kom_base + 128 * 1024 - 1);
        assert_eq!(child.flags_word(), KomFlags::THD.bits());

        // Re-delegating a wider kind set from the narrowed child fails.
        assert_eq!(
            add(
                root,
                Cid::one(0),
                5,
                Cid::one(0),
                4,
                abi::param_pack(0, (64 * 1024) >> KOM_SLOT_ORDER),
                (KomFlags::THD | KomFlags::SIG).bits(),
            ),
            Err(Error::CapFlag)
        );
        // Creating a table there is outside the child's kind authority.
        assert_eq!(
            crt(&kernel, root, Cid::one(0), Cid::one(4), 5, 0, 8),
            Err(Error::CapFlag)
        );
    }
}
