// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The page-table layer.
//!
//! On MPU-class parts the hardware walks nothing, so the table format is
//! ours: a tree of software directories, each with a `(size_order,
//! num_order)` geometry — every entry covers `2^size_order` bytes and there
//! are `2^num_order` entries. The top level is tagged TOP, carries the base
//! address of the whole tree, and holds the auxiliary MPU region table that
//! compresses resident directories into hardware regions
//! (`kerncore::pmsav7`).
//!
//! A directory of up to eight leaf pages is one MPU region; absent pages
//! become subregion-disable bits, which is also why all pages in one
//! directory must share the same flags. STATIC mappings are installed into
//! the region table eagerly and must fit; non-STATIC mappings wait for the
//! fault handler's dynamic insert and may be evicted at random.
//!
//! Directory entries are single words: `PRESENT | LEAF | address`, where
//! the address is page-aligned for leaves and word-aligned for child
//! directories.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use abi::{
    pgt_flags_pack, CapType, Cid, CptFlags, Error, KomFlags, PageFlags,
    PgtFlags, CID_MASK,
};
use kerncore::pmsav7::{self, Lfsr, PagePerm, RegionTable};

use crate::captbl::{CptRef, Slot};
use crate::kmem;
use crate::kot;
use crate::Kernel;

const ENT_PRESENT: usize = 1 << 0;
const ENT_LEAF: usize = 1 << 1;
const ENT_ADDR_MASK: usize = !(ENT_PRESENT | ENT_LEAF);

/// Largest directory this format accepts (256 entries). MPU residency is
/// stricter: see `MPU_NUM_ORDER_MAX`.
const NUM_ORDER_MAX: u32 = 8;
/// Smallest (32 B) and largest (4 GiB) page sizes the MPU can express.
const SIZE_ORDER_MIN: u32 = 5;
const SIZE_ORDER_MAX: u32 = 32;
/// Directories wider than eight entries have no subregion encoding, so no
/// leaf pages may be mapped in them.
const MPU_NUM_ORDER_MAX: u32 = 3;

/// TOP tag, kept in bit 0 of the capability's base word (the base is
/// aligned far beyond that).
const BASE_TOP: usize = 1 << 0;

/// Packs the geometry into the capability's `info1` word.
pub const fn pack_order(size_order: u32, num_order: u32) -> usize {
    ((size_order as usize) << 8) | num_order as usize
}

/// Left shift tolerating `order == WORD_BITS`, which arises for the 4 GiB
/// page geometry on 32-bit targets; all such callers shift a zero.
fn shl(v: usize, order: u32) -> usize {
    v.checked_shl(order).unwrap_or(0)
}

/// Matching guarded right shift; shifting everything out yields 0.
fn shr(v: usize, order: u32) -> usize {
    v.checked_shr(order).unwrap_or(0)
}

/// Replacement-policy state for dynamic MPU regions, shared by all tables.
static LFSR_STATE: AtomicU32 = AtomicU32::new(0xACE1_ACE1);

fn with_lfsr<R>(f: impl FnOnce(&mut Lfsr) -> R) -> R {
    let mut lfsr = Lfsr::from_state(LFSR_STATE.load(Ordering::Relaxed));
    let r = f(&mut lfsr);
    LFSR_STATE.store(lfsr.state(), Ordering::Relaxed);
    r
}

/// Directory header, at the front of every page-table object.
#[derive(Default)]
#[repr(C)]
struct PgtMeta {
    /// Start address of the covered range, with `BASE_TOP` in bit 0.
    base: AtomicUsize,
    /// kaddr of the top-level directory this tree hangs under, or 0 when
    /// detached (or when this directory *is* the top).
    toplevel: AtomicUsize,
    /// Geometry, as `pack_order`.
    order: AtomicUsize,
    /// Number of leaf pages mapped here.
    pages: AtomicUsize,
    /// Number of child directories mapped here.
    dirs: AtomicUsize,
    /// The uniform flags of all leaf pages in this directory.
    page_flags: AtomicUsize,
}

const META_SIZE: usize = core::mem::size_of::<PgtMeta>();
const MPU_SIZE: usize = (core::mem::size_of::<RegionTable>()
    + core::mem::size_of::<usize>()
    - 1)
    & !(core::mem::size_of::<usize>() - 1);

/// Bytes a top-level directory occupies in the pool.
pub const fn size_top(num_order: u32) -> usize {
    kot::round_up(
        META_SIZE + MPU_SIZE + (1 << num_order) * core::mem::size_of::<usize>(),
    )
}

/// Bytes a non-top directory occupies in the pool.
pub const fn size_nom(num_order: u32) -> usize {
    kot::round_up(META_SIZE + (1 << num_order) * core::mem::size_of::<usize>())
}

/// A live page-table directory in the pool.
#[derive(Copy, Clone)]
pub struct PgtObj {
    kaddr: usize,
}

impl PgtObj {
    /// Wraps a directory address.
    ///
    /// # Safety
    ///
    /// `kaddr` must point at a live, initialized directory: one reached
    /// through a published capability, a parent entry, or a process's page
    /// table reference.
    pub unsafe fn at(kaddr: usize) -> Self {
        PgtObj { kaddr }
    }

    pub fn addr(&self) -> usize {
        self.kaddr
    }

    fn meta(&self) -> &'static PgtMeta {
        // Safety: per `at`, the object is live; the meta is its prefix.
        unsafe { &*(self.kaddr as *const PgtMeta) }
    }

    pub fn is_top(&self) -> bool {
        self.meta().base.load(Ordering::Relaxed) & BASE_TOP != 0
    }

    /// Start address of the range this directory covers.
    pub fn start(&self) -> usize {
        self.meta().base.load(Ordering::Relaxed) & !BASE_TOP
    }

    pub fn size_order(&self) -> u32 {
        (self.meta().order.load(Ordering::Relaxed) >> 8) as u32
    }

    pub fn num_order(&self) -> u32 {
        (self.meta().order.load(Ordering::Relaxed) & 0xFF) as u32
    }

    pub fn pages(&self) -> usize {
        self.meta().pages.load(Ordering::Relaxed)
    }

    pub fn dirs(&self) -> usize {
        self.meta().dirs.load(Ordering::Relaxed)
    }

    pub fn page_flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(
            self.meta().page_flags.load(Ordering::Relaxed),
        )
    }

    fn entries(&self) -> &'static [AtomicUsize] {
        let base = self.kaddr
            + META_SIZE
            + if self.is_top() { MPU_SIZE } else { 0 };
        // Safety: the object was sized for exactly this many entries.
        unsafe {
            core::slice::from_raw_parts(
                base as *const AtomicUsize,
                1 << self.num_order(),
            )
        }
    }

    pub fn entry(&self, pos: usize) -> usize {
        self.entries()[pos].load(Ordering::Relaxed)
    }

    /// Address of the MPU region table, for the port's context-switch code.
    /// Only meaningful on a top-level directory.
    pub fn mpu_addr(&self) -> usize {
        self.kaddr + META_SIZE
    }

    /// Runs `f` on the MPU region table governing this directory: its own
    /// if it is the top, or its recorded top-level's. `None` if detached.
    fn with_mpu<R>(&self, f: impl FnOnce(&mut RegionTable) -> R) -> Option<R> {
        let top = if self.is_top() {
            self.kaddr
        } else {
            match self.meta().toplevel.load(Ordering::Relaxed) {
                0 => return None,
                t => t,
            }
        };
        // Safety: page tables are mutated only by the CPU operating on the
        // owning process, with interrupts off; the region table therefore
        // has a single writer for the duration of `f`.
        let mpu = unsafe { &mut *((top + META_SIZE) as *mut RegionTable) };
        Some(f(mpu))
    }

    /// Copy of the governing MPU region table, for tests and diagnostics.
    pub fn mpu_snapshot(&self) -> Option<RegionTable> {
        self.with_mpu(|m| m.clone())
    }

    fn init(&self, base: usize, is_top: bool, size_order: u32, num_order: u32) {
        let m = self.meta();
        m.base
            .store(base | if is_top { BASE_TOP } else { 0 }, Ordering::Relaxed);
        m.toplevel.store(0, Ordering::Relaxed);
        m.order.store(pack_order(size_order, num_order), Ordering::Relaxed);
        m.pages.store(0, Ordering::Relaxed);
        m.dirs.store(0, Ordering::Relaxed);
        m.page_flags.store(0, Ordering::Relaxed);

        if is_top {
            self.with_mpu(|mpu| mpu.reset());
        }
        for e in self.entries() {
            e.store(0, Ordering::Relaxed);
        }
    }
}

fn page_perm(flags: PageFlags) -> PagePerm {
    PagePerm {
        write: flags.contains(PageFlags::WRITE),
        execute: flags.contains(PageFlags::EXECUTE),
        cacheable: flags.contains(PageFlags::CACHE),
        bufferable: flags.contains(PageFlags::BUFFER),
    }
}

enum MpuOp {
    Refresh,
    Clear,
}

/// Recomputes this directory's hardware representation in the governing
/// region table: refresh regenerates the RASR from the present leaves and
/// updates/inserts/evicts; clear drops the region.
fn mpu_update(dir: &PgtObj, op: MpuOp) -> Result<(), Error> {
    if dir.num_order() > MPU_NUM_ORDER_MAX {
        return Err(Error::PgtHw);
    }

    let base = dir.start();
    let total_order = dir.size_order() + dir.num_order();
    if total_order > SIZE_ORDER_MAX {
        // Wider than the RASR size field can express.
        return Err(Error::PgtHw);
    }

    let result = dir.with_mpu(|mpu| match op {
        MpuOp::Clear => {
            mpu.clear(base as u32, total_order);
            Ok(())
        }
        MpuOp::Refresh => {
            let mut present = [false; 8];
            for (i, p) in present.iter_mut().enumerate().take(1 << dir.num_order()) {
                let e = dir.entry(i);
                *p = e & ENT_PRESENT != 0 && e & ENT_LEAF != 0;
            }
            let rasr = pmsav7::gen_rasr(
                &present[..1 << dir.num_order()],
                page_perm(dir.page_flags()),
                dir.size_order(),
            );
            if rasr == 0 {
                mpu.clear(base as u32, total_order);
                Ok(())
            } else {
                let is_static = dir.page_flags().contains(PageFlags::STATIC);
                with_lfsr(|lfsr| {
                    mpu.insert(base as u32, total_order, rasr, is_static, lfsr)
                })
                .map_err(|()| Error::PgtHw)
            }
        }
    });

    // A detached directory has no hardware representation to maintain.
    result.unwrap_or(Ok(()))
}

fn attached(dir: &PgtObj) -> bool {
    dir.is_top() || dir.meta().toplevel.load(Ordering::Relaxed) != 0
}

/// Maps a leaf page at `pos`. The first mapping fixes the directory's page
/// flags; later mappings must match them exactly, because one MPU region
/// carries one attribute set.
pub fn page_map(
    dir: &PgtObj,
    paddr: usize,
    pos: usize,
    flags: PageFlags,
) -> Result<(), Error> {
    if !flags.contains(PageFlags::READ) {
        return Err(Error::PgtPerm);
    }
    if dir.num_order() > MPU_NUM_ORDER_MAX {
        return Err(Error::PgtHw);
    }

    if dir.entry(pos) & ENT_PRESENT != 0 {
        return Err(Error::PgtMap);
    }

    if dir.pages() == 0 {
        dir.meta()
            .page_flags
            .store(flags.bits(), Ordering::Relaxed);
    } else if dir.page_flags() != flags {
        return Err(Error::PgtHw);
    }

    let aligned = if dir.size_order() as usize >= usize::BITS as usize {
        0
    } else {
        paddr & !((1usize << dir.size_order()) - 1)
    };
    dir.entries()[pos].store(ENT_PRESENT | ENT_LEAF | aligned, Ordering::Relaxed);

    if attached(dir) && flags.contains(PageFlags::STATIC) {
        // Static pages must be resident; a failed install reverts the map.
        if let Err(e) = mpu_update(dir, MpuOp::Refresh) {
            dir.entries()[pos].store(0, Ordering::Relaxed);
            return Err(e);
        }
    }

    dir.meta().pages.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Unmaps the leaf page at `pos`, refreshing the hardware representation so
/// no stale region outlives the mapping.
pub fn page_unmap(dir: &PgtObj, pos: usize) -> Result<(), Error> {
    if dir.num_order() > MPU_NUM_ORDER_MAX {
        return Err(Error::PgtHw);
    }
    let old = dir.entry(pos);
    if old & ENT_PRESENT == 0 || old & ENT_LEAF == 0 {
        return Err(Error::PgtMap);
    }

    dir.entries()[pos].store(0, Ordering::Relaxed);
    if attached(dir) {
        if let Err(e) = mpu_update(dir, MpuOp::Refresh) {
            dir.entries()[pos].store(old, Ordering::Relaxed);
            return Err(e);
        }
    }
    dir.meta().pages.fetch_sub(1, Ordering::Relaxed);
    Ok(())
}

/// Maps `child` as a child directory of `parent` at `pos`.
fn pgdir_map(parent: &PgtObj, pos: usize, child: &PgtObj) -> Result<(), Error> {
    // A designated top level may not be re-parented.
    if child.is_top() {
        return Err(Error::PgtMap);
    }
    // The parent must already belong to a tree (or be its top), and the
    // child must be loose with no grandchildren of its own.
    if !attached(parent) {
        return Err(Error::PgtMap);
    }
    if child.meta().toplevel.load(Ordering::Relaxed) != 0 || child.dirs() != 0 {
        return Err(Error::PgtMap);
    }
    if parent.entry(pos) & ENT_PRESENT != 0 {
        return Err(Error::PgtMap);
    }

    parent.entries()[pos].store(ENT_PRESENT | child.addr(), Ordering::Relaxed);

    let top = if parent.is_top() {
        parent.addr()
    } else {
        parent.meta().toplevel.load(Ordering::Relaxed)
    };
    child.meta().toplevel.store(top, Ordering::Relaxed);
    parent.meta().dirs.fetch_add(1, Ordering::Relaxed);

    // Static pages in the child must become resident in the new domain.
    if child.pages() != 0 && child.page_flags().contains(PageFlags::STATIC) {
        if let Err(_e) = mpu_update(child, MpuOp::Refresh) {
            parent.entries()[pos].store(0, Ordering::Relaxed);
            child.meta().toplevel.store(0, Ordering::Relaxed);
            parent.meta().dirs.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::PgtMap);
        }
    }
    Ok(())
}

/// Unmaps the child directory at `pos` of `parent`.
fn pgdir_unmap(parent: &PgtObj, pos: usize) -> Result<(), Error> {
    let entry = parent.entry(pos);
    if entry & ENT_PRESENT == 0 || entry & ENT_LEAF != 0 {
        return Err(Error::PgtMap);
    }
    // Safety: present directory entries hold live child directories.
    let child = unsafe { PgtObj::at(entry & ENT_ADDR_MASK) };
    if child.dirs() != 0 {
        // Deconstruct bottom-up.
        return Err(Error::PgtMap);
    }

    // The child's pages leave this domain; drop their region while the
    // child still knows its top level.
    if child.pages() != 0 {
        let _ = mpu_update(&child, MpuOp::Clear);
    }

    parent.entries()[pos].store(0, Ordering::Relaxed);
    child.meta().toplevel.store(0, Ordering::Relaxed);
    parent.meta().dirs.fetch_sub(1, Ordering::Relaxed);
    Ok(())
}

/// Looks up the leaf page at `pos`, returning its physical address and
/// flags.
pub fn lookup(dir: &PgtObj, pos: usize) -> Result<(usize, PageFlags), Error> {
    if pos >> dir.num_order() != 0 {
        return Err(Error::PgtAddr);
    }
    let e = dir.entry(pos);
    if e & ENT_PRESENT == 0 || e & ENT_LEAF == 0 {
        return Err(Error::PgtHw);
    }
    Ok((e & ENT_ADDR_MASK, dir.page_flags()))
}

/// Result of a full page-table walk. Callers use whichever fields they
/// care about.
#[derive(Copy, Clone, Debug)]
pub struct WalkResult {
    /// The directory the page was found in.
    pub dir: usize,
    /// Start of the page's mapping in virtual space.
    pub map_vaddr: usize,
    pub paddr: usize,
    pub size_order: u32,
    pub num_order: u32,
    pub flags: PageFlags,
}

/// Walks a top-level tree for `vaddr`, descending through child
/// directories until a leaf page covers it.
pub fn walk(top: &PgtObj, vaddr: usize) -> Result<WalkResult, Error> {
    if !top.is_top() {
        return Err(Error::PgtAddr);
    }

    let mut dir = *top;
    loop {
        if vaddr < dir.start() {
            return Err(Error::PgtAddr);
        }
        let pos = shr(vaddr - dir.start(), dir.size_order());
        if pos >> dir.num_order() != 0 {
            return Err(Error::PgtAddr);
        }
        let e = dir.entry(pos);
        if e & ENT_PRESENT == 0 {
            return Err(Error::PgtAddr);
        }
        if e & ENT_LEAF != 0 {
            let page_off = vaddr - dir.start() - shl(pos, dir.size_order());
            return Ok(WalkResult {
                dir: dir.addr(),
                map_vaddr: dir.start() + shl(pos, dir.size_order()),
                paddr: (e & ENT_ADDR_MASK) + page_off,
                size_order: dir.size_order(),
                num_order: dir.num_order(),
                flags: dir.page_flags(),
            });
        }
        // Safety: present directory entries hold live child directories.
        dir = unsafe { PgtObj::at(e & ENT_ADDR_MASK) };
    }
}

/// The fault handler's dynamic-insert path: if `vaddr` is backed by a
/// non-STATIC page whose flags include `need`, make its directory resident
/// and report success; otherwise the fault is genuine.
pub fn dyn_fault_insert(top: &PgtObj, vaddr: usize, need: PageFlags) -> Result<(), Error> {
    let hit = walk(top, vaddr)?;
    // A fault on a STATIC page means the kernel lost a region it promised
    // to keep resident; that is our bug, not the thread's.
    uassert!(!hit.flags.contains(PageFlags::STATIC));
    if !hit.flags.contains(need) {
        return Err(Error::PgtPerm);
    }
    // Safety: `walk` only returns live directories.
    let dir = unsafe { PgtObj::at(hit.dir) };
    mpu_update(&dir, MpuOp::Refresh)
}

fn geometry_ok(size_order: u32, num_order: u32) -> bool {
    num_order <= NUM_ORDER_MAX
        && (SIZE_ORDER_MIN..=SIZE_ORDER_MAX).contains(&size_order)
        && (size_order + num_order) as usize <= usize::BITS as usize
}

fn base_aligned(base: usize, total_order: u32) -> bool {
    if total_order as usize >= usize::BITS as usize {
        base == 0
    } else {
        base & ((1usize << total_order) - 1) == 0
    }
}

/// Position-range check against a page-table capability's flags word.
fn pos_allowed(slot: &Slot, pos: usize) -> Result<(), Error> {
    let w = slot.flags_word();
    if pos > abi::pgt_flags_high(w) || pos < abi::pgt_flags_low(w) {
        return Err(Error::CapFlag);
    }
    Ok(())
}

/// `pgt-crt`: creates a page-table directory from kernel memory.
#[allow(clippy::too_many_arguments)]
pub fn crt(
    kernel: &Kernel,
    cpt: CptRef,
    cap_cpt: Cid,
    cap_kom: Cid,
    dst_slot: usize,
    raddr: usize,
    base: usize,
    is_top: bool,
    size_order: u32,
    num_order: u32,
) -> Result<usize, Error> {
    if !geometry_ok(size_order, num_order)
        || !base_aligned(base, size_order + num_order)
    {
        return Err(Error::PgtHw);
    }

    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::CRT.bits())?;
    let (kom, kom_head) = cpt.lookup(cap_kom, CapType::Kom)?;
    let size = if is_top {
        size_top(num_order)
    } else {
        size_nom(num_order)
    };
    let vaddr = kmem::check(kom, kom_head, KomFlags::PGT, raddr, size)?;

    let dst = CptRef::from_slot(op).slot(dst_slot)?;
    dst.occupy()?;
    if let Err(e) = kernel.kot.mark(vaddr, size) {
        dst.abort();
        return Err(e);
    }

    // Safety: the KOT mark makes the range exclusively ours.
    let obj = unsafe { PgtObj::at(vaddr) };
    obj.init(base, is_top, size_order, num_order);

    dst.fill(
        0,
        vaddr,
        pgt_flags_pack(PgtFlags::all(), 0, CID_MASK),
        base | if is_top { BASE_TOP } else { 0 },
        pack_order(size_order, num_order),
    );
    dst.publish(CapType::Pgt, 0);
    Ok(0)
}

/// Boot-time creation of the initial (typically identity) top directory.
pub fn boot_crt(
    kernel: &Kernel,
    cpt: CptRef,
    dst_slot: usize,
    vaddr: usize,
    base: usize,
    is_top: bool,
    size_order: u32,
    num_order: u32,
) -> Result<usize, Error> {
    if !geometry_ok(size_order, num_order)
        || !base_aligned(base, size_order + num_order)
    {
        return Err(Error::PgtHw);
    }
    let size = if is_top {
        size_top(num_order)
    } else {
        size_nom(num_order)
    };
    let dst = cpt.slot(dst_slot)?;
    dst.occupy()?;
    if let Err(e) = kernel.kot.mark(vaddr, size) {
        dst.abort();
        return Err(e);
    }

    // Safety: the KOT mark makes the range exclusively ours.
    let obj = unsafe { PgtObj::at(vaddr) };
    obj.init(base, is_top, size_order, num_order);

    dst.fill(
        0,
        vaddr,
        pgt_flags_pack(PgtFlags::all(), 0, CID_MASK),
        base | if is_top { BASE_TOP } else { 0 },
        pack_order(size_order, num_order),
    );
    dst.publish(CapType::Pgt, 1);
    Ok(0)
}

/// Boot-time direct page mapping, used to seed the identity map before any
/// delegation sources exist.
pub fn boot_add(
    cpt: CptRef,
    cap_pgt: Cid,
    paddr: usize,
    pos: usize,
    flags: PageFlags,
) -> Result<usize, Error> {
    let (slot, _head) = cpt.lookup(cap_pgt, CapType::Pgt)?;
    // Safety: the capability pins the object.
    let dir = unsafe { PgtObj::at(slot.object()) };
    if pos >> dir.num_order() != 0 {
        return Err(Error::PgtAddr);
    }
    page_map(&dir, paddr, pos, flags)?;
    Ok(0)
}

/// Boot-time construction of a child directory into a parent.
pub fn boot_con(
    cpt: CptRef,
    cap_parent: Cid,
    pos: usize,
    cap_child: Cid,
) -> Result<usize, Error> {
    let (pslot, _) = cpt.lookup(cap_parent, CapType::Pgt)?;
    let (cslot, _) = cpt.lookup(cap_child, CapType::Pgt)?;
    // Safety: the capabilities pin both objects.
    let parent = unsafe { PgtObj::at(pslot.object()) };
    let child = unsafe { PgtObj::at(cslot.object()) };
    if pos >> parent.num_order() != 0 {
        return Err(Error::PgtAddr);
    }
    pgdir_map(&parent, pos, &child)?;
    Ok(0)
}

/// `pgt-del`: deletes a directory that is neither constructed into a tree
/// nor holding child directories.
pub fn del(kernel: &Kernel, cpt: CptRef, cap_cpt: Cid, slot: usize) -> Result<usize, Error> {
    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::DEL.bits())?;
    let target = CptRef::from_slot(op).slot(slot)?;
    let head = target.delete_check(CapType::Pgt)?;

    // Safety: delete_check proved the slot holds a live directory.
    let dir = unsafe { PgtObj::at(target.object()) };
    if dir.dirs() != 0 || dir.meta().toplevel.load(Ordering::Relaxed) != 0 {
        target.defrost();
        return Err(Error::PgtHw);
    }

    let size = if dir.is_top() {
        size_top(dir.num_order())
    } else {
        size_nom(dir.num_order())
    };
    let object = target.object();
    target.clear(head)?;
    uassert!(kernel.kot.erase(object, size).is_ok());
    Ok(0)
}

/// `pgt-add`: delegates a page from one directory into another, the only
/// way pages spread after boot. `index` selects which fraction of the
/// source page becomes the destination page when the destination's pages
/// are smaller.
#[allow(clippy::too_many_arguments)]
pub fn add(
    cpt: CptRef,
    cap_dst: Cid,
    pos_dst: usize,
    flags_dst: PageFlags,
    cap_src: Cid,
    pos_src: usize,
    index: usize,
) -> Result<usize, Error> {
    let dst_slot = cpt.get(
        cap_dst,
        CapType::Pgt,
        PgtFlags::ADD_DST.bits(),
    )?;
    let src_slot = cpt.get(
        cap_src,
        CapType::Pgt,
        PgtFlags::ADD_SRC.bits(),
    )?;
    pos_allowed(dst_slot, pos_dst)?;
    pos_allowed(src_slot, pos_src)?;

    // Safety: the capabilities pin both objects.
    let dst = unsafe { PgtObj::at(dst_slot.object()) };
    let src = unsafe { PgtObj::at(src_slot.object()) };

    // Destination pages may only be as large as the source page being
    // split.
    if dst.size_order() > src.size_order() {
        return Err(Error::PgtAddr);
    }
    if pos_dst >> dst.num_order() != 0 || pos_src >> src.num_order() != 0 {
        return Err(Error::PgtAddr);
    }
    // The selected fraction must lie inside the source page.
    let offset = if dst.size_order() as usize >= usize::BITS as usize {
        if index != 0 {
            return Err(Error::PgtAddr);
        }
        0
    } else {
        index.checked_mul(1 << dst.size_order()).ok_or(Error::PgtAddr)?
    };
    if (src.size_order() as usize) < usize::BITS as usize
        && offset >> src.size_order() != 0
    {
        return Err(Error::PgtAddr);
    }

    let (paddr_src, flags_src) = lookup(&src, pos_src)?;
    let paddr_dst = paddr_src + offset;

    // This architecture forces identity mapping: the page must land at the
    // virtual address it occupies physically.
    let expect = dst.start() + shl(pos_dst, dst.size_order());
    if paddr_dst != expect {
        return Err(Error::PgtAddr);
    }

    // No permission expansion.
    if flags_dst.bits() & !flags_src.bits() != 0 {
        return Err(Error::PgtPerm);
    }

    page_map(&dst, paddr_dst, pos_dst, flags_dst)?;
    Ok(0)
}

/// `pgt-rem`: unmaps a page.
pub fn rem(cpt: CptRef, cap_pgt: Cid, pos: usize) -> Result<usize, Error> {
    let slot = cpt.get(cap_pgt, CapType::Pgt, PgtFlags::REM.bits())?;
    pos_allowed(slot, pos)?;
    // Safety: the capability pins the object.
    let dir = unsafe { PgtObj::at(slot.object()) };
    if pos >> dir.num_order() != 0 {
        return Err(Error::PgtAddr);
    }
    page_unmap(&dir, pos)?;
    Ok(0)
}

/// `pgt-con`: constructs a child directory into a parent slot. The child's
/// whole coverage must fit inside the named parent entry (path compression
/// permits it to be smaller).
pub fn con(
    cpt: CptRef,
    cap_parent: Cid,
    pos: usize,
    cap_child: Cid,
) -> Result<usize, Error> {
    let pslot = cpt.get(cap_parent, CapType::Pgt, PgtFlags::CON_PARENT.bits())?;
    let cslot = cpt.get(cap_child, CapType::Pgt, PgtFlags::CON_CHILD.bits())?;
    pos_allowed(pslot, pos)?;

    // Safety: the capabilities pin both objects.
    let parent = unsafe { PgtObj::at(pslot.object()) };
    let child = unsafe { PgtObj::at(cslot.object()) };

    if pos >> parent.num_order() != 0 {
        return Err(Error::PgtAddr);
    }
    let child_total = child.size_order() + child.num_order();
    if parent.size_order() < child_total {
        return Err(Error::PgtAddr);
    }

    // Identity discipline again: the child must sit inside the parent
    // entry it is being mapped under.
    let slot_start = parent.start() + shl(pos, parent.size_order());
    if child.start() < slot_start {
        return Err(Error::PgtAddr);
    }
    if let Some(slot_size) = 1usize.checked_shl(parent.size_order()) {
        let slot_end = slot_start.wrapping_add(slot_size);
        if slot_end != 0 {
            let child_size =
                1usize.checked_shl(child_total).ok_or(Error::PgtAddr)?;
            let child_end = child
                .start()
                .checked_add(child_size)
                .ok_or(Error::PgtAddr)?;
            if child_end > slot_end {
                return Err(Error::PgtAddr);
            }
        }
    }

    pgdir_map(&parent, pos, &child)?;
    Ok(0)
}

/// `pgt-des`: deconstructs the child directory mapped at `pos`.
pub fn des(cpt: CptRef, cap_pgt: Cid, pos: usize) -> Result<usize, Error> {
    let slot = cpt.get(cap_pgt, CapType::Pgt, PgtFlags::DES.bits())?;
    pos_allowed(slot, pos)?;
    // Safety: the capability pins the object.
    let parent = unsafe { PgtObj::at(slot.object()) };
    if pos >> parent.num_order() != 0 {
        return Err(Error::PgtAddr);
    }
    pgdir_unmap(&parent, pos)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::{BOOT_CPT, BOOT_KOM};
    use crate::testutil::world;

    const TOP: usize = 11;
    const SRC: usize = 12;
    const CHILD: usize = 13;

    fn rw() -> PageFlags {
        PageFlags::READ | PageFlags::WRITE
    }

    fn obj(w: &crate::testutil::World, slot: usize) -> PgtObj {
        // Safety: pinned by its capability.
        unsafe { PgtObj::at(w.root.slot(slot).unwrap().object()) }
    }

    /// Creates a top directory at `base` with 8 pages of `2^size_order`.
    fn make_top(
        w: &mut crate::testutil::World,
        slot: usize,
        raddr: usize,
        base: usize,
        size_order: u32,
    ) {
        crt(
            w.kernel,
            w.root,
            abi::Cid::one(BOOT_CPT),
            abi::Cid::one(BOOT_KOM),
            slot,
            raddr,
            base,
            true,
            size_order,
            3,
        )
        .unwrap();
    }

    #[test]
    fn geometry_checks_reject_nonsense() {
        let w = world();
        // Entry count beyond 256.
        assert_eq!(
            crt(
                w.kernel,
                w.root,
                abi::Cid::one(BOOT_CPT),
                abi::Cid::one(BOOT_KOM),
                TOP,
                0x20000,
                0x2000_0000,
                true,
                10,
                9
            ),
            Err(Error::PgtHw)
        );
        // Pages smaller than the MPU can express.
        assert_eq!(
            crt(
                w.kernel,
                w.root,
                abi::Cid::one(BOOT_CPT),
                abi::Cid::one(BOOT_KOM),
                TOP,
                0x20000,
                0x2000_0000,
                true,
                4,
                3
            ),
            Err(Error::PgtHw)
        );
        // Misaligned base.
        assert_eq!(
            crt(
                w.kernel,
                w.root,
                abi::Cid::one(BOOT_CPT),
                abi::Cid::one(BOOT_KOM),
                TOP,
                0x20000,
                0x2000_0400,
                true,
                10,
                3
            ),
            Err(Error::PgtHw)
        );
    }

    #[test]
    fn map_unmap_round_trip_restores_table_and_mpu() {
        let mut w = world();
        make_top(&mut w, TOP, 0x20000, 0x2000_0000, 10);
        let top = obj(&w, TOP);

        let entries_before: Vec<usize> = (0..8).map(|i| top.entry(i)).collect();
        let mpu_before = top.mpu_snapshot().unwrap();

        boot_add(w.root, abi::Cid::one(TOP), 0x2000_0400, 1, rw() | PageFlags::STATIC).unwrap();
        assert_ne!(top.entry(1), 0);
        assert_eq!(top.pages(), 1);
        // The static page became a resident region.
        assert_eq!(top.mpu_snapshot().unwrap().resident(), 1);

        page_unmap(&top, 1).unwrap();
        let entries_after: Vec<usize> = (0..8).map(|i| top.entry(i)).collect();
        assert_eq!(entries_after, entries_before);
        let mpu_after = top.mpu_snapshot().unwrap();
        assert_eq!(mpu_after.resident(), 0);
        assert_eq!(mpu_after.static_mask, mpu_before.static_mask);
        assert_eq!(top.pages(), 0);
    }

    #[test]
    fn directory_flags_must_agree() {
        let mut w = world();
        make_top(&mut w, TOP, 0x20000, 0x2000_0000, 10);
        boot_add(w.root, abi::Cid::one(TOP), 0x2000_0000, 0, rw()).unwrap();
        // Same flags: fine.
        boot_add(w.root, abi::Cid::one(TOP), 0x2000_0400, 1, rw()).unwrap();
        // Conflicting flags in the same directory: hardware cannot express
        // it.
        assert_eq!(
            boot_add(
                w.root,
                abi::Cid::one(TOP),
                0x2000_0800,
                2,
                PageFlags::READ
            ),
            Err(Error::PgtHw)
        );
        // Double mapping the same slot is a map error, not a flag error.
        assert_eq!(
            boot_add(w.root, abi::Cid::one(TOP), 0x2000_0000, 0, rw()),
            Err(Error::PgtMap)
        );
    }

    #[test]
    fn delegation_checks_identity_range_and_permission() {
        let mut w = world();
        // Source: 8 x 4 KiB at 0x2000_0000, seeded by boot.
        make_top(&mut w, SRC, 0x20000, 0x2000_0000, 12);
        boot_add(w.root, abi::Cid::one(SRC), 0x2000_0000, 0, rw()).unwrap();
        // Destination: 8 x 1 KiB at 0x2000_0000.
        make_top(&mut w, TOP, 0x30000, 0x2000_0000, 10);

        // Quarter 2 of the source page lands at dst position 2.
        add(
            w.root,
            abi::Cid::one(TOP),
            2,
            rw(),
            abi::Cid::one(SRC),
            0,
            2,
        )
        .unwrap();
        let (paddr, flags) = lookup(&obj(&w, TOP), 2).unwrap();
        assert_eq!(paddr, 0x2000_0800);
        assert_eq!(flags, rw());

        // Wrong position for that index: identity mapping violated.
        assert_eq!(
            add(w.root, abi::Cid::one(TOP), 4, rw(), abi::Cid::one(SRC), 0, 1),
            Err(Error::PgtAddr)
        );
        // Index beyond the source page.
        assert_eq!(
            add(w.root, abi::Cid::one(TOP), 5, rw(), abi::Cid::one(SRC), 0, 9),
            Err(Error::PgtAddr)
        );
        // Permission expansion.
        assert_eq!(
            add(
                w.root,
                abi::Cid::one(TOP),
                3,
                rw() | PageFlags::EXECUTE,
                abi::Cid::one(SRC),
                0,
                3
            ),
            Err(Error::PgtPerm)
        );
        // Source slot with nothing mapped.
        assert_eq!(
            add(w.root, abi::Cid::one(TOP), 3, rw(), abi::Cid::one(SRC), 1, 0),
            Err(Error::PgtHw)
        );
    }

    #[test]
    fn narrowed_position_range_confines_delegation() {
        let mut w = world();
        make_top(&mut w, SRC, 0x20000, 0x2000_0000, 12);
        boot_add(w.root, abi::Cid::one(SRC), 0x2000_0000, 0, rw()).unwrap();
        make_top(&mut w, TOP, 0x30000, 0x2000_0000, 10);

        // Delegate the dst capability confined to positions [0, 1].
        crate::captbl::add(
            w.root,
            abi::Cid::one(BOOT_CPT),
            14,
            abi::Cid::one(BOOT_CPT),
            TOP,
            abi::pgt_flags_pack(abi::PgtFlags::all(), 0, 1),
            0,
        )
        .unwrap();
        assert_eq!(
            add(w.root, abi::Cid::one(14), 2, rw(), abi::Cid::one(SRC), 0, 2),
            Err(Error::CapFlag)
        );
        add(w.root, abi::Cid::one(14), 1, rw(), abi::Cid::one(SRC), 0, 1).unwrap();
    }

    #[test]
    fn construct_walk_and_deconstruct() {
        let mut w = world();
        // Parent: 8 x 8 KiB at 0x4000_0000. Child: 8 x 1 KiB covering the
        // first parent slot.
        make_top(&mut w, TOP, 0x20000, 0x4000_0000, 13);
        crt(
            w.kernel,
            w.root,
            abi::Cid::one(BOOT_CPT),
            abi::Cid::one(BOOT_KOM),
            CHILD,
            0x30000,
            0x4000_0000,
            false,
            10,
            3,
        )
        .unwrap();

        con(w.root, abi::Cid::one(TOP), 0, abi::Cid::one(CHILD)).unwrap();
        let parent = obj(&w, TOP);
        let child = obj(&w, CHILD);
        assert_eq!(parent.dirs(), 1);

        boot_add(w.root, abi::Cid::one(CHILD), 0x4000_0400, 1, rw()).unwrap();

        let hit = walk(&parent, 0x4000_0480).unwrap();
        assert_eq!(hit.dir, child.addr());
        assert_eq!(hit.map_vaddr, 0x4000_0400);
        assert_eq!(hit.paddr, 0x4000_0480);
        assert_eq!(hit.size_order, 10);
        assert_eq!(hit.flags, rw());

        // Unmapped addresses miss.
        assert!(walk(&parent, 0x4000_0000).is_err());
        assert!(walk(&parent, 0x3FFF_FFFF).is_err());

        // A constructed child cannot be deleted, nor can the parent.
        crate::captbl::frz(w.root, abi::Cid::one(BOOT_CPT), CHILD).unwrap();
        assert_eq!(
            del(w.kernel, w.root, abi::Cid::one(BOOT_CPT), CHILD),
            Err(Error::PgtHw)
        );

        des(w.root, abi::Cid::one(TOP), 0).unwrap();
        assert_eq!(parent.dirs(), 0);
        assert!(walk(&parent, 0x4000_0480).is_err());
        // Now it can go (the failed delete defrosted it).
        crate::captbl::frz(w.root, abi::Cid::one(BOOT_CPT), CHILD).unwrap();
        del(w.kernel, w.root, abi::Cid::one(BOOT_CPT), CHILD).unwrap();
    }

    #[test]
    fn construction_rejects_out_of_slot_children() {
        let mut w = world();
        make_top(&mut w, TOP, 0x20000, 0x4000_0000, 13);
        // Child based outside parent slot 0.
        crt(
            w.kernel,
            w.root,
            abi::Cid::one(BOOT_CPT),
            abi::Cid::one(BOOT_KOM),
            CHILD,
            0x30000,
            0x4000_4000,
            false,
            10,
            3,
        )
        .unwrap();
        assert_eq!(
            con(w.root, abi::Cid::one(TOP), 0, abi::Cid::one(CHILD)),
            Err(Error::PgtAddr)
        );
        // But it fits slot 2 exactly.
        con(w.root, abi::Cid::one(TOP), 2, abi::Cid::one(CHILD)).unwrap();
    }

    #[test]
    fn dynamic_fault_insert_evicts_only_dynamics() {
        let mut w = world();
        // Parent: 256 x 8 KiB at 0x4000_0000; children each 8 x 1 KiB.
        crt(
            w.kernel,
            w.root,
            abi::Cid::one(BOOT_CPT),
            abi::Cid::one(BOOT_KOM),
            TOP,
            0x20000,
            0x4000_0000,
            true,
            13,
            8,
        )
        .unwrap();
        let parent = obj(&w, TOP);

        // Six static children and three dynamic ones.
        let mut slot = 20;
        for i in 0..9usize {
            let base = 0x4000_0000 + (i << 13);
            crt(
                w.kernel,
                w.root,
                abi::Cid::one(BOOT_CPT),
                abi::Cid::one(BOOT_KOM),
                slot,
                0x30000 + i * 0x1000,
                base,
                false,
                10,
                3,
            )
            .unwrap();
            let flags = if i < 6 {
                rw() | PageFlags::STATIC
            } else {
                rw()
            };
            boot_add(w.root, abi::Cid::one(slot), base, 0, flags).unwrap();
            con(w.root, abi::Cid::one(TOP), i, abi::Cid::one(slot)).unwrap();
            slot += 1;
        }

        // The statics became resident at construction; the dynamics wait
        // for faults.
        let mpu = parent.mpu_snapshot().unwrap();
        assert_eq!(mpu.resident(), 6);
        assert_eq!(mpu.static_mask.count_ones(), 6);

        // Fault in the first two dynamic directories: they take the two
        // reserved slots.
        dyn_fault_insert(&parent, 0x4000_0000 + (6 << 13), PageFlags::READ)
            .unwrap();
        dyn_fault_insert(&parent, 0x4000_0000 + (7 << 13), PageFlags::READ)
            .unwrap();
        assert_eq!(parent.mpu_snapshot().unwrap().resident(), 8);

        // A third dynamic fault must evict a dynamic region, never a
        // static one.
        let statics_before = parent.mpu_snapshot().unwrap().static_mask;
        dyn_fault_insert(&parent, 0x4000_0000 + (8 << 13), PageFlags::READ)
            .unwrap();
        let mpu = parent.mpu_snapshot().unwrap();
        assert_eq!(mpu.resident(), 8);
        assert_eq!(mpu.static_mask, statics_before);
        let newly = (0..kerncore::pmsav7::REGIONS).any(|i| {
            kerncore::pmsav7::rbar_base(mpu.regions[i].rbar) as usize
                == 0x4000_0000 + (8 << 13)
        });
        assert!(newly, "faulted directory must be resident now");

        // Permission misses stay faults.
        assert_eq!(
            dyn_fault_insert(
                &parent,
                0x4000_0000 + (8 << 13),
                PageFlags::EXECUTE
            ),
            Err(Error::PgtPerm)
        );
        // Unbacked addresses stay faults.
        assert!(
            dyn_fault_insert(&parent, 0x4000_0000 + (9 << 13), PageFlags::READ)
                .is_err()
        );
    }
}
