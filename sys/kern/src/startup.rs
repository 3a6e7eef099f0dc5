// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The port hands us the kernel pool and a description of the first user
//! image; we carve the kernel-object table off the front of the pool,
//! create the boot objects (the root capability table, the kernel-memory
//! and kernel-function capabilities, the per-CPU tick and vector endpoints,
//! the identity page table, and the boot process and thread), and drop to
//! user mode in the boot thread.
//!
//! Boot objects are published pre-referenced and are therefore undeletable;
//! everything else the system will ever contain is created by user level
//! out of the boot kernel-memory capability.

use core::mem::MaybeUninit;
use core::sync::atomic::AtomicUsize;

use abi::{Cid, Error, KomFlags, PageFlags};

use crate::captbl::{self, cpt_size, CptRef};
use crate::kfn;
use crate::kmem;
use crate::kot::{round_up, Kot};
use crate::pgtbl;
use crate::prc;
use crate::sig;
use crate::thd::{self, ArchState, CpuLocal};
use crate::Kernel;

/// Fixed boot slots in the root capability table.
pub const BOOT_CPT: usize = 0;
pub const BOOT_KOM: usize = 1;
pub const BOOT_KFN: usize = 2;
pub const BOOT_TICK_SIG: usize = 3;
pub const BOOT_VECT_SIG: usize = 4;
pub const BOOT_PGT: usize = 5;
pub const BOOT_PRC: usize = 6;
pub const BOOT_THD: usize = 7;

/// Entries in the root capability table. The first eight are spoken for;
/// the rest are the boot image's to use.
pub const BOOT_CPT_ENTRIES: usize = 32;

/// What the port tells us about the machine and the first user image.
#[derive(Clone, Debug)]
pub struct BootConfig {
    /// The kernel pool. Granule-aligned on both ends.
    pub pool_base: usize,
    pub pool_size: usize,
    /// Geometry of the boot identity page table; `pages` selects which of
    /// its `2^num_order` slots get mapped, with full permissions, static.
    pub pgt_base: usize,
    pub pgt_size_order: u32,
    pub pgt_num_order: u32,
    pub pgt_pages: &'static [usize],
    /// First instruction and initial stack of the boot thread.
    pub entry: usize,
    pub stack: usize,
    /// Priority the boot thread starts at.
    pub prio: usize,
}

/// Creates every boot object out of the pool covered by `kernel.kot`.
///
/// Returns the root capability table. Factored out of `start_kernel` so the
/// whole bring-up sequence runs on the host under test.
pub fn boot_setup(
    kernel: &Kernel,
    cpu: &CpuLocal,
    cfg: &BootConfig,
    pool_base: usize,
    pool_end: usize,
) -> Result<CptRef, Error> {
    let mut cursor = pool_base;
    let mut alloc = |size: usize| {
        let at = cursor;
        cursor += round_up(size);
        at
    };

    let root = captbl::boot_init(
        kernel,
        alloc(cpt_size(BOOT_CPT_ENTRIES)),
        BOOT_CPT,
        BOOT_CPT_ENTRIES,
    )?;

    kfn::boot_crt(root, BOOT_KFN)?;

    sig::boot_crt(kernel, root, BOOT_TICK_SIG, alloc(sig::SIG_SIZE))?;
    sig::boot_crt(kernel, root, BOOT_VECT_SIG, alloc(sig::SIG_SIZE))?;
    cpu.set_tick_sig(root.slot(BOOT_TICK_SIG)?.object());
    cpu.set_vect_sig(root.slot(BOOT_VECT_SIG)?.object());

    pgtbl::boot_crt(
        kernel,
        root,
        BOOT_PGT,
        alloc(pgtbl::size_top(cfg.pgt_num_order)),
        cfg.pgt_base,
        true,
        cfg.pgt_size_order,
        cfg.pgt_num_order,
    )?;
    for &pos in cfg.pgt_pages {
        let paddr = cfg.pgt_base + pos * (1usize << cfg.pgt_size_order.min(usize::BITS - 1));
        pgtbl::boot_add(
            root,
            Cid::one(BOOT_PGT),
            paddr,
            pos,
            PageFlags::ALL_PERM,
        )?;
    }

    prc::boot_crt(
        kernel,
        root,
        BOOT_PRC,
        Cid::one(BOOT_CPT),
        Cid::one(BOOT_PGT),
        alloc(prc::PRC_SIZE),
    )?;

    thd::boot_crt(
        kernel,
        cpu,
        root,
        BOOT_THD,
        Cid::one(BOOT_PRC),
        alloc(thd::THD_SIZE),
        cfg.prio,
    )?;

    // Whatever the boot objects did not eat belongs to user level.
    kmem::boot_crt(root, BOOT_KOM, cursor, pool_end, KomFlags::all())?;

    Ok(root)
}

static CPU_LOCAL: CpuLocal = CpuLocal::new();
static mut KERNEL_SPACE: MaybeUninit<Kernel> = MaybeUninit::uninit();
static KERNEL_READY: AtomicUsize = AtomicUsize::new(0);

/// The kernel singleton, after `start_kernel` has built it.
pub fn kernel() -> &'static Kernel {
    uassert!(KERNEL_READY.load(core::sync::atomic::Ordering::Acquire) != 0);
    // Safety: written exactly once, before the flag above was raised.
    unsafe { (*core::ptr::addr_of!(KERNEL_SPACE)).assume_init_ref() }
}

/// This CPU's local structure. Single-core build; SMP ports index by CPU id
/// here.
pub fn cpu_local() -> &'static CpuLocal {
    &CPU_LOCAL
}

/// The main kernel entry point.
///
/// The port calls this after basic hardware setup, handing over the pool
/// and the boot image description. Does not return; the next instruction
/// executed outside the kernel is the boot thread's entry point.
///
/// # Safety
///
/// Must be called exactly once per boot, with a pool that is unused RAM.
pub unsafe fn start_kernel(cfg: &BootConfig) -> ! {
    klog!("starting: capability tables");

    CPU_LOCAL.init(0);

    // The kernel-object table itself is carved off the front of the pool;
    // the covered range starts after it.
    let word = core::mem::size_of::<usize>();
    let kot_bytes = round_up(Kot::words_for(cfg.pool_size) * word);
    let covered_base = cfg.pool_base + kot_bytes;
    let covered_size = cfg.pool_size - kot_bytes;

    // Safety: the pool is ours and unused; the bitmap words are zeroed
    // before the Kot wraps them.
    let words: &'static [AtomicUsize] = unsafe {
        core::ptr::write_bytes(cfg.pool_base as *mut u8, 0, kot_bytes);
        core::slice::from_raw_parts(
            cfg.pool_base as *const AtomicUsize,
            Kot::words_for(covered_size),
        )
    };

    // Safety: single write before the ready flag.
    unsafe {
        (*core::ptr::addr_of_mut!(KERNEL_SPACE)).write(Kernel {
            kot: Kot::new(covered_base, words),
        });
    }
    KERNEL_READY.store(1, core::sync::atomic::Ordering::Release);

    klog!("starting: boot objects");
    let root = boot_setup(
        kernel(),
        &CPU_LOCAL,
        cfg,
        covered_base,
        covered_base + covered_size,
    )
    .unwrap_or_else(|e| crate::fail::abort(e.code()));
    let _ = root;

    // Aim the boot thread at the image and go.
    let boot_thd = CPU_LOCAL.cur_thd();
    // Safety: boot thread is ours; nothing else runs yet.
    unsafe {
        boot_thd
            .context_mut()
            .reg
            .init_entry(cfg.entry, cfg.stack, 0);
    }
    crate::arch::set_pgt(boot_thd.cur_pgt());

    klog!("starting: user mode");
    crate::arch::start_first_thread(&CPU_LOCAL)
}
