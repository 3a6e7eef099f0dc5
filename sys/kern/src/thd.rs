// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Threads, the per-CPU runqueue, and the priority scheduler.
//!
//! A thread is in exactly one of five states. The *running* thread is
//! tracked in its CPU's `cur_thd` and is **not** on the runqueue; every
//! *ready* thread is on the runqueue at its priority; blocked, timeout and
//! fault threads are off the queue entirely. The highest-priority ready
//! thread is found by a most-significant-bit scan over the priority bitmap,
//! FIFO within a priority.
//!
//! Time is budgeted in slices. Two sentinel budgets exist: `SLICE_INIT`
//! marks boot threads (never expire, never block) and `SLICE_INF` marks
//! threads promoted to an infinite budget. Whenever a thread runs out of
//! time or faults, a notification is queued on its parent scheduler thread
//! and, if one is bound, a kernel send goes to the scheduler's endpoint.
//!
//! Threads live in the kernel pool like every other object; cross-CPU state
//! (the binding) is a CAS-guarded word, everything else is owned by the
//! bound CPU and accessed with that CPU's interrupts off.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use abi::{
    CapType, Cid, CptFlags, Error, KomFlags, PrcFlags, SigFlags, ThdFlags,
    SLICE_INF, SLICE_INIT, TID_FAULT_FLAG,
};

use crate::arch;
use crate::captbl::CptRef;
use crate::config::{MAX_PREEMPT_PRIO, PRIO_WORDS};
use crate::inv;
use crate::kmem;
use crate::kot;
use crate::list::Node;
use crate::prc::Process;
use crate::sig::{self, SigEndpoint};
use crate::Kernel;

/// Interface the architecture's saved register set must implement. This
/// gives architecture-independent access to syscall arguments and return
/// slots, thread launch, and the minimal state an invocation must preserve.
pub trait ArchState: Default {
    /// Reads the syscall descriptor word (opcode and capability id).
    fn syscall_desc(&self) -> usize;
    /// Reads syscall parameter `n` (0..=2).
    fn arg(&self, n: usize) -> usize;
    /// Writes the syscall return register.
    fn set_retval(&mut self, v: isize);
    /// Writes the invocation return register. Distinct from the syscall
    /// return register so a returning invocation can deliver both.
    fn set_inv_retval(&mut self, v: isize);
    /// Builds a fresh register set entering `entry` with `stack` and one
    /// argument.
    fn init_entry(&mut self, entry: usize, stack: usize, param: usize);
    /// Captures the registers an invocation must restore on return.
    fn iret_save(&self) -> Iret;
    /// Restores them.
    fn iret_restore(&mut self, ret: Iret);
}

/// The registers preserved across a synchronous invocation: the stack
/// pointer, and the link register on ports where it selects stack and mode.
/// Everything else is caller-saved at user level.
#[derive(Copy, Clone, Debug, Default)]
pub struct Iret {
    pub sp: usize,
    pub lr: usize,
}

/// A thread's full register save area: core registers plus coprocessor
/// state. One lives inside each thread; a hypervisor may redirect the
/// current pointer elsewhere.
#[derive(Default)]
#[repr(C)]
pub struct Context {
    pub reg: arch::SavedState,
    pub cop: arch::CopState,
}

/// Thread scheduling states.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum ThdState {
    Running = 0,
    Ready = 1,
    Blocked = 2,
    Timeout = 3,
    Fault = 4,
}

impl ThdState {
    fn from_word(w: usize) -> Self {
        match w {
            0 => Self::Running,
            1 => Self::Ready,
            2 => Self::Blocked,
            3 => Self::Timeout,
            4 => Self::Fault,
            _ => panic!("corrupt thread state"),
        }
    }
}

/// Internal representation of a thread.
#[repr(C)]
pub struct Thread {
    tid: AtomicUsize,
    state: AtomicUsize,
    prio: AtomicUsize,
    max_prio: AtomicUsize,
    slices: AtomicUsize,
    fault: AtomicUsize,
    /// Number of threads naming this one as their scheduler.
    refcnt: AtomicUsize,
    /// kaddr of the `CpuLocal` this thread is bound to; 0 while unbound.
    /// This is the one cross-CPU field: binding claims it by CAS.
    cpu: AtomicUsize,
    /// kaddr of the parent scheduler thread.
    parent: AtomicUsize,
    /// kaddr of the scheduler notification endpoint, if bound with one.
    sched_sig: AtomicUsize,
    /// kaddr of the endpoint this thread is blocked on, if any.
    block_sig: AtomicUsize,
    /// kaddr of the home process.
    prc: AtomicUsize,
    /// kaddr of the active register save area; normally `def_ctx`, but a
    /// hypervisor may point it at its own buffer.
    reg_cur: AtomicUsize,
    /// Runqueue linkage.
    run: Node,
    /// Pending-notification linkage on the parent's event list. Detached
    /// while no notification is queued; this doubles as the "already
    /// notified" test.
    notif: Node,
    /// Head of the event list of children we schedule.
    event: Node,
    /// Head of the invocation stack.
    inv_stack: Node,
    def_ctx: UnsafeCell<Context>,
}

// Safety: every mutable field is an atomic word except `def_ctx`, which is
// only touched by the CPU the thread is bound to (see `context_mut`).
unsafe impl Sync for Thread {}

/// Pool footprint of a thread object.
pub const THD_SIZE: usize = kot::round_up(core::mem::size_of::<Thread>());

impl Thread {
    /// Reconstitutes a thread reference from a kernel address.
    ///
    /// # Safety
    ///
    /// `kaddr` must point at a live thread object: one reached through a
    /// published capability, a runqueue/event link, or a CPU's `cur_thd`.
    pub unsafe fn deref<'a>(kaddr: usize) -> &'a Thread {
        unsafe { &*(kaddr as *const Thread) }
    }

    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    pub fn state(&self) -> ThdState {
        ThdState::from_word(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, s: ThdState) {
        self.state.store(s as usize, Ordering::Relaxed);
    }

    pub fn prio(&self) -> usize {
        self.prio.load(Ordering::Relaxed)
    }

    pub fn max_prio(&self) -> usize {
        self.max_prio.load(Ordering::Relaxed)
    }

    pub fn tid(&self) -> usize {
        self.tid.load(Ordering::Relaxed)
    }

    pub fn slices(&self) -> usize {
        self.slices.load(Ordering::Relaxed)
    }

    pub fn set_slices(&self, s: usize) {
        self.slices.store(s, Ordering::Relaxed);
    }

    pub fn fault_cause(&self) -> usize {
        self.fault.load(Ordering::Relaxed)
    }

    /// The CPU this thread is bound to, or `None`.
    pub fn cpu(&self) -> Option<&'static CpuLocal> {
        match self.cpu.load(Ordering::Acquire) {
            0 => None,
            // Safety: binding stores only live CpuLocal addresses, and
            // CpuLocals are never torn down.
            a => Some(unsafe { &*(a as *const CpuLocal) }),
        }
    }

    pub fn is_on(&self, cpu: &CpuLocal) -> bool {
        self.cpu.load(Ordering::Acquire) == cpu.addr()
    }

    pub fn parent(&self) -> Option<&'static Thread> {
        match self.parent.load(Ordering::Relaxed) {
            0 => None,
            // Safety: the parent's scheduler refcount pins it while we
            // point at it.
            a => Some(unsafe { Thread::deref(a) }),
        }
    }

    pub fn sched_sig(&self) -> Option<&'static SigEndpoint> {
        match self.sched_sig.load(Ordering::Relaxed) {
            0 => None,
            // Safety: pinned by the endpoint's object refcount at bind.
            a => Some(unsafe { SigEndpoint::deref(a) }),
        }
    }

    pub fn block_sig(&self) -> usize {
        self.block_sig.load(Ordering::Relaxed)
    }

    pub fn set_block_sig(&self, kaddr: usize) {
        self.block_sig.store(kaddr, Ordering::Relaxed);
    }

    /// The thread's home process.
    pub fn process(&self) -> &'static Process {
        // Safety: the process refcount taken at creation pins it.
        unsafe { Process::deref(self.prc.load(Ordering::Relaxed)) }
    }

    /// The capability table currently governing this thread's syscalls:
    /// the top invocation's process if one is active, else home.
    pub fn cur_captbl(&self) -> CptRef {
        match self.inv_top() {
            Some(i) => i.process().captbl(),
            None => self.process().captbl(),
        }
    }

    /// The page table that should be active while this thread runs.
    pub fn cur_pgt(&self) -> usize {
        match self.inv_top() {
            Some(i) => i.process().pgt_obj(),
            None => self.process().pgt_obj(),
        }
    }

    pub fn inv_stack(&self) -> &Node {
        &self.inv_stack
    }

    /// Top of the invocation stack, if any.
    pub fn inv_top(&self) -> Option<&'static inv::Invocation> {
        self.inv_stack
            .first_owner()
            // Safety: stack entries are live invocations; delete requires
            // them inactive, and active means on-stack.
            .map(|a| unsafe { inv::Invocation::deref(a) })
    }

    pub fn event_head(&self) -> &Node {
        &self.event
    }

    pub fn notif_node(&self) -> &Node {
        &self.notif
    }

    pub fn run_node(&self) -> &Node {
        &self.run
    }

    /// Redirects the register save area (`kaddr == 0` restores the built-in
    /// one).
    pub fn set_reg_cur(&self, kaddr: usize) {
        let target = if kaddr == 0 {
            self.def_ctx.get() as usize
        } else {
            kaddr
        };
        self.reg_cur.store(target, Ordering::Relaxed);
    }

    /// Mutable access to the active register save area.
    ///
    /// # Safety
    ///
    /// Caller must be running on the CPU this thread is bound to, with
    /// interrupts off, and must not create a second live reference. These
    /// are the standing conditions inside any syscall or interrupt handler.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn context_mut(&self) -> &mut Context {
        unsafe { &mut *(self.reg_cur.load(Ordering::Relaxed) as *mut Context) }
    }

    pub fn sched_refcnt(&self) -> usize {
        self.refcnt.load(Ordering::Relaxed)
    }
}

/// Per-CPU kernel state: the current thread, the tick and default-vector
/// endpoints, and the runqueue.
#[repr(C)]
pub struct CpuLocal {
    cpuid: AtomicUsize,
    cur_thd: AtomicUsize,
    tick_sig: AtomicUsize,
    vect_sig: AtomicUsize,
    bitmap: [AtomicUsize; PRIO_WORDS],
    heads: [Node; MAX_PREEMPT_PRIO],
}

impl CpuLocal {
    pub const fn new() -> Self {
        const WORD: AtomicUsize = AtomicUsize::new(0);
        CpuLocal {
            cpuid: AtomicUsize::new(0),
            cur_thd: AtomicUsize::new(0),
            tick_sig: AtomicUsize::new(0),
            vect_sig: AtomicUsize::new(0),
            bitmap: [WORD; PRIO_WORDS],
            heads: [Node::INIT; MAX_PREEMPT_PRIO],
        }
    }

    /// One-time setup after the structure has reached its final address.
    pub fn init(&self, cpuid: usize) {
        self.cpuid.store(cpuid, Ordering::Relaxed);
        for head in &self.heads {
            head.reset(self.addr());
        }
    }

    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }

    pub fn cpuid(&self) -> usize {
        self.cpuid.load(Ordering::Relaxed)
    }

    /// The running thread. Panics before the first thread is installed.
    pub fn cur_thd(&self) -> &'static Thread {
        let a = self.cur_thd.load(Ordering::Relaxed);
        uassert!(a != 0);
        // Safety: cur_thd only ever holds live bound threads.
        unsafe { Thread::deref(a) }
    }

    pub fn set_cur_thd(&self, thd: &Thread) {
        self.cur_thd.store(thd.addr(), Ordering::Relaxed);
    }

    pub fn set_tick_sig(&self, sig: usize) {
        self.tick_sig.store(sig, Ordering::Relaxed);
    }

    pub fn tick_sig(&self) -> Option<&'static SigEndpoint> {
        match self.tick_sig.load(Ordering::Relaxed) {
            0 => None,
            // Safety: boot endpoints are undeletable.
            a => Some(unsafe { SigEndpoint::deref(a) }),
        }
    }

    pub fn set_vect_sig(&self, sig: usize) {
        self.vect_sig.store(sig, Ordering::Relaxed);
    }

    pub fn vect_sig(&self) -> Option<&'static SigEndpoint> {
        match self.vect_sig.load(Ordering::Relaxed) {
            0 => None,
            // Safety: boot endpoints are undeletable.
            a => Some(unsafe { SigEndpoint::deref(a) }),
        }
    }
}

impl Default for CpuLocal {
    fn default() -> Self {
        Self::new()
    }
}

/// Inserts a ready thread into its CPU's runqueue, FIFO at its priority.
pub fn run_ins(thd: &Thread) {
    let cpu = thd.cpu();
    uassert!(cpu.is_some());
    let cpu = cpu.unwrap_or_else(|| unreachable!());
    let prio = thd.prio();
    thd.run.push_back(&cpu.heads[prio]);
    cpu.bitmap[prio / usize::BITS as usize].fetch_or(
        1 << (prio % usize::BITS as usize),
        Ordering::Relaxed,
    );
}

/// Removes a thread from its CPU's runqueue, clearing the priority bit if
/// its level emptied.
pub fn run_del(thd: &Thread) {
    let cpu = thd.cpu();
    uassert!(cpu.is_some());
    let cpu = cpu.unwrap_or_else(|| unreachable!());
    let prio = thd.prio();
    thd.run.remove();
    if cpu.heads[prio].is_detached() {
        cpu.bitmap[prio / usize::BITS as usize].fetch_and(
            !(1 << (prio % usize::BITS as usize)),
            Ordering::Relaxed,
        );
    }
}

/// Finds the highest-priority ready thread on this CPU, if any.
pub fn run_high(cpu: &CpuLocal) -> Option<&'static Thread> {
    for w in (0..PRIO_WORDS).rev() {
        let bits = cpu.bitmap[w].load(Ordering::Relaxed);
        if bits == 0 {
            continue;
        }
        let prio = w * usize::BITS as usize
            + (usize::BITS - 1 - bits.leading_zeros()) as usize;
        // Safety: a set bit means a non-empty list of live threads.
        return cpu.heads[prio]
            .first_owner()
            .map(|a| unsafe { Thread::deref(a) });
    }
    None
}

/// Queues a timeout/fault notification for `thd` on its parent scheduler.
/// Already-queued notifications are not duplicated. If a scheduler endpoint
/// is bound, a kernel send follows; callers must re-run the pick-highest
/// pass afterwards.
pub fn run_notif(cpu: &CpuLocal, thd: &Thread) {
    if let Some(parent) = thd.parent() {
        if thd.notif.is_detached() {
            thd.notif.push_back(&parent.event);
        }
    }
    if let Some(sig) = thd.sched_sig() {
        let _ = sig::kern_snd(cpu, sig);
    }
}

/// Swaps the live register set from `cur` to `next` and activates `next`'s
/// page table if it differs.
pub fn run_swt(reg: &mut arch::SavedState, cur: &Thread, next: &Thread) {
    // Safety: both threads are bound to this CPU and we are its only
    // execution context.
    unsafe {
        arch::context_save(reg, cur.context_mut());
        arch::context_restore(next.context_mut(), reg);
    }

    let cur_pgt = cur.cur_pgt();
    let next_pgt = next.cur_pgt();
    if cur_pgt != next_pgt {
        arch::set_pgt(next_pgt);
    }
}

/// After kernel-originated sends: if something on the runqueue now outranks
/// the current thread (or the current thread stopped being runnable),
/// switch to the highest-priority ready thread.
pub fn kern_high(reg: &mut arch::SavedState, cpu: &CpuLocal) {
    let cur = cpu.cur_thd();
    let cur_runnable =
        matches!(cur.state(), ThdState::Running | ThdState::Ready);

    let high = match run_high(cpu) {
        Some(h) => h,
        None => {
            // Nothing else ready; the current thread must still be viable.
            uassert!(cur_runnable);
            return;
        }
    };

    if cur_runnable && high.prio() <= cur.prio() {
        return;
    }

    if cur_runnable {
        cur.set_state(ThdState::Ready);
        run_ins(cur);
    }
    run_del(high);
    high.set_state(ThdState::Running);
    run_swt(reg, cur, high);
    cpu.set_cur_thd(high);
}

/// The per-tick scheduler pass: expire the current thread's budget if
/// finite, fire the tick endpoint, then reschedule once.
pub fn tick_handler(reg: &mut arch::SavedState, cpu: &CpuLocal) {
    let cur = cpu.cur_thd();
    let slices = cur.slices();
    if slices < SLICE_INF {
        cur.set_slices(slices - 1);
        if slices == 1 {
            // Out of time; the thread leaves the running state and its
            // scheduler hears about it.
            cur.set_state(ThdState::Timeout);
            run_notif(cpu, cur);
        }
    }

    if let Some(tick) = cpu.tick_sig() {
        let _ = sig::kern_snd(cpu, tick);
    }

    kern_high(reg, cpu);
}

/// The fatal-fault path. Attempts a forced invocation return first; if the
/// thread is not inside an invocation that permits fault returns, it is
/// killed: budget zeroed, state set to fault, scheduler notified.
pub fn fatal(reg: &mut arch::SavedState, cpu: &CpuLocal, cause: usize) {
    if inv::ret(reg, cpu, 0, true).is_ok() {
        return;
    }
    let cur = cpu.cur_thd();
    // Boot threads must not fault; there is nothing above them to recover.
    uassert!(cur.slices() != SLICE_INIT);
    cur.set_slices(0);
    cur.set_state(ThdState::Fault);
    cur.fault.store(cause, Ordering::Relaxed);
    run_notif(cpu, cur);
    kern_high(reg, cpu);
}

/// `thd-crt`: creates an unbound thread under a process, with a priority
/// ceiling no higher than the creator's own.
pub fn crt(
    kernel: &Kernel,
    cpu: &CpuLocal,
    cpt: CptRef,
    cap_cpt: Cid,
    cap_kom: Cid,
    dst_slot: usize,
    cap_prc: Cid,
    max_prio: usize,
    raddr: usize,
) -> Result<usize, Error> {
    if cpu.cur_thd().max_prio() < max_prio {
        return Err(Error::ThdPrio);
    }

    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::CRT.bits())?;
    let prc_slot = cpt.get(cap_prc, CapType::Prc, PrcFlags::THD.bits())?;
    let (kom, kom_head) = cpt.lookup(cap_kom, CapType::Kom)?;
    let vaddr = kmem::check(kom, kom_head, KomFlags::THD, raddr, THD_SIZE)?;

    let dst = CptRef::from_slot(op).slot(dst_slot)?;
    dst.occupy()?;
    if let Err(e) = kernel.kot.mark(vaddr, THD_SIZE) {
        dst.abort();
        return Err(e);
    }

    // Safety: the KOT mark makes the range exclusively ours.
    let thd = unsafe {
        core::ptr::write_bytes(vaddr as *mut u8, 0, THD_SIZE);
        Thread::deref(vaddr)
    };
    thd.set_state(ThdState::Timeout);
    thd.max_prio.store(max_prio, Ordering::Relaxed);
    thd.prc.store(prc_slot.object(), Ordering::Relaxed);
    thd.run.reset(vaddr);
    thd.notif.reset(vaddr);
    thd.event.reset(vaddr);
    thd.inv_stack.reset(vaddr);
    thd.set_reg_cur(0);

    thd.process().ref_inc();

    dst.fill(0, vaddr, ThdFlags::all().bits(), 0, 0);
    dst.publish(CapType::Thd, 0);
    Ok(0)
}

/// Creates a boot thread: already bound to `cpu` at `prio` with the `INIT`
/// budget, installed as the CPU's running thread. Used once per CPU during
/// startup.
pub fn boot_crt(
    kernel: &Kernel,
    cpu: &CpuLocal,
    cpt: CptRef,
    dst_slot: usize,
    cap_prc: Cid,
    vaddr: usize,
    prio: usize,
) -> Result<usize, Error> {
    if prio >= MAX_PREEMPT_PRIO {
        return Err(Error::ThdPrio);
    }
    let prc_slot = cpt.get(cap_prc, CapType::Prc, PrcFlags::THD.bits())?;

    let dst = cpt.slot(dst_slot)?;
    dst.occupy()?;
    if let Err(e) = kernel.kot.mark(vaddr, THD_SIZE) {
        dst.abort();
        return Err(e);
    }

    // Safety: the KOT mark makes the range exclusively ours.
    let thd = unsafe {
        core::ptr::write_bytes(vaddr as *mut u8, 0, THD_SIZE);
        Thread::deref(vaddr)
    };
    thd.set_state(ThdState::Running);
    thd.prio.store(prio, Ordering::Relaxed);
    thd.max_prio
        .store(MAX_PREEMPT_PRIO - 1, Ordering::Relaxed);
    thd.set_slices(SLICE_INIT);
    thd.cpu.store(cpu.addr(), Ordering::Release);
    thd.prc.store(prc_slot.object(), Ordering::Relaxed);
    thd.run.reset(vaddr);
    thd.notif.reset(vaddr);
    thd.event.reset(vaddr);
    thd.inv_stack.reset(vaddr);
    thd.set_reg_cur(0);

    thd.process().ref_inc();
    cpu.set_cur_thd(thd);

    dst.fill(0, vaddr, ThdFlags::all().bits(), 0, 0);
    dst.publish(CapType::Thd, 1);
    Ok(0)
}

/// `thd-del`: deletes a thread. Only unbound threads can go; a bound thread
/// must be freed from its CPU first.
pub fn del(kernel: &Kernel, cpt: CptRef, cap_cpt: Cid, slot: usize) -> Result<usize, Error> {
    let op = cpt.get(cap_cpt, CapType::Cpt, CptFlags::DEL.bits())?;
    let target = CptRef::from_slot(op).slot(slot)?;
    let head = target.delete_check(CapType::Thd)?;

    // Safety: delete_check proved this slot holds a live thread.
    let thd = unsafe { Thread::deref(target.object()) };
    if thd.cpu().is_some() {
        target.defrost();
        return Err(Error::ThdState);
    }

    target.clear(head)?;

    // Unwind any dead invocation stack so the ports become reusable. This
    // can be long if the stack is deep; that is the owner's choice.
    while let Some(i) = thd.inv_top() {
        i.force_pop();
    }

    thd.process().ref_dec();
    uassert!(kernel.kot.erase(thd.addr(), THD_SIZE).is_ok());
    Ok(0)
}

/// `thd-exec-set`: sets a thread's entry point and stack, clearing a
/// pending fault. With zero entry or stack, only the fault is cleared and
/// execution would resume where it stopped.
pub fn exec_set(
    cpu: &CpuLocal,
    cpt: CptRef,
    cap_thd: Cid,
    entry: usize,
    stack: usize,
    param: usize,
) -> Result<usize, Error> {
    let slot = cpt.get(cap_thd, CapType::Thd, ThdFlags::EXEC_SET.bits())?;
    // Safety: the capability pins the object.
    let thd = unsafe { Thread::deref(slot.object()) };
    if !thd.is_on(cpu) {
        return Err(Error::ThdState);
    }

    if thd.state() == ThdState::Fault {
        thd.set_state(ThdState::Timeout);
        thd.fault.store(0, Ordering::Relaxed);
    }

    if entry != 0 && stack != 0 {
        // Safety: thread is bound to this CPU; we are its kernel context.
        unsafe {
            thd.context_mut().reg.init_entry(entry, stack, param);
        }
    }
    Ok(0)
}

/// `thd-hyp-set`: redirects the register save area to a hypervisor-managed
/// buffer, or back to the built-in one when `kaddr` is zero.
pub fn hyp_set(cpu: &CpuLocal, cpt: CptRef, cap_thd: Cid, kaddr: usize) -> Result<usize, Error> {
    let slot = cpt.get(cap_thd, CapType::Thd, ThdFlags::HYP_SET.bits())?;
    // Safety: the capability pins the object.
    let thd = unsafe { Thread::deref(slot.object()) };
    if !thd.is_on(cpu) {
        return Err(Error::ThdState);
    }

    if kaddr != 0 && kaddr % core::mem::align_of::<Context>() != 0 {
        return Err(Error::ThdState);
    }
    thd.set_reg_cur(kaddr);
    Ok(0)
}

/// `thd-sched-bind`: binds a thread to the calling CPU under a parent
/// scheduler, with a priority and an opaque TID, optionally wiring a
/// scheduler notification endpoint.
pub fn sched_bind(
    cpu: &CpuLocal,
    cpt: CptRef,
    cap_thd: Cid,
    cap_parent: Cid,
    cap_sig: Cid,
    tid: usize,
    prio: usize,
) -> Result<usize, Error> {
    let thd_slot = cpt.get(cap_thd, CapType::Thd, ThdFlags::SCHED_CHILD.bits())?;
    let parent_slot =
        cpt.get(cap_parent, CapType::Thd, ThdFlags::SCHED_PARENT.bits())?;

    let sig = if cap_sig.is_valid() {
        let s = cpt.get(cap_sig, CapType::Sig, SigFlags::SCHED.bits())?;
        Some(s.object())
    } else {
        None
    };

    if tid >= TID_FAULT_FLAG {
        return Err(Error::ThdTid);
    }

    // Safety: the capabilities pin both objects.
    let thd = unsafe { Thread::deref(thd_slot.object()) };
    let parent = unsafe { Thread::deref(parent_slot.object()) };

    if thd.cpu().is_some() {
        return Err(Error::ThdState);
    }
    if !parent.is_on(cpu) {
        return Err(Error::ThdState);
    }
    if thd.addr() == parent.addr() {
        return Err(Error::ThdNotif);
    }
    if parent.max_prio() < prio {
        return Err(Error::ThdPrio);
    }

    // The binding itself is the linearization point against other CPUs.
    if thd
        .cpu
        .compare_exchange(0, cpu.addr(), Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(Error::ThdConflict);
    }

    // Bound to us now; no other core can touch the scheduling fields.
    thd.parent.store(parent.addr(), Ordering::Relaxed);
    thd.prio.store(prio, Ordering::Relaxed);
    thd.tid.store(tid, Ordering::Relaxed);
    match sig {
        Some(s) => {
            thd.sched_sig.store(s, Ordering::Relaxed);
            // Safety: the capability pinned the endpoint above; the object
            // refcount keeps it past the capability.
            unsafe { SigEndpoint::deref(s) }.ref_inc();
        }
        None => thd.sched_sig.store(0, Ordering::Relaxed),
    }
    parent.refcnt.fetch_add(1, Ordering::Relaxed);

    Ok(0)
}

/// `thd-sched-prio`: changes a bound thread's priority, effective
/// immediately, preempting in-line if the change demands it.
pub fn sched_prio(
    reg: &mut arch::SavedState,
    cpu: &CpuLocal,
    cpt: CptRef,
    cap_thd: Cid,
    prio: usize,
) -> Result<(), Error> {
    let slot = cpt.get(cap_thd, CapType::Thd, ThdFlags::SCHED_PRIO.bits())?;
    // Safety: the capability pins the object.
    let thd = unsafe { Thread::deref(slot.object()) };
    if !thd.is_on(cpu) {
        return Err(Error::ThdState);
    }
    if thd.max_prio() < prio {
        return Err(Error::ThdPrio);
    }

    reg.set_retval(0);

    match thd.state() {
        ThdState::Running => {
            thd.prio.store(prio, Ordering::Relaxed);
            kern_high(reg, cpu);
        }
        ThdState::Ready => {
            run_del(thd);
            thd.prio.store(prio, Ordering::Relaxed);
            run_ins(thd);
            kern_high(reg, cpu);
        }
        _ => thd.prio.store(prio, Ordering::Relaxed),
    }
    Ok(())
}

/// `thd-sched-free`: unbinds a thread from this CPU, cancelling any pending
/// scheduler notification and unblocking it with the `freed` code if it was
/// waiting on an endpoint.
pub fn sched_free(
    reg: &mut arch::SavedState,
    cpu: &CpuLocal,
    cpt: CptRef,
    cap_thd: Cid,
) -> Result<(), Error> {
    let slot = cpt.get(cap_thd, CapType::Thd, ThdFlags::SCHED_FREE.bits())?;
    // Safety: the capability pins the object.
    let thd = unsafe { Thread::deref(slot.object()) };
    if !thd.is_on(cpu) {
        return Err(Error::ThdState);
    }
    if thd.sched_refcnt() != 0 {
        return Err(Error::ThdRefcnt);
    }

    if let Some(parent) = thd.parent() {
        parent.refcnt.fetch_sub(1, Ordering::Relaxed);
    }
    thd.parent.store(0, Ordering::Relaxed);

    if !thd.notif.is_detached() {
        thd.notif.remove();
    }

    if let Some(sig) = thd.sched_sig() {
        sig.ref_dec();
        thd.sched_sig.store(0, Ordering::Relaxed);
    }

    reg.set_retval(0);

    match thd.state() {
        ThdState::Blocked => {
            // It cannot be the current thread, so we are not clobbering the
            // caller's return value here.
            // Safety: thread is bound to this CPU.
            unsafe {
                thd.context_mut()
                    .reg
                    .set_retval(Error::SivFreed.code());
            }
            let sig = thd.block_sig();
            uassert!(sig != 0);
            // Safety: a blocked thread's endpoint is pinned by the block.
            unsafe { SigEndpoint::deref(sig) }.clear_blocked();
            thd.set_block_sig(0);
            thd.set_state(ThdState::Timeout);
        }
        ThdState::Ready => {
            run_del(thd);
            thd.set_state(ThdState::Timeout);
        }
        ThdState::Running => {
            thd.set_state(ThdState::Timeout);
        }
        _ => (),
    }
    thd.set_slices(0);

    if cpu.cur_thd().addr() == thd.addr() {
        let next = run_high(cpu);
        uassert!(next.is_some());
        let next = next.unwrap_or_else(|| unreachable!());
        run_del(next);
        next.set_state(ThdState::Running);
        run_swt(reg, thd, next);
        cpu.set_cur_thd(next);
    }

    thd.cpu.store(0, Ordering::Release);
    Ok(())
}

/// `thd-sched-rcv`: pops one pending timeout/fault notification from a
/// scheduler thread's event list. Returns the child's TID, with the fault
/// flag OR-ed in and the cause placed in the invocation-return register if
/// the child faulted.
pub fn sched_rcv(
    reg: &mut arch::SavedState,
    cpu: &CpuLocal,
    cpt: CptRef,
    cap_thd: Cid,
) -> Result<usize, Error> {
    let slot = cpt.get(cap_thd, CapType::Thd, ThdFlags::SCHED_RCV.bits())?;
    // Safety: the capability pins the object.
    let thd = unsafe { Thread::deref(slot.object()) };
    if !thd.is_on(cpu) {
        return Err(Error::ThdState);
    }

    let child = match thd.event.first_owner() {
        None => return Err(Error::ThdNotif),
        // Safety: event-list entries are live threads pinned by binding.
        Some(a) => unsafe { Thread::deref(a) },
    };
    child.notif.remove();

    if child.state() == ThdState::Fault {
        reg.set_inv_retval(child.fault_cause() as isize);
        return Ok(child.tid() | TID_FAULT_FLAG);
    }
    Ok(child.tid())
}

/// `thd-time-xfer`: transfers slices between two threads on this CPU.
///
/// There are three kinds of thread (boot `INIT`, `INF`, and normal finite
/// budgets) and three kinds of transfer (a finite amount, `SLICE_INF` for
/// an infinite transfer, `SLICE_INIT` for a revoking transfer):
///
/// - a finite source moves finite slices, saturation-checked;
/// - an infinite transfer promotes a normal destination to `INF` without
///   draining an `INIT`/`INF` source;
/// - a revoking transfer additionally drains a non-boot source to zero.
///
/// A source that reaches zero leaves the runqueue, transitions to timeout,
/// and its scheduler is notified.
pub fn time_xfer(
    reg: &mut arch::SavedState,
    cpu: &CpuLocal,
    cpt: CptRef,
    cap_dst: Cid,
    cap_src: Cid,
    time: usize,
) -> Result<(), Error> {
    if time == 0 {
        return Err(Error::ThdState);
    }

    let dst_slot = cpt.get(cap_dst, CapType::Thd, ThdFlags::XFER_DST.bits())?;
    let src_slot = cpt.get(cap_src, CapType::Thd, ThdFlags::XFER_SRC.bits())?;
    // Safety: the capabilities pin both objects.
    let dst = unsafe { Thread::deref(dst_slot.object()) };
    let src = unsafe { Thread::deref(src_slot.object()) };

    if !src.is_on(cpu) || !dst.is_on(cpu) {
        return Err(Error::ThdState);
    }
    if src.slices() == 0 {
        return Err(Error::ThdState);
    }
    if dst.state() == ThdState::Fault {
        return Err(Error::ThdFault);
    }

    if src.slices() < SLICE_INF {
        // Finite source: transfer what was asked, capped by what it has.
        let amount = if time >= SLICE_INF {
            src.slices()
        } else {
            time.min(src.slices())
        };
        if dst.slices() < SLICE_INF {
            let total = dst
                .slices()
                .checked_add(amount)
                .filter(|&t| t < SLICE_INF)
                .ok_or(Error::ThdOverflow)?;
            dst.set_slices(total);
        }
        src.set_slices(src.slices() - amount);
    } else {
        // Boot or infinite source.
        if time >= SLICE_INF {
            if time == SLICE_INIT && src.slices() != SLICE_INIT {
                // Revoking transfer drains an infinite (non-boot) source.
                src.set_slices(0);
            }
            if dst.slices() < SLICE_INF {
                dst.set_slices(SLICE_INF);
            }
        } else {
            let total = dst
                .slices()
                .checked_add(time)
                .filter(|&t| t < SLICE_INF)
                .ok_or(Error::ThdOverflow)?;
            dst.set_slices(total);
        }
    }

    if src.slices() == 0 {
        match src.state() {
            ThdState::Running => src.set_state(ThdState::Timeout),
            ThdState::Ready => {
                run_del(src);
                src.set_state(ThdState::Timeout);
            }
            // A blocked thread keeps blocking; only the notification goes
            // out now.
            _ => (),
        }
        run_notif(cpu, src);
    }

    // Report how much the destination now holds, clamped so the sentinel
    // budgets cannot masquerade as error codes.
    reg.set_retval(dst.slices().min(isize::MAX as usize) as isize);

    if dst.state() == ThdState::Timeout && dst.slices() != 0 {
        dst.set_state(ThdState::Ready);
        run_ins(dst);
    }

    kern_high(reg, cpu);
    Ok(())
}

/// `thd-swt`: switches to a named same-priority runnable thread, or lets
/// the kernel pick the highest-priority ready thread. The full-yield flag
/// surrenders the current thread's remaining finite budget first.
pub fn swt(
    reg: &mut arch::SavedState,
    cpu: &CpuLocal,
    cpt: CptRef,
    cap_thd: Cid,
    full_yield: bool,
) -> Result<(), Error> {
    let cur = cpu.cur_thd();
    let mut next;

    if cap_thd.is_valid() {
        let slot = cpt.get(cap_thd, CapType::Thd, ThdFlags::SWT.bits())?;
        // Safety: the capability pins the object.
        let target = unsafe { Thread::deref(slot.object()) };
        if !target.is_on(cpu) {
            return Err(Error::ThdState);
        }
        if cur.prio() != target.prio() {
            return Err(Error::ThdPrio);
        }
        match target.state() {
            ThdState::Blocked | ThdState::Timeout => {
                return Err(Error::ThdState)
            }
            ThdState::Fault => return Err(Error::ThdFault),
            _ => (),
        }

        next = target;
        if full_yield && cur.slices() < SLICE_INF {
            cur.set_slices(0);
            cur.set_state(ThdState::Timeout);
            run_notif(cpu, cur);
            // The notification may have woken something hotter, and if the
            // target was ourselves we are no longer eligible.
            let high = run_high(cpu);
            uassert!(high.is_some());
            let high = high.unwrap_or_else(|| unreachable!());
            if high.prio() > next.prio() || next.addr() == cur.addr() {
                next = high;
            }
        } else {
            cur.set_state(ThdState::Ready);
            run_ins(cur);
        }
    } else {
        if full_yield && cur.slices() < SLICE_INF {
            cur.set_slices(0);
            cur.set_state(ThdState::Timeout);
            run_notif(cpu, cur);
        } else {
            // Rotate within our priority so equal-priority peers get a
            // chance.
            cur.set_state(ThdState::Ready);
            run_ins(cur);
        }
        let high = run_high(cpu);
        uassert!(high.is_some());
        next = high.unwrap_or_else(|| unreachable!());
    }

    reg.set_retval(0);

    if next.addr() == cur.addr() {
        // We rotated back to ourselves; undo the queue round trip.
        run_del(cur);
        cur.set_state(ThdState::Running);
        return Ok(());
    }

    run_del(next);
    next.set_state(ThdState::Running);
    run_swt(reg, cur, next);
    cpu.set_cur_thd(next);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::startup::{BOOT_CPT, BOOT_KOM, BOOT_PRC, BOOT_THD};
    use crate::testutil::world;

    #[test]
    fn spawn_binds_with_expected_fields() {
        let mut w = world();
        let a = w.spawn(8, 0, 2, 42);
        assert_eq!(a.tid(), 42);
        assert_eq!(a.prio(), 2);
        assert_eq!(a.state(), ThdState::Timeout);
        assert_eq!(a.slices(), 0);
        assert!(a.is_on(w.cpu));
        assert_eq!(a.parent().unwrap().addr(), w.boot_thd().addr());
        assert_eq!(w.boot_thd().sched_refcnt(), 1);

        // Rebinding a bound thread fails.
        assert_eq!(
            sched_bind(
                w.cpu,
                w.root,
                abi::Cid::one(8),
                abi::Cid::one(BOOT_THD),
                abi::Cid::NULL,
                1,
                1
            ),
            Err(Error::ThdState)
        );
    }

    #[test]
    fn bind_honors_tid_and_priority_ceilings() {
        let mut w = world();
        // A thread created with a low ceiling cannot parent high-priority
        // children.
        crt(
            w.kernel,
            w.cpu,
            w.root,
            abi::Cid::one(BOOT_CPT),
            abi::Cid::one(BOOT_KOM),
            8,
            abi::Cid::one(BOOT_PRC),
            3,
            0,
        )
        .unwrap();
        sched_bind(
            w.cpu,
            w.root,
            abi::Cid::one(8),
            abi::Cid::one(BOOT_THD),
            abi::Cid::NULL,
            1,
            2,
        )
        .unwrap();

        crt(
            w.kernel,
            w.cpu,
            w.root,
            abi::Cid::one(BOOT_CPT),
            abi::Cid::one(BOOT_KOM),
            9,
            abi::Cid::one(BOOT_PRC),
            31,
            THD_SIZE,
        )
        .unwrap();
        assert_eq!(
            sched_bind(
                w.cpu,
                w.root,
                abi::Cid::one(9),
                abi::Cid::one(8),
                abi::Cid::NULL,
                2,
                5
            ),
            Err(Error::ThdPrio)
        );
        assert_eq!(
            sched_bind(
                w.cpu,
                w.root,
                abi::Cid::one(9),
                abi::Cid::one(BOOT_THD),
                abi::Cid::NULL,
                abi::TID_FAULT_FLAG,
                5
            ),
            Err(Error::ThdTid)
        );
        // Binding under an unbound parent (including oneself) is refused.
        assert_eq!(
            sched_bind(
                w.cpu,
                w.root,
                abi::Cid::one(9),
                abi::Cid::one(9),
                abi::Cid::NULL,
                2,
                2
            ),
            Err(Error::ThdState)
        );
    }

    #[test]
    fn creation_cannot_exceed_creator_ceiling() {
        let w = world();
        // The boot thread's ceiling is MAX_PREEMPT_PRIO - 1; asking beyond
        // it fails.
        assert_eq!(
            crt(
                w.kernel,
                w.cpu,
                w.root,
                abi::Cid::one(BOOT_CPT),
                abi::Cid::one(BOOT_KOM),
                8,
                abi::Cid::one(BOOT_PRC),
                MAX_PREEMPT_PRIO,
                0,
            ),
            Err(Error::ThdPrio)
        );
    }

    #[test]
    fn time_transfer_preempts_and_reports_budget() {
        let mut w = world();
        let a = w.spawn(8, 0, 2, 42);

        let mut live = core::mem::take(&mut w.live);
        time_xfer(
            &mut live,
            w.cpu,
            w.root,
            abi::Cid::one(8),
            abi::Cid::one(BOOT_THD),
            3,
        )
        .unwrap();

        // The recipient outranks the boot thread, so it runs immediately;
        // the boot thread's saved frame carries the transfer result.
        assert_eq!(w.cpu.cur_thd().addr(), a.addr());
        assert_eq!(a.state(), ThdState::Running);
        assert_eq!(a.slices(), 3);
        let boot = w.boot_thd();
        assert_eq!(boot.state(), ThdState::Ready);
        // Safety: single-threaded test.
        assert_eq!(unsafe { &boot.context_mut().reg }.retval, 3);
    }

    #[test]
    fn transfer_draining_source_times_it_out() {
        let mut w = world();
        let a = w.spawn(8, 0, 2, 42);
        let b = w.spawn(9, THD_SIZE, 2, 43);

        let mut live = core::mem::take(&mut w.live);
        // Boot -> a: 4 slices; a becomes current.
        time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(8), abi::Cid::one(BOOT_THD), 4).unwrap();
        assert_eq!(w.cpu.cur_thd().addr(), a.addr());

        // a -> b: exactly everything a has. Source hits zero, times out,
        // and its scheduler is notified.
        time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(9), abi::Cid::one(8), 4).unwrap();
        assert_eq!(a.slices(), 0);
        assert_eq!(a.state(), ThdState::Timeout);
        assert_eq!(b.slices(), 4);
        assert_eq!(b.state(), ThdState::Running);
        assert_eq!(w.cpu.cur_thd().addr(), b.addr());

        // The parent hears about the drained child exactly once.
        let r = sched_rcv(&mut live, w.cpu, w.root, abi::Cid::one(BOOT_THD));
        assert_eq!(r, Ok(42));
        assert_eq!(
            sched_rcv(&mut live, w.cpu, w.root, abi::Cid::one(BOOT_THD)),
            Err(Error::ThdNotif)
        );
    }

    #[test]
    fn infinite_and_revoking_transfers_follow_the_matrix() {
        let mut w = world();
        let a = w.spawn(8, 0, 0, 1);
        let mut live = core::mem::take(&mut w.live);

        // Infinite transfer from the boot thread promotes the destination
        // without revoking the boot budget.
        time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(8), abi::Cid::one(BOOT_THD), abi::SLICE_INF).unwrap();
        assert_eq!(a.slices(), abi::SLICE_INF);
        assert_eq!(w.boot_thd().slices(), abi::SLICE_INIT);

        // Revoking transfer from the (infinite) a to b drains a.
        let b = w.spawn(9, THD_SIZE, 0, 2);
        time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(9), abi::Cid::one(8), abi::SLICE_INIT).unwrap();
        assert_eq!(a.slices(), 0);
        assert_eq!(b.slices(), abi::SLICE_INF);

        // A revoking transfer can never drain a boot thread.
        let c = w.spawn(10, 2 * THD_SIZE, 0, 3);
        time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(10), abi::Cid::one(BOOT_THD), abi::SLICE_INIT).unwrap();
        assert_eq!(w.boot_thd().slices(), abi::SLICE_INIT);
        assert_eq!(c.slices(), abi::SLICE_INF);
    }

    #[test]
    fn tick_expires_budget_and_falls_back(){
        let mut w = world();
        let a = w.spawn(8, 0, 2, 42);
        let mut live = core::mem::take(&mut w.live);
        time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(8), abi::Cid::one(BOOT_THD), 3).unwrap();
        assert_eq!(w.cpu.cur_thd().addr(), a.addr());

        tick_handler(&mut live, w.cpu);
        tick_handler(&mut live, w.cpu);
        assert_eq!(a.slices(), 1);
        assert_eq!(w.cpu.cur_thd().addr(), a.addr());

        tick_handler(&mut live, w.cpu);
        // Budget exhausted: the thread leaves the running state, the
        // lower-priority boot thread takes over, and the notification is
        // queued exactly once.
        assert_eq!(a.state(), ThdState::Timeout);
        assert_eq!(a.slices(), 0);
        assert_eq!(w.cpu.cur_thd().addr(), w.boot_thd().addr());
        assert_eq!(
            sched_rcv(&mut live, w.cpu, w.root, abi::Cid::one(BOOT_THD)),
            Ok(42)
        );
        assert_eq!(
            sched_rcv(&mut live, w.cpu, w.root, abi::Cid::one(BOOT_THD)),
            Err(Error::ThdNotif)
        );
    }

    #[test]
    fn switch_rotates_fifo_within_priority() {
        let mut w = world();
        let b = w.spawn(8, 0, 2, 1);
        let c = w.spawn(9, THD_SIZE, 2, 2);
        let mut live = core::mem::take(&mut w.live);
        time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(8), abi::Cid::one(BOOT_THD), 10).unwrap();
        time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(9), abi::Cid::one(BOOT_THD), 10).unwrap();
        assert_eq!(w.cpu.cur_thd().addr(), b.addr());

        // Kernel-chosen yield: FIFO hands the CPU to the peer.
        swt(&mut live, w.cpu, w.root, abi::Cid::NULL, false).unwrap();
        assert_eq!(w.cpu.cur_thd().addr(), c.addr());
        assert_eq!(b.state(), ThdState::Ready);

        // Directed switch back.
        swt(&mut live, w.cpu, w.root, abi::Cid::one(8), false).unwrap();
        assert_eq!(w.cpu.cur_thd().addr(), b.addr());

        // A directed switch to a thread of another priority is refused.
        let d = w.spawn(10, 2 * THD_SIZE, 3, 3);
        let _ = d;
        assert_eq!(
            swt(&mut live, w.cpu, w.root, abi::Cid::one(10), false),
            Err(Error::ThdPrio)
        );
    }

    #[test]
    fn full_yield_surrenders_budget() {
        let mut w = world();
        let b = w.spawn(8, 0, 2, 1);
        let mut live = core::mem::take(&mut w.live);
        time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(8), abi::Cid::one(BOOT_THD), 5).unwrap();
        assert_eq!(w.cpu.cur_thd().addr(), b.addr());

        swt(&mut live, w.cpu, w.root, abi::Cid::NULL, true).unwrap();
        assert_eq!(b.slices(), 0);
        assert_eq!(b.state(), ThdState::Timeout);
        assert_eq!(w.cpu.cur_thd().addr(), w.boot_thd().addr());
        assert_eq!(
            sched_rcv(&mut live, w.cpu, w.root, abi::Cid::one(BOOT_THD)),
            Ok(1)
        );
    }

    #[test]
    fn priority_change_takes_effect_immediately() {
        let mut w = world();
        let a = w.spawn(8, 0, 2, 1);
        let mut live = core::mem::take(&mut w.live);
        time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(8), abi::Cid::one(BOOT_THD), 10).unwrap();
        assert_eq!(w.cpu.cur_thd().addr(), a.addr());

        // Raising the ready boot thread above the current thread preempts
        // in-line.
        sched_prio(&mut live, w.cpu, w.root, abi::Cid::one(BOOT_THD), 3).unwrap();
        assert_eq!(w.cpu.cur_thd().addr(), w.boot_thd().addr());
        assert_eq!(a.state(), ThdState::Ready);

        // Beyond the thread's own ceiling is refused.
        crt(
            w.kernel,
            w.cpu,
            w.root,
            abi::Cid::one(BOOT_CPT),
            abi::Cid::one(BOOT_KOM),
            9,
            abi::Cid::one(BOOT_PRC),
            4,
            THD_SIZE,
        )
        .unwrap();
        sched_bind(
            w.cpu,
            w.root,
            abi::Cid::one(9),
            abi::Cid::one(BOOT_THD),
            abi::Cid::NULL,
            7,
            1,
        )
        .unwrap();
        assert_eq!(
            sched_prio(&mut live, w.cpu, w.root, abi::Cid::one(9), 5),
            Err(Error::ThdPrio)
        );
    }

    #[test]
    fn free_then_delete_reclaims_the_thread() {
        let mut w = world();
        let a = w.spawn(8, 0, 0, 1);
        let mut live = core::mem::take(&mut w.live);
        time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(8), abi::Cid::one(BOOT_THD), 5).unwrap();
        // Same priority as boot: a stays ready rather than preempting.
        assert_eq!(a.state(), ThdState::Ready);

        // Deleting while bound is refused.
        crate::captbl::frz(w.root, abi::Cid::one(BOOT_CPT), 8).unwrap();
        assert_eq!(
            del(w.kernel, w.root, abi::Cid::one(BOOT_CPT), 8),
            Err(Error::ThdState)
        );

        sched_free(&mut live, w.cpu, w.root, abi::Cid::one(8)).unwrap();
        assert!(a.cpu().is_none());
        assert_eq!(a.state(), ThdState::Timeout);
        assert_eq!(a.slices(), 0);
        assert_eq!(w.boot_thd().sched_refcnt(), 0);

        // The failed delete defrosted the slot; freeze again and retire it.
        crate::captbl::frz(w.root, abi::Cid::one(BOOT_CPT), 8).unwrap();
        del(w.kernel, w.root, abi::Cid::one(BOOT_CPT), 8).unwrap();
        assert_eq!(
            w.root.lookup(abi::Cid::one(8), CapType::Thd).err(),
            Some(Error::CapNull)
        );
    }

    #[test]
    fn fatal_kills_and_reports_through_sched_rcv() {
        let mut w = world();
        let a = w.spawn(8, 0, 2, 42);
        let mut live = core::mem::take(&mut w.live);
        time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(8), abi::Cid::one(BOOT_THD), 5).unwrap();
        assert_eq!(w.cpu.cur_thd().addr(), a.addr());

        fatal(&mut live, w.cpu, 0x99);
        assert_eq!(a.state(), ThdState::Fault);
        assert_eq!(a.slices(), 0);
        assert_eq!(w.cpu.cur_thd().addr(), w.boot_thd().addr());

        let r = sched_rcv(&mut live, w.cpu, w.root, abi::Cid::one(BOOT_THD));
        assert_eq!(r, Ok(42 | abi::TID_FAULT_FLAG));
        assert_eq!(live.inv_retval, 0x99);

        // Transfers to a faulted thread are refused.
        assert_eq!(
            time_xfer(&mut live, w.cpu, w.root, abi::Cid::one(8), abi::Cid::one(BOOT_THD), 1),
            Err(Error::ThdFault)
        );

        // exec-set re-arms it.
        exec_set(w.cpu, w.root, abi::Cid::one(8), 0x5000, 0x6000, 7).unwrap();
        assert_eq!(a.state(), ThdState::Timeout);
        // Safety: single-threaded test.
        let ctx = unsafe { &a.context_mut().reg };
        assert_eq!(ctx.entry, 0x5000);
        assert_eq!(ctx.param, 7);
    }

    #[test]
    fn hyp_set_redirects_the_register_area() {
        let mut w = world();
        let a = w.spawn(8, 0, 2, 1);
        let buf: &'static mut Context =
            Box::leak(Box::new(Context::default()));
        let kaddr = buf as *mut Context as usize;
        hyp_set(w.cpu, w.root, abi::Cid::one(8), kaddr).unwrap();
        // Safety: single-threaded test.
        assert_eq!(unsafe { a.context_mut() } as *mut Context as usize, kaddr);
        hyp_set(w.cpu, w.root, abi::Cid::one(8), 0).unwrap();
        assert_ne!(unsafe { a.context_mut() } as *mut Context as usize, kaddr);
        assert_eq!(
            hyp_set(w.cpu, w.root, abi::Cid::one(8), kaddr + 1),
            Err(Error::ThdState)
        );
    }
}
