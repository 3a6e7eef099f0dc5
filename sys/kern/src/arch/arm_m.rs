// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv7-M-class parts.
//!
//! # Trap shape
//!
//! Syscalls arrive over `SVC`. On any exception the hardware stacks
//! r0-r3/r12/lr/pc/xPSR onto the process stack; the callee-saved registers
//! are ours to capture. The `SVCall` stub deposits r4-r11, the process
//! stack pointer and the EXC_RETURN value into a `SavedState` on the main
//! stack and hands that to the portable dispatcher. Context switches are
//! copy-based: the dispatcher copies the live `SavedState` into the old
//! thread's save area and the new thread's over it, so the same stub
//! unwinds into whichever thread won.
//!
//! # Register conventions
//!
//! The syscall descriptor travels in r4 (opcode and capability id packed),
//! parameters in r5-r7. The return value replaces r4; the invocation
//! return value lands in r5. A freshly launched thread or invocation gets
//! its entry point in r4 (thumb bit set) and its argument in r5 — the
//! user-level runtime's entry stub branches through r4, which is what lets
//! the kernel start executables without ever writing user memory.
//!
//! # Timer
//!
//! SysTick is the kernel tick. Each interrupt advances the global
//! timestamp and runs the scheduler's tick pass; budget bookkeeping and
//! the deferred pick-highest both happen in the portable code.

use core::sync::atomic::{AtomicUsize, Ordering};

use abi::Error;

use crate::thd::{ArchState, Context, CpuLocal, Iret};

/// EXC_RETURN for a fresh thread: return to thread mode, process stack,
/// standard (FPU-free) frame.
const EXC_RET_INIT: usize = 0xFFFF_FFFD;

/// ARMv7-M callee-saved state, plus the two words that make the trap
/// re-entrant: the process stack pointer and the EXC_RETURN value (which
/// records whether the frame on the process stack is FPU-extended).
///
/// Field order is load-bearing: the `SVCall` stub builds this struct on the
/// main stack with two `push` pairs.
#[derive(Clone, Debug, Default)]
#[repr(C)]
pub struct SavedState {
    r4: usize,
    r5: usize,
    r6: usize,
    r7: usize,
    r8: usize,
    r9: usize,
    r10: usize,
    r11: usize,
    psp: usize,
    exc_return: usize,
}

impl ArchState for SavedState {
    fn syscall_desc(&self) -> usize {
        self.r4
    }

    fn arg(&self, n: usize) -> usize {
        match n {
            0 => self.r5,
            1 => self.r6,
            _ => self.r7,
        }
    }

    fn set_retval(&mut self, v: isize) {
        self.r4 = v as usize;
    }

    fn set_inv_retval(&mut self, v: isize) {
        self.r5 = v as usize;
    }

    fn init_entry(&mut self, entry: usize, stack: usize, param: usize) {
        self.exc_return = EXC_RET_INIT;
        // Thumb bit, so the user stub's `bx r4` stays in thumb state.
        self.r4 = entry | 1;
        self.r5 = param;
        self.psp = stack;
    }

    fn iret_save(&self) -> Iret {
        Iret {
            sp: self.psp,
            lr: self.exc_return,
        }
    }

    fn iret_restore(&mut self, ret: Iret) {
        self.psp = ret.sp;
        self.exc_return = ret.lr;
    }
}

/// FPU context, saved lazily: threads whose EXC_RETURN shows a standard
/// frame never used the FPU since their last switch, so s16-s31 need no
/// round trip.
#[derive(Clone, Debug)]
#[repr(C)]
pub struct CopState {
    s: [u32; 16],
}

impl Default for CopState {
    fn default() -> Self {
        CopState { s: [0; 16] }
    }
}

/// EXC_RETURN bit 4: set means the stacked frame is the standard one, i.e.
/// the FPU was untouched.
const EXC_RET_STD_FRAME: usize = 1 << 4;

pub fn context_save(live: &SavedState, into: &mut Context) {
    into.reg = live.clone();
    #[cfg(armv7em)]
    if live.exc_return & EXC_RET_STD_FRAME == 0 {
        // Safety: s16-s31 are live and unclobbered this trap.
        unsafe {
            core::arch::asm!(
                "vstm {0}, {{s16-s31}}",
                in(reg) into.cop.s.as_mut_ptr(),
            );
        }
    }
    #[cfg(not(armv7em))]
    let _ = EXC_RET_STD_FRAME;
}

pub fn context_restore(from: &Context, live: &mut SavedState) {
    *live = from.reg.clone();
    #[cfg(armv7em)]
    if from.reg.exc_return & EXC_RET_STD_FRAME == 0 {
        // Safety: symmetric with context_save.
        unsafe {
            core::arch::asm!(
                "vldm {0}, {{s16-s31}}",
                in(reg) from.cop.s.as_ptr(),
            );
        }
    }
}

// MPU register block.
const MPU_CTRL: *mut u32 = 0xE000_ED94 as *mut u32;
const MPU_RBAR: *mut u32 = 0xE000_ED9C as *mut u32;
const MPU_RASR: *mut u32 = 0xE000_EDA0 as *mut u32;

/// MPU_CTRL: enable, and keep the default map for privileged code so the
/// kernel itself is never locked out.
const MPU_CTRL_ENABLE_PRIVDEF: u32 = 0b101;

/// Activates a page table by loading its MPU region image. `pgt_obj` is
/// the top-level directory's object address.
pub fn set_pgt(pgt_obj: usize) {
    // Safety: the caller hands us a live top-level directory; its region
    // table is the MPU image. Every RBAR in the image carries VALID and
    // its region number, so a straight sequence of pair writes relocates
    // the whole table.
    unsafe {
        let top = crate::pgtbl::PgtObj::at(pgt_obj);
        let mpu =
            &*(top.mpu_addr() as *const kerncore::pmsav7::RegionTable);
        core::ptr::write_volatile(MPU_CTRL, 0);
        for r in &mpu.regions {
            core::ptr::write_volatile(MPU_RBAR, r.rbar);
            core::ptr::write_volatile(MPU_RASR, r.rasr);
        }
        core::ptr::write_volatile(MPU_CTRL, MPU_CTRL_ENABLE_PRIVDEF);
        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }
}

/// Port-specific privileged operations, reachable through kernel-function
/// capabilities. Sparse by design; boards grow their own ranges.
///
/// - 0x0000/sub: console putchar (sub is ignored);
/// - 0x0001: read the cycle counter low word;
/// - 0xFFFF: reboot.
pub fn kern_func_handler(
    fid: usize,
    _sub: usize,
    p1: usize,
    _p2: usize,
) -> Result<usize, Error> {
    match fid {
        0x0000 => {
            putchar(p1 as u8);
            Ok(0)
        }
        0x0001 => {
            // DWT_CYCCNT.
            // Safety: read-only volatile load of an always-present counter.
            let cyc = unsafe {
                core::ptr::read_volatile(0xE000_1004 as *const u32)
            };
            Ok(cyc as usize)
        }
        0xFFFF => reboot(),
        _ => Err(Error::CapNull),
    }
}

// ITM stimulus port 0, the debug console.
const ITM_STIM0: *mut u32 = 0xE000_0000 as *mut u32;

pub fn putchar(c: u8) {
    // Safety: volatile ITM access; harmless when the port is disabled.
    unsafe {
        while core::ptr::read_volatile(ITM_STIM0) & 1 == 0 {}
        core::ptr::write_volatile(ITM_STIM0, c as u32);
    }
}

#[cfg(feature = "klog")]
pub fn klog_line(args: core::fmt::Arguments<'_>) {
    use core::fmt::Write;
    struct Console;
    impl Write for Console {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            for b in s.bytes() {
                putchar(b);
            }
            Ok(())
        }
    }
    let _ = writeln!(Console, "kern: {args}");
}

/// The architecture reboot hook: request a system reset and park until it
/// takes effect.
pub fn reboot() -> ! {
    const AIRCR: *mut u32 = 0xE000_ED0C as *mut u32;
    const VECTKEY_SYSRESETREQ: u32 = (0x05FA << 16) | (1 << 2);
    // Safety: this is the documented reset sequence; nothing survives it.
    unsafe {
        cortex_m::asm::dsb();
        core::ptr::write_volatile(AIRCR, VECTKEY_SYSRESETREQ);
    }
    loop {
        cortex_m::asm::wfi();
    }
}

/// Stashed so interrupt handlers can find the per-CPU structure without an
/// argument.
static CPU_LOCAL_PTR: AtomicUsize = AtomicUsize::new(0);

fn cpu_local() -> &'static CpuLocal {
    let p = CPU_LOCAL_PTR.load(Ordering::Relaxed);
    uassert!(p != 0);
    // Safety: set once at startup to a static.
    unsafe { &*(p as *const CpuLocal) }
}

/// SysTick reload for the configured tick; the board init picks the
/// divisor before starting the kernel.
static TICK_RELOAD: AtomicUsize = AtomicUsize::new(0);

/// Records the cycles-per-tick divisor. Must happen before
/// `start_first_thread` arms the timer.
pub fn set_tick_divisor(cycles: usize) {
    TICK_RELOAD.store(cycles, Ordering::Relaxed);
}

const SYST_CSR: *mut u32 = 0xE000_E010 as *mut u32;
const SYST_RVR: *mut u32 = 0xE000_E014 as *mut u32;
const SYST_CVR: *mut u32 = 0xE000_E018 as *mut u32;

/// Drops into the boot thread.
///
/// We are still in privileged thread mode on the main stack at this point,
/// so no exception return is needed: switch thread mode onto the process
/// stack, drop privilege, and branch straight to the entry point. From
/// here on the main stack belongs to the trap stubs.
pub fn start_first_thread(cpu: &CpuLocal) -> ! {
    CPU_LOCAL_PTR.store(cpu as *const _ as usize, Ordering::Relaxed);

    let thd = cpu.cur_thd();
    // Safety: single context at boot.
    let reg = unsafe { &thd.context_mut().reg };

    // Put SVCall, SysTick and the fault handlers in the same (lowest)
    // priority group: kernel code is then never preempted by kernel code,
    // which is the single-core concurrency model the portable layer
    // assumes.
    const SHPR1: *mut u32 = 0xE000_ED18 as *mut u32;
    const SHPR2: *mut u32 = 0xE000_ED1C as *mut u32;
    const SHPR3: *mut u32 = 0xE000_ED20 as *mut u32;
    // Safety: standard system handler priority setup.
    unsafe {
        core::ptr::write_volatile(SHPR1, 0xFFFF_FFFF); // faults
        core::ptr::write_volatile(SHPR2, 0xFF00_0000); // SVCall
        core::ptr::write_volatile(SHPR3, 0xFFFF_0000); // SysTick, PendSV
    }

    // Arm the tick.
    // Safety: standard SysTick bring-up.
    unsafe {
        core::ptr::write_volatile(SYST_RVR, TICK_RELOAD.load(Ordering::Relaxed) as u32);
        core::ptr::write_volatile(SYST_CVR, 0);
        core::ptr::write_volatile(SYST_CSR, 0b111);
    }

    // Safety: the entry point and stack came from the port's boot
    // description, and nothing else is running yet. r4/r5 carry the entry
    // and argument per the launch convention.
    unsafe {
        core::arch::asm!(
            "msr psp, r0",
            "msr control, r1", // unprivileged thread mode, PSP
            "isb",
            "bx r4",
            in("r0") reg.psp,
            in("r1") 0b11usize,
            in("r4") reg.r4,
            in("r5") reg.r5,
            options(noreturn),
        );
    }
}

/// Rust side of the SVC trap.
///
/// # Safety
///
/// Called only from the `SVCall` stub with a live `SavedState`.
#[no_mangle]
unsafe extern "C" fn arm_m_svc_entry(reg: &mut SavedState) {
    crate::syscalls::svc_handler(crate::startup::kernel(), cpu_local(), reg);
}

/// Rust side of the SysTick trap.
///
/// # Safety
///
/// Called only from the `SysTick` stub with a live `SavedState`.
#[no_mangle]
unsafe extern "C" fn arm_m_tick_entry(reg: &mut SavedState) {
    crate::time::advance(1);
    crate::thd::tick_handler(reg, cpu_local());
}

/// Rust side of the fault traps.
///
/// # Safety
///
/// Called only from the fault stubs with a live `SavedState`.
#[no_mangle]
unsafe extern "C" fn arm_m_fault_entry(reg: &mut SavedState) {
    const SCB_CFSR: *mut u32 = 0xE000_ED28 as *mut u32;
    const SCB_MMFAR: *const u32 = 0xE000_ED34 as *const u32;

    const MMFSR_IACCVIOL: u32 = 1 << 0;
    const MMFSR_DACCVIOL: u32 = 1 << 1;
    const MMFSR_MMARVALID: u32 = 1 << 7;

    // A fault taken from handler mode is the kernel's own; no recovery.
    uassert!(reg.exc_return & (1 << 3) != 0);

    // Safety: volatile system-register access.
    let cfsr = unsafe { core::ptr::read_volatile(SCB_CFSR) };

    let cpu = cpu_local();
    let thd = cpu.cur_thd();
    // Safety: current thread's home or invoked process is live.
    let top = unsafe { crate::pgtbl::PgtObj::at(thd.cur_pgt()) };

    let recovered = if cfsr & MMFSR_DACCVIOL != 0 && cfsr & MMFSR_MMARVALID != 0 {
        // Possibly just a benign MPU miss on a dynamic page: re-walk the
        // user page table and, if the address is backed with sufficient
        // permission, swap the region in and resume.
        // Safety: volatile system-register access.
        let mmfar = unsafe { core::ptr::read_volatile(SCB_MMFAR) } as usize;
        crate::pgtbl::dyn_fault_insert(&top, mmfar, abi::PageFlags::READ)
            .is_ok()
    } else if cfsr & MMFSR_IACCVIOL != 0 {
        // Instruction-side miss: the faulting pc is in the stacked frame.
        // Safety: psp points at the frame the hardware just stacked.
        let pc = unsafe {
            core::ptr::read_volatile((reg.psp as *const u32).add(6))
        } as usize;
        crate::pgtbl::dyn_fault_insert(&top, pc, abi::PageFlags::EXECUTE)
            .is_ok()
    } else {
        false
    };

    if !recovered {
        crate::thd::fatal(reg, cpu, cfsr as usize);
    }

    // The status bits are sticky.
    // Safety: write-one-to-clear.
    unsafe {
        core::ptr::write_volatile(SCB_CFSR, !0);
    }
}

// Exception stubs. Each captures the callee-saved state into a SavedState
// on the main stack, in the exact field order of the struct, calls its
// Rust half, and unwinds into whatever that half left behind — which after
// a context switch is a different thread's state.
macro_rules! trap_stub {
    ($name:ident, $entry:literal) => {
        #[allow(non_snake_case)]
        #[no_mangle]
        #[naked]
        pub unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "mrs r12, psp",
                "push {{r12, lr}}",
                "push {{r4-r11}}",
                "mov r0, sp",
                concat!("bl ", $entry),
                "pop {{r4-r11}}",
                "pop {{r12, lr}}",
                "msr psp, r12",
                "bx lr",
            );
        }
    };
}

trap_stub!(SVCall, "arm_m_svc_entry");
trap_stub!(SysTick, "arm_m_tick_entry");
trap_stub!(MemoryManagement, "arm_m_fault_entry");
trap_stub!(BusFault, "arm_m_fault_entry");
trap_stub!(UsageFault, "arm_m_fault_entry");
