// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and applications.
//!
//! Everything in here is value-stable: capability ids, type tags, operation
//! flags, syscall numbers, and error codes are part of the contract between
//! the kernel and user level, and may not be renumbered.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of bits in a machine word. All ABI packings below are expressed in
/// terms of this, so the same encoding rules hold on 32-bit targets and on
/// 64-bit simulation hosts.
pub const WORD_BITS: u32 = usize::BITS;

/// Number of bits in a half word. Two capability ids or two small operands
/// pack into one syscall parameter at this boundary.
pub const HALF_BITS: u32 = WORD_BITS / 2;

/// Number of bits in a capability-id field. One full `Cid` (slot, table, and
/// the two-level flag) must fit in a half word so that two of them fit in one
/// parameter word.
pub const CID_BITS: u32 = HALF_BITS / 2 - 1;

/// Derived mask of one capability-id field.
pub const CID_MASK: usize = (1 << CID_BITS) - 1;

/// Maximum number of entries in one capability table. Table creation with
/// more entries than this must fail with `Error::CapRange`, because slots
/// past this point could never be named by a `Cid`.
pub const CPT_ENTRY_MAX: usize = 1 << CID_BITS;

/// Extracts the high half of a parameter word.
#[inline(always)]
pub const fn param_high(w: usize) -> usize {
    w >> HALF_BITS
}

/// Extracts the low half of a parameter word.
#[inline(always)]
pub const fn param_low(w: usize) -> usize {
    w & ((1 << HALF_BITS) - 1)
}

/// Packs two half-word operands into one parameter word.
#[inline(always)]
pub const fn param_pack(high: usize, low: usize) -> usize {
    (high << HALF_BITS) | (low & ((1 << HALF_BITS) - 1))
}

/// Extracts quarter field 0 (lowest) of a parameter word.
#[inline(always)]
pub const fn param_q0(w: usize) -> usize {
    w & ((1 << (WORD_BITS / 4)) - 1)
}

/// Extracts quarter field 1 of a parameter word.
#[inline(always)]
pub const fn param_q1(w: usize) -> usize {
    (w >> (WORD_BITS / 4)) & ((1 << (WORD_BITS / 4)) - 1)
}

/// Names a capability slot, either directly or through an intermediate
/// capability table.
///
/// A `Cid` is one machine word but always fits in a half word. The low
/// `CID_BITS` bits are the slot index. If `TWO_LEVEL` is set, the next
/// `CID_BITS` bits name a slot in the caller's master table that must hold a
/// capability-table capability, and the slot index is resolved inside that
/// table instead.
///
/// `Cid::NULL` is reserved to mean "no capability" in the places where a
/// capability argument is optional (scheduler endpoint at bind, thread
/// switch target). Every value with the NULL bit set is invalid.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Cid(pub usize);

impl Cid {
    /// The "no capability" sentinel. Also the lowest invalid id: anything
    /// numerically at or above this is not a capability name.
    pub const NULL: Self = Self(1 << (HALF_BITS - 1));

    /// Flag bit marking a two-level id.
    pub const TWO_LEVEL: usize = 1 << (HALF_BITS - 2);

    /// Fabricates a one-level id for a slot in the master table.
    pub const fn one(slot: usize) -> Self {
        Self(slot & CID_MASK)
    }

    /// Fabricates a two-level id: `table` is a slot in the master table
    /// holding a capability table, `slot` indexes into that table.
    pub const fn two(table: usize, slot: usize) -> Self {
        Self(Self::TWO_LEVEL | ((table & CID_MASK) << CID_BITS) | (slot & CID_MASK))
    }

    /// Checks whether this word names a capability at all.
    pub fn is_valid(self) -> bool {
        self.0 < Self::NULL.0
    }

    pub fn is_two_level(self) -> bool {
        self.0 & Self::TWO_LEVEL != 0
    }

    /// Extracts the slot index (the final level of the lookup).
    pub fn slot(self) -> usize {
        self.0 & CID_MASK
    }

    /// Extracts the intermediate table index of a two-level id.
    pub fn table(self) -> usize {
        (self.0 >> CID_BITS) & CID_MASK
    }
}

impl From<usize> for Cid {
    fn from(w: usize) -> Self {
        Cid(w)
    }
}

/// Capability type tags. Tag 0 is reserved for the empty slot; a slot is
/// non-empty exactly when its tag is non-zero.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CapType {
    /// Empty slot.
    Nop = 0,
    /// Capability table.
    Cpt = 1,
    /// Page table.
    Pgt = 2,
    /// Process.
    Prc = 3,
    /// Thread.
    Thd = 4,
    /// Signal endpoint.
    Sig = 5,
    /// Invocation port.
    Inv = 6,
    /// Kernel memory authority (no backing object).
    Kom = 7,
    /// Kernel function authority (no backing object).
    Kfn = 8,
}

impl CapType {
    pub const fn from_tag(tag: usize) -> Option<Self> {
        match tag {
            0 => Some(Self::Nop),
            1 => Some(Self::Cpt),
            2 => Some(Self::Pgt),
            3 => Some(Self::Prc),
            4 => Some(Self::Thd),
            5 => Some(Self::Sig),
            6 => Some(Self::Inv),
            7 => Some(Self::Kom),
            8 => Some(Self::Kfn),
            _ => None,
        }
    }
}

bitflags::bitflags! {
    /// Operations permitted through a capability-table capability.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct CptFlags: usize {
        const CRT = 1 << 0;
        const DEL = 1 << 1;
        const FRZ = 1 << 2;
        const ADD_SRC = 1 << 3;
        const ADD_DST = 1 << 4;
        const REM = 1 << 5;
        const PRC_CRT = 1 << 6;
        const PRC_CPT = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Operations permitted through a page-table capability. The position
    /// range of the delegation travels in the same flags word, above these
    /// bits; see [`pgt_flags_pack`].
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct PgtFlags: usize {
        const ADD_SRC = 1 << 0;
        const ADD_DST = 1 << 1;
        const REM = 1 << 2;
        const CON_CHILD = 1 << 3;
        const CON_PARENT = 1 << 4;
        const DES = 1 << 5;
        const PRC_CRT = 1 << 6;
        const PRC_PGT = 1 << 7;
    }
}

/// Number of bits reserved for the operation flags in a page-table
/// capability's flags word; the confined position range sits above them.
pub const PGT_FLAG_BITS: u32 = 8;

/// Packs a page-table flags word: operation bits plus the inclusive
/// `[low, high]` position range this capability may touch.
pub const fn pgt_flags_pack(flags: PgtFlags, low: usize, high: usize) -> usize {
    flags.bits()
        | ((low & CID_MASK) << PGT_FLAG_BITS)
        | ((high & CID_MASK) << (PGT_FLAG_BITS + CID_BITS))
}

pub const fn pgt_flags_low(word: usize) -> usize {
    (word >> PGT_FLAG_BITS) & CID_MASK
}

pub const fn pgt_flags_high(word: usize) -> usize {
    (word >> (PGT_FLAG_BITS + CID_BITS)) & CID_MASK
}

pub const fn pgt_flags_ops(word: usize) -> PgtFlags {
    PgtFlags::from_bits_truncate(word)
}

bitflags::bitflags! {
    /// Operations permitted through a process capability.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct PrcFlags: usize {
        const INV = 1 << 0;
        const THD = 1 << 1;
        const CPT = 1 << 2;
        const PGT = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Operations permitted through a thread capability.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct ThdFlags: usize {
        const EXEC_SET = 1 << 0;
        const HYP_SET = 1 << 1;
        const SCHED_CHILD = 1 << 2;
        const SCHED_PARENT = 1 << 3;
        const SCHED_PRIO = 1 << 4;
        const SCHED_FREE = 1 << 5;
        const SCHED_RCV = 1 << 6;
        const XFER_SRC = 1 << 7;
        const XFER_DST = 1 << 8;
        const SWT = 1 << 9;
    }
}

bitflags::bitflags! {
    /// Operations permitted through a signal-endpoint capability. One bit
    /// per receive mode, so delegation can confine a receiver to, say, the
    /// non-blocking modes only.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct SigFlags: usize {
        const SND = 1 << 0;
        const RCV_BS = 1 << 1;
        const RCV_BM = 1 << 2;
        const RCV_NS = 1 << 3;
        const RCV_NM = 1 << 4;
        const SCHED = 1 << 5;
    }
}

impl SigFlags {
    pub const RCV: Self = Self::RCV_BS
        .union(Self::RCV_BM)
        .union(Self::RCV_NS)
        .union(Self::RCV_NM);
}

bitflags::bitflags! {
    /// Operations permitted through an invocation capability.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct InvFlags: usize {
        const SET = 1 << 0;
        const ACT = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Kinds of kernel object a kernel-memory capability authorizes creating
    /// inside its range.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct KomFlags: usize {
        const CPT = 1 << 0;
        const PGT = 1 << 1;
        const PRC = 1 << 2;
        const THD = 1 << 3;
        const SIG = 1 << 4;
        const INV = 1 << 5;
    }
}

bitflags::bitflags! {
    /// Page permission and attribute flags, in the architecture-independent
    /// encoding. The architecture layer translates these into hardware
    /// attributes; STATIC pages must always be representable in hardware.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct PageFlags: usize {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const CACHE = 1 << 3;
        const BUFFER = 1 << 4;
        const STATIC = 1 << 5;
    }
}

impl PageFlags {
    pub const ALL_PERM: Self = Self::READ
        .union(Self::WRITE)
        .union(Self::EXECUTE)
        .union(Self::CACHE)
        .union(Self::BUFFER)
        .union(Self::STATIC);
}

/// Scheduler time sentinels. Slice counts at or above `SLICE_INF` are not
/// budgets but markers: `SLICE_INIT` tags boot threads (never expire, never
/// block), `SLICE_INF` tags threads promoted to an infinite budget. As a
/// time-transfer amount, `SLICE_INF` requests an infinite transfer and
/// `SLICE_INIT` requests a revoking transfer.
pub const SLICE_INIT: usize = usize::MAX;
pub const SLICE_INF: usize = usize::MAX - 1;

/// Flag bit OR-ed into a TID returned by `thd-sched-rcv` when the
/// notification reports a fault rather than a timeout. TIDs supplied at bind
/// time must be numerically below this.
pub const TID_FAULT_FLAG: usize = 1 << (WORD_BITS - 2);

/// Receive options for `sig-rcv`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(usize)]
pub enum RcvOpt {
    /// Block if empty, take one pending count.
    BlockSingle = 0,
    /// Block if empty, take all pending counts.
    BlockMulti = 1,
    /// Never block, take one pending count.
    PollSingle = 2,
    /// Never block, take all pending counts.
    PollMulti = 3,
}

impl core::convert::TryFrom<usize> for RcvOpt {
    type Error = ();

    fn try_from(x: usize) -> Result<Self, ()> {
        match x {
            0 => Ok(Self::BlockSingle),
            1 => Ok(Self::BlockMulti),
            2 => Ok(Self::PollSingle),
            3 => Ok(Self::PollMulti),
            _ => Err(()),
        }
    }
}

/// Enumeration of syscall numbers.
///
/// The first five are ordered by expected frequency: invocation return and
/// activation dominate the call mix under synchronous IPC workloads, and the
/// dispatcher branches on them before anything else.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum Sysnum {
    InvRet = 0,
    InvAct = 1,
    SigSnd = 2,
    SigRcv = 3,
    Kfn = 4,
    ThdSchedPrio = 5,
    ThdSchedFree = 6,
    ThdTimeXfer = 7,
    ThdSwt = 8,
    CptCrt = 9,
    CptDel = 10,
    CptFrz = 11,
    CptAdd = 12,
    CptRem = 13,
    PgtCrt = 14,
    PgtDel = 15,
    PgtAdd = 16,
    PgtRem = 17,
    PgtCon = 18,
    PgtDes = 19,
    PrcCrt = 20,
    PrcDel = 21,
    PrcCpt = 22,
    PrcPgt = 23,
    ThdCrt = 24,
    ThdDel = 25,
    ThdExecSet = 26,
    ThdHypSet = 27,
    ThdSchedBind = 28,
    ThdSchedRcv = 29,
    SigCrt = 30,
    SigDel = 31,
    InvCrt = 32,
    InvDel = 33,
    InvSet = 34,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on
/// `num-traits` and this seems okay.
impl core::convert::TryFrom<usize> for Sysnum {
    type Error = ();

    fn try_from(x: usize) -> Result<Self, ()> {
        match x {
            0 => Ok(Self::InvRet),
            1 => Ok(Self::InvAct),
            2 => Ok(Self::SigSnd),
            3 => Ok(Self::SigRcv),
            4 => Ok(Self::Kfn),
            5 => Ok(Self::ThdSchedPrio),
            6 => Ok(Self::ThdSchedFree),
            7 => Ok(Self::ThdTimeXfer),
            8 => Ok(Self::ThdSwt),
            9 => Ok(Self::CptCrt),
            10 => Ok(Self::CptDel),
            11 => Ok(Self::CptFrz),
            12 => Ok(Self::CptAdd),
            13 => Ok(Self::CptRem),
            14 => Ok(Self::PgtCrt),
            15 => Ok(Self::PgtDel),
            16 => Ok(Self::PgtAdd),
            17 => Ok(Self::PgtRem),
            18 => Ok(Self::PgtCon),
            19 => Ok(Self::PgtDes),
            20 => Ok(Self::PrcCrt),
            21 => Ok(Self::PrcDel),
            22 => Ok(Self::PrcCpt),
            23 => Ok(Self::PrcPgt),
            24 => Ok(Self::ThdCrt),
            25 => Ok(Self::ThdDel),
            26 => Ok(Self::ThdExecSet),
            27 => Ok(Self::ThdHypSet),
            28 => Ok(Self::ThdSchedBind),
            29 => Ok(Self::ThdSchedRcv),
            30 => Ok(Self::SigCrt),
            31 => Ok(Self::SigDel),
            32 => Ok(Self::InvCrt),
            33 => Ok(Self::InvDel),
            34 => Ok(Self::InvSet),
            _ => Err(()),
        }
    }
}

/// The flat error taxonomy. Every syscall returns either a non-negative
/// value or one of these, as a negative word. Codes group by subsystem at
/// bases 0, -100, -200, -300; the values are stable ABI.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(isize)]
pub enum Error {
    /// The named slot holds nothing, or an unknown syscall was made.
    CapNull = -1,
    /// The slot holds a capability of the wrong type.
    CapType = -2,
    /// An index or count is outside the representable range.
    CapRange = -3,
    /// The kernel-object bitmap refused the mark or erase.
    CapKot = -4,
    /// The destination slot is already occupied.
    CapExist = -5,
    /// A reference count forbids the operation, or would overflow.
    CapRefcnt = -6,
    /// Flag narrowing was violated, or a range/kind check failed.
    CapFlag = -7,
    /// The slot was frozen too recently; quiescence has not elapsed.
    CapQuie = -8,
    /// The slot is frozen (or, for freeze itself, already frozen).
    CapFrozen = -9,
    /// The operation requires a delegated capability but got a root one.
    CapRoot = -10,

    /// An address or position is outside the page table's coverage.
    PgtAddr = -101,
    /// The mapping or unmapping itself failed (occupied, absent, or
    /// inconsistent).
    PgtMap = -102,
    /// The hardware (or its fixed-size region table) cannot represent the
    /// request.
    PgtHw = -103,
    /// Permission expansion was attempted.
    PgtPerm = -104,

    /// The thread is not in a state that allows this operation.
    ThdState = -204,
    /// The TID is out of range.
    ThdTid = -203,
    /// The priority exceeds the maximum the capability allows.
    ThdPrio = -205,
    /// The thread is still referenced as a scheduler.
    ThdRefcnt = -206,
    /// A binding conflict: another CPU got there first, or self-binding.
    ThdConflict = -202,
    /// The target thread is in the fault state.
    ThdFault = -209,
    /// No scheduler notification is pending.
    ThdNotif = -207,
    /// The time transfer would overflow the destination budget.
    ThdOverflow = -208,

    /// The invocation is already active, or the receive option is invalid.
    SivAct = -301,
    /// A fault return was attempted but the port forbids it.
    SivFault = -302,
    /// The signal counter is saturated.
    SivFull = -303,
    /// The invocation stack is empty.
    SivEmpty = -304,
    /// A concurrent operation took the count or the blocking slot first.
    SivConflict = -305,
    /// The blocked thread was freed from its endpoint.
    SivFreed = -306,
    /// Boot threads may not block on signals.
    SivBoot = -307,
}

impl Error {
    /// The ABI representation: a negative machine word.
    pub const fn code(self) -> isize {
        self as isize
    }
}
