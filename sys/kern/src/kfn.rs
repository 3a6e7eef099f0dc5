// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-function capabilities.
//!
//! A kernel-function capability has no backing object; it gates access to
//! port-specific privileged operations (cache maintenance, interrupt
//! control, debugger access) by function-id range. The core only checks the
//! range; what the ids do is entirely the port's business, dispatched by
//! `arch::kern_func_handler` on a 16-bit function id and 16-bit subfunction
//! id.

use abi::{param_high, param_low, param_pack, CapType, Cid, Error};

use crate::arch;
use crate::captbl::CptRef;
use crate::thd::ArchState;

/// Creates the boot-time kernel-function capability covering the full id
/// range. Published pre-referenced, hence undeletable.
pub fn boot_crt(cpt: CptRef, slot: usize) -> Result<usize, Error> {
    let s = cpt.slot(slot)?;
    s.occupy()?;
    s.fill(0, 0, param_pack(usize::MAX, 0), 0, 0);
    s.publish(CapType::Kfn, 1);
    Ok(0)
}

/// `kfn`: invokes port-specific privileged operation `fid`/`sub` under the
/// named capability. The port handler's non-negative result becomes the
/// syscall return value.
pub fn act(
    reg: &mut arch::SavedState,
    cpt: CptRef,
    cap_kfn: Cid,
    fid: usize,
    sub: usize,
    p1: usize,
    p2: usize,
) -> Result<(), Error> {
    let (slot, _head) = cpt.lookup(cap_kfn, CapType::Kfn)?;

    let range = slot.flags_word();
    if fid < param_low(range) || fid > param_high(range) {
        return Err(Error::CapFlag);
    }

    let v = arch::kern_func_handler(fid, sub, p1, p2)?;
    reg.set_retval(v.min(isize::MAX as usize) as isize);
    Ok(())
}
