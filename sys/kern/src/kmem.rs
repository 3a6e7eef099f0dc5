// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-memory capabilities.
//!
//! A kernel-memory capability has no backing object; it *is* authority: the
//! right to create kernel objects of selected kinds inside a byte range of
//! the kernel pool. Every create path funnels through [`check`], which turns
//! a caller-relative address into an absolute pool address or refuses.
//!
//! The range is stored in the slot body as `{info0 = start, info1 =
//! inclusive end}`, both granule-aligned; the flags word holds the permitted
//! object-kind bits.

use abi::{CapType, Error, KomFlags};

use crate::captbl::{check_perm, CptRef, Slot};
use crate::config::KOM_SLOT_SIZE;

/// Validates a creation of `size` bytes at caller-relative `raddr` against a
/// kernel-memory capability, returning the absolute address to use.
///
/// `head` is the slot's head snapshot from lookup; frozen capabilities and
/// missing kind bits report `CapFlag`/`CapFrozen` through `check_perm`, and
/// any range violation (including overflow) is an authority failure,
/// `CapFlag`.
pub fn check(
    kom: &Slot,
    head: usize,
    kind: KomFlags,
    raddr: usize,
    size: usize,
) -> Result<usize, Error> {
    check_perm(head, kom.flags_word(), kind.bits())?;

    let start = kom.info0();
    let end_incl = kom.info1();
    let vaddr = start.checked_add(raddr).ok_or(Error::CapFlag)?;
    uassert!(size != 0);
    let last = vaddr.checked_add(size - 1).ok_or(Error::CapFlag)?;
    if last > end_incl {
        return Err(Error::CapFlag);
    }
    Ok(vaddr)
}

/// Creates the boot-time kernel-memory capability in `slot` of `cpt`,
/// covering `[start, end)` rounded inward to the allocation granule and
/// authorizing the given kinds. Published pre-referenced, hence undeletable.
pub fn boot_crt(
    cpt: CptRef,
    slot: usize,
    start: usize,
    end: usize,
    kind: KomFlags,
) -> Result<usize, Error> {
    let start = (start + KOM_SLOT_SIZE - 1) & !(KOM_SLOT_SIZE - 1);
    let end = end & !(KOM_SLOT_SIZE - 1);
    if end <= start || kind.is_empty() {
        return Err(Error::CapFlag);
    }

    let s = cpt.slot(slot)?;
    s.occupy()?;
    s.fill(0, 0, kind.bits(), start, end - 1);
    s.publish(CapType::Kom, 1);
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captbl::{self, cpt_size};
    use crate::kot::tests::test_pool;
    use crate::Kernel;
    use abi::Cid;

    #[test]
    fn check_enforces_range_and_kind() {
        let p = test_pool(64 * 1024);
        let kernel = Kernel { kot: p.kot };
        let root = captbl::boot_init(&kernel, p.base, 0, 8).unwrap();
        boot_crt(
            root,
            1,
            p.base + cpt_size(8),
            p.base + p.size,
            KomFlags::THD | KomFlags::SIG,
        )
        .unwrap();

        let (kom, head) = root.lookup(Cid::one(1), CapType::Kom).unwrap();
        let start = kom.info0();

        // In-range THD creation resolves to an absolute address.
        assert_eq!(check(kom, head, KomFlags::THD, 128, 64), Ok(start + 128));
        // Kind not granted.
        assert_eq!(
            check(kom, head, KomFlags::PGT, 128, 64),
            Err(Error::CapFlag)
        );
        // Falling off the end of the range.
        assert_eq!(
            check(kom, head, KomFlags::SIG, p.size, 64),
            Err(Error::CapFlag)
        );
        // Address arithmetic overflow is a range failure, not a panic.
        assert_eq!(
            check(kom, head, KomFlags::SIG, usize::MAX - 8, 64),
            Err(Error::CapFlag)
        );
    }

    #[test]
    fn boot_crt_rounds_inward() {
        let p = test_pool(64 * 1024);
        let kernel = Kernel { kot: p.kot };
        let root = captbl::boot_init(&kernel, p.base, 0, 8).unwrap();
        boot_crt(
            root,
            1,
            p.base + cpt_size(8) + 3,
            p.base + p.size - 5,
            KomFlags::all(),
        )
        .unwrap();
        let (kom, _) = root.lookup(Cid::one(1), CapType::Kom).unwrap();
        assert_eq!(kom.info0() % KOM_SLOT_SIZE, 0);
        assert_eq!((kom.info1() + 1) % KOM_SLOT_SIZE, 0);
    }
}
