// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel-object table: occupancy tracking for the kernel pool.
//!
//! Every kernel object lives in a contiguous, granule-aligned region of the
//! single kernel memory pool, and its granules are marked here for as long
//! as it is alive. The table is the kernel's proof obligation on free: an
//! erase succeeds only if the exact region being freed is currently marked,
//! so a confused (or malicious) deletion path cannot release memory it does
//! not own.
//!
//! This is why the kernel has an occupancy bitmap and not a `malloc`: the
//! verification on free is O(1) per word, and concurrent creates on
//! disjoint regions stay lock-free. The range protocol itself lives in
//! `kerncore::bitmap`.

use core::sync::atomic::AtomicUsize;

use abi::Error;
use kerncore::bitmap;

use crate::config::{KOM_SLOT_ORDER, KOM_SLOT_SIZE};

/// Rounds an object size up to whole granules. Object size constants go
/// through this so that mark and erase always see aligned sizes.
pub const fn round_up(size: usize) -> usize {
    (size + KOM_SLOT_SIZE - 1) & !(KOM_SLOT_SIZE - 1)
}

/// The kernel-object table. Covers `pool_slots() * KOM_SLOT_SIZE` bytes of
/// pool starting at `base`.
pub struct Kot {
    base: usize,
    words: &'static [AtomicUsize],
}

impl Kot {
    /// Number of bitmap words needed to cover `pool_size` bytes of pool.
    pub const fn words_for(pool_size: usize) -> usize {
        let slots = pool_size >> KOM_SLOT_ORDER;
        (slots + usize::BITS as usize - 1) / usize::BITS as usize
    }

    /// Wraps a zeroed word array as the table for the pool at `base`.
    ///
    /// `base` must be granule-aligned. The words must be zero; this is
    /// asserted rather than cleared so that handing the same storage to two
    /// tables is caught.
    pub fn new(base: usize, words: &'static [AtomicUsize]) -> Self {
        uassert!(base & (KOM_SLOT_SIZE - 1) == 0);
        uassert!(!words.is_empty());
        for w in words {
            uassert!(w.load(core::sync::atomic::Ordering::Relaxed) == 0);
        }
        Kot { base, words }
    }

    /// Number of granules this table covers.
    pub fn pool_slots(&self) -> usize {
        self.words.len() * usize::BITS as usize
    }

    /// Converts an object region into an inclusive bit range, verifying
    /// alignment and bounds. Misalignment is a distinct failure from
    /// contention: it reports `CapRange`, never `CapKot`.
    fn bit_range(&self, kaddr: usize, size: usize) -> Result<(usize, usize), Error> {
        if kaddr & (KOM_SLOT_SIZE - 1) != 0 || size & (KOM_SLOT_SIZE - 1) != 0 {
            return Err(Error::CapRange);
        }
        if size == 0 || kaddr < self.base {
            return Err(Error::CapRange);
        }
        let first = (kaddr - self.base) >> KOM_SLOT_ORDER;
        let last = first + (size >> KOM_SLOT_ORDER) - 1;
        if last >= self.pool_slots() {
            return Err(Error::CapRange);
        }
        Ok((first, last))
    }

    /// Marks `[kaddr, kaddr + size)` as occupied. Fails with `CapKot` if any
    /// granule in the range is already in use, leaving the table untouched.
    pub fn mark(&self, kaddr: usize, size: usize) -> Result<(), Error> {
        let (first, last) = self.bit_range(kaddr, size)?;
        bitmap::mark(self.words, first, last).map_err(|()| Error::CapKot)
    }

    /// Releases `[kaddr, kaddr + size)`. Fails with `CapKot` if the range is
    /// not entirely marked — the caller is trying to free something that was
    /// never allocated in this shape.
    pub fn erase(&self, kaddr: usize, size: usize) -> Result<(), Error> {
        let (first, last) = self.bit_range(kaddr, size)?;
        bitmap::erase(self.words, first, last).map_err(|()| Error::CapKot)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    /// A heap-backed kernel pool plus its object table, for tests across the
    /// kernel crate. Leaked so object references can be `'static`.
    pub(crate) struct TestPool {
        pub kot: Kot,
        pub base: usize,
        pub size: usize,
    }

    pub(crate) fn test_pool(size: usize) -> TestPool {
        let size = round_up(size);
        let mem: &'static mut [u8] =
            Box::leak(vec![0u8; size + KOM_SLOT_SIZE].into_boxed_slice());
        let base = round_up(mem.as_ptr() as usize);
        let words: &'static [AtomicUsize] = Box::leak(
            (0..Kot::words_for(size))
                .map(|_| AtomicUsize::new(0))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        );
        TestPool {
            kot: Kot::new(base, words),
            base,
            size,
        }
    }

    fn words_snapshot(k: &Kot) -> Vec<usize> {
        k.words.iter().map(|w| w.load(Ordering::Relaxed)).collect()
    }

    #[test]
    fn mark_then_erase_restores_bitmap() {
        let p = test_pool(64 * 1024);
        let before = words_snapshot(&p.kot);
        p.kot.mark(p.base + 256, 1024).unwrap();
        assert_ne!(words_snapshot(&p.kot), before);
        p.kot.erase(p.base + 256, 1024).unwrap();
        assert_eq!(words_snapshot(&p.kot), before);
    }

    #[test]
    fn overlapping_mark_fails_with_kot_conflict() {
        let p = test_pool(64 * 1024);
        p.kot.mark(p.base, 4096).unwrap();
        assert_eq!(p.kot.mark(p.base + 1024, 512), Err(Error::CapKot));
        // The loser's failed attempt must not have corrupted the winner.
        p.kot.erase(p.base, 4096).unwrap();
    }

    #[test]
    fn misalignment_is_not_a_conflict() {
        let p = test_pool(64 * 1024);
        assert_eq!(p.kot.mark(p.base + 3, 128), Err(Error::CapRange));
        assert_eq!(p.kot.mark(p.base, 96), Err(Error::CapRange));
        assert_eq!(p.kot.erase(p.base + 3, 128), Err(Error::CapRange));
    }

    #[test]
    fn erase_of_unmarked_range_fails() {
        let p = test_pool(64 * 1024);
        p.kot.mark(p.base, 4096).unwrap();
        assert_eq!(p.kot.erase(p.base, 8192), Err(Error::CapKot));
        assert_eq!(
            p.kot.erase(p.base + 8192, 4096),
            Err(Error::CapKot)
        );
    }

    #[test]
    fn out_of_pool_ranges_are_rejected() {
        let p = test_pool(64 * 1024);
        assert_eq!(
            p.kot.mark(p.base + p.size, KOM_SLOT_SIZE),
            Err(Error::CapRange)
        );
        assert_eq!(p.kot.mark(p.base - KOM_SLOT_SIZE, 64), Err(Error::CapRange));
    }
}
