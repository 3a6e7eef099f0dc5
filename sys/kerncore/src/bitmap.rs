// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Concurrent range occupancy over a bit array.
//!
//! This is the protocol behind the kernel-object table: `mark` transitions a
//! contiguous bit range from all-zero to all-one, `erase` transitions it
//! back. Both verify the *entire* prior state of the range, which is what
//! lets the kernel prove on free that the region being freed is exactly the
//! region that was allocated.
//!
//! Marking is lock-free against concurrent marks of disjoint ranges: each
//! word is claimed by compare-and-swap, and on any conflict every word
//! already claimed is rolled back before the failure is reported. Erasure
//! does not need CAS — the caller owns every bit in the range (they are all
//! set, and nobody else may erase them), so plain stores suffice for the
//! interior words and fetch-and for the shared boundary words.

use core::sync::atomic::{AtomicUsize, Ordering};

const WORD_BITS: usize = usize::BITS as usize;

/// Mask covering bit `n` and everything above it within a word.
#[inline(always)]
fn mask_from(n: usize) -> usize {
    !0 << n
}

/// Mask covering bit `n` and everything below it within a word.
#[inline(always)]
fn mask_to(n: usize) -> usize {
    !0 >> (WORD_BITS - 1 - n)
}

/// Atomically sets the inclusive bit range `[first, last]`, failing if any
/// bit in the range is already set.
///
/// On failure, all partial modifications have been undone and `Err` is
/// returned. Concurrent `mark` calls on disjoint ranges both succeed;
/// overlapping calls serialize such that exactly one wins.
///
/// # Panics
///
/// If `first > last` or `last` is out of range for `words`.
pub fn mark(words: &[AtomicUsize], first: usize, last: usize) -> Result<(), ()> {
    assert!(first <= last);
    assert!(last / WORD_BITS < words.len());

    let start = first / WORD_BITS;
    let start_mask = mask_from(first % WORD_BITS);
    let end = last / WORD_BITS;
    let end_mask = mask_to(last % WORD_BITS);

    if start == end {
        // Someone already populated something here?
        let mask = start_mask & end_mask;
        let old = words[start].load(Ordering::Relaxed);
        if old & mask != 0 {
            return Err(());
        }
        return words[start]
            .compare_exchange(old, old | mask, Ordering::AcqRel, Ordering::Relaxed)
            .map(drop)
            .map_err(drop);
    }

    // Claim the start word.
    let old = words[start].load(Ordering::Relaxed);
    if old & start_mask != 0 {
        return Err(());
    }
    if words[start]
        .compare_exchange(old, old | start_mask, Ordering::AcqRel, Ordering::Relaxed)
        .is_err()
    {
        return Err(());
    }

    // Claim the interior words, tracking how far we got for rollback.
    let mut claimed = start;
    let mut conflict = false;
    for i in start + 1..end {
        if words[i]
            .compare_exchange(0, !0, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            conflict = true;
            break;
        }
        claimed = i;
    }

    // Claim the end word.
    if !conflict {
        let old = words[end].load(Ordering::Relaxed);
        if old & end_mask != 0
            || words[end]
                .compare_exchange(old, old | end_mask, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
        {
            conflict = true;
        }
    }

    if conflict {
        // Unroll. The interior words are wholly ours, so plain stores are
        // fine; the start word may be shared with a neighboring range and
        // needs an atomic clear.
        for i in start + 1..=claimed {
            words[i].store(0, Ordering::Relaxed);
        }
        words[start].fetch_and(!start_mask, Ordering::Release);
        return Err(());
    }

    Ok(())
}

/// Atomically clears the inclusive bit range `[first, last]`, failing if any
/// bit in the range is not set.
///
/// On failure nothing has been modified.
///
/// # Panics
///
/// If `first > last` or `last` is out of range for `words`.
pub fn erase(words: &[AtomicUsize], first: usize, last: usize) -> Result<(), ()> {
    assert!(first <= last);
    assert!(last / WORD_BITS < words.len());

    let start = first / WORD_BITS;
    let start_mask = mask_from(first % WORD_BITS);
    let end = last / WORD_BITS;
    let end_mask = mask_to(last % WORD_BITS);

    if start == end {
        let mask = start_mask & end_mask;
        if words[start].load(Ordering::Acquire) & mask != mask {
            return Err(());
        }
        words[start].fetch_and(!mask, Ordering::Release);
        return Ok(());
    }

    // Verify the whole range is populated before touching anything.
    if words[start].load(Ordering::Acquire) & start_mask != start_mask {
        return Err(());
    }
    for i in start + 1..end {
        if words[i].load(Ordering::Acquire) != !0 {
            return Err(());
        }
    }
    if words[end].load(Ordering::Acquire) & end_mask != end_mask {
        return Err(());
    }

    // The boundary words may be shared with adjacent allocations; the
    // interior is exclusively ours.
    words[start].fetch_and(!start_mask, Ordering::Release);
    for i in start + 1..end {
        words[i].store(0, Ordering::Relaxed);
    }
    words[end].fetch_and(!end_mask, Ordering::Release);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(words: usize) -> Vec<AtomicUsize> {
        (0..words).map(|_| AtomicUsize::new(0)).collect()
    }

    fn snapshot(t: &[AtomicUsize]) -> Vec<usize> {
        t.iter().map(|w| w.load(Ordering::Relaxed)).collect()
    }

    #[test]
    fn mark_within_one_word() {
        let t = table(2);
        mark(&t, 3, 6).unwrap();
        assert_eq!(snapshot(&t), vec![0b1111000, 0]);
    }

    #[test]
    fn mark_spanning_words() {
        let t = table(4);
        mark(&t, WORD_BITS - 2, 3 * WORD_BITS + 1).unwrap();
        assert_eq!(
            snapshot(&t),
            vec![mask_from(WORD_BITS - 2), !0, !0, 0b11],
        );
    }

    #[test]
    fn mark_conflict_rolls_back() {
        let t = table(3);
        // Pre-occupy one bit near the end of the intended range.
        mark(&t, 2 * WORD_BITS + 4, 2 * WORD_BITS + 4).unwrap();
        let before = snapshot(&t);
        assert!(mark(&t, 1, 2 * WORD_BITS + 8).is_err());
        assert_eq!(snapshot(&t), before, "failed mark must leave no trace");
    }

    #[test]
    fn mark_conflict_in_interior_rolls_back() {
        let t = table(4);
        mark(&t, WORD_BITS + 7, WORD_BITS + 7).unwrap();
        let before = snapshot(&t);
        assert!(mark(&t, 3, 3 * WORD_BITS).is_err());
        assert_eq!(snapshot(&t), before);
    }

    #[test]
    fn adjacent_ranges_share_boundary_words() {
        let t = table(2);
        mark(&t, 0, 9).unwrap();
        mark(&t, 10, WORD_BITS + 3).unwrap();
        erase(&t, 0, 9).unwrap();
        // The neighbor must be intact.
        assert_eq!(snapshot(&t)[0], mask_from(10));
        erase(&t, 10, WORD_BITS + 3).unwrap();
        assert_eq!(snapshot(&t), vec![0, 0]);
    }

    #[test]
    fn erase_requires_exact_population() {
        let t = table(3);
        mark(&t, 4, 2 * WORD_BITS).unwrap();
        // A superset is not fully populated.
        assert!(erase(&t, 3, 2 * WORD_BITS).is_err());
        // A disjoint range is not populated at all.
        assert!(erase(&t, 2 * WORD_BITS + 1, 2 * WORD_BITS + 5).is_err());
        // Nothing was disturbed; the exact range still erases cleanly.
        erase(&t, 4, 2 * WORD_BITS).unwrap();
        assert_eq!(snapshot(&t), vec![0, 0, 0]);
    }

    #[test]
    fn erase_refuses_hole_in_interior() {
        let t = table(4);
        mark(&t, 0, 3 * WORD_BITS + 5).unwrap();
        // Punch a hole in an interior word.
        t[2].store(!0 & !(1 << 9), Ordering::Relaxed);
        assert!(erase(&t, 0, 3 * WORD_BITS + 5).is_err());
    }

    #[test]
    fn mark_erase_round_trip_restores_initial_state() {
        let t = table(3);
        for (first, last) in [(0, 0), (5, WORD_BITS), (1, 2 * WORD_BITS + 7)] {
            mark(&t, first, last).unwrap();
            erase(&t, first, last).unwrap();
            assert_eq!(snapshot(&t), vec![0, 0, 0]);
        }
    }
}
