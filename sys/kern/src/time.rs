// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The global kernel timestamp.
//!
//! A single monotonic counter, advanced by the port's tick driver, shared by
//! all CPUs. It is the time base for scheduler slices and for capability
//! quiescence; it has no absolute meaning.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::config::QUIE_TICKS;

static TIMESTAMP: AtomicUsize = AtomicUsize::new(0);

/// Reads the current timestamp.
pub fn now() -> usize {
    TIMESTAMP.load(Ordering::Relaxed)
}

/// Advances the timestamp, returning the value *before* the increment. The
/// port tick driver calls this once per tick, before entering the tick
/// handler proper.
pub fn advance(by: usize) -> usize {
    TIMESTAMP.fetch_add(by, Ordering::Relaxed)
}

/// Checks whether at least one quiescence period has elapsed since `stamp`.
///
/// Wrapping subtraction keeps this correct across counter wrap, as long as
/// nothing stays frozen for half the counter range, which at one tick per
/// millisecond is a comfortably long time.
pub fn quiescent(stamp: usize) -> bool {
    now().wrapping_sub(stamp) >= QUIE_TICKS
}
