// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pure, host-testable algorithms at the core of the kernel.
//!
//! Nothing in here touches kernel objects, capabilities, or hardware
//! registers; these are the raw protocols (occupancy bitmaps, MPU region
//! encoding) that the kernel proper wraps with addressing and authority
//! checks. Keeping them free of kernel types lets us unit test the tricky
//! parts exhaustively on the host.

// Allow std-y things to be used in test. Note that this attribute is a bit of
// a trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

pub mod bitmap;
pub mod pmsav7;
