// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-specific support.
//!
//! In practice, this works by
//!
//! - Conditionally defining a nested module (below).
//! - `pub use`-ing its contents
//!
//! Thus, all architecture-specific types and functions show up right here in
//! the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the same
//! set of names: register save/restore and syscall/invocation return-value
//! placement, page-table activation, kernel-function dispatch, and the
//! console. Ports that exist:
//!
//! - `arm_m`: ARMv7-M-class parts with a PMSAv7 MPU. The only real port.
//! - `fake`: a pure-software stand-in used for host-side testing of the
//!   architecture-independent kernel.

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "arm", target_os = "none"))] {
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        pub mod fake;
        pub use fake::*;
    }
}
