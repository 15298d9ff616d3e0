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
//! Thus, all architecture-specific types and functions show up right here
//! in the `arch` module, magically tailored for the current target.
//!
//! For this to work, each architecture support module must define the
//! same set of names: the `SavedState` register file, the trap/driver
//! hooks the portable kernel consumes (clocks, entropy, debug sink, GPIO,
//! EXTI, NVIC, DMA), and the `klog!`/`uassert!` macros.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        #[macro_use]
        pub mod arm_m;
        pub use arm_m::*;
    } else {
        // Anything that isn't the real target is treated as the hosted
        // simulation, which is what the test suite runs on.
        #[macro_use]
        pub mod fake;
        pub use fake::*;
    }
}
