// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervisor core of a statically-configured microkernel.
//!
//! This is the application-independent portion of the operating system:
//! everything that runs on a supervisor entry. Trap routing, the per-task
//! per-mode state machine, mailbox IPC, the permission model, and
//! device/DMA registration live here; scheduling policy, drivers, and
//! board bring-up live outside and are consumed through the `arch`
//! module's narrow surface.
//!
//! # Design principles
//!
//! While this isn't a *deeply* principled kernel, there are some basic
//! ideas that appear consistently.
//!
//! 1. Static configuration. The system takes a single shape baked in at
//!    image generation time: the task set, their memory slots, their
//!    permissions, and the device catalogue never change at runtime.
//! 2. Validate at the boundary. User-supplied pointers, sizes, ids, and
//!    descriptors are checked where they enter; past that point the types
//!    carry the proof.
//! 3. A strong preference for safe code where reasonable; the `unsafe`
//!    that remains sits in `umem` and the arch layer, behind checked
//!    constructors.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms. Everything here is a linear scan over a small fixed
//!    table.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

pub mod app;
pub mod device;
pub mod dma;
pub mod err;
pub mod fail;
pub mod ipc;
pub mod perm;
pub mod sleep;
pub mod softirq;
pub mod startup;
pub mod state;
pub mod svc;
pub mod syscalls;
pub mod task;
pub mod time;
pub mod umem;

#[cfg(test)]
mod testutil;
