// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The permission oracle: pure predicates over the image's static
//! permission tables.
//!
//! Nothing in here has side effects or consults mutable state; every
//! decision is a table lookup or a bitfield extraction. That keeps the
//! security-relevant logic auditable in one screenful and trivially
//! testable.

use abi::{Resource, TaskId};

use crate::app::Image;

/// Tests whether `from` is allowed to send an IPC to `to`.
///
/// The matrix is a half-duplex declaration: when a task is allowed to send
/// to another, the other is implicitly allowed to receive from it, but not
/// to answer. The wildcard is *not* a valid argument here; wildcard
/// receive resolves the concrete sender first and asks about that.
pub fn ipc_granted(image: &Image, from: TaskId, to: TaskId) -> bool {
    image.ipc_perm[from.index()][to.index()]
}

/// Tests whether `from` is allowed to declare a DMA shared-memory window
/// hosted for `to`.
///
/// Like IPC, this is declared one way around: the granting task holds the
/// right to declare, and the target's right to host is implied. The
/// channel itself stays half duplex -- the window is read-only or
/// read-write for the DMA controller, and is never mapped into the target
/// task's memory slot.
pub fn dmashm_granted(image: &Image, from: TaskId, to: TaskId) -> bool {
    image.dmashm_perm[from.index()][to.index()]
}

/// Tests whether `task`'s resource register grants `res`.
///
/// Each named resource is a (mask, expected value) pair over the 32-bit
/// register. Most are single bits; the crypto levels share a two-bit
/// field with three exclusive non-zero values, and the cycle-counter
/// permission requires both tick-permission bits at once.
pub fn resource_granted(image: &Image, res: Resource, task: TaskId) -> bool {
    let reg = image.resource_regs[task.index()];

    let (mask, expected): (u32, u32) = match res {
        // Device classes.
        Resource::DevDma => (1 << 31, 1 << 31),
        Resource::DevCryptoUsr => (3 << 29, 1 << 29),
        Resource::DevCryptoCfg => (3 << 29, 2 << 29),
        Resource::DevCryptoFull => (3 << 29, 3 << 29),
        Resource::DevBuses => (1 << 28, 1 << 28),
        Resource::DevExti => (1 << 27, 1 << 27),
        Resource::DevTim => (1 << 26, 1 << 26),
        // Time services. The cycle counter requires both tick bits.
        Resource::TimGetmilli => (1 << 22, 1 << 22),
        Resource::TimGetmicro => (1 << 23, 1 << 23),
        Resource::TimGetcycle => (3 << 22, 3 << 22),
        // Task services.
        Resource::TskFisr => (1 << 15, 1 << 15),
        Resource::TskFipc => (1 << 14, 1 << 14),
        Resource::TskReset => (1 << 13, 1 << 13),
        Resource::TskUpgrade => (1 << 12, 1 << 12),
        Resource::TskRng => (1 << 11, 1 << 11),
        // Memory services.
        Resource::MemDynamicMap => (1 << 7, 1 << 7),
    };

    reg & mask == expected
}

/// Tests whether two tasks live in the same security domain. The wildcard
/// is transparent: it stands for "whichever peer shows up", and the
/// concrete peer is re-checked once known.
#[cfg(feature = "domains")]
pub fn same_domain(
    tasks: &[crate::task::Task; abi::NUM_TASKS],
    a: TaskId,
    b: TaskId,
) -> bool {
    if a.is_any_app() || b.is_any_app() {
        return true;
    }
    tasks[a.index()].domain() == tasks[b.index()].domain()
}
