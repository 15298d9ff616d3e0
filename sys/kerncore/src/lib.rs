// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Allow std-y things to be used in test. Note that this attribute is a bit of
// a trap for the programmer, because rust-analyzer by default seems to build
// things with test set. This means it's easy to introduce code incompatible
// with no_std without your editor hassling you about it. Beware.
#![cfg_attr(not(test), no_std)]

//! Portable geometry checks behind the kernel's user-pointer sanitiser.
//!
//! Every syscall that touches user memory must first establish that the
//! claimed address range lies inside a region the calling task actually
//! owns: its RAM slot, its code/rodata slot, or one of its DMA
//! shared-memory windows. The range arithmetic is concentrated here, with
//! no kernel types in sight, so it can be exhaustively tested on the host.

/// Describes types that act as "slices" (in the very abstract sense)
/// referenced by tasks in syscalls.
///
/// This is not the same thing as a Rust slice in the kernel, because this
/// is just a base-length pair --- taken by itself, it doesn't let you
/// actually _access_ the memory.
///
/// # Invariants
///
/// `s.base_addr() <= s.end_addr()` must hold, and the range may not wrap
/// the end of the address space. Constructors of implementing types are
/// responsible for both.
pub trait UserSlice {
    /// Checks whether the slice spans zero bytes.
    ///
    /// Zero-byte slices confer no authority and are rejected by every
    /// check in this crate; callers that want "empty means skip the
    /// check" semantics must branch before calling in.
    fn is_empty(&self) -> bool;

    /// The address of the first byte included in this slice.
    fn base_addr(&self) -> usize;

    /// The address of the first byte _not_ included in this slice, past
    /// the end.
    fn end_addr(&self) -> usize;
}

impl<T: UserSlice> UserSlice for &T {
    #[inline(always)]
    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Describes types that delimit a contiguous span of owned address space:
/// a task's RAM slot, its text slot, or a DMA shared-memory window.
///
/// # Invariants
///
/// `w.base_addr() <= w.end_addr()` must hold and the span may not wrap.
pub trait MemoryWindow {
    fn base_addr(&self) -> usize;
    fn end_addr(&self) -> usize;

    /// Checks whether `addr` falls inside the window.
    fn contains(&self, addr: usize) -> bool {
        self.base_addr() <= addr && addr < self.end_addr()
    }
}

impl<T: MemoryWindow> MemoryWindow for &T {
    #[inline(always)]
    fn base_addr(&self) -> usize {
        (**self).base_addr()
    }

    #[inline(always)]
    fn end_addr(&self) -> usize {
        (**self).end_addr()
    }
}

/// Checks whether `slice` lies entirely within `window`.
///
/// Unlike a multi-region MPU map, the regions checked by this kernel are
/// single contiguous spans, so there is no gap-spanning subtlety: the
/// slice is admitted iff its first byte is at or after the window base and
/// its end does not pass the window end.
///
/// Zero-byte slices are rejected: a data pointer with no length proves
/// nothing about ownership.
pub fn fits_within<S, W>(slice: S, window: W) -> bool
where
    S: UserSlice,
    W: MemoryWindow,
{
    if slice.is_empty() {
        return false;
    }
    window.base_addr() <= slice.base_addr()
        && slice.end_addr() <= window.end_addr()
}

/// Checks whether `slice` lies entirely within any single window of
/// `windows` that also satisfies `window_ok`.
///
/// This is the shape of the DMA shared-memory check: the declared windows
/// are disjoint and a transfer may not straddle two of them, so coverage
/// means one window contains the whole slice and grants the requested
/// access (expressed by the predicate).
pub fn covered_by_any<S, W>(
    slice: S,
    windows: &[W],
    window_ok: impl Fn(&W) -> bool,
) -> bool
where
    S: UserSlice + Copy,
    W: MemoryWindow,
{
    windows
        .iter()
        .any(|w| window_ok(w) && fits_within(slice, w))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone)]
    struct TestSlice {
        base: usize,
        size: usize,
    }

    impl UserSlice for TestSlice {
        fn is_empty(&self) -> bool {
            self.size == 0
        }

        fn base_addr(&self) -> usize {
            self.base
        }

        fn end_addr(&self) -> usize {
            self.base + self.size
        }
    }

    struct TestWindow {
        base: usize,
        size: usize,
        writable: bool,
    }

    impl MemoryWindow for TestWindow {
        fn base_addr(&self) -> usize {
            self.base
        }

        fn end_addr(&self) -> usize {
            self.base + self.size
        }
    }

    const RAM: TestWindow = TestWindow {
        base: 0x2000_0000,
        size: 0x1000,
        writable: true,
    };

    #[test]
    fn admits_interior_range() {
        let s = TestSlice {
            base: RAM.base + 0x10,
            size: 0x100,
        };
        assert!(fits_within(s, &RAM));
    }

    #[test]
    fn admits_exact_extent() {
        let s = TestSlice {
            base: RAM.base,
            size: RAM.size,
        };
        assert!(fits_within(s, &RAM));
    }

    #[test]
    fn rejects_empty_slice() {
        let s = TestSlice {
            base: RAM.base + 0x10,
            size: 0,
        };
        assert!(!fits_within(s, &RAM));
    }

    #[test]
    fn rejects_range_starting_below() {
        let s = TestSlice {
            base: RAM.base - 1,
            size: 8,
        };
        assert!(!fits_within(s, &RAM));
    }

    #[test]
    fn rejects_range_running_past_end() {
        // Starts on the last byte, claims two.
        let s = TestSlice {
            base: RAM.base + RAM.size - 1,
            size: 2,
        };
        assert!(!fits_within(s, &RAM));
    }

    #[test]
    fn rejects_one_past_end_start() {
        let s = TestSlice {
            base: RAM.base + RAM.size,
            size: 1,
        };
        assert!(!fits_within(s, &RAM));
    }

    #[test]
    fn window_list_selection() {
        let windows = [
            TestWindow {
                base: 0x1000,
                size: 0x100,
                writable: false,
            },
            TestWindow {
                base: 0x3000,
                size: 0x100,
                writable: true,
            },
        ];

        let in_first = TestSlice {
            base: 0x1010,
            size: 0x20,
        };
        let in_second = TestSlice {
            base: 0x3010,
            size: 0x20,
        };
        let in_gap = TestSlice {
            base: 0x2000,
            size: 0x20,
        };

        assert!(covered_by_any(in_first, &windows, |_| true));
        // Write access is only granted by the second window.
        assert!(!covered_by_any(in_first, &windows, |w| w.writable));
        assert!(covered_by_any(in_second, &windows, |w| w.writable));
        assert!(!covered_by_any(in_gap, &windows, |_| true));
    }

    #[test]
    fn no_straddling_adjacent_windows() {
        let windows = [
            TestWindow {
                base: 0x1000,
                size: 0x100,
                writable: true,
            },
            TestWindow {
                base: 0x1100,
                size: 0x100,
                writable: true,
            },
        ];

        // Contiguous in the address space, but a transfer may not span two
        // declared windows.
        let straddle = TestSlice {
            base: 0x10f0,
            size: 0x20,
        };
        assert!(!covered_by_any(straddle, &windows, |_| true));
    }
}
