// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for recording kernel death such that tooling can find it.
//!
//! A kernel invariant violation is not an error value -- nothing inside
//! the kernel recovers from it. [`die`] records as much of the reason as
//! fits into a fixed "epitaph" buffer (as UTF-8, truncated, NUL-padded)
//! and halts the machine. Debuggers read `KERNEL_HAS_FAILED` for triage
//! and the epitaph for the reason.
//!
//! On hosted builds `die` is a plain panic, so tests can assert on the
//! diagnostic text.

#[cfg(target_os = "none")]
use core::fmt::Write;
#[cfg(target_os = "none")]
use core::sync::atomic::Ordering;

/// Flag that gets set by all failure reporting functions, giving tools a
/// one-stop shop for doing kernel triage.
#[cfg(target_os = "none")]
#[used]
static mut KERNEL_HAS_FAILED: bool = false;

#[cfg(target_os = "none")]
const EPITAPH_LEN: usize = 128;

#[cfg(target_os = "none")]
#[used]
static mut KERNEL_EPITAPH: [u8; EPITAPH_LEN] = [0; EPITAPH_LEN];

#[cfg(target_os = "none")]
fn begin_epitaph() -> &'static mut [u8; EPITAPH_LEN] {
    // Safety: we only access this flag here, and never from a context
    // where concurrency or interrupts are enabled.
    let previous_fail = unsafe {
        core::ptr::replace(core::ptr::addr_of_mut!(KERNEL_HAS_FAILED), true)
    };
    if previous_fail {
        // Dying while dying suggests a recursive panic; don't make it
        // worse, just stop.
        loop {
            core::sync::atomic::fence(Ordering::SeqCst);
        }
    }

    // Safety: only one execution gets past the flag above, so the mutable
    // reference is unique.
    unsafe { &mut *core::ptr::addr_of_mut!(KERNEL_EPITAPH) }
}

/// Halts the kernel, leaving `msg` behind for whoever finds the body.
#[cfg(target_os = "none")]
pub fn die(msg: &str) -> ! {
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{msg}").ok();

    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

/// Hosted stand-in: surface the reason as a panic the test harness can
/// observe.
#[cfg(not(target_os = "none"))]
pub fn die(msg: &str) -> ! {
    panic!("{msg}");
}

#[cfg(target_os = "none")]
struct Eulogist {
    dest: &'static mut [u8],
}

#[cfg(target_os = "none")]
impl Write for Eulogist {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.dest.len());
        let (dest, leftovers) = {
            let taken = core::mem::take(&mut self.dest);
            taken.split_at_mut(n)
        };
        dest.copy_from_slice(&s[..n]);
        self.dest = leftovers;
        Ok(())
    }
}

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    // Route explicit panics (assertion failures and friends) through the
    // same epitaph machinery.
    let buf = begin_epitaph();
    let mut writer = Eulogist { dest: buf };
    write!(writer, "{info}").ok();

    loop {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}
