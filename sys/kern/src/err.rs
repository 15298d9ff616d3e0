// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Syscall handlers spend most of their lines on validation; this module
//! keeps the outcome of a failed check out of their way. A handler returns
//! `Result<NextTask, SysError>`, and a single wrapper in the dispatcher
//! turns the `Err` arm into the caller's `r0` value. No failure propagates
//! any further into kernel control flow than that.

use abi::SyscallReturn;

/// A recoverable, caller-local syscall failure.
///
/// These map one-to-one onto the non-`Done` wire codes. Anything that is
/// *not* expressible as one of these -- a violated kernel invariant -- is
/// not an error value, it is a `fail::die`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SysError {
    /// Argument shape wrong: bad pointer, bad size, bad descriptor index,
    /// unknown sub-operation, self-IPC, GPIO not owned.
    Inval,
    /// Permission refused, or the call is not legal in the current phase
    /// (ISR mode, before/after init-done).
    Denied,
    /// Would block, a bounded resource is exhausted, or the entropy
    /// source declined.
    Busy,
}

impl From<SysError> for SyscallReturn {
    fn from(e: SysError) -> Self {
        match e {
            SysError::Inval => SyscallReturn::Inval,
            SysError::Denied => SyscallReturn::Denied,
            SysError::Busy => SyscallReturn::Busy,
        }
    }
}
