// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handler-mode syscall implementations.
//!
//! # Syscall implementations
//!
//! With only a couple of exceptions, syscalls are implemented by functions
//! with the signature:
//!
//! ```ignore
//! fn syscall(k: &mut KernelState, caller: usize, mode: TaskMode)
//!     -> Result<NextTask, SysError>;
//! ```
//!
//! `caller` is the index of the trapping task in the task table and `mode`
//! is the context it trapped from. On success a handler has already
//! written the caller's return value and final state, and hands back a
//! scheduling hint. On failure it returns the `SysError` naming the wire
//! code; a common wrapper in [`dispatch`] writes that code into the
//! caller's saved `r0` and leaves the task runnable. Failures never
//! propagate further than that.
//!
//! Arguments are read from the caller's saved registers through the
//! argument-proxy types on [`ArchState`], which give names and types to
//! the raw words. See `task::ArchState` for details.
//!
//! The same dispatcher runs in two settings: inline in handler mode for
//! the synchronous whitelist, and from the soft-IRQ task for everything
//! that was deferred. Handlers cannot tell the difference, which is the
//! point.

use abi::{
    CfgOp, InitOp, IpcOp, Resource, SyscallReturn, Sysnum, TaskId, TaskMode,
    TaskState, TickPrecision, MAX_LOG_MSG, MAX_RANDOM_BYTES, TASK_NAME_LEN,
};

use crate::device;
use crate::dma;
use crate::err::SysError;
use crate::ipc;
use crate::perm;
use crate::sleep;
use crate::state::KernelState;
use crate::task::{ArchState, NextTask, Task};
use crate::umem::USlice;

/// Common epilogue: write the return code for the invoking mode and, for
/// main-thread calls, bring the caller back to `Runnable` if it was only
/// parked for the syscall. ISR-mode returns never touch main-thread
/// state.
pub(crate) fn finish(task: &mut Task, mode: TaskMode, rc: SyscallReturn) {
    task.save_mut(mode).set_return(rc);
    if mode == TaskMode::Main {
        task.set_runnable_if_blocked();
    }
}

/// Executes the syscall `caller` trapped with, from its saved registers.
///
/// `caller` is a valid task index (i.e. not directly from user code).
pub fn dispatch(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> NextTask {
    let nr = k.tasks[caller].save(mode).syscall_number();
    let res = match Sysnum::try_from(nr) {
        Ok(Sysnum::Yield) => sys_yield(k, caller, mode),
        Ok(Sysnum::Sleep) => sys_sleep(k, caller, mode),
        Ok(Sysnum::Reset) => sys_reset(k, caller, mode),
        Ok(Sysnum::Gettick) => sys_gettick(k, caller, mode),
        Ok(Sysnum::Lock) => sys_lock(k, caller, mode),
        Ok(Sysnum::Init) => sys_init(k, caller, mode),
        Ok(Sysnum::Ipc) => sys_ipc(k, caller, mode),
        Ok(Sysnum::Cfg) => sys_cfg(k, caller, mode),
        Ok(Sysnum::Log) => sys_log(k, caller, mode),
        Ok(Sysnum::GetRandom) => sys_get_random(k, caller, mode),
        // Bogus dispatch number; same class as an unknown sub-op.
        Err(_) => Err(SysError::Inval),
    };
    match res {
        Ok(hint) => hint,
        Err(e) => {
            finish(&mut k.tasks[caller], mode, e.into());
            NextTask::Same
        }
    }
}

/// `YIELD`: park the calling thread until something wakes it. From ISR
/// context this is a no-op; the handler runs to completion regardless.
fn sys_yield(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let t = &mut k.tasks[caller];
    t.save_mut(mode).set_return(SyscallReturn::Done);
    if mode == TaskMode::Main {
        t.set_state(TaskMode::Main, TaskState::Idle);
        Ok(NextTask::Other)
    } else {
        Ok(NextTask::Same)
    }
}

/// `SLEEP`: install the caller in the sleep registry and park it. ISRs
/// can't sleep.
fn sys_sleep(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    if mode == TaskMode::Isr {
        return Err(SysError::Denied);
    }
    let args = k.tasks[caller].save(mode).as_sleep_args();
    let ms = args.millis();
    let sleep_mode = args.mode()?;

    k.tasks[caller]
        .save_mut(mode)
        .set_return(SyscallReturn::Done);
    sleep::sleeping(k, caller, ms, sleep_mode);
    // The caller is no longer executable; somebody else runs.
    Ok(NextTask::Other)
}

/// `RESET`: unconditional system reset, for tasks holding the right.
fn sys_reset(
    k: &mut KernelState,
    caller: usize,
    _mode: TaskMode,
) -> Result<NextTask, SysError> {
    let caller_id = k.tasks[caller].id();
    if !perm::resource_granted(k.image, Resource::TskReset, caller_id) {
        return Err(SysError::Denied);
    }
    crate::arch::reset()
}

/// `GETTICK`: write a 64-bit counter at the requested precision, each
/// gated by its own permission.
fn sys_gettick(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let caller_id = k.tasks[caller].id();
    let args = k.tasks[caller].save(mode).as_gettick_args();
    let out = args.out()?;
    let mut out_w = out.clone();
    if !k.tasks[caller].can_access_ram(&out) {
        return Err(SysError::Inval);
    }
    let precision = args.precision()?;

    let value = match precision {
        TickPrecision::Milli => {
            if !perm::resource_granted(
                k.image,
                Resource::TimGetmilli,
                caller_id,
            ) {
                return Err(SysError::Denied);
            }
            u64::from(crate::arch::now())
        }
        TickPrecision::Micro => {
            if !perm::resource_granted(
                k.image,
                Resource::TimGetmicro,
                caller_id,
            ) {
                return Err(SysError::Denied);
            }
            crate::arch::now_micros()
        }
        TickPrecision::Cycle => {
            if !perm::resource_granted(
                k.image,
                Resource::TimGetcycle,
                caller_id,
            ) {
                return Err(SysError::Denied);
            }
            crate::arch::now_cycles()
        }
    };

    let slot = k.tasks[caller].try_write(&mut out_w)?;
    slot[0] = value;

    finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Same)
}

/// `LOCK`: enter or leave the ISR-postponing lock. The lock does not
/// deschedule the caller; it has to keep running to reach the exit.
fn sys_lock(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    if mode == TaskMode::Isr {
        return Err(SysError::Denied);
    }
    let op = k.tasks[caller].save(mode).as_lock_args().op()?;

    let t = &mut k.tasks[caller];
    t.save_mut(mode).set_return(SyscallReturn::Done);
    match op {
        abi::LockOp::Enter => {
            t.set_state(TaskMode::Main, TaskState::Locked);
        }
        abi::LockOp::Exit => {
            t.set_state(TaskMode::Main, TaskState::Runnable);
            // Dispatches postponed by the lock are still queued; give the
            // service task a reason to run.
            if !k.softirq.is_empty() {
                k.tasks[TaskId::SOFTIRQ.index()].set_runnable_if_blocked();
            }
        }
    }
    Ok(NextTask::Same)
}

/// Shared body of `LOG` and `IPC LOG`: emit `[task-name] message` to the
/// debug sink.
fn log_impl(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
    len: usize,
    msg: Result<USlice<u8>, SysError>,
) -> Result<NextTask, SysError> {
    if len >= MAX_LOG_MSG {
        return Err(SysError::Inval);
    }
    if len == 0 {
        klog!("[{}]", k.tasks[caller].name());
    } else {
        let msg = msg?;
        let t = &k.tasks[caller];
        let bytes = t.try_read_ram(&msg)?;
        if bytes.iter().all(|&c| c < 0x80) {
            klog!("[{}] {}", t.name(), unsafe {
                // Safety: just checked that every byte is ASCII.
                core::str::from_utf8_unchecked(bytes)
            });
        } else {
            klog!("[{}] (message unprintable)", t.name());
        }
    }
    crate::arch::debug_flush();

    finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Same)
}

/// `LOG`: debug output, register-based variant.
fn sys_log(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let args = k.tasks[caller].save(mode).as_log_args();
    let len = args.len();
    let msg = args.message();
    log_impl(k, caller, mode, len, msg)
}

/// `GET_RANDOM`: fill a small caller buffer from the entropy source.
fn sys_get_random(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    if !k.tasks[caller].init_done() {
        return Err(SysError::Denied);
    }
    let caller_id = k.tasks[caller].id();
    let args = k.tasks[caller].save(mode).as_random_args();
    let len = args.len();
    let buf = args.buffer()?;
    if !k.tasks[caller].can_access_ram(&buf) {
        return Err(SysError::Inval);
    }
    if len > MAX_RANDOM_BYTES {
        return Err(SysError::Inval);
    }
    if !perm::resource_granted(k.image, Resource::TskRng, caller_id) {
        return Err(SysError::Denied);
    }

    let mut bytes = [0u8; MAX_RANDOM_BYTES];
    if !crate::arch::fill_random(&mut bytes[..len]) {
        return Err(SysError::Busy);
    }
    let mut buf_w = buf;
    let out = k.tasks[caller].try_write(&mut buf_w)?;
    out.copy_from_slice(&bytes[..len]);

    finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Same)
}

/// `INIT` family dispatcher. The whole family is fenced off once
/// initialization completes.
fn sys_init(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    if k.tasks[caller].init_done() {
        return Err(SysError::Denied);
    }
    let op = InitOp::try_from(k.tasks[caller].save(mode).sub_op())
        .map_err(|_| SysError::Inval)?;
    match op {
        InitOp::GetTaskId => init_get_taskid(k, caller, mode),
        InitOp::DevAccess => device::init_devaccess(k, caller, mode),
        InitOp::Dma => dma::init_dma(k, caller, mode),
        InitOp::DmaShm => dma::init_dma_shm(k, caller, mode),
        InitOp::Done => init_done(k, caller, mode),
    }
}

/// `INIT GETTASKID`: resolve a peer's name to its id, for peers the
/// caller could actually talk to.
fn init_get_taskid(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let caller_id = k.tasks[caller].id();
    let args = k.tasks[caller].save(mode).as_init_args();
    let name_win = args.name_window()?;
    let out_id = args.out_id()?;
    let mut out_w = out_id.clone();
    if !k.tasks[caller].can_access_ram(&out_id) {
        return Err(SysError::Inval);
    }

    // The name is read as a whole fixed-size window; the string is
    // whatever precedes the first NUL. This keeps a name right at the
    // end of a slot from leaking the neighbours.
    let mut name_buf = [0u8; TASK_NAME_LEN];
    name_buf.copy_from_slice(k.tasks[caller].try_read(&name_win)?);
    let len = name_buf
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(TASK_NAME_LEN);
    let name = &name_buf[..len];

    for peer in TaskId::all_apps() {
        let t = &k.tasks[peer.index()];
        if t.state(TaskMode::Main) == TaskState::Empty {
            continue;
        }
        if !t.name().as_bytes().eq_ignore_ascii_case(name) {
            continue;
        }

        #[cfg(feature = "domains")]
        if !perm::same_domain(&k.tasks, caller_id, peer) {
            return Err(SysError::Inval);
        }

        // Either direction of IPC justifies knowing the id; so does a
        // DMA-SHM grant, where only the declaring side needs it.
        if perm::ipc_granted(k.image, caller_id, peer)
            || perm::ipc_granted(k.image, peer, caller_id)
            || perm::dmashm_granted(k.image, caller_id, peer)
        {
            let out = k.tasks[caller].try_write(&mut out_w)?;
            out[0] = u32::from(peer.0);
            finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
            return Ok(NextTask::Same);
        }
    }
    Err(SysError::Inval)
}

/// `INIT DONE`: flip the caller into nominal operation -- enable its
/// auto-mapped devices and DMA interrupts, lock the `INIT` family, and
/// reschedule so the mappings take effect at its next election.
fn init_done(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    device::enable_all(k, caller);
    dma::enable_all(k, caller);
    k.tasks[caller].set_init_done();

    finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Other)
}

/// `CFG` family dispatcher.
fn sys_cfg(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let op = CfgOp::try_from(k.tasks[caller].save(mode).sub_op())
        .map_err(|_| SysError::Inval)?;
    match op {
        CfgOp::GpioGet => device::cfg_gpio_get(k, caller, mode),
        CfgOp::GpioSet => device::cfg_gpio_set(k, caller, mode),
        CfgOp::GpioUnlockExti => {
            device::cfg_gpio_unlock_exti(k, caller, mode)
        }
        CfgOp::DmaReconf => dma::cfg_dma_reconf(k, caller, mode),
        CfgOp::DmaReload => dma::cfg_dma_reload(k, caller, mode),
        CfgOp::DmaDisable => dma::cfg_dma_disable(k, caller, mode),
        CfgOp::DevMap => device::cfg_dev_map(k, caller, mode),
        CfgOp::DevUnmap => device::cfg_dev_unmap(k, caller, mode),
    }
}

/// `IPC` family dispatcher.
fn sys_ipc(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let op = IpcOp::try_from(k.tasks[caller].save(mode).sub_op())
        .map_err(|_| SysError::Inval)?;
    match op {
        IpcOp::Log => {
            let args = k.tasks[caller].save(mode).as_ipc_args();
            let len = args.log_len();
            let msg = args.log_message();
            log_impl(k, caller, mode, len, msg)
        }
        IpcOp::RecvSync => ipc::recv(k, caller, true, mode),
        IpcOp::SendSync => ipc::send(k, caller, true, mode),
        IpcOp::RecvAsync => ipc::recv(k, caller, false, mode),
        IpcOp::SendAsync => ipc::send(k, caller, false, mode),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::KernelState;
    use crate::testutil::{
        do_init_done, isr_syscall, kernel, r0, syscall, ImageSpec, UserMem,
    };
    use abi::{LockOp, SleepMode, SyscallReturn};

    const DONE: usize = 0;
    const INVAL: usize = 1;
    const DENIED: usize = 2;
    const BUSY: usize = 3;

    const YIELD: usize = Sysnum::Yield as usize;
    const SLEEP: usize = Sysnum::Sleep as usize;
    const RESET: usize = Sysnum::Reset as usize;
    const GETTICK: usize = Sysnum::Gettick as usize;
    const LOCK: usize = Sysnum::Lock as usize;
    const INIT: usize = Sysnum::Init as usize;
    const IPC_NUM: usize = Sysnum::Ipc as usize;
    const LOG: usize = Sysnum::Log as usize;
    const GET_RANDOM: usize = Sysnum::GetRandom as usize;

    fn main_state(k: &KernelState, i: usize) -> TaskState {
        k.tasks[i].state(TaskMode::Main)
    }

    #[test]
    fn gettick_denied_without_permission() {
        let mut k = kernel(ImageSpec::default());
        let mut m = UserMem::of(&k, TaskId(1));
        let out = m.alloc_u64(0xdead_beef);

        let rc = syscall(&mut k, TaskId(1), &[GETTICK, out, 0]);
        assert_eq!(rc, DENIED);
        // Output untouched, caller runnable again.
        assert_eq!(m.read_u64(out), 0xdead_beef);
        assert_eq!(main_state(&k, 1), TaskState::Runnable);
    }

    #[test]
    fn gettick_precisions_and_permissions() {
        let mut k = kernel(ImageSpec {
            resource_regs: vec![
                (TaskId(1), 3 << 22), // milli + micro, which implies cycle
                (TaskId(2), 1 << 23), // micro only
            ],
            ..Default::default()
        });
        crate::arch::set_now_millis(1234);
        crate::arch::set_now_micros(1_234_567);
        crate::arch::set_now_cycles(99_000_000);

        let mut m = UserMem::of(&k, TaskId(1));
        let out = m.alloc_u64(0);
        assert_eq!(syscall(&mut k, TaskId(1), &[GETTICK, out, 0]), DONE);
        assert_eq!(m.read_u64(out), 1234);
        assert_eq!(syscall(&mut k, TaskId(1), &[GETTICK, out, 1]), DONE);
        assert_eq!(m.read_u64(out), 1_234_567);
        assert_eq!(syscall(&mut k, TaskId(1), &[GETTICK, out, 2]), DONE);
        assert_eq!(m.read_u64(out), 99_000_000);

        // Micro-only does not unlock the cycle counter.
        let mut m2 = UserMem::of(&k, TaskId(2));
        let out2 = m2.alloc_u64(0);
        assert_eq!(syscall(&mut k, TaskId(2), &[GETTICK, out2, 1]), DONE);
        assert_eq!(syscall(&mut k, TaskId(2), &[GETTICK, out2, 2]), DENIED);
        // Unknown precision.
        assert_eq!(syscall(&mut k, TaskId(2), &[GETTICK, out2, 3]), INVAL);
    }

    #[test]
    fn gettick_pointer_must_be_own_ram() {
        let mut k = kernel(ImageSpec {
            resource_regs: vec![(TaskId(1), 1 << 22)],
            ..Default::default()
        });
        let mut m2 = UserMem::of(&k, TaskId(2));
        let foreign = m2.alloc_u64(0);
        assert_eq!(syscall(&mut k, TaskId(1), &[GETTICK, foreign, 0]), INVAL);
        // Misaligned for a u64.
        let mut m1 = UserMem::of(&k, TaskId(1));
        let odd = m1.alloc(16, 8) + 4;
        assert_eq!(syscall(&mut k, TaskId(1), &[GETTICK, odd, 0]), INVAL);
    }

    #[cfg(feature = "wise-repartition")]
    #[test]
    fn gettick_from_isr_leaves_main_state_alone() {
        let mut k = kernel(ImageSpec {
            resource_regs: vec![(TaskId(1), 1 << 22)],
            ..Default::default()
        });
        let mut m = UserMem::of(&k, TaskId(1));
        let out = m.alloc_u64(0);
        k.tasks[1].set_state(TaskMode::Main, TaskState::Idle);

        let rc = isr_syscall(&mut k, TaskId(1), &[GETTICK, out, 0]);
        assert_eq!(rc, DONE);
        // The redesigned epilogue: ISR-mode returns never touch the main
        // thread.
        assert_eq!(main_state(&k, 1), TaskState::Idle);
    }

    #[test]
    fn lock_round_trip_and_idempotence() {
        let mut k = kernel(ImageSpec::default());
        let enter = LockOp::Enter as usize;
        let exit = LockOp::Exit as usize;

        assert_eq!(main_state(&k, 1), TaskState::Runnable);
        assert_eq!(syscall(&mut k, TaskId(1), &[LOCK, enter]), DONE);
        assert_eq!(main_state(&k, 1), TaskState::Locked);

        // Entering twice still succeeds and stays locked.
        assert_eq!(syscall(&mut k, TaskId(1), &[LOCK, enter]), DONE);
        assert_eq!(main_state(&k, 1), TaskState::Locked);

        assert_eq!(syscall(&mut k, TaskId(1), &[LOCK, exit]), DONE);
        assert_eq!(main_state(&k, 1), TaskState::Runnable);

        assert_eq!(syscall(&mut k, TaskId(1), &[LOCK, 2]), INVAL);
        assert_eq!(
            isr_syscall(&mut k, TaskId(1), &[LOCK, enter]),
            DENIED
        );
    }

    #[test]
    fn sleep_parks_until_timer() {
        let mut k = kernel(ImageSpec::default());
        crate::arch::set_now_millis(100);
        let rc = syscall(
            &mut k,
            TaskId(1),
            &[SLEEP, 50, SleepMode::Shallow as usize],
        );
        assert_eq!(rc, DONE);
        assert_eq!(main_state(&k, 1), TaskState::Sleeping);

        let _ = crate::sleep::process_timers(&mut k, 150u64.into());
        assert_eq!(main_state(&k, 1), TaskState::Runnable);

        // Deep variant, and the ISR prohibition.
        assert_eq!(
            syscall(&mut k, TaskId(1), &[SLEEP, 50, SleepMode::Deep as usize]),
            DONE
        );
        assert_eq!(main_state(&k, 1), TaskState::DeepSleeping);
        let _ = crate::sleep::process_timers(&mut k, 300u64.into());
        assert_eq!(
            isr_syscall(&mut k, TaskId(1), &[SLEEP, 50, 0]),
            DENIED
        );
        assert_eq!(syscall(&mut k, TaskId(1), &[SLEEP, 50, 2]), INVAL);
    }

    #[test]
    fn yield_goes_idle() {
        let mut k = kernel(ImageSpec::default());
        assert_eq!(syscall(&mut k, TaskId(1), &[YIELD]), DONE);
        assert_eq!(main_state(&k, 1), TaskState::Idle);
    }

    #[test]
    fn reset_requires_permission() {
        let mut k = kernel(ImageSpec::default());
        assert_eq!(syscall(&mut k, TaskId(1), &[RESET]), DENIED);
        assert_eq!(main_state(&k, 1), TaskState::Runnable);
    }

    #[test]
    #[should_panic(expected = "SYSTEM RESET")]
    fn reset_with_permission_resets() {
        let mut k = kernel(ImageSpec {
            resource_regs: vec![(TaskId(1), 1 << 13)],
            ..Default::default()
        });
        let _ = syscall(&mut k, TaskId(1), &[RESET]);
    }

    #[test]
    fn log_emits_prefixed_line() {
        let mut k = kernel(ImageSpec::default());
        let mut m = UserMem::of(&k, TaskId(1));
        let msg = m.alloc_bytes(b"pump primed");
        assert_eq!(syscall(&mut k, TaskId(1), &[LOG, 11, msg]), DONE);
        let out = crate::arch::take_debug_output();
        assert!(out.contains("[blinky] pump primed"), "got: {out}");
    }

    #[test]
    fn log_length_and_placement_limits() {
        let mut k = kernel(ImageSpec::default());
        let mut m = UserMem::of(&k, TaskId(1));
        let msg = m.alloc_bytes(&[b'a'; 64]);
        assert_eq!(
            syscall(&mut k, TaskId(1), &[LOG, MAX_LOG_MSG, msg]),
            INVAL
        );
        // Log messages must come from RAM, not rodata.
        let mut t = UserMem::txt_of(&k, TaskId(1));
        let ro = t.alloc_bytes(b"const");
        assert_eq!(syscall(&mut k, TaskId(1), &[LOG, 5, ro]), INVAL);
        // Empty is fine and logs just the name tag.
        assert_eq!(syscall(&mut k, TaskId(1), &[LOG, 0, 0]), DONE);
        let out = crate::arch::take_debug_output();
        assert!(out.contains("[blinky]"));
    }

    #[test]
    fn ipc_log_variant_shares_the_sink() {
        let mut k = kernel(ImageSpec::default());
        do_init_done(&mut k, TaskId(2));
        let mut m = UserMem::of(&k, TaskId(2));
        let msg = m.alloc_bytes(b"via ipc");
        assert_eq!(
            syscall(
                &mut k,
                TaskId(2),
                &[IPC_NUM, abi::IpcOp::Log as usize, 7, msg]
            ),
            DONE
        );
        let out = crate::arch::take_debug_output();
        assert!(out.contains("[pump] via ipc"), "got: {out}");
    }

    #[test]
    fn get_random_limits_and_permissions() {
        let mut k = kernel(ImageSpec {
            resource_regs: vec![(TaskId(1), 1 << 11)],
            ..Default::default()
        });
        let mut m = UserMem::of(&k, TaskId(1));
        let buf = m.alloc(MAX_RANDOM_BYTES + 1, 1);

        // Initialization gates the entropy source.
        assert_eq!(
            syscall(&mut k, TaskId(1), &[GET_RANDOM, buf, 16]),
            DENIED
        );
        do_init_done(&mut k, TaskId(1));

        assert_eq!(syscall(&mut k, TaskId(1), &[GET_RANDOM, buf, 16]), DONE);
        assert_eq!(
            syscall(&mut k, TaskId(1), &[GET_RANDOM, buf, 17]),
            INVAL
        );

        // Task without the RNG bit.
        do_init_done(&mut k, TaskId(2));
        let mut m2 = UserMem::of(&k, TaskId(2));
        let buf2 = m2.alloc(16, 1);
        assert_eq!(
            syscall(&mut k, TaskId(2), &[GET_RANDOM, buf2, 8]),
            DENIED
        );

        // Exhausted source reports busy.
        crate::arch::set_entropy_exhausted(true);
        assert_eq!(
            syscall(&mut k, TaskId(1), &[GET_RANDOM, buf, 8]),
            BUSY
        );
    }

    #[test]
    fn get_taskid_resolves_case_insensitively() {
        let mut k = kernel(ImageSpec {
            ipc_pairs: vec![(TaskId(1), TaskId(2))],
            dmashm_pairs: vec![(TaskId(1), TaskId(4))],
            ..Default::default()
        });
        let get = abi::InitOp::GetTaskId as usize;
        let mut m = UserMem::of(&k, TaskId(1));

        // "pump" is APP2 in the fixture; we may send to it.
        let name = m.alloc(16, 1);
        m.write(name, b"PUMP\0\0\0\0\0\0\0\0\0\0\0\0");
        let out = m.alloc_u32(0);
        assert_eq!(syscall(&mut k, TaskId(1), &[INIT, get, name, out]), DONE);
        assert_eq!(m.read_u32(out), 2);

        // A DMA-SHM grant is also grounds for discovery.
        m.write(name, b"flash\0\0\0\0\0\0\0\0\0\0\0");
        assert_eq!(syscall(&mut k, TaskId(1), &[INIT, get, name, out]), DONE);
        assert_eq!(m.read_u32(out), 4);

        // A peer we have no relationship with is invisible.
        m.write(name, b"sensor\0\0\0\0\0\0\0\0\0\0");
        assert_eq!(
            syscall(&mut k, TaskId(1), &[INIT, get, name, out]),
            INVAL
        );

        // Unknown name.
        m.write(name, b"nosuch\0\0\0\0\0\0\0\0\0\0");
        assert_eq!(
            syscall(&mut k, TaskId(1), &[INIT, get, name, out]),
            INVAL
        );

        // The whole init family locks at DONE.
        do_init_done(&mut k, TaskId(1));
        m.write(name, b"pump\0\0\0\0\0\0\0\0\0\0\0\0");
        assert_eq!(
            syscall(&mut k, TaskId(1), &[INIT, get, name, out]),
            DENIED
        );
    }

    #[test]
    fn init_done_is_monotonic() {
        let mut k = kernel(ImageSpec::default());
        do_init_done(&mut k, TaskId(1));
        assert!(k.tasks[1].init_done());
        // Every init sub-op, including DONE, now fails without effect.
        for sub in 0..5 {
            assert_eq!(
                syscall(&mut k, TaskId(1), &[INIT, sub, 0, 0]),
                DENIED
            );
        }
        assert!(k.tasks[1].init_done());
    }

    #[test]
    fn unknown_numbers_are_inval() {
        let mut k = kernel(ImageSpec::default());
        assert_eq!(syscall(&mut k, TaskId(1), &[99]), INVAL);
        assert_eq!(syscall(&mut k, TaskId(1), &[INIT, 9]), INVAL);
        assert_eq!(syscall(&mut k, TaskId(1), &[Sysnum::Cfg as usize, 8]), INVAL);
    }

    #[test]
    fn finish_helper_modes() {
        let mut k = kernel(ImageSpec::default());
        // Main mode: a parked caller comes back runnable.
        k.tasks[1].set_state(TaskMode::Main, TaskState::SvcBlocked);
        finish(&mut k.tasks[1], TaskMode::Main, SyscallReturn::Done);
        assert_eq!(main_state(&k, 1), TaskState::Runnable);
        assert_eq!(r0(&k, TaskId(1)), DONE);

        // ISR mode: return value only.
        k.tasks[1].set_state(TaskMode::Main, TaskState::Idle);
        finish(&mut k.tasks[1], TaskMode::Isr, SyscallReturn::Busy);
        assert_eq!(main_state(&k, 1), TaskState::Idle);
    }
}
