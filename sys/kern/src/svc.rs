// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Supervisor entry router.
//!
//! Every trap out of user code lands here with the trap opcode extracted
//! by the arch layer. Opcode 0 is a syscall; 1 and 2 announce that the
//! main thread or an ISR handler returned; anything else is a fault in
//! the making.
//!
//! Syscall execution is usually delayed, managed by the soft-IRQ kernel
//! task. Tasks in ISR mode share the kernel stack, so their syscalls
//! can't be delayed: only the synchronous whitelist is available to them,
//! executed right here in handler mode.

use abi::{CfgOp, Sysnum, SyscallReturn, TaskMode, TaskState};

use crate::softirq;
use crate::state::KernelState;
use crate::syscalls;
use crate::task::{ArchState, NextTask, Task};

/// Trap opcode: user syscall.
pub const SVC_SYSCALL: u8 = 0;
/// Trap opcode: the task's main function returned.
pub const SVC_MAIN_RETURNED: u8 = 1;
/// Trap opcode: a user ISR handler returned.
pub const SVC_ISR_RETURNED: u8 = 2;

/// Whether the synchronous whitelist is executed inline in handler mode.
/// When off, every syscall takes the deferred path, and ISR-mode callers
/// are denied everything.
const WISE_REPARTITION: bool = cfg!(feature = "wise-repartition");

/// Checks whether the pending syscall in `mode` is on the synchronous
/// whitelist: cheap, non-parking operations that are safe to run in
/// handler mode and that ISR handlers are allowed to use.
fn is_synchronous_syscall(task: &Task, mode: TaskMode) -> bool {
    let save = task.save(mode);
    match Sysnum::try_from(save.syscall_number()) {
        Ok(Sysnum::Yield)
        | Ok(Sysnum::Gettick)
        | Ok(Sysnum::Reset)
        | Ok(Sysnum::Sleep)
        | Ok(Sysnum::Lock) => true,
        Ok(Sysnum::Cfg) => matches!(
            CfgOp::try_from(save.sub_op()),
            Ok(CfgOp::GpioGet)
                | Ok(CfgOp::GpioSet)
                | Ok(CfgOp::GpioUnlockExti)
                | Ok(CfgOp::DmaReload)
                | Ok(CfgOp::DmaReconf)
                | Ok(CfgOp::DmaDisable)
                | Ok(CfgOp::DevMap)
                | Ok(CfgOp::DevUnmap)
        ),
        _ => false,
    }
}

/// Entry point for supervisor traps. `current` is the index of the task
/// that trapped (the arch layer knows which one it suspended) and
/// `opcode` is the trap opcode byte.
///
/// The caller is responsible for acting on the returned scheduling hint.
pub fn handle_trap(
    k: &mut KernelState,
    current: usize,
    opcode: u8,
) -> NextTask {
    match opcode {
        SVC_SYSCALL => handle_syscall(k, current),

        SVC_MAIN_RETURNED => {
            klog!(
                "task {} returned from main; finished",
                k.tasks[current].name()
            );
            crate::arch::debug_flush();
            k.tasks[current].set_state(TaskMode::Main, TaskState::Finished);
            NextTask::Other
        }

        SVC_ISR_RETURNED => {
            // The handler may have asked for its main thread to run next.
            #[cfg(feature = "fisr")]
            if let Some(ctx) = k.tasks[current].isr_context() {
                if ctx.mode == abi::IrqMode::ForceMainThread
                    && matches!(
                        k.tasks[current].state(TaskMode::Main),
                        TaskState::Idle | TaskState::Runnable
                    )
                {
                    k.tasks[current]
                        .set_state(TaskMode::Main, TaskState::Forced);
                }
            }
            k.tasks[current].set_state(TaskMode::Isr, TaskState::IsrDone);
            NextTask::Other
        }

        _ => {
            klog!(
                "invalid SVC request {} from {}; faulting task",
                opcode,
                k.tasks[current].name()
            );
            crate::arch::debug_flush();
            k.tasks[current].set_state(TaskMode::Main, TaskState::Fault);
            NextTask::Other
        }
    }
}

fn handle_syscall(k: &mut KernelState, current: usize) -> NextTask {
    let mode = k.tasks[current].current_mode();

    if mode == TaskMode::Isr {
        if WISE_REPARTITION
            && is_synchronous_syscall(&k.tasks[current], mode)
        {
            syscalls::dispatch(k, current, TaskMode::Isr)
        } else {
            // Not available from ISR context. Fail the call without any
            // state side effects.
            k.tasks[current]
                .save_mut(TaskMode::Isr)
                .set_return(SyscallReturn::Denied);
            NextTask::Same
        }
    } else if WISE_REPARTITION
        && is_synchronous_syscall(&k.tasks[current], mode)
    {
        syscalls::dispatch(k, current, TaskMode::Main)
    } else {
        softirq::defer_syscall(k, current);
        NextTask::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{IpcOp, Sysnum, TaskId};
    use crate::softirq::{self, WorkItem};
    use crate::testutil::{do_init_done, kernel, ImageSpec, UserMem};

    #[test]
    fn main_return_finishes_task() {
        let mut k = kernel(ImageSpec::default());
        let hint = handle_trap(&mut k, 1, SVC_MAIN_RETURNED);
        assert_eq!(hint, NextTask::Other);
        assert_eq!(
            k.tasks[1].state(TaskMode::Main),
            TaskState::Finished
        );
        // The ISR context stays serviceable.
        assert_eq!(k.tasks[1].state(TaskMode::Isr), TaskState::Idle);
    }

    #[test]
    fn unknown_trap_opcode_faults_task() {
        let mut k = kernel(ImageSpec::default());
        let _ = handle_trap(&mut k, 1, 7);
        assert_eq!(k.tasks[1].state(TaskMode::Main), TaskState::Fault);
    }

    #[test]
    fn non_whitelisted_syscall_is_deferred() {
        let mut k = kernel(ImageSpec::default());
        do_init_done(&mut k, TaskId(1));

        let mut m = UserMem::of(&k, TaskId(1));
        let msg = m.alloc_bytes(b"deferred");
        k.tasks[1].save_mut(TaskMode::Main).set_args(&[
            Sysnum::Log as usize,
            8,
            msg,
        ]);

        let hint = handle_trap(&mut k, 1, SVC_SYSCALL);
        assert_eq!(hint, NextTask::Other);
        assert_eq!(
            k.tasks[1].state(TaskMode::Main),
            TaskState::SvcBlocked
        );
        assert_eq!(k.softirq.len(), 1);
        assert_eq!(
            k.tasks[TaskId::SOFTIRQ.index()].state(TaskMode::Main),
            TaskState::Runnable
        );

        let _ = softirq::drain(&mut k);
        assert_eq!(
            k.tasks[1].state(TaskMode::Main),
            TaskState::Runnable
        );
        assert_eq!(k.tasks[1].save(TaskMode::Main).r0(), 0);
    }

    #[cfg(feature = "wise-repartition")]
    #[test]
    fn whitelisted_syscall_runs_inline() {
        let mut k = kernel(ImageSpec::default());
        k.tasks[1].save_mut(TaskMode::Main).set_args(&[
            Sysnum::Yield as usize,
        ]);
        let _ = handle_trap(&mut k, 1, SVC_SYSCALL);
        // Executed on the spot: no deferral, state already updated.
        assert!(k.softirq.is_empty());
        assert_eq!(k.tasks[1].state(TaskMode::Main), TaskState::Idle);
    }

    #[test]
    fn isr_mode_denies_non_whitelisted_calls() {
        let mut k = kernel(ImageSpec::default());
        do_init_done(&mut k, TaskId(1));
        do_init_done(&mut k, TaskId(2));

        k.tasks[1].set_current_mode(TaskMode::Isr);
        k.tasks[1].save_mut(TaskMode::Isr).set_args(&[
            Sysnum::Ipc as usize,
            IpcOp::SendSync as usize,
            2,
            0,
            0,
        ]);
        let hint = handle_trap(&mut k, 1, SVC_SYSCALL);
        assert_eq!(hint, NextTask::Same);
        assert_eq!(k.tasks[1].save(TaskMode::Isr).r0(), 2); // DENIED
        // No side effects at all: nothing queued, no endpoint born.
        assert!(k.softirq.is_empty());
        assert_eq!(k.endpoints.allocated(), 0);
        assert!(k.tasks[1].endpoint_for(TaskId(2)).is_none());
    }

    #[cfg(feature = "fisr")]
    #[test]
    fn isr_return_can_force_main_thread() {
        let mut k = kernel(ImageSpec::default());
        softirq::query(
            &mut k,
            WorkItem::UserIsr {
                task: TaskId(1),
                irq: 23,
                handler: 0x4000,
                mode: abi::IrqMode::ForceMainThread,
            },
        );
        let _ = softirq::drain(&mut k);
        assert_eq!(
            k.tasks[1].state(TaskMode::Isr),
            TaskState::Runnable
        );
        k.tasks[1].set_state(TaskMode::Main, TaskState::Idle);

        let _ = handle_trap(&mut k, 1, SVC_ISR_RETURNED);
        assert_eq!(
            k.tasks[1].state(TaskMode::Isr),
            TaskState::IsrDone
        );
        assert_eq!(
            k.tasks[1].state(TaskMode::Main),
            TaskState::Forced
        );

        // Scheduling exit returns the ISR context to idle.
        k.tasks[1].retire_isr();
        assert_eq!(k.tasks[1].state(TaskMode::Isr), TaskState::Idle);
        assert!(k.tasks[1].isr_context().is_none());
    }

    #[test]
    fn isr_return_without_force_leaves_main_alone() {
        let mut k = kernel(ImageSpec::default());
        softirq::query(
            &mut k,
            WorkItem::UserIsr {
                task: TaskId(1),
                irq: 23,
                handler: 0x4000,
                mode: abi::IrqMode::Standard,
            },
        );
        let _ = softirq::drain(&mut k);
        k.tasks[1].set_state(TaskMode::Main, TaskState::Idle);

        let _ = handle_trap(&mut k, 1, SVC_ISR_RETURNED);
        assert_eq!(k.tasks[1].state(TaskMode::Main), TaskState::Idle);
        assert_eq!(
            k.tasks[1].state(TaskMode::Isr),
            TaskState::IsrDone
        );
    }
}
