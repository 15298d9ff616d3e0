// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The deferred-work queue and the soft-IRQ service task.
//!
//! Most syscalls are not executed in handler mode: the supervisor entry
//! parks the caller and appends a work item here, and the soft-IRQ task --
//! a privileged kernel task scheduled like any other -- pops items and
//! runs them with interrupts enabled. User ISR dispatches ride the same
//! queue, which is what serializes their user-visible effects.

use abi::{IrqMode, TaskId, TaskMode, TaskState};
use itemq::ItemQ;

use crate::state::KernelState;
use crate::task::{IsrContext, NextTask};

/// Queue capacity. Sized as a static worst case over the task set: every
/// task simultaneously parked in a deferred syscall plus every registered
/// IRQ line pending once. Overflow is therefore a kernel bug, not load.
pub const SOFTIRQ_QUEUE_DEPTH: usize = 32;

/// One unit of deferred work.
#[derive(Copy, Clone, Debug)]
pub enum WorkItem {
    /// Execute the syscall `task` trapped with, from its saved registers.
    Syscall { task: TaskId },
    /// Arm `task`'s ISR context for `handler` and make it runnable.
    UserIsr {
        task: TaskId,
        irq: u8,
        handler: usize,
        mode: IrqMode,
    },
}

impl WorkItem {
    /// Filler for backing storage; never observed by the queue's users.
    pub const EMPTY: WorkItem = WorkItem::Syscall {
        task: TaskId::UNUSED,
    };
}

/// The deferred-work FIFO. Backing storage is borrowed from a named
/// static so it stays visible to a debugger.
pub struct SoftirqQueue {
    q: ItemQ<'static, WorkItem>,
}

impl SoftirqQueue {
    pub fn new(backing: &'static mut [WorkItem; SOFTIRQ_QUEUE_DEPTH]) -> Self {
        Self {
            q: ItemQ::new(backing),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    pub fn len(&self) -> usize {
        self.q.len()
    }

    fn push(&mut self, item: WorkItem) {
        if self.q.push(item).is_err() {
            // The queue is sized for the worst case; hitting the ceiling
            // means the sizing analysis is wrong.
            crate::fail::die("softirq queue overflow");
        }
    }

    fn pop(&mut self) -> Option<WorkItem> {
        self.q.pop()
    }
}

/// Appends a work item and wakes the service task.
pub fn query(k: &mut KernelState, item: WorkItem) {
    k.softirq.push(item);
    k.tasks[TaskId::SOFTIRQ.index()].set_runnable_if_blocked();
}

/// Parks `caller` behind the service task and schedules its pending
/// syscall for deferred execution.
pub fn defer_syscall(k: &mut KernelState, caller: usize) {
    let id = k.tasks[caller].id();
    k.tasks[caller].set_state(TaskMode::Main, TaskState::SvcBlocked);
    query(k, WorkItem::Syscall { task: id });
}

/// Body of the soft-IRQ service task: drain the queue, then go idle until
/// the next query. Runs with interrupts enabled but is never preempted by
/// another kernel path, so everything it touches is serialized.
pub fn drain(k: &mut KernelState) -> NextTask {
    let mut hint = NextTask::Same;

    // ISR dispatches held back by a locked task are set aside and
    // re-queued after the loop; putting them straight back would spin.
    let mut postponed = [None; SOFTIRQ_QUEUE_DEPTH];
    let mut n_postponed = 0;

    while let Some(item) = k.softirq.pop() {
        match item {
            WorkItem::Syscall { task } => {
                let idx = task.index();
                let nt =
                    crate::syscalls::dispatch(k, idx, TaskMode::Main);
                hint = hint.combine(nt);
            }
            WorkItem::UserIsr {
                task,
                irq,
                handler,
                mode,
            } => {
                let t = &mut k.tasks[task.index()];
                // A faulted task's handlers are dead along with it; a
                // finished task still services its interrupts.
                if matches!(
                    t.state(TaskMode::Main),
                    TaskState::Empty | TaskState::Fault
                ) {
                    continue;
                }
                // A locked task has asked for its handlers to be held
                // back; keep the dispatch for a later pass.
                if t.state(TaskMode::Main).defers_isr_dispatch() {
                    postponed[n_postponed] = Some(item);
                    n_postponed += 1;
                    continue;
                }
                t.arm_isr_context(IsrContext { handler, irq, mode });
                t.set_state(TaskMode::Isr, TaskState::Runnable);
                hint = hint.combine(NextTask::Other);
            }
        }
    }

    for item in postponed.into_iter().flatten() {
        k.softirq.push(item);
    }

    let softirq = &mut k.tasks[TaskId::SOFTIRQ.index()];
    softirq.set_state(TaskMode::Main, TaskState::Idle);
    hint.combine(NextTask::Other)
}
