// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sleep registry and timer wake sweep.
//!
//! A sleeping task is just a task in one of the two sleeping states plus
//! a deadline recorded here. Non-deep sleepers can additionally be woken
//! early by a peer's IPC send; deep sleepers only by the timer.

use abi::{SleepMode, TaskId, TaskMode, TaskState, NUM_TASKS};

use crate::state::KernelState;
use crate::task::NextTask;
use crate::time::Timestamp;

#[derive(Copy, Clone, Debug)]
struct SleepEntry {
    until: Timestamp,
    deep: bool,
}

/// Deadline table, one optional entry per task slot. An entry exists iff
/// the task's main state is `Sleeping` or `DeepSleeping`.
pub struct SleepTable {
    entries: [Option<SleepEntry>; NUM_TASKS],
}

impl SleepTable {
    pub fn new() -> Self {
        Self {
            entries: [None; NUM_TASKS],
        }
    }
}

/// Installs `task` in the sleep registry and parks it. The caller has
/// already written its return value; it will simply resume after the
/// wake.
pub fn sleeping(k: &mut KernelState, task: usize, ms: u32, mode: SleepMode) {
    let deep = mode == SleepMode::Deep;
    let until = crate::arch::now().add_millis(ms);
    k.sleep.entries[task] = Some(SleepEntry { until, deep });
    k.tasks[task].set_state(
        TaskMode::Main,
        if deep {
            TaskState::DeepSleeping
        } else {
            TaskState::Sleeping
        },
    );
}

/// Checks whether `task` is currently installed in the sleep registry.
pub fn is_sleeping(k: &KernelState, task: TaskId) -> bool {
    k.sleep.entries[task.index()].is_some()
}

/// Attempts an early wake of `task`, as performed by a peer's IPC send.
/// Deep sleepers ignore it. Returns whether the task was woken.
pub fn try_waking_up(k: &mut KernelState, task: TaskId) -> bool {
    let idx = task.index();
    match k.sleep.entries[idx] {
        Some(e) if !e.deep => {
            k.sleep.entries[idx] = None;
            k.tasks[idx].set_state(TaskMode::Main, TaskState::Runnable);
            true
        }
        _ => false,
    }
}

/// Processes all armed sleep deadlines, waking any that have expired by
/// `current_time` (and disarming them atomically).
pub fn process_timers(
    k: &mut KernelState,
    current_time: Timestamp,
) -> NextTask {
    let mut sched_hint = NextTask::Same;
    for index in 0..NUM_TASKS {
        if let Some(entry) = k.sleep.entries[index] {
            if entry.until <= current_time {
                k.sleep.entries[index] = None;
                k.tasks[index]
                    .set_state(TaskMode::Main, TaskState::Runnable);
                sched_hint = sched_hint.combine(NextTask::Specific(index));
            }
        }
    }
    sched_hint
}
