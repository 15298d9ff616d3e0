// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.

use abi::{TaskId, TaskType, TASK_NAME_LEN};

use crate::app::Image;
use crate::softirq::{WorkItem, SOFTIRQ_QUEUE_DEPTH};
use crate::state::KernelState;

/// Sanity-checks the image the generator handed us. The generator is
/// trusted, but it is also a program, and a malformed image turns every
/// kernel guarantee to sand -- so the cheap structural checks run once
/// here.
fn validate_image(image: &Image) {
    let mut seen = [false; abi::NUM_TASKS];
    let mut have_softirq = false;
    let mut have_idle = false;

    for desc in image.tasks {
        uassert!(desc.id != TaskId::UNUSED);
        uassert!(!desc.id.is_any_app());
        uassert!(desc.id.index() < abi::NUM_TASKS);
        uassert!(!seen[desc.id.index()]);
        seen[desc.id.index()] = true;

        uassert!(desc.name.len() <= TASK_NAME_LEN);
        uassert!(desc.ram.size > 0);
        // Stack lives inside the RAM slot.
        uassert!(desc.stack.base >= desc.ram.base);
        uassert!(desc.stack.end() <= desc.ram.end());

        match desc.id {
            TaskId::SOFTIRQ => {
                uassert!(desc.task_type == TaskType::Kernel);
                have_softirq = true;
            }
            TaskId::IDLE => {
                uassert!(desc.task_type == TaskType::Kernel);
                have_idle = true;
            }
            _ => uassert!(desc.task_type == TaskType::User),
        }
    }
    uassert!(have_softirq);
    uassert!(have_idle);
}

/// Builds the kernel state from the image: validate, populate the task
/// table, wire up the deferred-work queue.
pub fn populate(
    image: &'static Image,
    softirq_backing: &'static mut [WorkItem; SOFTIRQ_QUEUE_DEPTH],
) -> KernelState {
    klog!("starting: laziness");
    validate_image(image);
    KernelState::new(image, softirq_backing)
}

/// The main kernel entry point.
///
/// The platform does its hardware setup (clocks, MPU base configuration,
/// vector table) and then calls this with the baked image and the queue
/// backing storage.
///
/// # Safety
///
/// This can be called exactly once per boot.
#[cfg(target_arch = "arm")]
pub unsafe fn start_kernel(
    image: &'static Image,
    softirq_backing: &'static mut [WorkItem; SOFTIRQ_QUEUE_DEPTH],
    tick_divisor: u32,
) -> ! {
    klog!("starting: impatience");
    crate::arch::set_clock_freq(tick_divisor);

    let k = populate(image, softirq_backing);
    // Safety: once per boot, before the first trap, per our own contract.
    unsafe {
        crate::arch::install_kernel_state(k);
    }

    crate::arch::with_kernel_state(|k| {
        // Act like we're scheduling after the last task, which causes a
        // scan from 0 on.
        let first = crate::task::select(abi::NUM_TASKS - 1, &k.tasks);
        crate::arch::set_current_task(first);
        klog!("starting: kernel");
        crate::arch::start_first_task(&k.tasks[first])
    })
}
