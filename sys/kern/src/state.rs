// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide kernel state.
//!
//! The task table, endpoint pool, deferred-work queue, and resource
//! tables are singletons with one lifecycle: built at bring-up, before
//! the first user task runs, and never torn down. They are only ever
//! touched from handler mode or from the soft-IRQ task, both of which run
//! with preemption-disabling discipline, so no locking appears here.
//!
//! Rather than a pile of module-level statics, everything lives in one
//! struct that is passed explicitly. The arch layer owns the single
//! instance on real targets; tests just build their own.

use abi::{TaskId, NUM_TASKS};

use crate::app::Image;
use crate::device::DeviceTable;
use crate::dma::DmaTable;
use crate::ipc::EndpointPool;
use crate::sleep::SleepTable;
use crate::softirq::{SoftirqQueue, WorkItem, SOFTIRQ_QUEUE_DEPTH};
use crate::task::Task;

pub struct KernelState {
    pub(crate) image: &'static Image,
    pub(crate) tasks: [Task; NUM_TASKS],
    pub(crate) endpoints: EndpointPool,
    pub(crate) softirq: SoftirqQueue,
    pub(crate) devices: DeviceTable,
    pub(crate) dmas: DmaTable,
    pub(crate) sleep: SleepTable,
}

impl KernelState {
    /// Builds the kernel state from the static image. Populated task
    /// slots start with a runnable main thread; the soft-IRQ task idles
    /// until queried.
    pub fn new(
        image: &'static Image,
        softirq_backing: &'static mut [WorkItem; SOFTIRQ_QUEUE_DEPTH],
    ) -> Self {
        let mut tasks: [Task; NUM_TASKS] =
            core::array::from_fn(|_| Task::empty());
        for desc in image.tasks {
            tasks[desc.id.index()] = Task::from_descriptor(desc);
        }
        tasks[TaskId::SOFTIRQ.index()]
            .set_state(abi::TaskMode::Main, abi::TaskState::Idle);

        Self {
            image,
            tasks,
            endpoints: EndpointPool::new(),
            softirq: SoftirqQueue::new(softirq_backing),
            devices: DeviceTable::new(),
            dmas: DmaTable::new(),
            sleep: SleepTable::new(),
        }
    }

    pub fn image(&self) -> &'static Image {
        self.image
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.index()]
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.index()]
    }
}
