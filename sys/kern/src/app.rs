// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application description.
//!
//! An "application" here is the entire collection of tasks, permissions,
//! and SoC resources that customize the generic kernel. All of it is baked
//! into the image by the configuration generator; the kernel only ever
//! reads it. Tests build their own [`Image`]s by hand.

use abi::{Priority, Resource, TaskId, TaskType, NUM_TASKS};

/// A contiguous span of address space. Used for task slots, stacks, and
/// DMA shared-memory windows.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemSpan {
    pub base: usize,
    pub size: usize,
}

impl MemSpan {
    pub const fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    /// Address one past the last byte. Spans may not butt up against the
    /// end of the address space, so this cannot wrap.
    pub fn end(&self) -> usize {
        self.base + self.size
    }
}

impl kerncore::MemoryWindow for MemSpan {
    fn base_addr(&self) -> usize {
        self.base
    }

    fn end_addr(&self) -> usize {
        self.end()
    }
}

/// Record describing a single task.
#[derive(Clone, Debug)]
pub struct TaskDesc {
    /// Task name, for peer lookup and pretty printing. Compared
    /// case-insensitively by `INIT GETTASKID`; at most
    /// `abi::TASK_NAME_LEN` bytes.
    pub name: &'static str,
    /// Slot this task occupies. The image generator must not emit two
    /// descriptors with the same id, nor use slot 0.
    pub id: TaskId,
    pub task_type: TaskType,
    /// Address of the task's entry point.
    pub entry: usize,
    pub priority: Priority,
    /// Security domain; tasks in different domains cannot see each other
    /// when domain enforcement is compiled in.
    #[cfg(feature = "domains")]
    pub domain: u8,
    /// The task's RAM slot: data, bss, heap, stacks.
    pub ram: MemSpan,
    /// The task's code + rodata slot.
    pub txt: MemSpan,
    /// Main-thread stack extent, within `ram`.
    pub stack: MemSpan,
}

/// One entry of the SoC device catalogue: a peripheral the image permits
/// tasks to claim, identified by its physical base address.
#[derive(Clone, Debug)]
pub struct SocDevice {
    pub name: &'static str,
    pub base: u32,
    pub size: u32,
    /// IRQ lines this peripheral may raise. A user descriptor naming an
    /// IRQ outside this list is malformed.
    pub irqs: &'static [u8],
    /// Resource permission a task must hold to claim this device, if any.
    pub requires: Option<Resource>,
}

/// Everything the image generator bakes in: task descriptors, the
/// permission tables, and the SoC catalogue.
///
/// The permission tables are indexed by task table index on both axes.
/// Rows for kernel tasks and the reserved slot are all-false / zero by
/// construction.
#[derive(Clone, Debug)]
pub struct Image {
    pub tasks: &'static [TaskDesc],
    /// 32-bit resource register per task.
    pub resource_regs: [u32; NUM_TASKS],
    /// `ipc_perm[from][to]` grants `from` the right to send to `to`.
    pub ipc_perm: [[bool; NUM_TASKS]; NUM_TASKS],
    /// `dmashm_perm[from][to]` grants `from` the right to declare a DMA
    /// shared-memory window hosted for `to`.
    pub dmashm_perm: [[bool; NUM_TASKS]; NUM_TASKS],
    pub devices: &'static [SocDevice],
}

impl Image {
    /// Looks up the catalogue entry claiming physical address `base`.
    pub fn soc_device_at(&self, base: u32) -> Option<&SocDevice> {
        self.devices.iter().find(|d| d.base == base)
    }
}
