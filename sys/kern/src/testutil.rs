// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test fixtures: hand-built images whose task slots alias real host
//! memory, so whole syscalls can be driven through the dispatcher with
//! genuine user-pointer traffic.

use abi::{
    Priority, Sysnum, TaskId, TaskMode, TaskState, TaskType, NUM_TASKS,
};

use crate::app::{Image, MemSpan, SocDevice, TaskDesc};
use crate::softirq::{WorkItem, SOFTIRQ_QUEUE_DEPTH};
use crate::state::KernelState;
use crate::svc;

const RAM_SIZE: usize = 4096;
const TXT_SIZE: usize = 512;
const STACK_SIZE: usize = 1024;

/// Declarative description of a test image. Defaults to four populated
/// application slots with no permissions at all; tests grant exactly what
/// they exercise.
pub struct ImageSpec {
    pub apps: Vec<&'static str>,
    pub resource_regs: Vec<(TaskId, u32)>,
    pub ipc_pairs: Vec<(TaskId, TaskId)>,
    pub dmashm_pairs: Vec<(TaskId, TaskId)>,
    pub devices: Vec<SocDevice>,
    #[cfg(feature = "domains")]
    pub domains: Vec<(TaskId, u8)>,
    /// Emit a second descriptor reusing APP1's slot, to exercise image
    /// validation.
    pub duplicate_first_app: bool,
}

impl Default for ImageSpec {
    fn default() -> Self {
        Self {
            apps: vec!["blinky", "pump", "sensor", "flash"],
            resource_regs: Vec::new(),
            ipc_pairs: Vec::new(),
            dmashm_pairs: Vec::new(),
            devices: Vec::new(),
            #[cfg(feature = "domains")]
            domains: Vec::new(),
            duplicate_first_app: false,
        }
    }
}

fn leak_ram(words: usize) -> usize {
    // u64 backing keeps the base aligned for every scalar the syscall
    // interface traffics in.
    Box::into_raw(vec![0u64; words].into_boxed_slice()) as *mut u64 as usize
}

fn make_desc(
    spec: &ImageSpec,
    name: &'static str,
    id: TaskId,
    task_type: TaskType,
) -> TaskDesc {
    let ram_base = leak_ram(RAM_SIZE / 8);
    let txt_base = leak_ram(TXT_SIZE / 8);
    #[cfg(feature = "domains")]
    let domain = spec
        .domains
        .iter()
        .find(|(d, _)| *d == id)
        .map(|(_, v)| *v)
        .unwrap_or(0);
    #[cfg(not(feature = "domains"))]
    let _ = spec;
    TaskDesc {
        name,
        id,
        task_type,
        entry: txt_base,
        priority: Priority(if task_type == TaskType::Kernel { 0 } else { 1 }),
        #[cfg(feature = "domains")]
        domain,
        ram: MemSpan::new(ram_base, RAM_SIZE),
        txt: MemSpan::new(txt_base, TXT_SIZE),
        stack: MemSpan::new(ram_base + RAM_SIZE - STACK_SIZE, STACK_SIZE),
    }
}

pub fn leak_image(spec: ImageSpec) -> &'static Image {
    let mut tasks = Vec::new();
    for (i, name) in spec.apps.iter().enumerate() {
        let id = TaskId((i + 1) as u8);
        tasks.push(make_desc(&spec, name, id, TaskType::User));
    }
    if spec.duplicate_first_app {
        tasks.push(make_desc(&spec, "impostor", TaskId::APP1, TaskType::User));
    }
    tasks.push(make_desc(&spec, "softirq", TaskId::SOFTIRQ, TaskType::Kernel));
    tasks.push(make_desc(&spec, "idle", TaskId::IDLE, TaskType::Kernel));

    let mut resource_regs = [0u32; NUM_TASKS];
    for (id, reg) in &spec.resource_regs {
        resource_regs[id.index()] = *reg;
    }
    let mut ipc_perm = [[false; NUM_TASKS]; NUM_TASKS];
    for (from, to) in &spec.ipc_pairs {
        ipc_perm[from.index()][to.index()] = true;
    }
    let mut dmashm_perm = [[false; NUM_TASKS]; NUM_TASKS];
    for (from, to) in &spec.dmashm_pairs {
        dmashm_perm[from.index()][to.index()] = true;
    }

    Box::leak(Box::new(Image {
        tasks: Box::leak(tasks.into_boxed_slice()),
        resource_regs,
        ipc_perm,
        dmashm_perm,
        devices: Box::leak(spec.devices.into_boxed_slice()),
    }))
}

/// Builds a ready-to-drive kernel over a fresh image, with the fake
/// hardware reset.
pub fn kernel(spec: ImageSpec) -> KernelState {
    crate::arch::reset_hw();
    let image = leak_image(spec);
    let backing = Box::leak(Box::new([WorkItem::EMPTY; SOFTIRQ_QUEUE_DEPTH]));
    KernelState::new(image, backing)
}

/// Bump allocator over one task's RAM slot (below the stack), with raw
/// read/write access the way the task itself would have it.
pub struct UserMem {
    cursor: usize,
    limit: usize,
}

impl UserMem {
    pub fn of(k: &KernelState, id: TaskId) -> Self {
        let desc = k
            .image()
            .tasks
            .iter()
            .find(|d| d.id == id)
            .expect("no such task in image");
        Self {
            cursor: desc.ram.base,
            limit: desc.ram.end() - STACK_SIZE,
        }
    }

    /// Like `of`, but over the task's text slot, for payloads that live
    /// in rodata.
    pub fn txt_of(k: &KernelState, id: TaskId) -> Self {
        let desc = k
            .image()
            .tasks
            .iter()
            .find(|d| d.id == id)
            .expect("no such task in image");
        Self {
            cursor: desc.txt.base,
            limit: desc.txt.end(),
        }
    }

    pub fn alloc(&mut self, len: usize, align: usize) -> usize {
        let addr = (self.cursor + align - 1) & !(align - 1);
        assert!(addr + len <= self.limit, "test fixture out of user RAM");
        self.cursor = addr + len;
        addr
    }

    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> usize {
        let addr = self.alloc(bytes.len().max(1), 1);
        self.write(addr, bytes);
        addr
    }

    pub fn alloc_u32(&mut self, v: u32) -> usize {
        let addr = self.alloc(4, 4);
        self.write_u32(addr, v);
        addr
    }

    pub fn alloc_u64(&mut self, v: u64) -> usize {
        let addr = self.alloc(8, 8);
        self.write(addr, &v.to_ne_bytes());
        addr
    }

    pub fn write(&self, addr: usize, bytes: &[u8]) {
        // Safety: addr points into this task's leaked slot; the kernel
        // holds no live reference between syscalls.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                addr as *mut u8,
                bytes.len(),
            );
        }
    }

    pub fn write_u32(&self, addr: usize, v: u32) {
        self.write(addr, &v.to_ne_bytes());
    }

    pub fn read(&self, addr: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        // Safety: as for `write`.
        unsafe {
            core::ptr::copy_nonoverlapping(
                addr as *const u8,
                out.as_mut_ptr(),
                len,
            );
        }
        out
    }

    pub fn read_u32(&self, addr: usize) -> u32 {
        u32::from_ne_bytes(self.read(addr, 4).try_into().unwrap())
    }

    pub fn read_u64(&self, addr: usize) -> u64 {
        u64::from_ne_bytes(self.read(addr, 8).try_into().unwrap())
    }
}

/// Drives one main-thread syscall end to end: load the argument
/// registers, take the trap, and if it was deferred, run the soft-IRQ
/// drain. Returns the caller's visible `r0`.
pub fn syscall(k: &mut KernelState, id: TaskId, args: &[usize]) -> usize {
    let idx = id.index();
    k.tasks[idx].save_mut(TaskMode::Main).set_args(args);
    let _ = svc::handle_trap(k, idx, svc::SVC_SYSCALL);
    if k.tasks[idx].state(TaskMode::Main) == TaskState::SvcBlocked {
        let _ = crate::softirq::drain(k);
    }
    r0(k, id)
}

/// Drives one syscall from ISR context. No drain: ISR-mode calls either
/// execute inline or fail, by construction.
pub fn isr_syscall(k: &mut KernelState, id: TaskId, args: &[usize]) -> usize {
    let idx = id.index();
    k.tasks[idx].set_current_mode(TaskMode::Isr);
    k.tasks[idx].save_mut(TaskMode::Isr).set_args(args);
    let _ = svc::handle_trap(k, idx, svc::SVC_SYSCALL);
    let rc = k.tasks[idx].save(TaskMode::Isr).r0();
    k.tasks[idx].set_current_mode(TaskMode::Main);
    rc
}

pub fn r0(k: &KernelState, id: TaskId) -> usize {
    k.tasks[id.index()].save(TaskMode::Main).r0()
}

/// Completes a task's init phase.
pub fn do_init_done(k: &mut KernelState, id: TaskId) {
    let rc = syscall(
        k,
        id,
        &[Sysnum::Init as usize, abi::InitOp::Done as usize],
    );
    assert_eq!(rc, 0, "INIT DONE failed for {id:?}");
}
