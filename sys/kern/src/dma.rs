// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! DMA channel registration, DMA shared-memory declarations, and the DMA
//! stream configuration calls.
//!
//! The kernel never programs transfers itself; it validates what a task
//! asks for, owns the controller/stream bookkeeping, and drives the DMA
//! driver through the arch hooks. Shared-memory windows are recorded in
//! the *consumer* task and consulted by the sanitiser when that task later
//! names a buffer inside one.

use abi::{
    DmaDirection, DmaShmAccess, Resource, SyscallReturn, TaskId, TaskMode,
    UserDma, UserDmaShm,
};

use crate::app::MemSpan;
use crate::err::SysError;
use crate::perm;
use crate::state::KernelState;
use crate::task::{check_task_id, task_id_from_arg, ArchState, DmaIdx, NextTask};
use crate::umem::USlice;

/// Size of the kernel DMA table, shared by all tasks.
pub const MAX_KERNEL_DMAS: usize = 16;

pub const NUM_DMA_CONTROLLERS: u8 = 2;
pub const NUM_DMA_STREAMS: u8 = 8;
pub const NUM_DMA_CHANNELS: u8 = 8;

/// A DMA shared-memory window granted to a task: `source` declared that
/// the DMA controller may touch `span` on behalf of the owning task, with
/// at most `access` rights.
#[derive(Copy, Clone, Debug)]
pub struct DmaShmWindow {
    pub source: TaskId,
    pub access: DmaShmAccess,
    pub span: MemSpan,
}

impl DmaShmWindow {
    /// Filler for unoccupied table slots. A zero-sized span can never
    /// admit a transfer.
    pub const EMPTY: DmaShmWindow = DmaShmWindow {
        source: TaskId::UNUSED,
        access: DmaShmAccess::ReadOnly,
        span: MemSpan::new(0, 0),
    };

    /// Checks whether the window's declared access covers `requested`.
    pub fn grants(&self, requested: DmaShmAccess) -> bool {
        self.access == DmaShmAccess::ReadWrite
            || requested == DmaShmAccess::ReadOnly
    }
}

impl kerncore::MemoryWindow for DmaShmWindow {
    fn base_addr(&self) -> usize {
        self.span.base
    }

    fn end_addr(&self) -> usize {
        self.span.end()
    }
}

/// A registered DMA channel.
pub struct KDma {
    pub(crate) udma: UserDma,
    pub(crate) owner: TaskId,
}

pub struct DmaTable {
    dmas: [Option<KDma>; MAX_KERNEL_DMAS],
}

impl DmaTable {
    pub fn new() -> Self {
        Self {
            dmas: core::array::from_fn(|_| None),
        }
    }

    pub fn get(&self, idx: DmaIdx) -> Option<&KDma> {
        self.dmas[usize::from(idx.0)].as_ref()
    }

    fn free_slot(&self) -> Option<DmaIdx> {
        self.dmas
            .iter()
            .position(|d| d.is_none())
            .map(|i| DmaIdx(i as u8))
    }

    /// A controller/stream pair belongs to at most one task.
    fn stream_registered(&self, controller: u8, stream: u8) -> bool {
        self.dmas.iter().flatten().any(|d| {
            d.udma.controller == controller && d.udma.stream == stream
        })
    }
}

/// Validates a DMA descriptor: identifier ranges, direction, and the
/// memory-side buffer. Buffers may be left null at registration and
/// supplied later through `CFG DMA_RECONF`.
fn sanitize_dma(
    k: &KernelState,
    caller: usize,
    udma: &UserDma,
) -> Result<(), SysError> {
    if udma.controller >= NUM_DMA_CONTROLLERS
        || udma.stream >= NUM_DMA_STREAMS
        || udma.channel >= NUM_DMA_CHANNELS
    {
        return Err(SysError::Inval);
    }
    let dir = udma.direction().ok_or(SysError::Inval)?;

    // The memory end of the transfer must be the caller's own RAM or a
    // shared window granting the right direction of access.
    let (addr, access) = match dir {
        DmaDirection::MemToPeriph => (udma.src, DmaShmAccess::ReadOnly),
        DmaDirection::PeriphToMem => (udma.dst, DmaShmAccess::ReadWrite),
    };
    if addr != 0 {
        let span =
            USlice::<u8>::from_raw(addr as usize, udma.size as usize)?;
        let t = &k.tasks[caller];
        if !t.can_access_ram(&span)
            && !t.can_access_dma_shm(&span, access)
        {
            return Err(SysError::Inval);
        }
    }
    Ok(())
}

/// Implementation of `INIT DMA`: register a DMA channel for the caller.
pub(crate) fn init_dma(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let caller_id = k.tasks[caller].id();
    let args = k.tasks[caller].save(mode).as_init_args();
    let udma_slice = args.dma()?;
    let out_desc = args.out_descriptor()?;
    let mut out_desc_w = out_desc.clone();

    let udma: UserDma = k.tasks[caller].try_read_ram(&udma_slice)?[0];
    if !k.tasks[caller].can_access_ram(&out_desc) {
        return Err(SysError::Inval);
    }

    if !perm::resource_granted(k.image, Resource::DevDma, caller_id) {
        return Err(SysError::Denied);
    }
    sanitize_dma(k, caller, &udma)?;
    if k.dmas.stream_registered(udma.controller, udma.stream) {
        return Err(SysError::Busy);
    }

    let slot = k.dmas.free_slot().ok_or(SysError::Busy)?;
    let desc_index = k.tasks[caller].add_dma(slot)?;
    k.dmas.dmas[usize::from(slot.0)] = Some(KDma {
        udma,
        owner: caller_id,
    });
    crate::arch::dma_init(&udma);

    let out = k.tasks[caller].try_write(&mut out_desc_w)?;
    out[0] = desc_index as u32;

    crate::syscalls::finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Same)
}

/// Implementation of `INIT DMA_SHM`: declare a shared-memory window
/// hosted by the caller for a peer's DMA use.
pub(crate) fn init_dma_shm(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let caller_id = k.tasks[caller].id();
    let args = k.tasks[caller].save(mode).as_init_args();
    let shm_slice = args.dma_shm()?;
    let shm: UserDmaShm = k.tasks[caller].try_read_ram(&shm_slice)?[0];

    let target = task_id_from_arg(usize::from(shm.target))?;
    let target_idx = check_task_id(&k.tasks, target)?;
    if target == caller_id {
        return Err(SysError::Inval);
    }
    let access = shm.access().ok_or(SysError::Inval)?;
    if shm.size == 0 {
        return Err(SysError::Inval);
    }
    // The window is carved out of the declaring task's own memory; flash
    // windows are legal as read-only sources.
    let span =
        USlice::<u8>::from_raw(shm.base as usize, shm.size as usize)?;
    if !k.tasks[caller].can_access_any(&span) {
        return Err(SysError::Inval);
    }

    if !perm::dmashm_granted(k.image, caller_id, target) {
        return Err(SysError::Denied);
    }

    k.tasks[target_idx].add_dma_shm(DmaShmWindow {
        source: caller_id,
        access,
        span: MemSpan::new(shm.base as usize, shm.size as usize),
    })?;

    klog!(
        "dma-shm: {} grants {} access over {:#x}+{:#x}",
        k.tasks[caller].name(),
        k.tasks[target_idx].name(),
        shm.base,
        shm.size
    );

    crate::syscalls::finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Same)
}

/// `INIT DONE` stage: unmask the DMA interrupts of every channel the
/// caller registered.
pub(crate) fn enable_all(k: &mut KernelState, caller: usize) {
    let ids: [Option<DmaIdx>; abi::MAX_DMAS_PER_TASK] = {
        let mut out = [None; abi::MAX_DMAS_PER_TASK];
        for (slot, idx) in k.tasks[caller].dma_ids().enumerate() {
            out[slot] = Some(idx);
        }
        out
    };
    for idx in ids.into_iter().flatten() {
        if let Some(d) = k.dmas.get(idx) {
            crate::arch::dma_enable_irq(d.udma.controller, d.udma.stream);
        }
    }
}

/// Looks up the caller's DMA channel named by a per-task descriptor
/// index.
fn caller_dma(
    k: &KernelState,
    caller: usize,
    desc: usize,
) -> Result<DmaIdx, SysError> {
    let idx = k.tasks[caller].dma_at(desc).ok_or(SysError::Inval)?;
    match k.dmas.get(idx) {
        Some(d) if d.owner == k.tasks[caller].id() => Ok(idx),
        _ => crate::fail::die("dma: descriptor table out of sync"),
    }
}

/// Implementation of `CFG DMA_RECONF`: replace the transfer parameters of
/// a registered channel. The controller/channel/stream triple is fixed at
/// registration and must match.
pub(crate) fn cfg_dma_reconf(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let args = k.tasks[caller].save(mode).as_cfg_args();
    let udma_slice = args.dma()?;
    let mask = args.reconf_mask();
    let desc = args.reconf_descriptor();

    let new: UserDma = k.tasks[caller].try_read_ram(&udma_slice)?[0];
    let idx = caller_dma(k, caller, desc)?;
    {
        let cur = match k.dmas.get(idx) {
            Some(d) => &d.udma,
            None => crate::fail::die("dma: task names an empty slot"),
        };
        if cur.controller != new.controller
            || cur.channel != new.channel
            || cur.stream != new.stream
        {
            return Err(SysError::Inval);
        }
    }
    sanitize_dma(k, caller, &new)?;

    if let Some(d) = k.dmas.dmas[usize::from(idx.0)].as_mut() {
        d.udma = new;
    }
    crate::arch::dma_reconf(&new, mask);

    crate::syscalls::finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Same)
}

/// Implementation of `CFG DMA_RELOAD`: re-arm the stream for another
/// transfer with unchanged parameters.
pub(crate) fn cfg_dma_reload(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let desc = k.tasks[caller].save(mode).as_cfg_args().descriptor();
    let idx = caller_dma(k, caller, desc)?;
    if let Some(d) = k.dmas.get(idx) {
        crate::arch::dma_enable_stream(d.udma.controller, d.udma.stream);
    }

    crate::syscalls::finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Same)
}

/// Implementation of `CFG DMA_DISABLE`: stop the stream. It can be
/// brought back with `CFG DMA_RECONF` or `CFG DMA_RELOAD`.
pub(crate) fn cfg_dma_disable(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let desc = k.tasks[caller].save(mode).as_cfg_args().descriptor();
    let idx = caller_dma(k, caller, desc)?;
    if let Some(d) = k.dmas.get(idx) {
        crate::arch::dma_disable_stream(d.udma.controller, d.udma.stream);
    }

    crate::syscalls::finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Same)
}
