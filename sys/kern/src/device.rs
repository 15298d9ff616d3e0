// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel device records: registration, GPIO/IRQ binding, enabling, and
//! the GPIO and mapping configuration calls.
//!
//! Registration is a staged protocol that only runs while the task is
//! still initializing. Every stage that takes a shared resource (a kernel
//! slot, a GPIO line, an IRQ line) is rolled back if a later stage fails,
//! so a failed registration leaves no residue.

use abi::{
    DevFlags, DevMapMode, ExtiTrigger, IrqMode, Kref, Resource,
    SyscallReturn, TaskId, TaskMode, UserDevice, MAX_DEVS_PER_TASK,
    MAX_GPIOS_PER_DEV, MAX_IRQS_PER_DEV,
};
use zerocopy::FromZeros;

use crate::err::SysError;
use crate::perm;
use crate::state::KernelState;
use crate::task::{ArchState, DeviceIdx, NextTask};

/// Size of the kernel device table, shared by all tasks.
pub const MAX_KERNEL_DEVICES: usize = 16;

/// Number of NVIC lines the IRQ binding table covers.
pub const MAX_IRQ_LINES: usize = 96;

/// Lifecycle of a kernel device record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DevState {
    /// Slot free.
    None,
    /// Slot claimed during a registration in progress.
    Reserved,
    /// Fully registered; waiting for `INIT DONE` (auto devices) or a
    /// first map (voluntary devices) to be enabled.
    Registered,
    /// Live.
    Enabled,
    /// Registration failed after the slot was claimed; diagnostic only.
    RegFail,
}

/// A device as the kernel sees it: the validated copy of the user
/// descriptor plus kernel bookkeeping.
pub struct KDevice {
    pub(crate) udev: UserDevice,
    pub(crate) owner: TaskId,
    /// Index into the image's SoC catalogue; `None` for RAM-backed and
    /// GPIO-only devices.
    pub(crate) soc_index: Option<u8>,
    /// Voluntary devices only: currently mapped through `CFG DEV_MAP`.
    pub(crate) is_mapped: bool,
    pub(crate) state: DevState,
}

/// An IRQ line bound to a task's handler during device registration. The
/// ISR context itself is created lazily when the line first fires.
#[derive(Copy, Clone, Debug)]
pub struct IrqBinding {
    pub task: TaskId,
    pub device: DeviceIdx,
    pub handler: usize,
    pub mode: IrqMode,
}

pub struct DeviceTable {
    devices: [KDevice; MAX_KERNEL_DEVICES],
    /// Which task owns each GPIO line, indexed by kref. A line belongs to
    /// at most one task, ever.
    gpio_owner: [Option<TaskId>; 256],
    irqs: [Option<IrqBinding>; MAX_IRQ_LINES],
}

impl DeviceTable {
    pub fn new() -> Self {
        Self {
            devices: core::array::from_fn(|_| KDevice {
                udev: UserDevice::new_zeroed(),
                owner: TaskId::UNUSED,
                soc_index: None,
                is_mapped: false,
                state: DevState::None,
            }),
            gpio_owner: [None; 256],
            irqs: [None; MAX_IRQ_LINES],
        }
    }

    pub fn get(&self, idx: DeviceIdx) -> &KDevice {
        &self.devices[usize::from(idx.0)]
    }

    pub fn get_mut(&mut self, idx: DeviceIdx) -> &mut KDevice {
        &mut self.devices[usize::from(idx.0)]
    }

    fn free_slot(&self) -> Option<DeviceIdx> {
        // A slot whose last registration failed is free again; the state
        // is kept only as a diagnostic.
        self.devices
            .iter()
            .position(|d| {
                matches!(d.state, DevState::None | DevState::RegFail)
            })
            .map(|i| DeviceIdx(i as u8))
    }

    /// Looks up the handler bound to an IRQ line; this is what the
    /// hardware top-half consults to route a dispatch.
    pub fn irq_binding(&self, irq: u8) -> Option<&IrqBinding> {
        self.irqs.get(usize::from(irq))?.as_ref()
    }

    pub fn gpio_owner(&self, kref: Kref) -> Option<TaskId> {
        self.gpio_owner[usize::from(kref.0)]
    }
}

/// Validates a user device descriptor against the descriptor caps, the
/// SoC catalogue, and the task's permissions. Returns the catalogue index
/// backing the device, if any.
fn sanitize_user_device(
    k: &KernelState,
    caller_id: TaskId,
    udev: &UserDevice,
) -> Result<Option<u8>, SysError> {
    let irq_count = usize::from(udev.irq_count);
    let gpio_count = usize::from(udev.gpio_count);
    if irq_count > MAX_IRQS_PER_DEV || gpio_count > MAX_GPIOS_PER_DEV {
        return Err(SysError::Inval);
    }
    if udev.map_mode().is_none() {
        return Err(SysError::Inval);
    }

    let mut wants_exti = false;
    for gpio in &udev.gpios[..gpio_count] {
        // Port and pin must pack into the kref byte.
        if Kref::new(gpio.port, gpio.pin).is_none() {
            return Err(SysError::Inval);
        }
        match gpio.exti_trigger() {
            None => return Err(SysError::Inval),
            Some(ExtiTrigger::None) => (),
            Some(_) => wants_exti = true,
        }
    }
    for irq in &udev.irqs[..irq_count] {
        if irq.mode().is_none() {
            return Err(SysError::Inval);
        }
        if usize::from(irq.irq) >= MAX_IRQ_LINES {
            return Err(SysError::Inval);
        }
    }
    if wants_exti
        && !perm::resource_granted(k.image, Resource::DevExti, caller_id)
    {
        return Err(SysError::Denied);
    }

    if udev.has_region() && !udev.flags.contains(DevFlags::RAM_BACKED) {
        // Memory-mapped peripheral: must exist in the catalogue, with
        // exactly the declared extent.
        let (soc_index, soc) = k
            .image
            .devices
            .iter()
            .enumerate()
            .find(|(_, d)| d.base == udev.base)
            .ok_or(SysError::Inval)?;
        if soc.size != udev.size {
            return Err(SysError::Inval);
        }
        for irq in &udev.irqs[..irq_count] {
            if !soc.irqs.contains(&irq.irq) {
                return Err(SysError::Inval);
            }
        }
        if let Some(res) = soc.requires {
            if !perm::resource_granted(k.image, res, caller_id) {
                return Err(SysError::Denied);
            }
        }
        Ok(Some(soc_index as u8))
    } else {
        // RAM-backed or GPIO-only: no catalogue entry, so there is no IRQ
        // list to validate against. Such devices get their interrupts via
        // EXTI, not NVIC lines.
        if irq_count != 0 {
            return Err(SysError::Inval);
        }
        Ok(None)
    }
}

/// Implementation of `INIT DEVACCESS`: validate, claim a slot, bind
/// GPIOs and IRQs, commit. See the module docs for the rollback rules.
pub(crate) fn init_devaccess(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let caller_id = k.tasks[caller].id();
    let args = k.tasks[caller].save(mode).as_init_args();
    let udev_slice = args.device()?;
    let out_desc = args.out_descriptor()?;
    let mut out_desc_w = out_desc.clone();

    // The descriptor may be read from RAM or rodata; the returned index
    // always lands in RAM.
    let mut udev: UserDevice = k.tasks[caller].try_read(&udev_slice)?[0];
    if !k.tasks[caller].can_access_ram(&out_desc) {
        return Err(SysError::Inval);
    }

    let soc_index = sanitize_user_device(k, caller_id, &udev)?;

    let counts_mapped =
        udev.has_region() && udev.map_mode() == Some(DevMapMode::Auto);
    if counts_mapped
        && k.tasks[caller].num_devs_mmapped()
            >= crate::arch::MPU_FREE_REGIONS
    {
        return Err(SysError::Busy);
    }
    if k.tasks[caller].num_devs() >= MAX_DEVS_PER_TASK {
        return Err(SysError::Busy);
    }
    let slot = k.devices.free_slot().ok_or(SysError::Busy)?;
    k.devices.get_mut(slot).state = DevState::Reserved;

    // Bind the GPIO lines, refusing duplicates, and stamp the krefs into
    // the kernel copy.
    let gpio_count = usize::from(udev.gpio_count);
    for i in 0..gpio_count {
        let g = &mut udev.gpios[i];
        // Infallible; sanitized above.
        let kref = match Kref::new(g.port, g.pin) {
            Some(kr) => kr,
            None => crate::fail::die("device: kref vanished"),
        };
        if k.devices.gpio_owner[usize::from(kref.0)].is_some() {
            unbind_gpios(k, &udev, i);
            k.devices.get_mut(slot).state = DevState::RegFail;
            return Err(SysError::Busy);
        }
        k.devices.gpio_owner[usize::from(kref.0)] = Some(caller_id);
        g.kref = kref.0;
    }

    // Bind the IRQ lines.
    let irq_count = usize::from(udev.irq_count);
    for i in 0..irq_count {
        let line = usize::from(udev.irqs[i].irq);
        if k.devices.irqs[line].is_some() {
            unbind_irqs(k, &udev, i);
            unbind_gpios(k, &udev, gpio_count);
            k.devices.get_mut(slot).state = DevState::RegFail;
            return Err(SysError::Busy);
        }
        k.devices.irqs[line] = Some(IrqBinding {
            task: caller_id,
            device: slot,
            handler: udev.irqs[i].handler as usize,
            // Infallible; sanitized above.
            mode: udev.irqs[i].mode().unwrap_or(IrqMode::Standard),
        });
    }

    // Commit.
    let desc_index = k.tasks[caller].add_device(slot, counts_mapped);
    {
        let d = k.devices.get_mut(slot);
        d.udev = udev;
        d.owner = caller_id;
        d.soc_index = soc_index;
        d.is_mapped = false;
        d.state = DevState::Registered;
    }

    let out = k.tasks[caller].try_write(&mut out_desc_w)?;
    out[0] = desc_index as u32;

    // Hand the computed krefs back if the descriptor lives in writable
    // memory; a descriptor in rodata just doesn't learn them.
    if k.tasks[caller].can_access_ram(&udev_slice) {
        let mut w = udev_slice.clone();
        let out = k.tasks[caller].try_write(&mut w)?;
        out[0] = udev;
    }

    crate::syscalls::finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Same)
}

fn unbind_gpios(k: &mut KernelState, udev: &UserDevice, bound: usize) {
    for g in &udev.gpios[..bound] {
        if let Some(kref) = Kref::new(g.port, g.pin) {
            k.devices.gpio_owner[usize::from(kref.0)] = None;
        }
    }
}

fn unbind_irqs(k: &mut KernelState, udev: &UserDevice, bound: usize) {
    for irq in &udev.irqs[..bound] {
        k.devices.irqs[usize::from(irq.irq)] = None;
    }
}

/// Enables a registered device: GPIOs driven, EXTI lines armed (unless
/// declared kernel-locked), NVIC lines unmasked.
fn enable_device(k: &mut KernelState, idx: DeviceIdx) {
    let d = k.devices.get_mut(idx);
    d.state = DevState::Enabled;
    let udev = d.udev;
    for g in &udev.gpios[..usize::from(udev.gpio_count)] {
        let kref = Kref(g.kref);
        crate::arch::gpio_enable(kref);
        if g.exti_trigger() != Some(ExtiTrigger::None) && g.exti_locked == 0
        {
            crate::arch::exti_enable(kref);
        }
    }
    for irq in &udev.irqs[..usize::from(udev.irq_count)] {
        crate::arch::enable_irq(u32::from(irq.irq));
    }
}

/// `INIT DONE` stage: enable every `Auto` device of `caller` at once.
/// `Voluntary` devices wait for their first `CFG DEV_MAP`.
pub(crate) fn enable_all(k: &mut KernelState, caller: usize) {
    let devs: [Option<DeviceIdx>; MAX_DEVS_PER_TASK] = {
        let mut out = [None; MAX_DEVS_PER_TASK];
        for (slot, idx) in k.tasks[caller].device_ids().enumerate() {
            out[slot] = Some(idx);
        }
        out
    };
    for idx in devs.into_iter().flatten() {
        if k.devices.get(idx).udev.map_mode() == Some(DevMapMode::Auto) {
            enable_device(k, idx);
        }
    }
}

/// Finds the device and GPIO entry of `caller` matching `kref`.
fn find_gpio(
    k: &KernelState,
    caller: usize,
    kref: Kref,
) -> Option<(DeviceIdx, usize)> {
    for idx in k.tasks[caller].device_ids() {
        let udev = &k.devices.get(idx).udev;
        for (i, g) in
            udev.gpios[..usize::from(udev.gpio_count)].iter().enumerate()
        {
            if g.kref == kref.0 {
                return Some((idx, i));
            }
        }
    }
    None
}

/// Implementation of `CFG GPIO_SET`.
pub(crate) fn cfg_gpio_set(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    if !k.tasks[caller].init_done() {
        return Err(SysError::Denied);
    }
    let args = k.tasks[caller].save(mode).as_cfg_args();
    let kref = args.kref()?;
    let value = args.gpio_value();

    // The task may only touch lines it registered.
    find_gpio(k, caller, kref).ok_or(SysError::Inval)?;
    crate::arch::gpio_set_value(kref, value);

    crate::syscalls::finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Same)
}

/// Implementation of `CFG GPIO_GET`.
pub(crate) fn cfg_gpio_get(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    let args = k.tasks[caller].save(mode).as_cfg_args();
    let kref = args.kref()?;
    let out_value = args.out_value()?;
    let mut out_w = out_value.clone();
    if !k.tasks[caller].can_access_ram(&out_value) {
        return Err(SysError::Inval);
    }
    if !k.tasks[caller].init_done() {
        return Err(SysError::Denied);
    }

    find_gpio(k, caller, kref).ok_or(SysError::Inval)?;
    let value = crate::arch::gpio_get_value(kref);
    let out = k.tasks[caller].try_write(&mut out_w)?;
    out[0] = value;

    crate::syscalls::finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Same)
}

/// Implementation of `CFG GPIO_UNLOCK_EXTI`: arm an EXTI line the image
/// declared kernel-locked. Only lines that declare a trigger and are
/// currently locked qualify.
pub(crate) fn cfg_gpio_unlock_exti(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    if !k.tasks[caller].init_done() {
        return Err(SysError::Denied);
    }
    let args = k.tasks[caller].save(mode).as_cfg_args();
    let kref = args.kref()?;

    let (dev, gi) = find_gpio(k, caller, kref).ok_or(SysError::Inval)?;
    let g = &k.devices.get(dev).udev.gpios[gi];
    if g.exti_trigger() == Some(ExtiTrigger::None) || g.exti_locked == 0 {
        return Err(SysError::Inval);
    }
    crate::arch::exti_enable(kref);

    crate::syscalls::finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Same)
}

/// Implementation of `CFG DEV_MAP`: map (and on first use, enable) a
/// voluntary device.
pub(crate) fn cfg_dev_map(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    if !k.tasks[caller].init_done() {
        return Err(SysError::Denied);
    }
    let caller_id = k.tasks[caller].id();
    if !perm::resource_granted(k.image, Resource::MemDynamicMap, caller_id)
    {
        return Err(SysError::Denied);
    }
    let desc = k.tasks[caller].save(mode).as_cfg_args().descriptor();
    let idx = k.tasks[caller].device_at(desc).ok_or(SysError::Inval)?;

    {
        let d = k.devices.get(idx);
        if d.udev.map_mode() != Some(DevMapMode::Voluntary)
            || !d.udev.has_region()
        {
            return Err(SysError::Inval);
        }
        if d.is_mapped {
            return Err(SysError::Busy);
        }
    }
    // The dynamic map still has to fit the MPU slot budget next to the
    // task's auto-mapped devices.
    if k.tasks[caller].num_devs_mmapped()
        + k.tasks[caller].num_mapped_voluntary()
        >= crate::arch::MPU_FREE_REGIONS
    {
        return Err(SysError::Busy);
    }

    if k.devices.get(idx).state == DevState::Registered {
        enable_device(k, idx);
    }
    k.devices.get_mut(idx).is_mapped = true;
    k.tasks[caller].note_voluntary_mapped(true);

    crate::syscalls::finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Other)
}

/// Implementation of `CFG DEV_UNMAP`.
pub(crate) fn cfg_dev_unmap(
    k: &mut KernelState,
    caller: usize,
    mode: TaskMode,
) -> Result<NextTask, SysError> {
    if !k.tasks[caller].init_done() {
        return Err(SysError::Denied);
    }
    let caller_id = k.tasks[caller].id();
    if !perm::resource_granted(k.image, Resource::MemDynamicMap, caller_id)
    {
        return Err(SysError::Denied);
    }
    let desc = k.tasks[caller].save(mode).as_cfg_args().descriptor();
    let idx = k.tasks[caller].device_at(desc).ok_or(SysError::Inval)?;

    {
        let d = k.devices.get(idx);
        if d.udev.map_mode() != Some(DevMapMode::Voluntary) || !d.is_mapped
        {
            return Err(SysError::Inval);
        }
    }
    k.devices.get_mut(idx).is_mapped = false;
    k.tasks[caller].note_voluntary_mapped(false);

    crate::syscalls::finish(&mut k.tasks[caller], mode, SyscallReturn::Done);
    Ok(NextTask::Other)
}
