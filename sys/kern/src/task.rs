// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.

use abi::{
    DmaShmAccess, Kref, LockOp, Priority, SleepMode, SyscallReturn, TaskId,
    TaskMode, TaskState, TaskType, TickPrecision, UserDevice, UserDma,
    UserDmaShm, MAX_DEVS_PER_TASK, MAX_DMAS_PER_TASK, MAX_DMA_SHM_PER_TASK,
    NUM_MODES, NUM_TASKS, TASK_NAME_LEN,
};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::app::TaskDesc;
use crate::dma::DmaShmWindow;
use crate::err::SysError;
use crate::umem::USlice;

/// Identifies an endpoint in the global pool. Tasks reference endpoints by
/// index, never by address, so the pool and the task table stay free of
/// cross-references.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EndpointIdx(pub u8);

/// Identifies a device record in the kernel device table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DeviceIdx(pub u8);

/// Identifies a DMA channel record in the kernel DMA table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DmaIdx(pub u8);

/// Context armed when a user ISR is dispatched: which handler to run,
/// which IRQ fired, and how the handler interacts with the main thread on
/// return.
#[derive(Copy, Clone, Debug)]
pub struct IsrContext {
    pub handler: usize,
    pub irq: u8,
    pub mode: abi::IrqMode,
}

/// Internal representation of a task.
///
/// The fields of this struct are private to this module so that we can
/// maintain some task invariants. These mostly have to do with keeping the
/// resource bookkeeping consistent: the device counters must agree with
/// the device table, endpoint bindings must stay symmetric with the pool,
/// and nobody outside should write a state without going through the
/// transition helpers.
pub struct Task {
    /// Saved machine state of the user program, one frame per mode.
    save: [crate::arch::SavedState; NUM_MODES],
    /// Scheduling state, one per mode.
    states: [TaskState; NUM_MODES],
    /// Mode the task is currently executing (or was last executing).
    mode: TaskMode,
    /// Static descriptor this task was created from; `None` only for the
    /// reserved slot 0.
    descriptor: Option<&'static TaskDesc>,
    /// Set once by `INIT DONE`; never reverts.
    init_done: bool,
    /// Inbound/outbound endpoint binding per peer, indexed by peer task
    /// index. Both ends of a bound pair point at the same pool entry.
    endpoints: [Option<EndpointIdx>; NUM_TASKS],
    devices: [Option<DeviceIdx>; MAX_DEVS_PER_TASK],
    num_devs: u8,
    /// Devices with a memory region and `Auto` map mode; bounded by the
    /// MPU slot budget.
    num_devs_mmapped: u8,
    /// Voluntary devices currently mapped through `CFG DEV_MAP`.
    num_mapped_voluntary: u8,
    dmas: [Option<DmaIdx>; MAX_DMAS_PER_TASK],
    num_dmas: u8,
    /// DMA shared-memory windows this task has been granted access to.
    /// These live in the *consumer* task; only the first `num_dma_shms`
    /// entries are meaningful.
    dma_shms: [DmaShmWindow; MAX_DMA_SHM_PER_TASK],
    num_dma_shms: u8,
    /// ISR dispatch context, armed by the soft-IRQ task and cleared when
    /// the ISR state returns to idle.
    isr_ctx: Option<IsrContext>,
}

impl Task {
    /// Creates the contents of an unpopulated slot.
    pub fn empty() -> Self {
        Task {
            save: Default::default(),
            states: [TaskState::Empty; NUM_MODES],
            mode: TaskMode::Main,
            descriptor: None,
            init_done: false,
            endpoints: [None; NUM_TASKS],
            devices: [None; MAX_DEVS_PER_TASK],
            num_devs: 0,
            num_devs_mmapped: 0,
            num_mapped_voluntary: 0,
            dmas: [None; MAX_DMAS_PER_TASK],
            num_dmas: 0,
            dma_shms: [DmaShmWindow::EMPTY; MAX_DMA_SHM_PER_TASK],
            num_dma_shms: 0,
            isr_ctx: None,
        }
    }

    /// Creates a `Task` in its initial state, filling in fields from
    /// `descriptor`. The main thread starts `Runnable`, the ISR context
    /// `Idle`.
    pub fn from_descriptor(descriptor: &'static TaskDesc) -> Self {
        Task {
            states: [TaskState::Runnable, TaskState::Idle],
            descriptor: Some(descriptor),
            ..Task::empty()
        }
    }

    fn desc(&self) -> &'static TaskDesc {
        match self.descriptor {
            Some(d) => d,
            None => crate::fail::die("slot 0 dereferenced"),
        }
    }

    pub fn id(&self) -> TaskId {
        match self.descriptor {
            Some(d) => d.id,
            None => TaskId::UNUSED,
        }
    }

    pub fn name(&self) -> &'static str {
        self.desc().name
    }

    pub fn priority(&self) -> Priority {
        match self.descriptor {
            Some(d) => d.priority,
            None => Priority(u8::MAX),
        }
    }

    pub fn is_user_task(&self) -> bool {
        matches!(self.descriptor, Some(d) if d.task_type == TaskType::User)
    }

    #[cfg(feature = "domains")]
    pub fn domain(&self) -> u8 {
        self.desc().domain
    }

    pub fn entry_point(&self) -> usize {
        self.desc().entry
    }

    pub fn initial_stack(&self) -> usize {
        self.desc().stack.end()
    }

    pub fn init_done(&self) -> bool {
        self.init_done
    }

    /// Marks initialization complete. Monotonic; there is deliberately no
    /// way back.
    pub fn set_init_done(&mut self) {
        self.init_done = true;
    }

    pub fn state(&self, mode: TaskMode) -> TaskState {
        self.states[mode.index()]
    }

    pub fn set_state(&mut self, mode: TaskMode, state: TaskState) {
        self.states[mode.index()] = state;
    }

    /// Transitions the main thread to `Runnable`, but only out of the two
    /// states where somebody else finishing work is what the task was
    /// waiting for. A task blocked in IPC, sleeping, or locked keeps its
    /// state.
    ///
    /// The target may currently be executing in ISR mode; its main state
    /// is still the right thing to update, since the scheduler consults it
    /// on return to thread mode.
    pub fn set_runnable_if_blocked(&mut self) {
        if matches!(
            self.states[TaskMode::Main.index()],
            TaskState::SvcBlocked | TaskState::Idle
        ) {
            self.states[TaskMode::Main.index()] = TaskState::Runnable;
        }
    }

    /// Bumps the main thread to `Forced` so the scheduler elects it next,
    /// if it is in a state where that makes sense.
    #[cfg(feature = "fipc")]
    pub fn set_forced_if_eligible(&mut self) {
        if matches!(
            self.states[TaskMode::Main.index()],
            TaskState::Runnable | TaskState::Idle
        ) {
            self.states[TaskMode::Main.index()] = TaskState::Forced;
        }
    }

    pub fn current_mode(&self) -> TaskMode {
        self.mode
    }

    pub fn set_current_mode(&mut self, mode: TaskMode) {
        self.mode = mode;
    }

    /// Returns a reference to the saved machine state for `mode`.
    pub fn save(&self, mode: TaskMode) -> &crate::arch::SavedState {
        &self.save[mode.index()]
    }

    /// Returns a mutable reference to the saved machine state for `mode`.
    pub fn save_mut(
        &mut self,
        mode: TaskMode,
    ) -> &mut crate::arch::SavedState {
        &mut self.save[mode.index()]
    }

    /// Tests whether this task has access to `slice` within its RAM slot.
    /// The same range applies in both modes; there is no separate ISR
    /// stack region.
    ///
    /// This function is `must_use` because calling it without checking its
    /// return value is incredibly suspicious.
    #[must_use]
    pub fn can_access_ram<T>(&self, slice: &USlice<T>) -> bool {
        kerncore::fits_within(slice, &self.desc().ram)
    }

    /// Tests whether this task has access to `slice` within its code +
    /// rodata slot.
    #[must_use]
    pub fn can_access_txt<T>(&self, slice: &USlice<T>) -> bool {
        kerncore::fits_within(slice, &self.desc().txt)
    }

    /// Tests whether `slice` lies in either of the task's slots. This is
    /// the read-side check for payloads, which may legitimately live in
    /// rodata.
    #[must_use]
    pub fn can_access_any<T>(&self, slice: &USlice<T>) -> bool {
        self.can_access_ram(slice) || self.can_access_txt(slice)
    }

    /// Tests whether `slice` lies inside one of the task's DMA
    /// shared-memory windows granting at least `access`.
    #[must_use]
    pub fn can_access_dma_shm<T>(
        &self,
        slice: &USlice<T>,
        access: DmaShmAccess,
    ) -> bool {
        let windows = &self.dma_shms[..usize::from(self.num_dma_shms)];
        kerncore::covered_by_any(slice, windows, |w| w.grants(access))
    }

    /// Obtains the memory backing `slice` as a Rust slice, provided the
    /// task can read it from either of its slots. This is how payload
    /// sources are accessed from the kernel in validated form.
    pub fn try_read<'a, T>(
        &'a self,
        slice: &'a USlice<T>,
    ) -> Result<&'a [T], SysError>
    where
        T: FromBytes + Immutable + KnownLayout,
    {
        if self.can_access_any(slice) {
            // Safety: assume_readable requires us to have validated that
            // the slice refers to task-owned memory, which we did on the
            // previous line.
            unsafe { Ok(slice.assume_readable()) }
        } else {
            Err(SysError::Inval)
        }
    }

    /// Like `try_read`, but the slice must lie in the RAM slot
    /// specifically.
    pub fn try_read_ram<'a, T>(
        &'a self,
        slice: &'a USlice<T>,
    ) -> Result<&'a [T], SysError>
    where
        T: FromBytes + Immutable + KnownLayout,
    {
        if self.can_access_ram(slice) {
            // Safety: validated on the previous line.
            unsafe { Ok(slice.assume_readable()) }
        } else {
            Err(SysError::Inval)
        }
    }

    /// Obtains the memory backing `slice` as a mutable Rust slice. Writes
    /// always target the RAM slot.
    pub fn try_write<'a, T>(
        &'a mut self,
        slice: &'a mut USlice<T>,
    ) -> Result<&'a mut [T], SysError>
    where
        T: FromBytes + Immutable + KnownLayout,
    {
        if self.can_access_ram(slice) {
            // Safety: validated on the previous line.
            unsafe { Ok(slice.assume_writable()) }
        } else {
            Err(SysError::Inval)
        }
    }

    pub fn endpoint_for(&self, peer: TaskId) -> Option<EndpointIdx> {
        self.endpoints[peer.index()]
    }

    pub fn bind_endpoint(&mut self, peer: TaskId, ep: EndpointIdx) {
        self.endpoints[peer.index()] = Some(ep);
    }

    /// Device descriptor index -> kernel device table index, if `desc` is
    /// one of this task's registered devices.
    pub fn device_at(&self, desc: usize) -> Option<DeviceIdx> {
        self.devices.get(desc).copied().flatten()
    }

    /// Iterates this task's registered devices.
    pub fn device_ids(&self) -> impl Iterator<Item = DeviceIdx> + '_ {
        self.devices[..usize::from(self.num_devs)]
            .iter()
            .copied()
            .flatten()
    }

    pub fn num_devs(&self) -> usize {
        usize::from(self.num_devs)
    }

    pub fn num_devs_mmapped(&self) -> usize {
        usize::from(self.num_devs_mmapped)
    }

    pub fn num_mapped_voluntary(&self) -> usize {
        usize::from(self.num_mapped_voluntary)
    }

    /// Records a freshly registered device and returns the per-task
    /// descriptor index userspace will use to name it.
    pub fn add_device(&mut self, dev: DeviceIdx, counts_mapped: bool) -> usize {
        let slot = usize::from(self.num_devs);
        uassert!(slot < MAX_DEVS_PER_TASK);
        uassert!(self.devices[slot].is_none());
        self.devices[slot] = Some(dev);
        self.num_devs += 1;
        if counts_mapped {
            self.num_devs_mmapped += 1;
        }
        slot
    }

    /// Rolls back the most recent `add_device`. Only meaningful during
    /// the registration sequence, before anything else could observe the
    /// entry.
    pub fn remove_last_device(&mut self, counts_mapped: bool) {
        uassert!(self.num_devs > 0);
        self.num_devs -= 1;
        self.devices[usize::from(self.num_devs)] = None;
        if counts_mapped {
            self.num_devs_mmapped -= 1;
        }
    }

    pub fn note_voluntary_mapped(&mut self, mapped: bool) {
        if mapped {
            self.num_mapped_voluntary += 1;
        } else {
            uassert!(self.num_mapped_voluntary > 0);
            self.num_mapped_voluntary -= 1;
        }
    }

    pub fn dma_at(&self, desc: usize) -> Option<DmaIdx> {
        self.dmas.get(desc).copied().flatten()
    }

    pub fn dma_ids(&self) -> impl Iterator<Item = DmaIdx> + '_ {
        self.dmas[..usize::from(self.num_dmas)]
            .iter()
            .copied()
            .flatten()
    }

    pub fn num_dmas(&self) -> usize {
        usize::from(self.num_dmas)
    }

    /// Records a registered DMA channel and returns its descriptor index.
    /// Fails if the per-task table is full.
    pub fn add_dma(&mut self, dma: DmaIdx) -> Result<usize, SysError> {
        let slot = usize::from(self.num_dmas);
        if slot == MAX_DMAS_PER_TASK {
            return Err(SysError::Busy);
        }
        self.dmas[slot] = Some(dma);
        self.num_dmas += 1;
        Ok(slot)
    }

    /// Records a DMA shared-memory window granted to this task. Fails if
    /// the per-task table is full.
    pub fn add_dma_shm(&mut self, w: DmaShmWindow) -> Result<(), SysError> {
        let slot = usize::from(self.num_dma_shms);
        if slot == MAX_DMA_SHM_PER_TASK {
            return Err(SysError::Busy);
        }
        self.dma_shms[slot] = w;
        self.num_dma_shms += 1;
        Ok(())
    }

    pub fn isr_context(&self) -> Option<IsrContext> {
        self.isr_ctx
    }

    /// Scheduling-exit transition for the ISR context: a completed
    /// handler's `IsrDone` state returns to `Idle` and the dispatch
    /// context is dropped.
    pub fn retire_isr(&mut self) {
        if self.states[TaskMode::Isr.index()] == TaskState::IsrDone {
            self.states[TaskMode::Isr.index()] = TaskState::Idle;
            self.isr_ctx = None;
        }
    }

    pub fn arm_isr_context(&mut self, ctx: IsrContext) {
        self.isr_ctx = Some(ctx);
    }

    pub fn clear_isr_context(&mut self) {
        self.isr_ctx = None;
    }
}

/// Checks a task id supplied by user code as an IPC peer: it must be in
/// range, name an application slot, and that slot must be populated.
///
/// On success, returns an index usable to dereference the task table
/// without panicking. The wildcard is deliberately *not* accepted here;
/// callers that allow it must branch before calling in.
pub fn check_task_id(
    tasks: &[Task; NUM_TASKS],
    id: TaskId,
) -> Result<usize, SysError> {
    if !id.is_app() {
        return Err(SysError::Inval);
    }
    let index = id.index();
    if tasks[index].state(TaskMode::Main) == TaskState::Empty {
        return Err(SysError::Inval);
    }
    Ok(index)
}

/// Converts a raw register word into a `TaskId`, rejecting values that do
/// not even fit the id space. Range/population checks are separate.
pub fn task_id_from_arg(word: usize) -> Result<TaskId, SysError> {
    u8::try_from(word).map(TaskId).map_err(|_| SysError::Inval)
}

/// Interface that must be implemented by the `arch::SavedState` type. This
/// gives architecture-independent access to task state for the rest of the
/// kernel.
///
/// Architectures need to implement the `argX` functions plus `ret0`, and
/// the rest of the trait (such as the argument proxy types) will just
/// work. Registers are machine words; on 32-bit targets they are the
/// hardware registers, on the host simulation they are plain fields.
pub trait ArchState: Default {
    /// Reads syscall argument register `r0` (the dispatch number).
    fn arg0(&self) -> usize;
    /// Reads syscall argument register `r1`.
    fn arg1(&self) -> usize;
    /// Reads syscall argument register `r2`.
    fn arg2(&self) -> usize;
    /// Reads syscall argument register `r3`.
    fn arg3(&self) -> usize;
    /// Reads syscall argument register `r4`.
    fn arg4(&self) -> usize;

    /// Writes the syscall return register `r0`.
    fn ret0(&mut self, _: usize);

    /// Reads the syscall dispatch number.
    fn syscall_number(&self) -> u32 {
        self.arg0() as u32
    }

    /// Reads the sub-operation number, for syscall families that have
    /// one.
    fn sub_op(&self) -> u32 {
        self.arg1() as u32
    }

    /// Writes the return code the caller will observe in `r0`.
    fn set_return(&mut self, rc: SyscallReturn) {
        self.ret0(rc.as_word());
    }

    /// Returns a proxied reference that assigns names and types to the
    /// syscall arguments for SLEEP.
    fn as_sleep_args(&self) -> AsSleepArgs<&Self> {
        AsSleepArgs(self)
    }

    /// Returns a proxied reference that assigns names and types to the
    /// syscall arguments for GETTICK.
    fn as_gettick_args(&self) -> AsGettickArgs<&Self> {
        AsGettickArgs(self)
    }

    /// Returns a proxied reference that assigns names and types to the
    /// syscall arguments for LOCK.
    fn as_lock_args(&self) -> AsLockArgs<&Self> {
        AsLockArgs(self)
    }

    /// Returns a proxied reference that assigns names and types to the
    /// syscall arguments for LOG.
    fn as_log_args(&self) -> AsLogArgs<&Self> {
        AsLogArgs(self)
    }

    /// Returns a proxied reference that assigns names and types to the
    /// syscall arguments for GET_RANDOM.
    fn as_random_args(&self) -> AsRandomArgs<&Self> {
        AsRandomArgs(self)
    }

    /// Returns a proxied reference that assigns names and types to the
    /// syscall arguments for the INIT family.
    fn as_init_args(&self) -> AsInitArgs<&Self> {
        AsInitArgs(self)
    }

    /// Returns a proxied reference that assigns names and types to the
    /// syscall arguments for the CFG family.
    fn as_cfg_args(&self) -> AsCfgArgs<&Self> {
        AsCfgArgs(self)
    }

    /// Returns a proxied reference that assigns names and types to the
    /// syscall arguments for the IPC family.
    fn as_ipc_args(&self) -> AsIpcArgs<&Self> {
        AsIpcArgs(self)
    }
}

/// Reference proxy for SLEEP argument registers.
pub struct AsSleepArgs<T>(T);

impl<'a, T: ArchState> AsSleepArgs<&'a T> {
    pub fn millis(&self) -> u32 {
        self.0.arg1() as u32
    }

    pub fn mode(&self) -> Result<SleepMode, SysError> {
        SleepMode::try_from(self.0.arg2() as u32)
            .map_err(|_| SysError::Inval)
    }
}

/// Reference proxy for GETTICK argument registers.
pub struct AsGettickArgs<T>(T);

impl<'a, T: ArchState> AsGettickArgs<&'a T> {
    /// Extracts the destination pointer for the 64-bit counter value.
    pub fn out(&self) -> Result<USlice<u64>, SysError> {
        USlice::for_scalar(self.0.arg1())
    }

    pub fn precision(&self) -> Result<TickPrecision, SysError> {
        TickPrecision::try_from(self.0.arg2() as u32)
            .map_err(|_| SysError::Inval)
    }
}

/// Reference proxy for LOCK argument registers.
pub struct AsLockArgs<T>(T);

impl<'a, T: ArchState> AsLockArgs<&'a T> {
    pub fn op(&self) -> Result<LockOp, SysError> {
        LockOp::try_from(self.0.arg1() as u32).map_err(|_| SysError::Inval)
    }
}

/// Reference proxy for LOG argument registers.
pub struct AsLogArgs<T>(T);

impl<'a, T: ArchState> AsLogArgs<&'a T> {
    pub fn len(&self) -> usize {
        self.0.arg1()
    }

    /// Extracts the bounds of the caller's message as a `USlice`.
    pub fn message(&self) -> Result<USlice<u8>, SysError> {
        USlice::from_raw(self.0.arg2(), self.0.arg1())
    }
}

/// Reference proxy for GET_RANDOM argument registers.
pub struct AsRandomArgs<T>(T);

impl<'a, T: ArchState> AsRandomArgs<&'a T> {
    pub fn len(&self) -> usize {
        self.0.arg2()
    }

    pub fn buffer(&self) -> Result<USlice<u8>, SysError> {
        USlice::from_raw(self.0.arg1(), self.0.arg2())
    }
}

/// Reference proxy for INIT-family argument registers.
pub struct AsInitArgs<T>(T);

impl<'a, T: ArchState> AsInitArgs<&'a T> {
    /// GETTASKID: the peer name, checked as a whole `TASK_NAME_LEN`-byte
    /// window regardless of the actual string length.
    pub fn name_window(&self) -> Result<USlice<u8>, SysError> {
        USlice::from_raw(self.0.arg2(), TASK_NAME_LEN)
    }

    /// GETTASKID: where to deposit the peer id.
    pub fn out_id(&self) -> Result<USlice<u32>, SysError> {
        USlice::for_scalar(self.0.arg3())
    }

    /// DEVACCESS: the user device descriptor.
    pub fn device(&self) -> Result<USlice<UserDevice>, SysError> {
        USlice::for_scalar(self.0.arg2())
    }

    /// DMA: the user DMA descriptor.
    pub fn dma(&self) -> Result<USlice<UserDma>, SysError> {
        USlice::for_scalar(self.0.arg2())
    }

    /// DMA_SHM: the shared-memory declaration.
    pub fn dma_shm(&self) -> Result<USlice<UserDmaShm>, SysError> {
        USlice::for_scalar(self.0.arg2())
    }

    /// DEVACCESS / DMA: where to deposit the per-task descriptor index.
    pub fn out_descriptor(&self) -> Result<USlice<u32>, SysError> {
        USlice::for_scalar(self.0.arg3())
    }
}

/// Reference proxy for CFG-family argument registers.
pub struct AsCfgArgs<T>(T);

impl<'a, T: ArchState> AsCfgArgs<&'a T> {
    /// GPIO operations: the kref naming the line.
    pub fn kref(&self) -> Result<Kref, SysError> {
        u8::try_from(self.0.arg2())
            .map(Kref)
            .map_err(|_| SysError::Inval)
    }

    /// GPIO_SET: the value to drive.
    pub fn gpio_value(&self) -> u32 {
        self.0.arg3() as u32
    }

    /// GPIO_GET: where to deposit the sampled value.
    pub fn out_value(&self) -> Result<USlice<u32>, SysError> {
        USlice::for_scalar(self.0.arg3())
    }

    /// DMA_RECONF: the replacement DMA descriptor.
    pub fn dma(&self) -> Result<USlice<UserDma>, SysError> {
        USlice::for_scalar(self.0.arg2())
    }

    /// DMA_RECONF: mask of fields to apply.
    pub fn reconf_mask(&self) -> u8 {
        self.0.arg3() as u8
    }

    /// DMA_RECONF: the per-task DMA descriptor index.
    pub fn reconf_descriptor(&self) -> usize {
        self.0.arg4()
    }

    /// DMA_RELOAD / DMA_DISABLE / DEV_MAP / DEV_UNMAP: the per-task
    /// descriptor index.
    pub fn descriptor(&self) -> usize {
        self.0.arg2()
    }
}

/// Reference proxy for IPC-family argument registers.
pub struct AsIpcArgs<T>(T);

impl<'a, T: ArchState> AsIpcArgs<&'a T> {
    /// SEND: the receiver id.
    pub fn peer(&self) -> Result<TaskId, SysError> {
        task_id_from_arg(self.0.arg2())
    }

    /// SEND: payload length in bytes.
    pub fn send_len(&self) -> usize {
        self.0.arg3()
    }

    /// SEND: the payload. Invalid if the length is nonzero and the range
    /// is malformed; a zero-length payload is a bare notification.
    pub fn send_buffer(&self) -> Result<USlice<u8>, SysError> {
        USlice::from_raw(self.0.arg4(), self.0.arg3())
    }

    /// RECV: where the sender id is read from (specific or wildcard) and
    /// written back to.
    pub fn sender_ptr(&self) -> Result<USlice<u32>, SysError> {
        USlice::for_scalar(self.0.arg2())
    }

    /// RECV: where the receiver's capacity is read from and the message
    /// length written back to.
    pub fn size_ptr(&self) -> Result<USlice<u32>, SysError> {
        USlice::for_scalar(self.0.arg3())
    }

    /// RECV: the receive buffer, sized by `capacity`.
    pub fn recv_buffer(
        &self,
        capacity: usize,
    ) -> Result<USlice<u8>, SysError> {
        USlice::from_raw(self.0.arg4(), capacity)
    }

    /// LOG: message length.
    pub fn log_len(&self) -> usize {
        self.0.arg2()
    }

    /// LOG: the message bytes.
    pub fn log_message(&self) -> Result<USlice<u8>, SysError> {
        USlice::from_raw(self.0.arg3(), self.0.arg2())
    }
}

/// Return value for operations that can have scheduling implications. This
/// is marked `must_use` because forgetting to actually update the
/// scheduler after performing an operation that requires it would be Bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// It's fine to keep running whatever task we were just running.
    Same,
    /// We need to switch tasks, but this routine has not concluded which
    /// one should now run. The scheduler needs to figure it out.
    Other,
    /// We need to switch tasks, and we already know which one should run
    /// next. This is an optimization available in certain IPC cases.
    Specific(usize),
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        use NextTask::*; // shorthand for patterns

        match (self, other) {
            // If both agree, our job is easy.
            (x, y) if x == y => x,
            // Specific task recommendations that *don't* agree get
            // downgraded to Other.
            (Specific(_), Specific(_)) => Other,
            // If only *one* is specific, it wins.
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            // Otherwise, if either suggestion says switch, switch.
            (Other, _) | (_, Other) => Other,
            // All we have left is...
            (Same, Same) => Same,
        }
    }
}

/// Scans `tasks` for the next task, after `previous`, that satisfies
/// `pred`. If more than one task satisfies `pred`, returns the most
/// important one. If multiple tasks with the same priority satisfy `pred`,
/// prefers the first one in order after `previous`, mod `tasks.len()`.
///
/// Whew.
///
/// This is generally the right way to search a task table, and is used to
/// implement (among other bits) the election helper.
///
/// # Panics
///
/// If `previous` is not a valid index in `tasks`.
pub fn priority_scan(
    previous: usize,
    tasks: &[Task],
    pred: impl Fn(&Task) -> bool,
) -> Option<usize> {
    uassert!(previous < tasks.len());
    let search_order = (previous + 1..tasks.len()).chain(0..previous + 1);
    let mut choice = None;
    for i in search_order {
        if !pred(&tasks[i]) {
            continue;
        }

        if let Some((_, prio)) = choice {
            if !tasks[i].priority().is_more_important_than(prio) {
                continue;
            }
        }

        choice = Some((i, tasks[i].priority()));
    }

    choice.map(|(idx, _)| idx)
}

/// Selects a task to run after `previous`. A `Forced` main thread wins
/// outright; otherwise this is a fair priority scan over schedulable
/// states. The production election policy lives outside the core; this
/// helper is what the simulation and the deferred-work path use.
///
/// If no tasks are runnable, the kernel dies, because the image is
/// required to carry an always-runnable idle task.
pub fn select(previous: usize, tasks: &[Task]) -> usize {
    if let Some(forced) = priority_scan(previous, tasks, |t| {
        t.state(TaskMode::Main) == TaskState::Forced
    }) {
        return forced;
    }
    match priority_scan(previous, tasks, |t| {
        t.state(TaskMode::Main).is_schedulable()
            || t.state(TaskMode::Isr) == TaskState::Runnable
    }) {
        Some(i) => i,
        None => crate::fail::die("no tasks runnable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::leak_image;

    fn table() -> [Task; NUM_TASKS] {
        let image = leak_image(Default::default());
        let mut tasks = core::array::from_fn(|_| Task::empty());
        for desc in image.tasks {
            tasks[desc.id.index()] = Task::from_descriptor(desc);
        }
        tasks
    }

    #[test]
    fn fresh_task_states() {
        let tasks = table();
        let t = &tasks[TaskId::APP1.index()];
        assert_eq!(t.state(TaskMode::Main), TaskState::Runnable);
        assert_eq!(t.state(TaskMode::Isr), TaskState::Idle);
        assert!(!t.init_done());
        assert_eq!(tasks[0].state(TaskMode::Main), TaskState::Empty);
    }

    #[test]
    fn runnable_if_blocked_only_from_blocked_states() {
        let mut tasks = table();
        let t = &mut tasks[TaskId::APP1.index()];

        t.set_state(TaskMode::Main, TaskState::SvcBlocked);
        t.set_runnable_if_blocked();
        assert_eq!(t.state(TaskMode::Main), TaskState::Runnable);

        t.set_state(TaskMode::Main, TaskState::Idle);
        t.set_runnable_if_blocked();
        assert_eq!(t.state(TaskMode::Main), TaskState::Runnable);

        for s in [
            TaskState::Sleeping,
            TaskState::DeepSleeping,
            TaskState::Locked,
            TaskState::IpcWaitAck,
            TaskState::IpcRecvBlocked,
            TaskState::Fault,
        ] {
            t.set_state(TaskMode::Main, s);
            t.set_runnable_if_blocked();
            assert_eq!(t.state(TaskMode::Main), s, "{s:?} must be sticky");
        }
    }

    #[cfg(feature = "fipc")]
    #[test]
    fn forced_only_from_runnable_or_idle() {
        let mut tasks = table();
        let t = &mut tasks[TaskId::APP1.index()];

        t.set_state(TaskMode::Main, TaskState::Runnable);
        t.set_forced_if_eligible();
        assert_eq!(t.state(TaskMode::Main), TaskState::Forced);

        t.set_state(TaskMode::Main, TaskState::SvcBlocked);
        t.set_forced_if_eligible();
        assert_eq!(t.state(TaskMode::Main), TaskState::SvcBlocked);
    }

    #[test]
    fn peer_id_validation() {
        let tasks = table();
        assert!(check_task_id(&tasks, TaskId::UNUSED).is_err());
        assert!(check_task_id(&tasks, TaskId::SOFTIRQ).is_err());
        assert!(check_task_id(&tasks, TaskId::ANY_APP).is_err());
        assert_eq!(check_task_id(&tasks, TaskId::APP1), Ok(1));
        // In-range app id whose slot the image left empty.
        assert!(check_task_id(&tasks, TaskId(7)).is_err());
    }

    #[test]
    fn select_prefers_forced() {
        let mut tasks = table();
        tasks[2].set_state(TaskMode::Main, TaskState::Forced);
        assert_eq!(select(1, &tasks), 2);
    }

    #[test]
    fn select_falls_back_to_idle_task() {
        let mut tasks = table();
        for id in TaskId::all_apps() {
            let t = &mut tasks[id.index()];
            if t.state(TaskMode::Main) != TaskState::Empty {
                t.set_state(TaskMode::Main, TaskState::Idle);
            }
        }
        tasks[TaskId::SOFTIRQ.index()]
            .set_state(TaskMode::Main, TaskState::Idle);
        assert_eq!(select(1, &tasks), TaskId::IDLE.index());
    }

    #[test]
    fn next_task_combine() {
        use NextTask::*;
        assert_eq!(Same.combine(Same), Same);
        assert_eq!(Same.combine(Other), Other);
        assert_eq!(Specific(3).combine(Same), Specific(3));
        assert_eq!(Specific(3).combine(Other), Specific(3));
        assert_eq!(Specific(3).combine(Specific(4)), Other);
    }
}
