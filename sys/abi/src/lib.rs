// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and application tasks.
//!
//! Everything in here is part of the contract between the kernel, the
//! userspace support library, and the image generation tooling: identifier
//! spaces, state encodings, syscall numbers, descriptor layouts, and payload
//! limits. Changing anything here changes the ABI.

#![cfg_attr(not(test), no_std)]

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of application tasks the image can carry. The image generator is
/// expected to emit exactly this many application slots (some possibly
/// unused); the wildcard receive scan iterates `APP1..=APP_MAX`.
pub const MAX_APPS: usize = 7;

/// Total size of the task table: slot 0 (reserved, always empty), the
/// application slots, the soft-IRQ service task, and the kernel idle task.
pub const NUM_TASKS: usize = MAX_APPS + 3;

/// Number of IPC endpoints in the global pool. Sized so that every directed
/// pair the permission matrix allows can be bound at once.
pub const MAX_IPC_ENDPOINTS: usize = 10;

/// Largest IPC payload, in bytes.
pub const MAX_IPC_MSG: usize = 128;

/// Log lines must be strictly shorter than this.
pub const MAX_LOG_MSG: usize = 512;

/// Largest random buffer a task may request at once.
pub const MAX_RANDOM_BYTES: usize = 16;

pub const MAX_DEVS_PER_TASK: usize = 8;
pub const MAX_DMAS_PER_TASK: usize = 8;
pub const MAX_DMA_SHM_PER_TASK: usize = 4;

/// Per-device descriptor table caps. These bound what the kernel is willing
/// to copy in and iterate over; the SoC catalogue may list fewer.
pub const MAX_IRQS_PER_DEV: usize = 8;
pub const MAX_GPIOS_PER_DEV: usize = 8;

pub const TASK_NAME_LEN: usize = 16;
pub const DEV_NAME_LEN: usize = 16;

/// Names a task slot.
///
/// Task identities are fixed at image generation time: slot 0 is reserved
/// and never populated, applications occupy `1..=MAX_APPS`, and the two
/// kernel tasks sit above them. There are no generations -- tasks are never
/// reused for a different program, they can only reach a terminal state.
///
/// `ANY_APP` is a wildcard sentinel, legal only as the peer argument of an
/// IPC receive.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct TaskId(pub u8);

impl TaskId {
    /// Reserved slot 0; also the reset value of endpoint peer fields.
    pub const UNUSED: Self = Self(0);

    /// First application slot.
    pub const APP1: Self = Self(1);

    /// The soft-IRQ service task, a privileged kernel task that drains the
    /// deferred work queue.
    pub const SOFTIRQ: Self = Self(MAX_APPS as u8 + 1);

    /// The kernel idle task, elected when nothing else is runnable.
    pub const IDLE: Self = Self(MAX_APPS as u8 + 2);

    /// Wildcard for IPC receive: accept from any permitted sender.
    pub const ANY_APP: Self = Self(0xff);

    /// Fabricates a `TaskId` from a table index.
    ///
    /// # Panics
    ///
    /// If `index` is outside the task table.
    pub fn from_index(index: usize) -> Self {
        assert!(index < NUM_TASKS);
        TaskId(index as u8)
    }

    /// Extracts the task table index for this id.
    ///
    /// `ANY_APP` has no index; callers must have filtered it out already.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Checks whether this id names an application slot. `ANY_APP` is not
    /// an application.
    pub fn is_app(self) -> bool {
        (1..=MAX_APPS).contains(&usize::from(self.0))
    }

    pub fn is_any_app(self) -> bool {
        self == Self::ANY_APP
    }

    /// Iterates the application id space in ascending order. The wildcard
    /// receive scan relies on this ordering to pick the lowest-id sender.
    pub fn all_apps() -> impl Iterator<Item = TaskId> {
        (1..=MAX_APPS as u8).map(TaskId)
    }
}

/// Execution context of a task. Each task carries one state and one saved
/// frame per mode; the two are independent.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TaskMode {
    /// Executing (or suspended in) its main thread.
    Main = 0,
    /// Executing one of its ISR handlers in user mode.
    Isr = 1,
}

pub const NUM_MODES: usize = 2;

impl TaskMode {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskType {
    /// Kernel task, executing privileged (typically the soft-IRQ task).
    Kernel,
    /// User task, executed in user mode with restricted access.
    User,
}

/// Per-mode scheduling state of a task.
///
/// The scheduler only ever elects tasks in `Runnable` or `Forced`;
/// everything else is a flavor of "not now" with enough information to know
/// who is responsible for the wake-up.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TaskState {
    /// No task in this slot.
    Empty,
    /// Can be elected by the scheduler with its standard priority.
    Runnable,
    /// The scheduler must choose this task next.
    Forced,
    /// Pending deferred syscall; not schedulable until the soft-IRQ task
    /// has executed it.
    SvcBlocked,
    /// ISR handler has returned; awaiting scheduling exit back to `Idle`.
    IsrDone,
    /// Nothing to do; wakeable by an IPC send or an ISR dispatch.
    Idle,
    /// Sleeping; wakeable by timer or by an IPC send.
    Sleeping,
    /// Sleeping; wakeable by timer only.
    DeepSleeping,
    /// Generated an exception (memory fault, invalid trap). Terminal.
    Fault,
    /// Returned from its main function. Terminal for the main thread, but
    /// ISR handlers may still run.
    Finished,
    /// Blocking send: waiting for the peer's mailbox to empty.
    IpcSendBlocked,
    /// Blocking receive: waiting for a peer to send.
    IpcRecvBlocked,
    /// Blocking send: message delivered, waiting for the receiver to read
    /// it.
    IpcWaitAck,
    /// Explicitly locked against ISR delivery.
    Locked,
}

impl TaskState {
    /// Checks whether the scheduler may elect a task in this state.
    ///
    /// A `Locked` main thread keeps executing -- the lock postpones ISR
    /// delivery, it does not suspend the task (it has to keep running to
    /// reach the unlock).
    pub fn is_schedulable(self) -> bool {
        matches!(
            self,
            TaskState::Runnable | TaskState::Forced | TaskState::Locked
        )
    }

    /// Checks whether user ISR dispatches for this task must be
    /// postponed rather than armed.
    pub fn defers_isr_dispatch(self) -> bool {
        matches!(self, TaskState::Locked)
    }

    /// Checks whether this state is terminal: the main thread will never
    /// run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Fault | TaskState::Finished)
    }
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Empty
    }
}

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically lower
/// priorities are more important, so Priority 0 is the most likely to be
/// scheduled, followed by 1, and so forth.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means numerically
/// greater / less important, or more important / numerically smaller.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities, since lower numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

/// Value returned to the caller in `r0` after every syscall.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SyscallReturn {
    /// Operation succeeded.
    Done = 0,
    /// Argument shape was wrong: bad pointer, size, descriptor index,
    /// unknown sub-operation, self-IPC, message too large for the
    /// receiver, GPIO not owned.
    Inval = 1,
    /// Permission refused, or the operation is not legal in the current
    /// phase (ISR mode, before/after `init done`).
    Denied = 2,
    /// Would block in non-blocking mode, a bounded resource is exhausted,
    /// or the entropy source declined.
    Busy = 3,
}

impl SyscallReturn {
    pub fn as_word(self) -> usize {
        self as u32 as usize
    }
}

/// Enumeration of syscall dispatch numbers, passed in `r0`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Sysnum {
    Yield = 0,
    Sleep = 1,
    Reset = 2,
    Gettick = 3,
    Lock = 4,
    Init = 5,
    Ipc = 6,
    Cfg = 7,
    Log = 8,
    GetRandom = 9,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` because the kernel doesn't currently depend on
/// `num-traits` and this seems okay.
impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Yield),
            1 => Ok(Self::Sleep),
            2 => Ok(Self::Reset),
            3 => Ok(Self::Gettick),
            4 => Ok(Self::Lock),
            5 => Ok(Self::Init),
            6 => Ok(Self::Ipc),
            7 => Ok(Self::Cfg),
            8 => Ok(Self::Log),
            9 => Ok(Self::GetRandom),
            _ => Err(()),
        }
    }
}

/// Sub-operations of the `INIT` syscall, passed in `r1`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum InitOp {
    GetTaskId = 0,
    DevAccess = 1,
    Dma = 2,
    DmaShm = 3,
    Done = 4,
}

impl core::convert::TryFrom<u32> for InitOp {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::GetTaskId),
            1 => Ok(Self::DevAccess),
            2 => Ok(Self::Dma),
            3 => Ok(Self::DmaShm),
            4 => Ok(Self::Done),
            _ => Err(()),
        }
    }
}

/// Sub-operations of the `CFG` syscall, passed in `r1`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum CfgOp {
    GpioGet = 0,
    GpioSet = 1,
    GpioUnlockExti = 2,
    DmaReconf = 3,
    DmaReload = 4,
    DmaDisable = 5,
    DevMap = 6,
    DevUnmap = 7,
}

impl core::convert::TryFrom<u32> for CfgOp {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::GpioGet),
            1 => Ok(Self::GpioSet),
            2 => Ok(Self::GpioUnlockExti),
            3 => Ok(Self::DmaReconf),
            4 => Ok(Self::DmaReload),
            5 => Ok(Self::DmaDisable),
            6 => Ok(Self::DevMap),
            7 => Ok(Self::DevUnmap),
            _ => Err(()),
        }
    }
}

/// Sub-operations of the `IPC` syscall, passed in `r1`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum IpcOp {
    Log = 0,
    RecvSync = 1,
    SendSync = 2,
    RecvAsync = 3,
    SendAsync = 4,
}

impl core::convert::TryFrom<u32> for IpcOp {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Log),
            1 => Ok(Self::RecvSync),
            2 => Ok(Self::SendSync),
            3 => Ok(Self::RecvAsync),
            4 => Ok(Self::SendAsync),
            _ => Err(()),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SleepMode {
    /// Wakeable by timer or by a peer's IPC send.
    Shallow = 0,
    /// Wakeable by timer only.
    Deep = 1,
}

impl core::convert::TryFrom<u32> for SleepMode {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Shallow),
            1 => Ok(Self::Deep),
            _ => Err(()),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum LockOp {
    Enter = 0,
    Exit = 1,
}

impl core::convert::TryFrom<u32> for LockOp {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Enter),
            1 => Ok(Self::Exit),
            _ => Err(()),
        }
    }
}

/// Precision selector for `GETTICK`. Each precision is gated by its own
/// time-service permission.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum TickPrecision {
    Milli = 0,
    Micro = 1,
    Cycle = 2,
}

impl core::convert::TryFrom<u32> for TickPrecision {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Milli),
            1 => Ok(Self::Micro),
            2 => Ok(Self::Cycle),
            _ => Err(()),
        }
    }
}

/// Named entries of a task's resource register. The register itself is a
/// 32-bit bitfield baked into the image; the mapping of names to
/// bit/width/value triples lives in the kernel's permission oracle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Resource {
    DevDma,
    DevCryptoUsr,
    DevCryptoCfg,
    DevCryptoFull,
    DevBuses,
    DevExti,
    DevTim,
    TimGetmilli,
    TimGetmicro,
    TimGetcycle,
    TskFisr,
    TskFipc,
    TskReset,
    TskUpgrade,
    TskRng,
    MemDynamicMap,
}

/// A compact GPIO identifier: port in the high nibble, pin in the low
/// nibble. This is the only name userspace has for a GPIO after
/// registration.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Kref(pub u8);

impl Kref {
    /// Packs a port/pin pair. Fails if either doesn't fit its nibble.
    pub fn new(port: u8, pin: u8) -> Option<Self> {
        if port > 0xf || pin > 0xf {
            return None;
        }
        Some(Kref(port << 4 | pin))
    }

    pub fn port(self) -> u8 {
        self.0 >> 4
    }

    pub fn pin(self) -> u8 {
        self.0 & 0xf
    }
}

/// How a device's memory region relates to the task's MPU mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DevMapMode {
    /// Mapped for the task's whole life, enabled en masse at `INIT DONE`.
    Auto = 0,
    /// Mapped on demand through `CFG DEV_MAP`, enabled at first map.
    Voluntary = 1,
}

impl core::convert::TryFrom<u8> for DevMapMode {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Auto),
            1 => Ok(Self::Voluntary),
            _ => Err(()),
        }
    }
}

/// How a user ISR handler interacts with the task's main thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum IrqMode {
    Standard = 0,
    /// After the handler returns, bump the main thread to `Forced` if it
    /// is idle or runnable.
    ForceMainThread = 1,
}

impl core::convert::TryFrom<u8> for IrqMode {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Standard),
            1 => Ok(Self::ForceMainThread),
            _ => Err(()),
        }
    }
}

/// EXTI trigger declared for a GPIO, if any.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ExtiTrigger {
    None = 0,
    Rise = 1,
    Fall = 2,
    Both = 3,
}

impl core::convert::TryFrom<u8> for ExtiTrigger {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::None),
            1 => Ok(Self::Rise),
            2 => Ok(Self::Fall),
            3 => Ok(Self::Both),
            _ => Err(()),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DmaDirection {
    PeriphToMem = 0,
    MemToPeriph = 1,
}

impl core::convert::TryFrom<u8> for DmaDirection {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::PeriphToMem),
            1 => Ok(Self::MemToPeriph),
            _ => Err(()),
        }
    }
}

/// Access the DMA controller is granted on a shared-memory window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DmaShmAccess {
    ReadOnly = 0,
    ReadWrite = 1,
}

impl core::convert::TryFrom<u8> for DmaShmAccess {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::ReadOnly),
            1 => Ok(Self::ReadWrite),
            _ => Err(()),
        }
    }
}

// Defined outside the bitflags! macro so the zerocopy derives apply to the
// transparent wrapper; any bit pattern is a valid flag set.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct DevFlags(u8);

bitflags::bitflags! {
    impl DevFlags: u8 {
        /// The region may only be mapped read-only.
        const READ_ONLY = 1 << 0;
        /// The device memory lives in task RAM rather than the SoC
        /// peripheral space, so it has no catalogue entry to match.
        const RAM_BACKED = 1 << 1;
    }
}

/// One GPIO line of a user device descriptor.
///
/// The task fills in `port`/`pin` and the EXTI fields; the kernel computes
/// `kref` during registration and writes it back.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct UserGpio {
    pub port: u8,
    pub pin: u8,
    /// Filled in by the kernel at registration.
    pub kref: u8,
    /// `ExtiTrigger` encoding.
    pub exti_trigger: u8,
    /// Nonzero if the EXTI line starts kernel-locked and must be released
    /// with `CFG GPIO_UNLOCK_EXTI`.
    pub exti_locked: u8,
    pub _pad: [u8; 3],
}

impl UserGpio {
    pub fn exti_trigger(&self) -> Option<ExtiTrigger> {
        ExtiTrigger::try_from(self.exti_trigger).ok()
    }
}

/// One IRQ line of a user device descriptor.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct UserIrq {
    pub irq: u8,
    /// `IrqMode` encoding.
    pub mode: u8,
    pub _pad: [u8; 2],
    /// User-space handler entry point; executed in the task's ISR context.
    pub handler: u32,
}

impl UserIrq {
    pub fn mode(&self) -> Option<IrqMode> {
        IrqMode::try_from(self.mode).ok()
    }
}

/// Device descriptor as supplied by a task to `INIT DEVACCESS`.
///
/// The kernel copies this structure out of task memory, validates it
/// against the SoC catalogue and the task's permissions, and keeps its own
/// augmented copy. `kref` fields are the only part the kernel writes back.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct UserDevice {
    pub name: [u8; DEV_NAME_LEN],
    /// Physical base address; must match the catalogue entry unless the
    /// device is `RAM_BACKED`. Zero for GPIO-only devices.
    pub base: u32,
    pub size: u32,
    /// `DevMapMode` encoding.
    pub map_mode: u8,
    pub flags: DevFlags,
    pub irq_count: u8,
    pub gpio_count: u8,
    pub irqs: [UserIrq; MAX_IRQS_PER_DEV],
    pub gpios: [UserGpio; MAX_GPIOS_PER_DEV],
}

impl UserDevice {
    pub fn map_mode(&self) -> Option<DevMapMode> {
        DevMapMode::try_from(self.map_mode).ok()
    }

    /// Checks whether the descriptor claims a memory region at all.
    pub fn has_region(&self) -> bool {
        self.size != 0
    }
}

/// DMA channel descriptor as supplied by a task to `INIT DMA`.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct UserDma {
    pub controller: u8,
    pub stream: u8,
    pub channel: u8,
    /// `DmaDirection` encoding.
    pub direction: u8,
    pub src: u32,
    pub dst: u32,
    pub size: u32,
}

impl UserDma {
    pub fn direction(&self) -> Option<DmaDirection> {
        DmaDirection::try_from(self.direction).ok()
    }
}

/// DMA shared-memory declaration as supplied by the granting task to
/// `INIT DMA_SHM`. The kernel records it in the *target* task, which is
/// the one being granted DMA access over the window.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct UserDmaShm {
    /// `TaskId` of the consumer.
    pub target: u8,
    /// `DmaShmAccess` encoding.
    pub access: u8,
    pub _pad: [u8; 2],
    pub base: u32,
    pub size: u32,
}

impl UserDmaShm {
    pub fn access(&self) -> Option<DmaShmAccess> {
        DmaShmAccess::try_from(self.access).ok()
    }
}

// The descriptor structs travel across the user/kernel boundary by copy;
// their sizes are load-bearing.
const_assert!(core::mem::size_of::<UserGpio>() == 8);
const_assert!(core::mem::size_of::<UserIrq>() == 8);
const_assert!(core::mem::size_of::<UserDevice>() == 156);
const_assert!(core::mem::size_of::<UserDma>() == 16);
const_assert!(core::mem::size_of::<UserDmaShm>() == 12);
const_assert!(NUM_TASKS <= TaskId::ANY_APP.0 as usize);
