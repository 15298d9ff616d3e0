// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARM M-profile targets.
//!
//! The kernel core is portable; this module pins down what the hardware
//! actually provides. Context save/restore, the vector table, and the
//! SVC/PendSV assembly live in the platform crate (they are board
//! bring-up, not coordination logic); the platform calls [`kernel_trap`]
//! with the stacked exception frame and acts on the returned election.
//!
//! Drivers (GPIO, EXTI, DMA, entropy) are likewise linked in by the
//! platform and consumed here through a narrow `extern "C"` surface.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::state::KernelState;
use crate::task::NextTask;
use crate::time::Timestamp;
use abi::{Kref, UserDma};

/// Log things from kernel context. Routed over the ITM when the
/// `klog-itm` feature is enabled; stubbed out otherwise.
#[cfg(feature = "klog-itm")]
macro_rules! klog {
    ($($tt:tt)*) => {
        #[allow(unused_unsafe)]
        unsafe {
            let stim = &mut (*cortex_m::peripheral::ITM::PTR).stim[0];
            cortex_m::iprintln!(stim, $($tt)*);
        }
    };
}

#[cfg(not(feature = "klog-itm"))]
macro_rules! klog {
    ($($tt:tt)*) => {
        let _ = format_args!($($tt)*);
    };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// The hardware-stacked exception frame, as pushed on trap entry.
#[repr(C)]
#[derive(Debug)]
pub struct StackFrame {
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r12: u32,
    pub lr: u32,
    pub pc: u32,
    pub xpsr: u32,
}

/// Saved machine state of a suspended context. The registers live in the
/// exception frame on the task's stack; we keep the pointer the trap
/// entry handed us. Syscall arguments ride in `r0..r3` plus `r12` (the
/// fifth argument register; `r4..r11` are not stacked by hardware).
pub struct SavedState {
    frame: *mut StackFrame,
}

impl Default for SavedState {
    fn default() -> Self {
        Self {
            frame: core::ptr::null_mut(),
        }
    }
}

impl SavedState {
    /// Records the frame stacked by the current trap. Must happen before
    /// any register access for this context.
    pub fn set_frame(&mut self, frame: *mut StackFrame) {
        self.frame = frame;
    }

    fn frame(&self) -> &StackFrame {
        uassert!(!self.frame.is_null());
        // Safety: the frame pointer was produced by trap entry and stays
        // valid while the task is suspended, which is the only time the
        // kernel reads it.
        unsafe { &*self.frame }
    }

    fn frame_mut(&mut self) -> &mut StackFrame {
        uassert!(!self.frame.is_null());
        // Safety: as above, plus the kernel is single-threaded so no
        // aliasing access exists.
        unsafe { &mut *self.frame }
    }
}

impl crate::task::ArchState for SavedState {
    fn arg0(&self) -> usize {
        self.frame().r0 as usize
    }

    fn arg1(&self) -> usize {
        self.frame().r1 as usize
    }

    fn arg2(&self) -> usize {
        self.frame().r2 as usize
    }

    fn arg3(&self) -> usize {
        self.frame().r3 as usize
    }

    fn arg4(&self) -> usize {
        self.frame().r12 as usize
    }

    fn ret0(&mut self, v: usize) {
        self.frame_mut().r0 = v as u32;
    }
}

/// MPU regions left for device mappings once the fixed task regions are
/// programmed.
pub const MPU_FREE_REGIONS: usize = 5;

// Platform-provided drivers. These symbols come from the board support
// and driver crates linked into the final image.
extern "C" {
    fn plat_gpio_enable(kref: u8);
    fn plat_gpio_set_value(kref: u8, value: u32);
    fn plat_gpio_get_value(kref: u8) -> u32;
    fn plat_exti_enable(kref: u8);
    fn plat_dma_init(
        controller: u8,
        stream: u8,
        channel: u8,
        direction: u8,
        src: u32,
        dst: u32,
        size: u32,
    );
    fn plat_dma_reconf(
        controller: u8,
        stream: u8,
        channel: u8,
        direction: u8,
        src: u32,
        dst: u32,
        size: u32,
        mask: u8,
    );
    fn plat_dma_enable_stream(controller: u8, stream: u8);
    fn plat_dma_disable_stream(controller: u8, stream: u8);
    fn plat_dma_enable_irq(controller: u8, stream: u8);
    fn plat_get_random(buf: *mut u8, len: u32) -> i32;
    fn plat_debug_write(ptr: *const u8, len: u32);
    fn plat_debug_flush();
    fn plat_start_first_task(entry: u32, stack: u32) -> !;
}

static mut KERNEL_STATE: Option<KernelState> = None;
static CURRENT_TASK: AtomicUsize = AtomicUsize::new(0);
static CLOCK_CYCLES_PER_MS: AtomicU32 = AtomicU32::new(0);

// Millisecond tick and the 32->64 bit cycle counter extension, both
// touched only inside critical sections.
static mut TICKS: u64 = 0;
static mut CYCLE_HIGH: u32 = 0;
static mut CYCLE_LAST: u32 = 0;

/// Records the core clock so the tick and microsecond conversions work.
/// Called once during platform bring-up.
pub fn set_clock_freq(cycles_per_ms: u32) {
    CLOCK_CYCLES_PER_MS.store(cycles_per_ms, Ordering::Relaxed);
}

/// Installs the kernel state singleton.
///
/// # Safety
///
/// Must be called exactly once, before the first trap can arrive.
pub unsafe fn install_kernel_state(k: KernelState) {
    // Safety: single-core, pre-trap, per this function's contract.
    unsafe {
        KERNEL_STATE = Some(k);
    }
}

/// Runs `f` over the kernel state with interrupts masked.
///
/// # Panics
///
/// If the state has not been installed yet.
pub fn with_kernel_state<R>(f: impl FnOnce(&mut KernelState) -> R) -> R {
    cortex_m::interrupt::free(|_| {
        // Safety: interrupts are masked and the kernel is single-core, so
        // this is the only live reference.
        let k = unsafe {
            (*core::ptr::addr_of_mut!(KERNEL_STATE))
                .as_mut()
                .unwrap_or_else(|| crate::fail::die("kernel not installed"))
        };
        f(k)
    })
}

/// Notes which task the platform is about to resume, so the next trap
/// can be attributed.
pub fn set_current_task(index: usize) {
    CURRENT_TASK.store(index, Ordering::Relaxed);
}

/// Platform SysTick handler body: advance kernel time and wake expired
/// sleepers. Returns the election hint.
pub fn tick() -> NextTask {
    let now = cortex_m::interrupt::free(|_| {
        // Safety: interrupts masked.
        unsafe {
            let t = core::ptr::addr_of_mut!(TICKS);
            *t += 1;
            *t
        }
    });
    with_kernel_state(|k| {
        crate::sleep::process_timers(k, Timestamp::from(now))
    })
}

/// Platform SVC handler body: attribute the trap, stash the frame, and
/// route it. Returns the index of the task to resume.
///
/// # Safety
///
/// `frame` must be the exception frame stacked for the trapping task.
pub unsafe fn kernel_trap(opcode: u8, frame: *mut StackFrame) -> usize {
    let current = CURRENT_TASK.load(Ordering::Relaxed);
    with_kernel_state(|k| {
        let mode = k.tasks[current].current_mode();
        k.tasks[current].save_mut(mode).set_frame(frame);

        let hint = crate::svc::handle_trap(k, current, opcode);
        let next = match hint {
            NextTask::Same => current,
            NextTask::Specific(i) => i,
            NextTask::Other => crate::task::select(current, &k.tasks),
        };
        CURRENT_TASK.store(next, Ordering::Relaxed);
        next
    })
}

pub fn reset() -> ! {
    cortex_m::peripheral::SCB::sys_reset()
}

pub fn now() -> Timestamp {
    let t = cortex_m::interrupt::free(|_| {
        // Safety: interrupts masked.
        unsafe { *core::ptr::addr_of!(TICKS) }
    });
    Timestamp::from(t)
}

pub fn now_micros() -> u64 {
    let per_ms = CLOCK_CYCLES_PER_MS.load(Ordering::Relaxed);
    if per_ms == 0 {
        return 0;
    }
    now_cycles() / u64::from(per_ms / 1000)
}

pub fn now_cycles() -> u64 {
    cortex_m::interrupt::free(|_| {
        let current = cortex_m::peripheral::DWT::cycle_count();
        // Safety: interrupts masked; these statics are only touched here.
        unsafe {
            let last = core::ptr::addr_of_mut!(CYCLE_LAST);
            let high = core::ptr::addr_of_mut!(CYCLE_HIGH);
            if current < *last {
                *high += 1;
            }
            *last = current;
            (u64::from(*high) << 32) | u64::from(current)
        }
    })
}

pub fn fill_random(buf: &mut [u8]) -> bool {
    // Safety: the driver contract is a plain fill of `len` bytes.
    let rc = unsafe {
        plat_get_random(buf.as_mut_ptr(), buf.len() as u32)
    };
    rc == 0
}

pub fn debug_write(args: core::fmt::Arguments<'_>) {
    use core::fmt::Write;

    struct Sink;
    impl Write for Sink {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            // Safety: the sink copies the bytes before returning.
            unsafe {
                plat_debug_write(s.as_ptr(), s.len() as u32);
            }
            Ok(())
        }
    }
    let _ = Sink.write_fmt(args);
    let _ = Sink.write_str("\n");
}

pub fn debug_flush() {
    // Safety: no preconditions; the sink serializes internally.
    unsafe { plat_debug_flush() }
}

pub fn gpio_enable(kref: Kref) {
    // Safety: driver call with a validated kref.
    unsafe { plat_gpio_enable(kref.0) }
}

pub fn gpio_set_value(kref: Kref, value: u32) {
    // Safety: driver call with a validated kref.
    unsafe { plat_gpio_set_value(kref.0, value) }
}

pub fn gpio_get_value(kref: Kref) -> u32 {
    // Safety: driver call with a validated kref.
    unsafe { plat_gpio_get_value(kref.0) }
}

pub fn exti_enable(kref: Kref) {
    // Safety: driver call with a validated kref.
    unsafe { plat_exti_enable(kref.0) }
}

pub fn enable_irq(irq: u32) {
    let nvic = cortex_m::peripheral::NVIC::PTR;
    // Safety: ISER is write-1-to-set; the line number was validated at
    // device registration.
    unsafe {
        (*nvic).iser[(irq / 32) as usize].write(1 << (irq % 32));
    }
}

pub fn disable_irq(irq: u32) {
    let nvic = cortex_m::peripheral::NVIC::PTR;
    // Safety: ICER is write-1-to-clear.
    unsafe {
        (*nvic).icer[(irq / 32) as usize].write(1 << (irq % 32));
    }
}

pub fn dma_init(udma: &UserDma) {
    // Safety: descriptor fields were validated by the caller.
    unsafe {
        plat_dma_init(
            udma.controller,
            udma.stream,
            udma.channel,
            udma.direction,
            udma.src,
            udma.dst,
            udma.size,
        )
    }
}

pub fn dma_reconf(udma: &UserDma, mask: u8) {
    // Safety: descriptor fields were validated by the caller.
    unsafe {
        plat_dma_reconf(
            udma.controller,
            udma.stream,
            udma.channel,
            udma.direction,
            udma.src,
            udma.dst,
            udma.size,
            mask,
        )
    }
}

pub fn dma_enable_stream(controller: u8, stream: u8) {
    // Safety: identifiers validated at registration.
    unsafe { plat_dma_enable_stream(controller, stream) }
}

pub fn dma_disable_stream(controller: u8, stream: u8) {
    // Safety: identifiers validated at registration.
    unsafe { plat_dma_disable_stream(controller, stream) }
}

pub fn dma_enable_irq(controller: u8, stream: u8) {
    // Safety: identifiers validated at registration.
    unsafe { plat_dma_enable_irq(controller, stream) }
}

/// Hands the CPU to the first task. Never returns; everything after this
/// happens through traps.
pub fn start_first_task(task: &crate::task::Task) -> ! {
    // Safety: entry/stack come from the validated image descriptors.
    unsafe {
        plat_start_first_task(
            task.entry_point() as u32,
            task.initial_stack() as u32,
        )
    }
}
