// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted stand-in for the architecture layer.
//!
//! Everything the portable kernel consumes from the hardware is modeled
//! here with plain state: settable clocks, a deterministic entropy
//! source with an "exhausted" switch, a captured debug sink, and
//! recording GPIO/EXTI/NVIC/DMA hooks. The test suite drives whole
//! syscalls against this module; state is thread-local so tests can run
//! in parallel.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt::Write;

use crate::time::Timestamp;
use abi::{Kref, UserDma};

/// Log things from kernel context. On the hosted build the output is
/// captured per thread and drained by [`take_debug_output`].
macro_rules! klog {
    ($($tt:tt)*) => {
        $crate::arch::debug_write(format_args!($($tt)*))
    };
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

/// Saved register file of a suspended context. On hardware these words
/// live in the exception frame; here they are plain fields that tests
/// poke directly.
#[derive(Debug, Default)]
pub struct SavedState {
    r: [usize; 8],
}

impl crate::task::ArchState for SavedState {
    fn arg0(&self) -> usize {
        self.r[0]
    }

    fn arg1(&self) -> usize {
        self.r[1]
    }

    fn arg2(&self) -> usize {
        self.r[2]
    }

    fn arg3(&self) -> usize {
        self.r[3]
    }

    fn arg4(&self) -> usize {
        self.r[4]
    }

    fn ret0(&mut self, v: usize) {
        self.r[0] = v;
    }
}

impl SavedState {
    /// Loads syscall argument registers, as the userspace call stub
    /// would.
    pub fn set_args(&mut self, args: &[usize]) {
        assert!(args.len() <= self.r.len());
        self.r = Default::default();
        self.r[..args.len()].copy_from_slice(args);
    }

    /// Reads back the return register.
    pub fn r0(&self) -> usize {
        self.r[0]
    }
}

struct FakeHw {
    millis: u64,
    micros: u64,
    cycles: u64,
    entropy_exhausted: bool,
    rng_state: u32,
    debug: String,
    gpio_values: [u32; 256],
    gpio_enabled: HashSet<u8>,
    exti_enabled: HashSet<u8>,
    irqs_enabled: HashSet<u32>,
    dma_streams_enabled: HashSet<(u8, u8)>,
    dma_irqs_enabled: HashSet<(u8, u8)>,
}

impl FakeHw {
    fn new() -> Self {
        Self {
            millis: 0,
            micros: 0,
            cycles: 0,
            entropy_exhausted: false,
            rng_state: 0x2545_f491,
            debug: String::new(),
            gpio_values: [0; 256],
            gpio_enabled: HashSet::new(),
            exti_enabled: HashSet::new(),
            irqs_enabled: HashSet::new(),
            dma_streams_enabled: HashSet::new(),
            dma_irqs_enabled: HashSet::new(),
        }
    }
}

thread_local! {
    static HW: RefCell<FakeHw> = RefCell::new(FakeHw::new());
}

/// MPU regions left over for device mappings after the fixed task
/// regions; same budget the real MPU layout leaves.
pub const MPU_FREE_REGIONS: usize = 5;

/// Returns the simulated hardware to its power-on state. Tests call this
/// when they build a fresh kernel, since the thread running them may be
/// reused.
pub fn reset_hw() {
    HW.with(|hw| *hw.borrow_mut() = FakeHw::new());
}

pub fn reset() -> ! {
    panic!("SYSTEM RESET");
}

pub fn now() -> Timestamp {
    HW.with(|hw| Timestamp::from(hw.borrow().millis))
}

pub fn now_micros() -> u64 {
    HW.with(|hw| hw.borrow().micros)
}

pub fn now_cycles() -> u64 {
    HW.with(|hw| hw.borrow().cycles)
}

pub fn set_now_millis(v: u64) {
    HW.with(|hw| hw.borrow_mut().millis = v);
}

pub fn set_now_micros(v: u64) {
    HW.with(|hw| hw.borrow_mut().micros = v);
}

pub fn set_now_cycles(v: u64) {
    HW.with(|hw| hw.borrow_mut().cycles = v);
}

/// Fills `buf` from the simulated entropy source. Returns `false` when
/// the source has been switched off, which is how tests provoke the
/// kernel's `Busy` path.
pub fn fill_random(buf: &mut [u8]) -> bool {
    HW.with(|hw| {
        let mut hw = hw.borrow_mut();
        if hw.entropy_exhausted {
            return false;
        }
        for b in buf.iter_mut() {
            // xorshift; quality is irrelevant, determinism is not.
            let mut x = hw.rng_state;
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            hw.rng_state = x;
            *b = x as u8;
        }
        true
    })
}

pub fn set_entropy_exhausted(v: bool) {
    HW.with(|hw| hw.borrow_mut().entropy_exhausted = v);
}

pub fn debug_write(args: core::fmt::Arguments<'_>) {
    HW.with(|hw| {
        let mut hw = hw.borrow_mut();
        let _ = hw.debug.write_fmt(args);
        hw.debug.push('\n');
    });
}

pub fn debug_flush() {}

/// Drains everything written to the debug sink so far.
pub fn take_debug_output() -> String {
    HW.with(|hw| core::mem::take(&mut hw.borrow_mut().debug))
}

pub fn gpio_enable(kref: Kref) {
    HW.with(|hw| {
        hw.borrow_mut().gpio_enabled.insert(kref.0);
    });
}

pub fn gpio_set_value(kref: Kref, value: u32) {
    HW.with(|hw| {
        hw.borrow_mut().gpio_values[usize::from(kref.0)] = value;
    });
}

pub fn gpio_get_value(kref: Kref) -> u32 {
    HW.with(|hw| hw.borrow().gpio_values[usize::from(kref.0)])
}

pub fn gpio_is_enabled(kref: Kref) -> bool {
    HW.with(|hw| hw.borrow().gpio_enabled.contains(&kref.0))
}

pub fn exti_enable(kref: Kref) {
    HW.with(|hw| {
        hw.borrow_mut().exti_enabled.insert(kref.0);
    });
}

pub fn exti_is_enabled(kref: Kref) -> bool {
    HW.with(|hw| hw.borrow().exti_enabled.contains(&kref.0))
}

pub fn enable_irq(irq: u32) {
    HW.with(|hw| {
        hw.borrow_mut().irqs_enabled.insert(irq);
    });
}

pub fn disable_irq(irq: u32) {
    HW.with(|hw| {
        hw.borrow_mut().irqs_enabled.remove(&irq);
    });
}

pub fn irq_is_enabled(irq: u32) -> bool {
    HW.with(|hw| hw.borrow().irqs_enabled.contains(&irq))
}

pub fn dma_init(udma: &UserDma) {
    HW.with(|hw| {
        let mut hw = hw.borrow_mut();
        hw.dma_streams_enabled.remove(&(udma.controller, udma.stream));
    });
}

pub fn dma_reconf(udma: &UserDma, _mask: u8) {
    HW.with(|hw| {
        let mut hw = hw.borrow_mut();
        hw.dma_streams_enabled.insert((udma.controller, udma.stream));
    });
}

pub fn dma_enable_stream(controller: u8, stream: u8) {
    HW.with(|hw| {
        hw.borrow_mut().dma_streams_enabled.insert((controller, stream));
    });
}

pub fn dma_disable_stream(controller: u8, stream: u8) {
    HW.with(|hw| {
        hw.borrow_mut().dma_streams_enabled.remove(&(controller, stream));
    });
}

pub fn dma_stream_is_enabled(controller: u8, stream: u8) -> bool {
    HW.with(|hw| {
        hw.borrow().dma_streams_enabled.contains(&(controller, stream))
    })
}

pub fn dma_enable_irq(controller: u8, stream: u8) {
    HW.with(|hw| {
        hw.borrow_mut().dma_irqs_enabled.insert((controller, stream));
    });
}

pub fn dma_irq_is_enabled(controller: u8, stream: u8) -> bool {
    HW.with(|hw| {
        hw.borrow().dma_irqs_enabled.contains(&(controller, stream))
    })
}

/// Entering userland makes no sense on the host.
pub fn start_first_task(_task: &crate::task::Task) -> ! {
    panic!("entering userland");
}
