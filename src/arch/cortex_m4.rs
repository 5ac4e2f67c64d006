//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements context switching via PendSV, SysTick as the kernel's timer
//! interrupt source, and the routing of every device interrupt into the
//! kernel's single dispatcher.
//!
//! ## Interrupt Path
//!
//! ```text
//!  device IRQ n ──► DefaultHandler ─┐
//!                                   ├─► latch source, Kernel::dispatch()
//!  SysTick ─────► SysTick ──────────┘        │
//!                                            ▼ needs_reschedule?
//!                                      pend PendSV
//!                                            │ (tail-chains at return)
//!                                            ▼
//!                           PendSV: save ─► Scheduler::reschedule ─► restore
//! ```
//!
//! PendSV runs at the lowest priority, so the reschedule decision is only
//! ever taken on the way out of interrupt context, never mid-handler.
//!
//! ## Context Layout
//!
//! On exception entry the hardware stacks R0–R3, R12, LR, PC and xPSR (and
//! S0–S15/FPSCR for threads that used the FPU) on the process stack.
//! PendSV pushes R4–R11 (and S16–S31 when the extended frame is active)
//! below that; the TCB keeps the resulting stack pointer and EXC_RETURN.

use core::arch::{asm, naked_asm};

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::scb::{SystemHandler, VectActive};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{NVIC, SCB, SYST};

use super::ContextSwitch;
use crate::api;
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::irq::IrqSource;
use crate::thread::{Stack, ThreadEntry};

/// Return to Thread mode, process stack, basic (no FPU) frame.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// xPSR with only the Thumb bit set.
const XPSR_THUMB: u32 = 0x0100_0000;

// ---------------------------------------------------------------------------
// Saved context
// ---------------------------------------------------------------------------

/// Saved state of a thread that is not running: the process stack pointer
/// (registers live on the thread's own stack below it) and the EXC_RETURN
/// value that says which frame format to unstack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    pub sp: usize,
    pub exc_return: u32,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            sp: 0,
            exc_return: EXC_RETURN_THREAD_PSP,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the initial frame so that the first PendSV "return" into this
/// thread lands in `thread_trampoline(entry, arg)`.
///
/// ```text
/// [Hardware stacked frame]   <- high address
///   xPSR  (Thumb bit set)
///   PC    (thread_trampoline)
///   LR    (unused, trampoline never returns)
///   R12, R3, R2
///   R1    (arg)
///   R0    (entry)
/// [Software saved context]
///   R11 … R4 (0)             <- context.sp
/// ```
pub fn init_context(context: &mut Context, entry: ThreadEntry, arg: usize, stack: &Stack) {
    let frame = (stack.top() - 16 * 4) as *mut u32;

    unsafe {
        for i in 0..8 {
            frame.add(i).write(0); // R4–R11
        }
        frame.add(8).write(entry as usize as u32); // R0
        frame.add(9).write(arg as u32); // R1
        frame.add(10).write(0); // R2
        frame.add(11).write(0); // R3
        frame.add(12).write(0); // R12
        frame.add(13).write(0); // LR
        frame.add(14).write(thread_trampoline as usize as u32 & !1); // PC
        frame.add(15).write(XPSR_THUMB); // xPSR
    }

    context.sp = frame as usize;
    context.exc_return = EXC_RETURN_THREAD_PSP;
}

/// First code every thread runs. Calls the entry and exits the thread
/// when it returns.
extern "C" fn thread_trampoline(entry: usize, arg: usize) -> ! {
    // SAFETY: `init_context` stored a `ThreadEntry` in R0.
    let entry: ThreadEntry = unsafe { core::mem::transmute::<usize, ThreadEntry>(entry) };
    entry(arg);
    api::exit_thread()
}

// ---------------------------------------------------------------------------
// Context switch engine
// ---------------------------------------------------------------------------

/// The process-stack state PendSV is holding while it decides.
struct PendSvFrame {
    psp: usize,
    exc_return: u32,
}

impl ContextSwitch for PendSvFrame {
    fn save(&mut self, context: &mut Context) {
        context.sp = self.psp;
        context.exc_return = self.exc_return;
    }

    fn restore(&mut self, context: &Context) {
        self.psp = context.sp;
        self.exc_return = context.exc_return;
    }
}

/// Reschedule check, called from PendSV with the outgoing thread's PSP
/// (after R4–R11 were pushed) and its EXC_RETURN.
///
/// Returns the PSP to unstack in the low word and the EXC_RETURN to use
/// in the high word (r0/r1 under AAPCS).
#[no_mangle]
unsafe extern "C" fn pendsv_switch(psp: usize, exc_return: u32) -> u64 {
    let mut frame = PendSvFrame { psp, exc_return };
    api::with_kernel(|kernel| {
        kernel.scheduler.reschedule_with(&mut frame);
    });
    ((frame.exc_return as u64) << 32) | frame.psp as u64
}

/// PendSV exception handler: performs the actual context switch.
///
/// ## Sequence
/// 1. Push S16–S31 (extended frame only) and R4–R11 onto the current PSP
/// 2. `pendsv_switch` saves PSP/EXC_RETURN into the current TCB, runs the
///    scheduler and returns the next thread's PSP/EXC_RETURN
/// 3. Pop R4–R11 (and S16–S31) from the new stack, set PSP
/// 4. Exception return; hardware unstacks the rest
#[cfg(target_abi = "eabihf")]
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "tst lr, #0x10",
        "it eq",
        "vstmdbeq r0!, {{s16-s31}}",
        "stmdb r0!, {{r4-r11}}",
        "mov r1, lr",
        "bl {switch}",
        "ldmia r0!, {{r4-r11}}",
        "tst r1, #0x10",
        "it eq",
        "vldmiaeq r0!, {{s16-s31}}",
        "msr psp, r0",
        "isb",
        "bx r1",
        switch = sym pendsv_switch,
    );
}

/// PendSV for soft-float targets: no extended frame to handle.
#[cfg(not(target_abi = "eabihf"))]
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "mov r1, lr",
        "bl {switch}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "isb",
        "bx r1",
        switch = sym pendsv_switch,
    );
}

/// Pend PendSV. It runs as soon as no other handler is active and
/// interrupts are unmasked.
#[inline]
pub fn request_reschedule() {
    SCB::set_pendsv();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Sleep until the next interrupt.
#[inline]
pub fn halt() {
    cortex_m::asm::wfi();
}

// ---------------------------------------------------------------------------
// Interrupt entry
// ---------------------------------------------------------------------------

/// NVIC line for a device interrupt source. Source 0 is the SysTick timer,
/// device line `n` is source `n + 1`.
#[derive(Debug, Clone, Copy)]
struct Line(u16);

// SAFETY: numbers come from `IrqSource`, which is bounded by IRQ_SOURCES.
unsafe impl InterruptNumber for Line {
    fn number(self) -> u16 {
        self.0
    }
}

fn line(source: IrqSource) -> Option<Line> {
    source.index().checked_sub(1).map(|n| Line(n as u16))
}

/// Let a device source reach the NVIC.
pub fn unmask_line(source: IrqSource) {
    if let Some(line) = line(source) {
        // SAFETY: the kernel's dispatcher handles every line it unmasks.
        unsafe { NVIC::unmask(line) };
    }
}

pub fn mask_line(source: IrqSource) {
    if let Some(line) = line(source) {
        NVIC::mask(line);
    }
}

fn interrupt_entry(source: IrqSource) {
    if api::on_interrupt(source) {
        request_reschedule();
    }
}

/// SysTick exception handler, the kernel's timer interrupt source.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    interrupt_entry(IrqSource::TIMER);
}

/// Catch-all for device interrupts: the single hardware entry point that
/// feeds the kernel's vector table.
#[no_mangle]
pub unsafe extern "C" fn DefaultHandler() {
    if let VectActive::Interrupt { irqn } = SCB::vect_active() {
        match IrqSource::checked(usize::from(irqn) + 1) {
            Some(source) => interrupt_entry(source),
            None => {
                log::warn!("interrupt line {} has no kernel source", irqn);
                NVIC::mask(Line(u16::from(irqn)));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// Scratch process stack for the very first PendSV, which pushes R4–R11
/// on behalf of "no thread" before switching into the first real one.
static mut BOOT_STACK: [u64; 32] = [0; 32];

/// Configure SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// PendSV and SysTick at the lowest priority, so the switch never
/// preempts a device handler.
pub fn set_interrupt_priorities(scb: &mut SCB) {
    unsafe {
        scb.set_priority(SystemHandler::PendSV, 0xFF);
        scb.set_priority(SystemHandler::SysTick, 0xFF);
    }
}

/// Hand the CPU to the scheduler. **Does not return.**
///
/// The caller has already moved the scheduler to its running phase; the
/// first PendSV selects the highest-priority thread and the main stack is
/// from then on used only by handlers.
pub fn launch(mut core_peripherals: cortex_m::Peripherals) -> ! {
    configure_systick(&mut core_peripherals.SYST);
    set_interrupt_priorities(&mut core_peripherals.SCB);

    unsafe {
        let top = core::ptr::addr_of_mut!(BOOT_STACK) as usize + core::mem::size_of::<[u64; 32]>();
        asm!("msr psp, {0}", "isb", in(reg) top);
    }

    request_reschedule();
    loop {
        halt();
    }
}
