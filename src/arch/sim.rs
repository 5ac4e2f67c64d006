//! # Simulated CPU Port
//!
//! A register file in memory standing in for the processor on host
//! builds. `SimCpu` holds the *live* registers; saving copies them into
//! the outgoing TCB and restoring copies a TCB's snapshot back.
//!
//! Nothing executes here: a thread "resumes" when its registers are live
//! again, which is exactly what the round-trip tests check.

use super::ContextSwitch;
use crate::irq::IrqSource;
use crate::thread::{Stack, ThreadEntry};

/// Thread-mode status word for a freshly created thread.
pub const INITIAL_STATUS: u32 = 0x0000_001F;

/// Extended (floating-point) register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpuState {
    pub regs: [u64; 16],
    pub fpscr: u32,
}

impl FpuState {
    pub const fn new() -> Self {
        Self {
            regs: [0; 16],
            fpscr: 0,
        }
    }
}

/// Full register snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    /// General registers r0–r12.
    pub gpr: [usize; 13],
    pub sp: usize,
    pub lr: usize,
    pub pc: usize,
    pub status: u32,
    /// Present once a thread has touched the coprocessor.
    pub fpu: Option<FpuState>,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            gpr: [0; 13],
            sp: 0,
            lr: 0,
            pc: 0,
            status: 0,
            fpu: None,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Lay out the first-run state: execution starts at `entry` with `arg` in
/// r0 and the stack pointer at the top of the region.
pub fn init_context(context: &mut Context, entry: ThreadEntry, arg: usize, stack: &Stack) {
    *context = Context::new();
    context.gpr[0] = arg;
    context.sp = stack.top();
    context.pc = entry as usize;
    context.status = INITIAL_STATUS;
}

/// The simulated processor.
#[derive(Debug, Clone, Default)]
pub struct SimCpu {
    /// Registers of whatever is executing right now.
    pub regs: Context,
    pub saves: usize,
    pub restores: usize,
}

impl SimCpu {
    pub const fn new() -> Self {
        Self {
            regs: Context::new(),
            saves: 0,
            restores: 0,
        }
    }
}

impl ContextSwitch for SimCpu {
    fn save(&mut self, context: &mut Context) {
        *context = self.regs;
        self.saves += 1;
    }

    fn restore(&mut self, context: &Context) {
        self.regs = *context;
        self.restores += 1;
    }
}

/// Run the reschedule check against the global kernel. There is no second
/// stack to jump to on the host, so only the bookkeeping happens.
pub fn request_reschedule() {
    crate::api::with_kernel(|kernel| {
        let mut cpu = SimCpu::new();
        kernel.scheduler.reschedule_with(&mut cpu);
    });
}

/// Wait for the next interrupt.
pub fn halt() {
    core::hint::spin_loop();
}

/// No interrupt controller lines to touch on the host.
pub fn unmask_line(_source: IrqSource) {}

pub fn mask_line(_source: IrqSource) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(_: usize) {}

    #[test]
    fn test_save_restore_round_trip() {
        let mut cpu = SimCpu::new();
        cpu.regs.gpr = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];
        cpu.regs.sp = 0x2000_1000;
        cpu.regs.lr = 0x0800_0101;
        cpu.regs.pc = 0x0800_0200;
        cpu.regs.status = 0x6000_001F;
        cpu.regs.fpu = Some(FpuState {
            regs: [0x3FF0_0000_0000_0000; 16],
            fpscr: 0x0300_0000,
        });
        let before = cpu.regs;

        let mut saved = Context::new();
        cpu.save(&mut saved);
        cpu.regs = Context::new();
        cpu.restore(&saved);

        assert_eq!(cpu.regs, before);
        assert_eq!((cpu.saves, cpu.restores), (1, 1));
    }

    #[test]
    fn test_initial_context() {
        let stack = Stack::new(Box::leak(Box::new([0u64; 64])));
        let mut context = Context::new();
        init_context(&mut context, entry, 7, &stack);

        assert_eq!(context.gpr[0], 7);
        assert_eq!(context.sp, stack.top());
        assert_eq!(context.pc, entry as usize);
        assert_eq!(context.status, INITIAL_STATUS);
        assert!(context.fpu.is_none());
    }
}
