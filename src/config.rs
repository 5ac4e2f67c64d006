//! # IrqOS Configuration
//!
//! Compile-time constants governing the kernel. All limits are fixed at
//! compile time, with no dynamic allocation.

/// Maximum number of threads the system can manage simultaneously.
/// This bounds the static TCB pool. Wait-queues keep one membership bit
/// per thread in a `u32`, so this may not exceed 32.
pub const MAX_THREADS: usize = 16;

/// Number of interrupt sources the vector table can hold. Pending and
/// enable masks are one `u32`, one bit per source.
pub const IRQ_SOURCES: usize = 32;

/// Maximum number of simultaneously armed alarms.
pub const MAX_ALARMS: usize = 16;

/// Timer tick frequency in Hz. Alarms and `sleep` count in these ticks.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

/// Smallest stack a thread may be created with, in bytes. The initial
/// frame alone takes 64 bytes (hardware frame plus R4–R11), and the
/// extended frame adds another 72 when the FPU is in use.
pub const MIN_STACK_SIZE: usize = 256;

/// Size of the idle thread's stack, in 8-byte words.
pub const IDLE_STACK_WORDS: usize = 64;

const _: () = assert!(MAX_THREADS <= 32, "wait-queue bitmaps are 32 bits wide");
const _: () = assert!(IRQ_SOURCES <= 32, "interrupt masks are 32 bits wide");
const _: () = assert!(MAX_ALARMS <= u8::MAX as usize);
