//! # IrqOS
//!
//! A small real-time kernel for ARM Cortex-M4 microcontrollers in which
//! every scheduling decision is taken on the way out of an interrupt.
//!
//! ## Overview
//!
//! Threads run at fixed priorities. Nothing switches them mid-handler and
//! nothing switches them from ordinary code: a handler (or a thread) that
//! wakes somebody only raises a flag, and the flag is consulted exactly
//! once, at interrupt return. Every other code path is therefore atomic
//! with respect to scheduling.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                 Application Threads                    │
//! ├────────────────────────────────────────────────────────┤
//! │            Kernel API (api.rs, mailbox.rs)             │
//! │  create_thread · sleep_on · wait_irq · send · receive  │
//! ├──────────────┬──────────────────┬──────────────────────┤
//! │  Interrupts  │  Message Queues  │  Alarms              │
//! │  irq.rs      │  message.rs      │  alarm.rs            │
//! │  ─ vectors   │  ─ send / jam    │  ─ one-shot          │
//! │  ─ IME/IE/IF │  ─ receive       │  ─ periodic          │
//! ├──────────────┴──────────────────┴──────────────────────┤
//! │        Kernel (kernel.rs) · dispatch · ticks           │
//! ├────────────────────────────────────────────────────────┤
//! │  Scheduler (scheduler.rs) · Wait-Queues (wait_queue.rs)│
//! │        reschedule · sleep_on · wake_one / wake_all     │
//! ├────────────────────────────────────────────────────────┤
//! │         Threads (thread.rs) · TCB pool · ready list    │
//! ├────────────────────────────────────────────────────────┤
//! │    Arch Port (arch/cortex_m4.rs, arch/sim.rs)          │
//! │       PendSV · SysTick · save / restore context        │
//! ├────────────────────────────────────────────────────────┤
//! │         ARM Cortex-M4 Hardware (Thumb-2)               │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Scheduling Model
//!
//! - Priorities `0..=31`, 0 most urgent; FIFO among equals
//! - The running thread is always the first runnable thread on the
//!   priority-ordered ready list as of the last reschedule check
//! - Threads give up the CPU only by blocking (wait-queue, message queue,
//!   join, sleep), by yielding, or by being preempted at interrupt return
//! - Wait-queues wake in FIFO order
//!
//! ## Memory Model
//!
//! - **No heap**: All state is statically allocated
//! - **No `alloc`**: Pure `core` only
//! - **Fixed-size TCB pool**: `[Tcb; MAX_THREADS]`, links are indices
//! - **Caller-supplied stacks**: no dynamic growth
//! - **Critical sections**: `critical_section::with()` for shared state
//!
//! ## Host Builds
//!
//! Everything above the port layer is portable. On the host the `sim`
//! port stands in for the processor, so the kernel runs under
//! `cargo test`.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod arch;
pub mod thread;
pub mod wait_queue;
pub mod scheduler;
pub mod irq;
pub mod message;
pub mod alarm;
pub mod kernel;
pub mod sync;
pub mod api;
pub mod mailbox;

pub use error::{KernelError, QueueError, SendError};
pub use mailbox::Mailbox;
pub use thread::{Priority, Stack, ThreadId};
