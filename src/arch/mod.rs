//! # Architecture Abstraction Layer
//!
//! The one non-portable piece of the kernel: capturing and reinstating a
//! thread's machine state. The scheduler only ever talks to it through
//! [`ContextSwitch`] and the handful of free functions re-exported here.
//!
//! - `cortex_m4`: the real port, PendSV-driven, for bare-metal ARM targets.
//! - `sim`: an in-memory register file used on the host, so the scheduler
//!   above it can be exercised by ordinary unit tests.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub use self::cortex_m4::{halt, init_context, mask_line, request_reschedule, unmask_line, Context};

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub mod sim;
#[cfg(not(all(target_arch = "arm", target_os = "none")))]
pub use self::sim::{halt, init_context, mask_line, request_reschedule, unmask_line, Context};

/// Context Switch Engine contract.
///
/// Both calls run with interrupts masked and are not reentrant. After
/// `restore`, the target thread continues as if the interrupt that
/// preempted it had simply returned in its own frame.
pub trait ContextSwitch {
    /// Capture the state of the thread that is about to stop running.
    fn save(&mut self, context: &mut Context);

    /// Reinstate a previously saved state.
    fn restore(&mut self, context: &Context);
}
