//! # Kernel API
//!
//! The global kernel instance and the thread-context entry points to it.
//!
//! Each call takes the kernel inside a short critical section. Calls that
//! may block do their blocking step there, then leave the critical section
//! and pend a reschedule; the switch happens on the way out of that
//! interrupt, and the call re-checks its condition once the thread is
//! resumed.
//!
//! ## Startup Sequence
//!
//! ```text
//! reset_handler (cortex-m-rt)
//!   └─► main()
//!         ├─► api::init()            ← timer handler, master enable
//!         ├─► api::create_thread()   ← register threads (×N)
//!         ├─► api::install_handler() ← drivers hook their sources
//!         └─► api::start()           ← idle thread, SysTick, first switch
//! ```
//!
//! Interrupt handlers and alarm callbacks must not call into this module:
//! they already run with the kernel borrowed and get it (or the
//! scheduler) passed in directly. `Mailbox::post` is their way to send.

use crate::alarm::{AlarmAction, AlarmId, Tick};
use crate::arch;
use crate::error::KernelError;
use crate::irq::{Handler, IrqMask, IrqSource};
use crate::kernel::{Kernel, WaitOutcome};
use crate::scheduler::{Phase, SwitchCallback};
use crate::sync::{critical_section, CriticalSection, Shared};
use crate::thread::{Priority, Stack, ThreadEntry, ThreadId};
use crate::wait_queue::WaitQueue;

/// Global kernel instance.
static KERNEL: Shared<Kernel> = Shared::new(Kernel::new());

/// Run `f` on the global kernel inside a critical section.
///
/// # Panics
/// If called again from inside `f`.
pub fn with_kernel<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    KERNEL.lock(f)
}

pub(crate) fn with_kernel_in<R>(cs: CriticalSection<'_>, f: impl FnOnce(&mut Kernel) -> R) -> R {
    KERNEL.lock_in(cs, f)
}

/// Run `f` on the kernel and a user wait-queue together.
fn with_queue<R>(queue: &Shared<WaitQueue>, f: impl FnOnce(&mut Kernel, &mut WaitQueue) -> R) -> R {
    critical_section(|cs| queue.lock_in(cs, |queue| KERNEL.lock_in(cs, |kernel| f(kernel, queue))))
}

/// Let a pending reschedule happen now instead of at the next interrupt.
pub(crate) fn reschedule_point() {
    let wanted = with_kernel(|kernel| {
        kernel.scheduler.needs_reschedule() && kernel.scheduler.phase() == Phase::Running
    });
    if wanted {
        arch::request_reschedule();
    }
}

/// Interrupt entry from the port layer: latch and dispatch `source`.
/// Returns whether the port should perform a reschedule on its way out.
pub(crate) fn on_interrupt(source: IrqSource) -> bool {
    with_kernel(|kernel| kernel.service(source))
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Initialize the kernel. Must be called once, before any other call.
pub fn init() {
    with_kernel(Kernel::init);
}

/// Create a READY thread running `entry(arg)` on `stack`.
pub fn create_thread(
    entry: ThreadEntry,
    arg: usize,
    stack: Stack,
    priority: Priority,
) -> Result<ThreadId, KernelError> {
    let id = with_kernel(|kernel| kernel.scheduler.create_thread(entry, arg, stack, priority))?;
    reschedule_point();
    Ok(id)
}

/// Start scheduling. **Does not return.**
///
/// Creates the idle thread, leaves the bootstrap phase and hands the CPU
/// to the highest-priority thread.
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub fn start(core_peripherals: cortex_m::Peripherals) -> ! {
    use crate::config::IDLE_STACK_WORDS;

    static mut IDLE_STACK: [u64; IDLE_STACK_WORDS] = [0; IDLE_STACK_WORDS];

    // SAFETY: `start` runs once; the idle thread is the only user.
    let stack = unsafe {
        Stack::from_raw(
            core::ptr::addr_of_mut!(IDLE_STACK) as usize,
            IDLE_STACK_WORDS * core::mem::size_of::<u64>(),
        )
    };
    with_kernel(|kernel| {
        if let Err(err) = kernel.scheduler.create_idle_thread(idle, stack) {
            log::error!("idle thread: {}", err);
        }
        kernel.scheduler.start();
    });
    arch::cortex_m4::launch(core_peripherals)
}

#[cfg(all(target_arch = "arm", target_os = "none"))]
fn idle(_: usize) {
    loop {
        arch::halt();
    }
}

// ---------------------------------------------------------------------------
// Threads
// ---------------------------------------------------------------------------

pub fn current_thread() -> Option<ThreadId> {
    with_kernel(|kernel| kernel.scheduler.current())
}

/// Let equal-priority threads run.
pub fn yield_now() {
    if with_kernel(|kernel| kernel.scheduler.yield_current()).is_ok() {
        arch::request_reschedule();
    }
}

/// Terminate the calling thread. Threads whose entry returns end up here.
pub fn exit_thread() -> ! {
    if let Err(err) = with_kernel(|kernel| kernel.scheduler.exit_current()) {
        log::error!("exit outside a thread: {}", err);
    }
    loop {
        arch::request_reschedule();
        arch::halt();
    }
}

/// Terminate a thread that is not blocked.
pub fn kill(id: ThreadId) -> Result<(), KernelError> {
    with_kernel(|kernel| kernel.scheduler.kill(id))?;
    reschedule_point();
    Ok(())
}

/// Block until `id` has terminated.
///
/// The wait ends at the first wake: `id` is not looked up again, as its
/// slot may already belong to a new thread. A direct [`wakeup`] also
/// ends it early.
pub fn join(id: ThreadId) -> Result<(), KernelError> {
    if with_kernel(|kernel| kernel.scheduler.join(id))? {
        return Ok(());
    }
    arch::request_reschedule();
    with_kernel(|kernel| kernel.scheduler.finish_join(id));
    Ok(())
}

/// Make a blocked thread READY, whatever it is waiting for.
pub fn wakeup(id: ThreadId) -> bool {
    let woken = with_kernel(|kernel| kernel.scheduler.wake_thread(id));
    reschedule_point();
    woken
}

/// Returns the previous priority.
pub fn set_priority(id: ThreadId, priority: Priority) -> Result<Priority, KernelError> {
    let previous = with_kernel(|kernel| kernel.scheduler.set_priority(id, priority))?;
    reschedule_point();
    Ok(previous)
}

/// Suspend thread switching. Nestable.
pub fn lock_scheduler() -> u32 {
    with_kernel(|kernel| kernel.scheduler.lock())
}

pub fn unlock_scheduler() -> u32 {
    let depth = with_kernel(|kernel| kernel.scheduler.unlock());
    if depth == 0 {
        reschedule_point();
    }
    depth
}

pub fn set_switch_callback(callback: Option<SwitchCallback>) -> Option<SwitchCallback> {
    with_kernel(|kernel| kernel.scheduler.set_switch_callback(callback))
}

// ---------------------------------------------------------------------------
// Wait-queues
// ---------------------------------------------------------------------------

/// Block the calling thread on `queue` until some wake reaches it.
pub fn sleep_on(queue: &Shared<WaitQueue>) -> Result<(), KernelError> {
    with_queue(queue, |kernel, queue| kernel.scheduler.sleep_on(queue))?;
    arch::request_reschedule();
    Ok(())
}

/// Sleep on `queue` until `condition` holds.
///
/// `condition` is evaluated inside the critical section, so a wake cannot
/// slip in between the check and the sleep. It must not call into the
/// kernel.
pub fn wait_for(queue: &Shared<WaitQueue>, mut condition: impl FnMut() -> bool) -> Result<(), KernelError> {
    loop {
        let slept = with_queue(queue, |kernel, queue| {
            if condition() {
                kernel.scheduler.leave(queue);
                return Ok(false);
            }
            kernel.scheduler.sleep_on(queue).map(|_| true)
        })?;
        if !slept {
            return Ok(());
        }
        arch::request_reschedule();
    }
}

/// Sleep on `queue` for at most `timeout` ticks.
pub fn wait_on_timeout(queue: &Shared<WaitQueue>, timeout: Tick) -> Result<WaitOutcome, KernelError> {
    let wait = with_queue(queue, |kernel, queue| kernel.wait_timeout(queue, timeout))?;
    arch::request_reschedule();
    Ok(with_queue(queue, |kernel, queue| kernel.finish_wait(queue, wait)))
}

pub fn wake_one(queue: &Shared<WaitQueue>) -> Option<ThreadId> {
    let woken = with_queue(queue, |kernel, queue| kernel.scheduler.wake_one(queue));
    reschedule_point();
    woken
}

pub fn wake_all(queue: &Shared<WaitQueue>) -> usize {
    let woken = with_queue(queue, |kernel, queue| kernel.scheduler.wake_all(queue));
    reschedule_point();
    woken
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

/// Register the handler for `source`, returning the previous one.
pub fn install_handler(source: IrqSource, handler: Option<Handler>) -> Option<Handler> {
    with_kernel(|kernel| kernel.irq.install(source, handler))
}

/// Enable sources in the kernel and at the interrupt controller. Returns
/// the previous enable mask.
pub fn enable_irq(mask: IrqMask) -> IrqMask {
    let previous = with_kernel(|kernel| kernel.irq.enable(mask));
    mask.iter().for_each(arch::unmask_line);
    previous
}

pub fn disable_irq(mask: IrqMask) -> IrqMask {
    mask.iter().for_each(arch::mask_line);
    with_kernel(|kernel| kernel.irq.disable(mask))
}

/// Block until a source in `mask` has fired, returning the ones that
/// did. With `clear`, earlier firings are forgotten first.
///
/// Before the scheduler runs there is no thread to block, so this falls
/// back to [`wait_interrupt`].
pub fn wait_irq(clear: bool, mask: IrqMask) -> IrqMask {
    if clear {
        with_kernel(|kernel| kernel.irq.clear_check(mask));
    }
    loop {
        match with_kernel(|kernel| kernel.irq_wait(mask)) {
            Ok(Some(fired)) => return fired,
            Ok(None) => arch::request_reschedule(),
            Err(_) => return wait_interrupt(false, mask),
        }
    }
}

/// Block until the next interrupt of any kind.
pub fn wait_any_irq() {
    match with_kernel(|kernel| kernel.irq_wait_any()) {
        Ok(_) => arch::request_reschedule(),
        Err(_) => arch::halt(),
    }
}

/// Halt the CPU in place until a source in `mask` has fired. No thread
/// switch; this is what early boot code uses.
pub fn wait_interrupt(clear: bool, mask: IrqMask) -> IrqMask {
    if clear {
        with_kernel(|kernel| kernel.irq.clear_check(mask));
    }
    loop {
        // Halting inside the critical section still wakes on a pending
        // interrupt, which then runs as soon as the section ends.
        let fired = critical_section(|cs| {
            let fired = with_kernel_in(cs, |kernel| kernel.irq.check_flags() & mask);
            if fired.is_empty() {
                arch::halt();
            }
            fired
        });
        if !fired.is_empty() {
            return fired;
        }
    }
}

// ---------------------------------------------------------------------------
// Time and alarms
// ---------------------------------------------------------------------------

pub fn ticks() -> Tick {
    with_kernel(|kernel| kernel.ticks())
}

/// Block the calling thread for `ticks` timer ticks.
pub fn sleep(ticks: Tick) {
    let deadline = with_kernel(|kernel| kernel.ticks()) + ticks;
    loop {
        match with_kernel(|kernel| kernel.sleep_until(deadline)) {
            Ok(None) => return,
            Ok(Some(alarm)) => {
                arch::request_reschedule();
                with_kernel(|kernel| kernel.cancel_alarm(alarm));
            }
            Err(KernelError::NoCurrentThread) => arch::halt(),
            Err(err) => {
                log::warn!("sleep: {}", err);
                return;
            }
        }
    }
}

pub fn set_alarm(delay: Tick, action: AlarmAction) -> Result<AlarmId, KernelError> {
    with_kernel(|kernel| kernel.set_alarm(delay, action))
}

pub fn set_periodic_alarm(start: Tick, period: Tick, action: AlarmAction) -> Result<AlarmId, KernelError> {
    with_kernel(|kernel| kernel.set_periodic_alarm(start, period, action))
}

pub fn cancel_alarm(id: AlarmId) -> bool {
    with_kernel(|kernel| kernel.cancel_alarm(id))
}

pub fn set_alarm_tag(id: AlarmId, tag: u32) -> bool {
    with_kernel(|kernel| kernel.alarms.set_tag(id, tag))
}

pub fn cancel_alarms(tag: u32) -> usize {
    with_kernel(|kernel| kernel.alarms.cancel_tagged(tag))
}

pub fn cancel_all_alarms() -> usize {
    with_kernel(|kernel| kernel.alarms.cancel_all())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;

    fn noop(_: usize) {}

    fn nothing(_: &mut Scheduler, _: usize) {}

    // The global kernel is shared by every test in the crate, so all of
    // its checks live in this one function.
    #[test]
    fn test_global_kernel() {
        init();
        let before = ticks();
        assert!(!on_interrupt(IrqSource::TIMER));
        assert_eq!(ticks(), before + 1);

        let stack = Stack::new(Box::leak(Box::new([0u64; 64])));
        let id = create_thread(noop, 3, stack, Priority::new(4).unwrap()).unwrap();
        assert_eq!(current_thread(), None);
        assert_eq!(set_priority(id, Priority::new(2).unwrap()), Ok(Priority::new(4).unwrap()));
        assert!(!wakeup(id));

        let source = IrqSource::new(6);
        assert!(install_handler(source, Some(Handler::Notify)).is_none());
        assert!(!enable_irq(source.mask()).contains(source));
        on_interrupt(source);
        assert_eq!(wait_irq(false, source.mask()), source.mask());
        assert_eq!(wait_interrupt(false, source.mask()), source.mask());
        assert!(disable_irq(source.mask()).contains(source));

        let alarm = set_alarm(100, AlarmAction::Call(nothing, 0)).unwrap();
        assert!(set_alarm_tag(alarm, 9));
        assert_eq!(cancel_alarms(9), 1);
        assert!(!cancel_alarm(alarm));
        set_periodic_alarm(0, 50, AlarmAction::Call(nothing, 0)).unwrap();
        assert_eq!(cancel_all_alarms(), 1);

        let queue = Shared::new(WaitQueue::new());
        assert_eq!(wake_all(&queue), 0);
        assert_eq!(wake_one(&queue), None);
        assert_eq!(sleep_on(&queue), Err(KernelError::NoCurrentThread));
        assert_eq!(wait_for(&queue, || true), Ok(()));

        assert_eq!(lock_scheduler(), 1);
        assert_eq!(unlock_scheduler(), 0);
        assert_eq!(kill(id), Ok(()));
        assert_eq!(join(id), Ok(()));
    }
}
