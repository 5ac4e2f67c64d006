//! # Kernel
//!
//! The single kernel context object: scheduler, interrupt controller,
//! alarm pool and tick counter. The port layer owns one instance (see
//! [`api`](crate::api)) and drives it from its interrupt entry; tests
//! build their own and drive it directly.
//!
//! ## Interrupt Path
//!
//! ```text
//! hardware IRQ
//!   └─► Kernel::interrupt()
//!         ├─► dispatch()            ← one source per pass, lowest first
//!         │     ├─► clear IF bit
//!         │     ├─► vector table handler (may wake / post)
//!         │     ├─► latch check flag
//!         │     └─► wake IRQ waiters
//!         └─► Scheduler::reschedule_with()
//!               └─► save / restore through the Context Switch Engine
//! ```
//!
//! Blocking operations here are split into a step that puts the caller to
//! sleep and a check the caller repeats once it is resumed. The loops that
//! drive them from thread context live in `api`.

use crate::alarm::{periodic_start, AlarmAction, AlarmId, AlarmQueue, Tick};
use crate::arch::ContextSwitch;
use crate::error::KernelError;
use crate::irq::{Handler, InterruptController, IrqMask, IrqSource};
use crate::scheduler::{Scheduler, Switch};
use crate::thread::ThreadId;
use crate::wait_queue::WaitQueue;

/// What a hardware interrupt amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// Nothing pending and enabled: no thread state was touched.
    Spurious,
    Handled {
        source: IrqSource,
        /// The context switch performed on the way out, if any.
        switched: Option<Switch>,
    },
}

/// A wait with a deadline in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedWait {
    alarm: AlarmId,
}

/// How a wait with a deadline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
}

pub struct Kernel {
    pub scheduler: Scheduler,
    pub irq: InterruptController,
    pub alarms: AlarmQueue,
    ticks: Tick,
}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
            irq: InterruptController::new(),
            alarms: AlarmQueue::new(),
            ticks: 0,
        }
    }

    /// Hook the tick handler to the timer source and open the master
    /// enable. Device sources stay disabled until a driver enables them.
    pub fn init(&mut self) {
        self.irq.install(IrqSource::TIMER, Some(Handler::Func(timer_tick)));
        self.irq.enable(IrqSource::TIMER.mask());
        self.irq.enable_master();
        log::info!("kernel initialized");
    }

    /// Timer ticks since `init`.
    #[inline]
    pub fn ticks(&self) -> Tick {
        self.ticks
    }

    // -----------------------------------------------------------------------
    // Interrupt dispatch
    // -----------------------------------------------------------------------

    /// One dispatch pass: service the lowest-numbered pending-and-enabled
    /// source. Returns `None` without touching anything when there is none
    /// or the master enable is off.
    pub fn dispatch(&mut self) -> Option<IrqSource> {
        if !self.irq.master_enabled() {
            return None;
        }
        let source = self.irq.take_next()?;
        log::trace!("dispatch {}", source);

        match self.irq.handler(source) {
            Some(Handler::Func(handler)) => handler(self, source),
            Some(Handler::Notify) => {}
            None => {
                if cfg!(debug_assertions) {
                    log::error!("{} fired with no handler installed", source);
                    panic!("kernel configuration error: {} fired with no handler installed", source);
                }
            }
        }

        self.irq.set_check(source.mask());
        self.scheduler.wake_all(&mut self.irq.waiters);
        Some(source)
    }

    /// Full interrupt: one dispatch pass, then the reschedule check on the
    /// way out.
    pub fn interrupt<E: ContextSwitch>(&mut self, engine: &mut E) -> IrqReturn {
        let Some(source) = self.dispatch() else {
            return IrqReturn::Spurious;
        };
        let switched = self.scheduler.reschedule_with(engine);
        IrqReturn::Handled { source, switched }
    }

    /// Latch `source` as pending and dispatch until nothing is left.
    /// Returns whether a reschedule is wanted.
    pub fn service(&mut self, source: IrqSource) -> bool {
        self.irq.raise(source);
        while self.dispatch().is_some() {}
        self.scheduler.needs_reschedule()
    }

    // -----------------------------------------------------------------------
    // Waiting for interrupts
    // -----------------------------------------------------------------------

    /// Wait until a source in `mask` has its check flag set.
    ///
    /// Returns the flagged sources once there are any, or `None` after
    /// putting the caller to sleep until the next dispatch.
    pub fn irq_wait(&mut self, mask: IrqMask) -> Result<Option<IrqMask>, KernelError> {
        let fired = self.irq.check_flags() & mask;
        if !fired.is_empty() {
            self.scheduler.leave(&mut self.irq.waiters);
            return Ok(Some(fired));
        }
        self.scheduler.sleep_on(&mut self.irq.waiters)?;
        Ok(None)
    }

    /// Sleep until the next interrupt of any kind is dispatched.
    pub fn irq_wait_any(&mut self) -> Result<ThreadId, KernelError> {
        self.scheduler.sleep_on(&mut self.irq.waiters)
    }

    // -----------------------------------------------------------------------
    // Alarms and time
    // -----------------------------------------------------------------------

    /// One-shot alarm `delay` ticks from now.
    pub fn set_alarm(&mut self, delay: Tick, action: AlarmAction) -> Result<AlarmId, KernelError> {
        self.alarms.arm(self.ticks + delay, 0, action)
    }

    /// Periodic alarm whose period counts from the absolute tick `start`.
    /// If `start` has already passed, the first firing is the next
    /// multiple of `period` after it.
    pub fn set_periodic_alarm(
        &mut self,
        start: Tick,
        period: Tick,
        action: AlarmAction,
    ) -> Result<AlarmId, KernelError> {
        if period == 0 {
            return Err(KernelError::InvalidPeriod);
        }
        let due = periodic_start(self.ticks, start, period);
        self.alarms.arm(due, period, action)
    }

    pub fn cancel_alarm(&mut self, id: AlarmId) -> bool {
        self.alarms.cancel(id)
    }

    /// Block the running thread until tick `deadline`. Returns `None` if
    /// the deadline has already been reached, otherwise the wake-up alarm,
    /// to be cancelled if the thread is resumed early.
    pub fn sleep_until(&mut self, deadline: Tick) -> Result<Option<AlarmId>, KernelError> {
        if self.ticks >= deadline {
            return Ok(None);
        }
        let id = self.scheduler.block_current()?;
        match self.alarms.arm(deadline, 0, AlarmAction::Wake(id)) {
            Ok(alarm) => Ok(Some(alarm)),
            Err(err) => {
                self.scheduler.wake_thread(id);
                Err(err)
            }
        }
    }

    /// Sleep on `queue` with a forced wake after `timeout` ticks.
    /// Conclude with [`finish_wait`](Self::finish_wait) once resumed.
    pub fn wait_timeout(&mut self, queue: &mut WaitQueue, timeout: Tick) -> Result<TimedWait, KernelError> {
        let id = self.scheduler.sleep_on(queue)?;
        match self.set_alarm(timeout, AlarmAction::Wake(id)) {
            Ok(alarm) => Ok(TimedWait { alarm }),
            Err(err) => {
                self.scheduler.cancel_sleep(queue, id);
                Err(err)
            }
        }
    }

    /// The wait timed out if the deadline alarm has already fired or the
    /// caller is still linked into `queue`. A deadline that passes before
    /// the woken caller gets to run counts as a timeout too.
    pub fn finish_wait(&mut self, queue: &mut WaitQueue, wait: TimedWait) -> WaitOutcome {
        let fired = !self.alarms.cancel(wait.alarm);
        let linked = self.scheduler.leave(queue);
        if fired || linked {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Woken
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for `IrqSource::TIMER`: advance the tick and fire due alarms.
fn timer_tick(kernel: &mut Kernel, _source: IrqSource) {
    kernel.ticks += 1;
    kernel.alarms.fire_due(kernel.ticks, &mut kernel.scheduler);
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
