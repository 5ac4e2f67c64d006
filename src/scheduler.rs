//! # Scheduler
//!
//! Core scheduling logic for IrqOS: a priority scheduler whose only
//! preemption point is the tail of interrupt handling.
//!
//! ## Reschedule Algorithm
//!
//! Anything that changes a thread's state raises `needs_reschedule`. At
//! interrupt return the flag is consulted exactly once:
//! 1. **Fast path**: flag clear → return (O(1))
//! 2. **Clear** the flag
//! 3. **Select**: the first runnable thread on the priority-ordered ready
//!    list; if there is none, keep `current`
//! 4. **Same thread**: nothing to switch
//! 5. **Switch**: previous `current` goes back to Ready (unless it blocked
//!    or terminated), the selected thread becomes Running, the switch
//!    callback fires, and the Context Switch Engine swaps registers
//!
//! Every other code path is therefore atomic with respect to scheduling;
//! thread-context callers only need interrupts masked around their own
//! short critical sections.

use crate::arch::ContextSwitch;
use crate::config::MIN_STACK_SIZE;
use crate::error::{configuration_error, KernelError};
use crate::thread::{Priority, ReadyIter, Stack, Tcb, ThreadEntry, ThreadId, ThreadPool, ThreadState};
use crate::wait_queue::WaitQueue;

/// Observability hook invoked on every switch, before registers move.
pub type SwitchCallback = fn(from: Option<ThreadId>, to: ThreadId);

/// Lifecycle of the scheduler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before `start`: threads may be created, but nothing runs them and
    /// blocking primitives fall back to halting in place.
    Bootstrap,
    /// Threads are being scheduled.
    Running,
}

/// Outcome of a reschedule that picked a different thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    /// `None` for the very first switch out of the bootstrap context.
    pub from: Option<ThreadId>,
    pub to: ThreadId,
}

/// Scheduler state: the TCB pool, the ready list, `current` and the
/// reschedule flag. One instance per CPU core.
pub struct Scheduler {
    pool: ThreadPool,
    current: Option<ThreadId>,
    /// Never killed, so something is always runnable.
    idle: Option<ThreadId>,
    needs_reschedule: bool,
    phase: Phase,
    lock_depth: u32,
    switch_callback: Option<SwitchCallback>,
    switch_count: u32,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            pool: ThreadPool::new(),
            current: None,
            idle: None,
            needs_reschedule: false,
            phase: Phase::Bootstrap,
            lock_depth: 0,
            switch_callback: None,
            switch_count: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    #[inline]
    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    pub fn needs_reschedule(&self) -> bool {
        self.needs_reschedule
    }

    /// Number of context switches performed so far.
    #[inline]
    pub fn switch_count(&self) -> u32 {
        self.switch_count
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock_depth > 0
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Tcb> {
        self.pool.get(id)
    }

    pub fn state(&self, id: ThreadId) -> Option<ThreadState> {
        self.pool.get(id).map(Tcb::state)
    }

    /// Live threads in scheduling order.
    pub fn threads(&self) -> ReadyIter<'_> {
        self.pool.iter()
    }

    /// Raise the reschedule flag without changing any thread.
    #[inline]
    pub fn request_reschedule(&mut self) {
        self.needs_reschedule = true;
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a READY thread on a caller-supplied stack.
    ///
    /// # Errors
    /// - `StackTooSmall` if the stack is below `MIN_STACK_SIZE`
    /// - `PoolExhausted` if every TCB is taken (fatal in debug builds)
    pub fn create_thread(
        &mut self,
        entry: ThreadEntry,
        arg: usize,
        stack: Stack,
        priority: Priority,
    ) -> Result<ThreadId, KernelError> {
        if stack.size() < MIN_STACK_SIZE {
            return Err(KernelError::StackTooSmall(stack.size()));
        }
        let id = self
            .pool
            .allocate(entry, arg, stack, priority)
            .ok_or_else(|| configuration_error(KernelError::PoolExhausted))?;
        self.pool.link(id);
        if self.phase == Phase::Running {
            self.needs_reschedule = true;
        }
        log::info!("created {} at priority {}", id, priority.level());
        Ok(id)
    }

    /// Create the idle thread at `Priority::IDLE`. It cannot be killed.
    pub fn create_idle_thread(&mut self, entry: ThreadEntry, stack: Stack) -> Result<ThreadId, KernelError> {
        let id = self.create_thread(entry, 0, stack, Priority::IDLE)?;
        self.idle = Some(id);
        Ok(id)
    }

    #[inline]
    pub fn idle_thread(&self) -> Option<ThreadId> {
        self.idle
    }

    /// Leave the bootstrap phase. The next reschedule check picks the
    /// first thread to run.
    pub fn start(&mut self) {
        self.phase = Phase::Running;
        self.needs_reschedule = true;
        log::info!("scheduler running with {} threads", self.pool.len());
    }

    /// Terminate the running thread. It keeps the CPU until the next
    /// reschedule check, which never selects it again.
    pub fn exit_current(&mut self) -> Result<ThreadId, KernelError> {
        let id = self.running_thread()?;
        self.terminate(id);
        Ok(id)
    }

    /// Terminate a READY or RUNNING thread. Blocked threads cannot be
    /// cancelled: only a matching wake gets them out. The idle thread
    /// cannot be killed at all.
    pub fn kill(&mut self, id: ThreadId) -> Result<(), KernelError> {
        if self.idle == Some(id) {
            return Err(KernelError::IdleThread(id));
        }
        let state = self.pool.get(id).ok_or(KernelError::NoSuchThread(id))?.state();
        match state {
            ThreadState::Blocked => Err(KernelError::ThreadBlocked(id)),
            ThreadState::Terminated => Ok(()),
            ThreadState::Ready | ThreadState::Running => {
                self.terminate(id);
                Ok(())
            }
        }
    }

    /// Wait for `target` to terminate.
    ///
    /// Returns `Ok(true)` if it already has. `Ok(false)` means the caller
    /// was put to sleep; once resumed it concludes with
    /// [`finish_join`](Self::finish_join) and must not join again, since
    /// the slot may by then hold a new thread under the same id.
    pub fn join(&mut self, target: ThreadId) -> Result<bool, KernelError> {
        let state = self
            .pool
            .get(target)
            .ok_or(KernelError::NoSuchThread(target))?
            .state();
        if state == ThreadState::Terminated {
            return Ok(true);
        }
        if self.current == Some(target) {
            return Err(KernelError::InvalidState { thread: target, state });
        }
        let mut joiners = core::mem::take(&mut self.pool[target].joiners);
        let slept = self.sleep_on(&mut joiners);
        self.pool[target].joiners = joiners;
        slept.map(|_| false)
    }

    /// End a `join` after the caller was resumed. Returns `true` if the
    /// caller was still linked to `target`'s joiners, i.e. it was woken
    /// directly rather than by the target terminating.
    pub fn finish_join(&mut self, target: ThreadId) -> bool {
        let mut joiners = core::mem::take(&mut self.pool[target].joiners);
        let left = self.leave(&mut joiners);
        self.pool[target].joiners = joiners;
        left
    }

    fn terminate(&mut self, id: ThreadId) {
        self.pool.unlink(id);
        self.pool[id].set_state(ThreadState::Terminated);
        let mut joiners = core::mem::take(&mut self.pool[id].joiners);
        self.wake_all(&mut joiners);
        self.pool[id].joiners = joiners;
        self.needs_reschedule = true;
        log::info!("{} terminated", id);
    }

    /// Change a thread's priority and re-sort the ready list. Returns the
    /// previous priority.
    pub fn set_priority(&mut self, id: ThreadId, priority: Priority) -> Result<Priority, KernelError> {
        let tcb = self.pool.get(id).ok_or(KernelError::NoSuchThread(id))?;
        if tcb.state() == ThreadState::Terminated {
            return Err(KernelError::InvalidState {
                thread: id,
                state: ThreadState::Terminated,
            });
        }
        let previous = tcb.priority();
        self.pool.unlink(id);
        self.pool[id].set_priority(priority);
        self.pool.link(id);
        self.needs_reschedule = true;
        Ok(previous)
    }

    /// Move the running thread behind its equal-priority peers.
    pub fn yield_current(&mut self) -> Result<(), KernelError> {
        let id = self.running_thread()?;
        self.pool.unlink(id);
        self.pool.link(id);
        self.needs_reschedule = true;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Blocking and waking
    // -----------------------------------------------------------------------

    /// Block the running thread on `queue`.
    ///
    /// The thread keeps executing until the next reschedule check; callers
    /// in thread context trigger one right after and re-check their
    /// condition when they are resumed.
    ///
    /// A thread already linked into `queue` (left there by a forced wake)
    /// keeps its place. Being linked into any *other* queue aborts.
    pub fn sleep_on(&mut self, queue: &mut WaitQueue) -> Result<ThreadId, KernelError> {
        let id = self.running_thread()?;
        if !queue.contains(id) {
            queue.push(&mut self.pool, id);
        }
        self.pool[id].set_state(ThreadState::Blocked);
        self.needs_reschedule = true;
        Ok(id)
    }

    /// Block the running thread without queueing it anywhere. Only a
    /// direct `wake_thread` resumes it.
    pub fn block_current(&mut self) -> Result<ThreadId, KernelError> {
        let id = self.running_thread()?;
        self.pool[id].set_state(ThreadState::Blocked);
        self.needs_reschedule = true;
        Ok(id)
    }

    /// Unlink the current thread from `queue` if it is still there.
    ///
    /// Only a running thread leaves: seen from an interrupt handler,
    /// `current` may have just blocked on this very queue and must stay
    /// linked to be woken.
    pub fn leave(&mut self, queue: &mut WaitQueue) -> bool {
        match self.current {
            Some(id) if self.pool[id].state() == ThreadState::Running => {
                queue.remove(&mut self.pool, id)
            }
            _ => false,
        }
    }

    /// Wake the longest-waiting blocked thread in `queue`.
    ///
    /// Entries already made runnable by a direct wake are dropped on the
    /// way without counting as the woken thread.
    pub fn wake_one(&mut self, queue: &mut WaitQueue) -> Option<ThreadId> {
        while let Some(id) = queue.pop(&mut self.pool) {
            if self.pool[id].state() == ThreadState::Blocked {
                self.make_ready(id);
                return Some(id);
            }
        }
        None
    }

    /// Wake every blocked thread in `queue`. Returns how many were woken;
    /// an empty queue leaves the reschedule flag alone.
    pub fn wake_all(&mut self, queue: &mut WaitQueue) -> usize {
        let mut woken = 0;
        while let Some(id) = queue.pop(&mut self.pool) {
            if self.pool[id].state() == ThreadState::Blocked {
                self.make_ready(id);
                woken += 1;
            }
        }
        woken
    }

    /// Make a specific blocked thread READY. A thread that is not blocked
    /// is left alone. Queue membership is untouched: the woken thread
    /// unlinks itself with [`leave`](Self::leave) when it resumes.
    pub fn wake_thread(&mut self, id: ThreadId) -> bool {
        match self.pool.get(id) {
            Some(tcb) if tcb.state() == ThreadState::Blocked => {
                self.make_ready(id);
                true
            }
            _ => false,
        }
    }

    /// Undo a `sleep_on` whose thread has not been switched out yet.
    pub(crate) fn cancel_sleep(&mut self, queue: &mut WaitQueue, id: ThreadId) {
        queue.remove(&mut self.pool, id);
        self.wake_thread(id);
    }

    fn make_ready(&mut self, id: ThreadId) {
        self.pool[id].set_state(ThreadState::Ready);
        self.needs_reschedule = true;
    }

    /// The current thread, provided it is actually running.
    fn running_thread(&self) -> Result<ThreadId, KernelError> {
        let id = self.current.ok_or(KernelError::NoCurrentThread)?;
        match self.pool[id].state() {
            ThreadState::Running => Ok(id),
            state => Err(configuration_error(KernelError::InvalidState { thread: id, state })),
        }
    }

    // -----------------------------------------------------------------------
    // Scheduler lock and hooks
    // -----------------------------------------------------------------------

    /// Suspend switching. Nestable; returns the new depth.
    pub fn lock(&mut self) -> u32 {
        self.lock_depth += 1;
        self.lock_depth
    }

    /// Undo one `lock`. A reschedule requested meanwhile stays pending.
    pub fn unlock(&mut self) -> u32 {
        debug_assert!(self.lock_depth > 0, "scheduler unlocked more often than locked");
        self.lock_depth = self.lock_depth.saturating_sub(1);
        self.lock_depth
    }

    /// Install (or clear) the switch callback, returning the previous one.
    pub fn set_switch_callback(&mut self, callback: Option<SwitchCallback>) -> Option<SwitchCallback> {
        core::mem::replace(&mut self.switch_callback, callback)
    }

    // -----------------------------------------------------------------------
    // Reschedule
    // -----------------------------------------------------------------------

    /// The reschedule decision. Updates thread states and `current` and
    /// returns the switch the engine must perform, if any.
    pub fn reschedule(&mut self) -> Option<Switch> {
        if !self.needs_reschedule {
            return None;
        }
        if self.lock_depth > 0 || self.phase == Phase::Bootstrap {
            return None;
        }
        self.needs_reschedule = false;

        let next = self.pool.first_runnable()?;
        if Some(next) == self.current {
            // Woken again before it was switched out
            self.pool[next].set_state(ThreadState::Running);
            return None;
        }

        let from = self.current;
        if let Some(prev) = from {
            if self.pool[prev].state() == ThreadState::Running {
                self.pool[prev].set_state(ThreadState::Ready);
            }
        }
        self.pool[next].set_state(ThreadState::Running);
        self.current = Some(next);
        self.switch_count = self.switch_count.wrapping_add(1);

        if let Some(callback) = self.switch_callback {
            callback(from, next);
        }
        log::trace!("switch {:?} -> {}", from, next);
        Some(Switch { from, to: next })
    }

    /// Reschedule check followed by the register swap through `engine`.
    pub fn reschedule_with<E: ContextSwitch>(&mut self, engine: &mut E) -> Option<Switch> {
        let switch = self.reschedule()?;
        if let Some(from) = switch.from {
            engine.save(&mut self.pool[from].context);
        }
        engine.restore(&self.pool[switch.to].context);
        Some(switch)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimCpu;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn noop(_: usize) {}

    fn stack() -> Stack {
        Stack::new(Box::leak(Box::new([0u64; 64])))
    }

    fn prio(level: u8) -> Priority {
        Priority::new(level).unwrap()
    }

    fn spawn(sched: &mut Scheduler, level: u8) -> ThreadId {
        sched.create_thread(noop, 0, stack(), prio(level)).unwrap()
    }

    fn running(sched: &Scheduler) -> Vec<ThreadId> {
        sched
            .threads()
            .filter(|t| t.state() == ThreadState::Running)
            .map(Tcb::id)
            .collect()
    }

    #[test]
    fn test_fast_path_without_request() {
        let mut sched = Scheduler::new();
        spawn(&mut sched, 5);
        sched.start();
        assert!(sched.reschedule().is_some());
        assert!(!sched.needs_reschedule());
        assert_eq!(sched.reschedule(), None);
    }

    #[test]
    fn test_bootstrap_never_switches() {
        let mut sched = Scheduler::new();
        spawn(&mut sched, 5);
        sched.request_reschedule();
        assert_eq!(sched.reschedule(), None);
        assert_eq!(sched.current(), None);
        assert_eq!(sched.phase(), Phase::Bootstrap);
    }

    #[test]
    fn test_start_runs_highest_priority() {
        let mut sched = Scheduler::new();
        let low = spawn(&mut sched, 9);
        let high = spawn(&mut sched, 3);
        sched.start();

        let switch = sched.reschedule().unwrap();
        assert_eq!(switch, Switch { from: None, to: high });
        assert_eq!(sched.current(), Some(high));
        assert_eq!(sched.state(high), Some(ThreadState::Running));
        assert_eq!(sched.state(low), Some(ThreadState::Ready));
    }

    #[test]
    fn test_higher_priority_creation_preempts() {
        let mut sched = Scheduler::new();
        let low = spawn(&mut sched, 9);
        sched.start();
        sched.reschedule();

        let high = spawn(&mut sched, 1);
        assert!(sched.needs_reschedule());
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(low), to: high }));
        assert_eq!(sched.state(low), Some(ThreadState::Ready));
    }

    #[test]
    fn test_lower_priority_creation_does_not_switch() {
        let mut sched = Scheduler::new();
        let high = spawn(&mut sched, 1);
        sched.start();
        sched.reschedule();

        spawn(&mut sched, 9);
        assert_eq!(sched.reschedule(), None);
        assert_eq!(sched.current(), Some(high));
    }

    #[test]
    fn test_sleep_and_wake() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, 1);
        let b = spawn(&mut sched, 2);
        let mut queue = WaitQueue::new();
        sched.start();
        sched.reschedule();

        assert_eq!(sched.sleep_on(&mut queue), Ok(a));
        assert_eq!(sched.state(a), Some(ThreadState::Blocked));
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(a), to: b }));
        // Blocked is not overwritten by the switch
        assert_eq!(sched.state(a), Some(ThreadState::Blocked));

        assert_eq!(sched.wake_one(&mut queue), Some(a));
        assert!(queue.is_empty());
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(b), to: a }));
        assert_eq!(sched.state(b), Some(ThreadState::Ready));
    }

    #[test]
    fn test_wake_before_switch_keeps_running() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, 1);
        spawn(&mut sched, 2);
        let mut queue = WaitQueue::new();
        sched.start();
        sched.reschedule();

        sched.sleep_on(&mut queue).unwrap();
        sched.wake_all(&mut queue);
        assert_eq!(sched.reschedule(), None);
        assert_eq!(sched.current(), Some(a));
        assert_eq!(sched.state(a), Some(ThreadState::Running));
    }

    #[test]
    fn test_wake_all_on_empty_queue_is_noop() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, 1);
        sched.start();
        sched.reschedule();

        let mut queue = WaitQueue::new();
        assert_eq!(sched.wake_all(&mut queue), 0);
        assert_eq!(sched.wake_one(&mut queue), None);
        assert!(!sched.needs_reschedule());
        assert_eq!(sched.current(), Some(a));
    }

    #[test]
    fn test_wake_thread_not_blocked_is_noop() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, 1);
        sched.start();
        sched.reschedule();
        assert!(!sched.wake_thread(a));
        assert!(!sched.needs_reschedule());
    }

    #[test]
    fn test_wake_one_skips_directly_woken() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, 1);
        let b = spawn(&mut sched, 2);
        spawn(&mut sched, 30);
        let mut queue = WaitQueue::new();
        sched.start();
        sched.reschedule();

        sched.sleep_on(&mut queue).unwrap();
        sched.reschedule();
        sched.sleep_on(&mut queue).unwrap();
        sched.reschedule();

        // a is forced awake but stays linked until it leaves the queue
        assert!(sched.wake_thread(a));
        assert!(queue.contains(a));
        assert_eq!(sched.wake_one(&mut queue), Some(b));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_yield_rotates_equal_priority() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, 4);
        let b = spawn(&mut sched, 4);
        sched.start();
        sched.reschedule();

        sched.yield_current().unwrap();
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(a), to: b }));
        sched.yield_current().unwrap();
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(b), to: a }));
    }

    #[test]
    fn test_yield_alone_keeps_cpu() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, 4);
        spawn(&mut sched, 8);
        sched.start();
        sched.reschedule();

        sched.yield_current().unwrap();
        assert_eq!(sched.reschedule(), None);
        assert_eq!(sched.current(), Some(a));
    }

    #[test]
    fn test_set_priority_resorts() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, 4);
        let b = spawn(&mut sched, 8);
        sched.start();
        sched.reschedule();

        assert_eq!(sched.set_priority(b, prio(1)), Ok(prio(8)));
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(a), to: b }));
        assert_eq!(sched.threads().map(Tcb::id).collect::<Vec<_>>(), vec![b, a]);
    }

    #[test]
    fn test_exit_wakes_joiners() {
        let mut sched = Scheduler::new();
        let joiner = spawn(&mut sched, 1);
        let worker = spawn(&mut sched, 2);
        sched.start();
        sched.reschedule();

        assert_eq!(sched.join(worker), Ok(false));
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(joiner), to: worker }));

        assert_eq!(sched.exit_current(), Ok(worker));
        assert_eq!(sched.state(joiner), Some(ThreadState::Ready));
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(worker), to: joiner }));
        assert_eq!(sched.state(worker), Some(ThreadState::Terminated));
        assert_eq!(sched.join(worker), Ok(true));
        assert_eq!(sched.threads().count(), 1);
    }

    #[test]
    fn test_kill_rules() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, 1);
        let b = spawn(&mut sched, 2);
        let c = spawn(&mut sched, 3);
        let mut queue = WaitQueue::new();
        sched.start();
        sched.reschedule();
        sched.sleep_on(&mut queue).unwrap();
        sched.reschedule();

        assert_eq!(sched.kill(a), Err(KernelError::ThreadBlocked(a)));
        assert_eq!(sched.kill(c), Ok(()));
        assert_eq!(sched.state(c), Some(ThreadState::Terminated));
        assert_eq!(sched.kill(c), Ok(()));
        assert_eq!(sched.current(), Some(b));
    }

    #[test]
    fn test_idle_thread_cannot_be_killed() {
        let mut sched = Scheduler::new();
        let idle = sched.create_idle_thread(noop, stack()).unwrap();
        assert_eq!(sched.idle_thread(), Some(idle));
        assert_eq!(sched.thread(idle).unwrap().priority(), Priority::IDLE);
        assert_eq!(sched.kill(idle), Err(KernelError::IdleThread(idle)));
        assert_eq!(sched.state(idle), Some(ThreadState::Ready));
    }

    #[test]
    fn test_join_ends_when_target_slot_is_reused() {
        let mut sched = Scheduler::new();
        let creator = spawn(&mut sched, 0);
        let joiner = spawn(&mut sched, 1);
        let target = spawn(&mut sched, 2);
        let mut parked = WaitQueue::new();
        sched.start();
        sched.reschedule();
        sched.sleep_on(&mut parked).unwrap();
        sched.reschedule();

        assert_eq!(sched.join(target), Ok(false));
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(joiner), to: target }));

        // Target wakes the creator on its way out
        assert_eq!(sched.wake_one(&mut parked), Some(creator));
        assert_eq!(sched.exit_current(), Ok(target));
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(target), to: creator }));

        let fresh = spawn(&mut sched, 5);
        assert_eq!(fresh, target);
        sched.sleep_on(&mut parked).unwrap();
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(creator), to: joiner }));

        assert!(!sched.finish_join(target));
        assert_eq!(sched.state(joiner), Some(ThreadState::Running));
        assert!(sched.thread(fresh).unwrap().joiners.is_empty());
        assert_eq!(sched.reschedule(), None);
    }

    #[test]
    fn test_direct_wake_ends_join() {
        let mut sched = Scheduler::new();
        let joiner = spawn(&mut sched, 1);
        let target = spawn(&mut sched, 2);
        sched.start();
        sched.reschedule();

        assert_eq!(sched.join(target), Ok(false));
        sched.reschedule();
        assert!(sched.wake_thread(joiner));
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(target), to: joiner }));

        assert!(sched.finish_join(target));
        assert!(sched.thread(target).unwrap().joiners.is_empty());
        assert!(!sched.thread(joiner).unwrap().is_queued());
    }

    #[test]
    fn test_lock_defers_switch() {
        let mut sched = Scheduler::new();
        let low = spawn(&mut sched, 9);
        sched.start();
        sched.reschedule();

        sched.lock();
        let high = spawn(&mut sched, 1);
        assert_eq!(sched.reschedule(), None);
        assert_eq!(sched.current(), Some(low));
        assert!(sched.needs_reschedule());

        sched.unlock();
        assert_eq!(sched.reschedule(), Some(Switch { from: Some(low), to: high }));
    }

    static CALLBACKS: AtomicUsize = AtomicUsize::new(0);

    fn count_switch(_from: Option<ThreadId>, _to: ThreadId) {
        CALLBACKS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_switch_callback() {
        let mut sched = Scheduler::new();
        spawn(&mut sched, 3);
        let high = spawn(&mut sched, 1);
        assert!(sched.set_switch_callback(Some(count_switch)).is_none());
        sched.start();

        sched.reschedule();
        assert_eq!(CALLBACKS.load(Ordering::SeqCst), 1);
        sched.request_reschedule();
        sched.reschedule();
        assert_eq!(CALLBACKS.load(Ordering::SeqCst), 1);
        assert_eq!(sched.current(), Some(high));
        assert_eq!(sched.switch_count(), 1);
    }

    #[test]
    fn test_blocking_needs_a_running_thread() {
        let mut sched = Scheduler::new();
        spawn(&mut sched, 3);
        let mut queue = WaitQueue::new();
        assert_eq!(sched.sleep_on(&mut queue), Err(KernelError::NoCurrentThread));
        assert_eq!(sched.block_current(), Err(KernelError::NoCurrentThread));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "operation not permitted")]
    fn test_blocking_twice_is_fatal_in_debug() {
        let mut sched = Scheduler::new();
        spawn(&mut sched, 3);
        let mut queue = WaitQueue::new();
        sched.start();
        sched.reschedule();
        sched.sleep_on(&mut queue).unwrap();
        let _ = sched.sleep_on(&mut queue);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "thread pool exhausted")]
    fn test_pool_exhaustion_is_fatal_in_debug() {
        let mut sched = Scheduler::new();
        for _ in 0..=crate::config::MAX_THREADS {
            spawn(&mut sched, 3);
        }
    }

    #[test]
    fn test_small_stack_rejected() {
        let mut sched = Scheduler::new();
        let tiny = Stack::new(Box::leak(Box::new([0u64; 4])));
        assert_eq!(
            sched.create_thread(noop, 0, tiny, Priority::DEFAULT),
            Err(KernelError::StackTooSmall(32))
        );
    }

    #[test]
    fn test_switch_preserves_registers() {
        let mut sched = Scheduler::new();
        let a = spawn(&mut sched, 1);
        let b = spawn(&mut sched, 2);
        let mut cpu = SimCpu::new();
        let mut queue = WaitQueue::new();
        sched.start();
        sched.reschedule_with(&mut cpu);
        assert_eq!(cpu.regs.sp, sched.thread(a).unwrap().stack().top());

        // a computes something, then blocks
        cpu.regs.gpr = [0xA0; 13];
        cpu.regs.gpr[4] = 0xDEAD_BEEF;
        cpu.regs.pc += 0x40;
        let a_regs = cpu.regs;
        sched.sleep_on(&mut queue).unwrap();
        sched.reschedule_with(&mut cpu);
        assert_eq!(cpu.regs.sp, sched.thread(b).unwrap().stack().top());

        // b scribbles over every register
        cpu.regs.gpr = [0xB0; 13];
        cpu.regs.sp -= 0x100;
        sched.wake_one(&mut queue);
        sched.reschedule_with(&mut cpu);

        assert_eq!(cpu.regs, a_regs);
    }

    /// Deterministic xorshift so the sequence is reproducible.
    struct Rng(u32);

    impl Rng {
        fn next(&mut self, bound: usize) -> usize {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 17;
            self.0 ^= self.0 << 5;
            self.0 as usize % bound
        }
    }

    #[test]
    fn test_running_thread_is_highest_priority_runnable() {
        let mut sched = Scheduler::new();
        let ids: Vec<ThreadId> = [7, 3, 12, 3, 20, 1].iter().map(|&l| spawn(&mut sched, l)).collect();
        // Idle-style floor so something is always runnable
        spawn(&mut sched, 31);
        let mut queues = [const { WaitQueue::new() }; 3];
        let mut rng = Rng(0x1234_5678);
        sched.start();
        sched.reschedule();

        for _ in 0..2000 {
            match rng.next(5) {
                0 => {
                    let current = sched.current().unwrap();
                    if sched.thread(current).unwrap().priority() != Priority::IDLE {
                        sched.sleep_on(&mut queues[rng.next(3)]).unwrap();
                    }
                }
                1 => {
                    sched.wake_one(&mut queues[rng.next(3)]);
                }
                2 => {
                    sched.wake_all(&mut queues[rng.next(3)]);
                }
                3 => {
                    let id = ids[rng.next(ids.len())];
                    sched.set_priority(id, prio(rng.next(30) as u8)).unwrap();
                }
                _ => {
                    let _ = sched.yield_current();
                }
            }
            sched.reschedule();

            let current = sched.current().unwrap();
            assert_eq!(running(&sched), vec![current]);
            let best = sched
                .threads()
                .filter(|t| t.is_runnable())
                .map(Tcb::priority)
                .min()
                .unwrap();
            assert_eq!(sched.thread(current).unwrap().priority(), best);
        }
    }
}
