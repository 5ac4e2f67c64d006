//! # Alarms
//!
//! One-shot and periodic actions driven by the timer interrupt source.
//! Alarms live in a fixed pool; each pass of [`AlarmQueue::fire_due`]
//! runs every alarm whose due tick has been reached, in due order.
//!
//! Actions run in interrupt context. They must be short and must never
//! block: the usual action posts a message without blocking or wakes a
//! specific thread.

use core::fmt;

use crate::config::{MAX_ALARMS, TICK_HZ};
use crate::error::KernelError;
use crate::scheduler::Scheduler;
use crate::thread::ThreadId;

/// Timer ticks since boot.
pub type Tick = u64;

/// Milliseconds to ticks, rounded up so a delay is never shortened.
pub const fn ms_to_ticks(ms: u64) -> Tick {
    (ms * TICK_HZ as u64).div_ceil(1000)
}

/// Alarm callback, invoked with the scheduler and the alarm's argument.
pub type AlarmCallback = fn(&mut Scheduler, usize);

/// What a firing alarm does.
#[derive(Clone, Copy)]
pub enum AlarmAction {
    Call(AlarmCallback, usize),
    /// Force a blocked thread awake (sleeps and timeouts).
    Wake(ThreadId),
}

impl AlarmAction {
    fn run(self, sched: &mut Scheduler) {
        match self {
            Self::Call(callback, arg) => callback(sched, arg),
            Self::Wake(thread) => {
                sched.wake_thread(thread);
            }
        }
    }
}

impl fmt::Debug for AlarmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call(callback, arg) => write!(f, "Call({:p}, {:#x})", *callback as *const (), arg),
            Self::Wake(thread) => write!(f, "Wake({})", thread),
        }
    }
}

/// Handle to an armed alarm. Once the alarm is cancelled or has fired
/// for the last time, the handle goes stale and every operation on it is
/// a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmId {
    slot: u8,
    generation: u16,
}

#[derive(Debug, Clone, Copy)]
struct Alarm {
    due: Tick,
    /// 0 for one-shot.
    period: Tick,
    action: AlarmAction,
    /// 0 means untagged.
    tag: u32,
    /// Arming order; breaks ties between alarms due on the same tick.
    seq: u32,
}

/// First due tick of a periodic alarm whose period counts from `start`:
/// `start` itself if that is still ahead, otherwise the first
/// `start + k * period` strictly after `now`.
pub fn periodic_start(now: Tick, start: Tick, period: Tick) -> Tick {
    debug_assert!(period > 0);
    if start > now {
        start
    } else {
        start + period * ((now - start) / period + 1)
    }
}

/// The alarm pool.
pub struct AlarmQueue {
    slots: [Option<Alarm>; MAX_ALARMS],
    generations: [u16; MAX_ALARMS],
    seq: u32,
}

impl AlarmQueue {
    pub const fn new() -> Self {
        Self {
            slots: [None; MAX_ALARMS],
            generations: [0; MAX_ALARMS],
            seq: 0,
        }
    }

    /// Arm an alarm due at the absolute tick `due`. With `period > 0` it
    /// re-arms itself `period` ticks later after every firing.
    pub fn arm(&mut self, due: Tick, period: Tick, action: AlarmAction) -> Result<AlarmId, KernelError> {
        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            log::warn!("no free alarm slot for {:?}", action);
            return Err(KernelError::AlarmPoolExhausted);
        };
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.slots[slot] = Some(Alarm {
            due,
            period,
            action,
            tag: 0,
            seq,
        });
        log::debug!("alarm {} armed: due {} period {} {:?}", slot, due, period, action);
        Ok(AlarmId {
            slot: slot as u8,
            generation: self.generations[slot],
        })
    }

    fn live(&self, id: AlarmId) -> Option<&Alarm> {
        let slot = usize::from(id.slot);
        if self.generations[slot] != id.generation {
            return None;
        }
        self.slots[slot].as_ref()
    }

    fn release(&mut self, slot: usize) -> Option<Alarm> {
        let alarm = self.slots[slot].take()?;
        self.generations[slot] = self.generations[slot].wrapping_add(1);
        Some(alarm)
    }

    /// Disarm. Returns false if the handle is stale.
    pub fn cancel(&mut self, id: AlarmId) -> bool {
        if self.live(id).is_none() {
            return false;
        }
        self.release(usize::from(id.slot));
        log::debug!("alarm {} cancelled", id.slot);
        true
    }

    /// Group an alarm under `tag` for `cancel_tagged`.
    pub fn set_tag(&mut self, id: AlarmId, tag: u32) -> bool {
        if self.live(id).is_none() {
            return false;
        }
        match self.slots[usize::from(id.slot)].as_mut() {
            Some(alarm) => {
                alarm.tag = tag;
                true
            }
            None => false,
        }
    }

    /// Cancel every alarm carrying `tag`. Tag 0 (untagged) matches nothing.
    pub fn cancel_tagged(&mut self, tag: u32) -> usize {
        if tag == 0 {
            return 0;
        }
        self.cancel_where(|alarm| alarm.tag == tag)
    }

    pub fn cancel_all(&mut self) -> usize {
        self.cancel_where(|_| true)
    }

    fn cancel_where(&mut self, mut matches: impl FnMut(&Alarm) -> bool) -> usize {
        let mut cancelled = 0;
        for slot in 0..MAX_ALARMS {
            if self.slots[slot].as_ref().is_some_and(&mut matches) {
                self.release(slot);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            log::debug!("{} alarms cancelled", cancelled);
        }
        cancelled
    }

    #[inline]
    pub fn is_armed(&self, id: AlarmId) -> bool {
        self.live(id).is_some()
    }

    /// Due tick of an armed alarm.
    pub fn due(&self, id: AlarmId) -> Option<Tick> {
        self.live(id).map(|alarm| alarm.due)
    }

    /// Number of armed alarms.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Earliest due tick among armed alarms.
    pub fn next_due(&self) -> Option<Tick> {
        self.slots.iter().flatten().map(|alarm| alarm.due).min()
    }

    /// The alarm to fire next at `now`: earliest due, then earliest armed.
    fn next_expired(&self, now: Tick) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, alarm)| alarm.as_ref().map(|alarm| (slot, alarm)))
            .filter(|(_, alarm)| alarm.due <= now)
            .min_by_key(|(_, alarm)| (alarm.due, alarm.seq))
            .map(|(slot, _)| slot)
    }

    /// Fire everything due at or before `now`. A periodic alarm that fell
    /// more than one period behind fires once per missed period, in the
    /// same pass. Returns the number of actions run.
    pub fn fire_due(&mut self, now: Tick, sched: &mut Scheduler) -> usize {
        let mut fired = 0;
        while let Some(slot) = self.next_expired(now) {
            let Some(alarm) = self.slots[slot].as_mut() else {
                break;
            };
            let action = alarm.action;
            if alarm.period > 0 {
                alarm.due += alarm.period;
            } else {
                self.release(slot);
            }
            log::trace!("alarm {} fired at {}", slot, now);
            action.run(sched);
            fired += 1;
        }
        fired
    }
}

impl Default for AlarmQueue {
    fn default() -> Self {
        Self::new()
    }
}
