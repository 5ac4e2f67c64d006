//! # Message Queues
//!
//! A bounded FIFO ring of `C` messages with two wait-queues: threads
//! waiting for a message and threads waiting for space.
//!
//! Every operation is a short non-preemptible step against the scheduler.
//! A blocking call that cannot complete puts the caller to sleep and
//! reports [`QueueError::Blocked`]; the thread-context wrapper
//! ([`Mailbox`](crate::mailbox::Mailbox)) retries once it is resumed.
//! Interrupt handlers and alarm callbacks only ever use [`Mode::NoBlock`].

use crate::error::{QueueError, SendError};
use crate::scheduler::Scheduler;
use crate::wait_queue::WaitQueue;

/// Blocking behavior of a send or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Sleep until the operation can complete.
    Block,
    /// Fail with `Full`/`Empty` instead of waiting.
    NoBlock,
}

pub struct MessageQueue<T, const C: usize> {
    slots: [Option<T>; C],
    head: usize,
    count: usize,
    /// Threads waiting for a message.
    receivers: WaitQueue,
    /// Threads waiting for space.
    senders: WaitQueue,
}

impl<T, const C: usize> MessageQueue<T, C> {
    const NON_ZERO: () = assert!(C > 0, "message queue capacity must be non-zero");

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::NON_ZERO;
        Self {
            slots: [const { None }; C],
            head: 0,
            count: 0,
            receivers: WaitQueue::new(),
            senders: WaitQueue::new(),
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        C
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub const fn is_full(&self) -> bool {
        self.count == C
    }

    /// Threads blocked in `receive`.
    pub fn receivers(&self) -> &WaitQueue {
        &self.receivers
    }

    /// Threads blocked in `send`/`jam`.
    pub fn senders(&self) -> &WaitQueue {
        &self.senders
    }

    /// Append `message` at the tail.
    pub fn send(&mut self, sched: &mut Scheduler, message: T, mode: Mode) -> Result<(), SendError<T>> {
        if self.is_full() {
            let error = wait(sched, &mut self.senders, mode, QueueError::Full);
            return Err(SendError { error, message });
        }
        let tail = (self.head + self.count) % C;
        self.slots[tail] = Some(message);
        self.count += 1;
        self.delivered(sched);
        Ok(())
    }

    /// Urgent send: the message goes in front of everything queued and is
    /// the next one received.
    pub fn jam(&mut self, sched: &mut Scheduler, message: T, mode: Mode) -> Result<(), SendError<T>> {
        if self.is_full() {
            let error = wait(sched, &mut self.senders, mode, QueueError::Full);
            return Err(SendError { error, message });
        }
        self.head = (self.head + C - 1) % C;
        self.slots[self.head] = Some(message);
        self.count += 1;
        self.delivered(sched);
        Ok(())
    }

    /// Take the message at the head.
    pub fn receive(&mut self, sched: &mut Scheduler, mode: Mode) -> Result<T, QueueError> {
        if self.is_empty() {
            return Err(wait(sched, &mut self.receivers, mode, QueueError::Empty));
        }
        let Some(message) = self.slots[self.head].take() else {
            unreachable!("message queue slot {} counted but empty", self.head);
        };
        self.head = (self.head + 1) % C;
        self.count -= 1;
        sched.leave(&mut self.receivers);
        sched.wake_one(&mut self.senders);
        Ok(message)
    }

    /// The message `receive` would return, left in place.
    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            None
        } else {
            self.slots[self.head].as_ref()
        }
    }

    fn delivered(&mut self, sched: &mut Scheduler) {
        sched.leave(&mut self.senders);
        sched.wake_one(&mut self.receivers);
    }
}

impl<T, const C: usize> Default for MessageQueue<T, C> {
    fn default() -> Self {
        Self::new()
    }
}

fn wait(sched: &mut Scheduler, queue: &mut WaitQueue, mode: Mode, unavailable: QueueError) -> QueueError {
    match mode {
        Mode::NoBlock => unavailable,
        Mode::Block => match sched.sleep_on(queue) {
            Ok(_) => QueueError::Blocked,
            Err(err) => QueueError::Kernel(err),
        },
    }
}
