//! # Mailboxes
//!
//! A [`MessageQueue`] that can live in a `static` and be used from any
//! context: blocking calls from threads, [`post`](Mailbox::post) from
//! interrupt handlers and alarm callbacks.
//!
//! ```ignore
//! static EVENTS: Mailbox<u32, 8> = Mailbox::new();
//!
//! fn on_tick(sched: &mut Scheduler, _: usize) {
//!     let _ = EVENTS.post(sched, 1);
//! }
//!
//! fn worker(_: usize) {
//!     while let Ok(event) = EVENTS.receive() {
//!         // ...
//!     }
//! }
//! ```

use crate::api;
use crate::arch;
use crate::error::{QueueError, SendError};
use crate::message::{MessageQueue, Mode};
use crate::scheduler::Scheduler;
use crate::sync::{critical_section, Shared};

type SendOp<T, const C: usize> = fn(&mut MessageQueue<T, C>, &mut Scheduler, T, Mode) -> Result<(), SendError<T>>;

pub struct Mailbox<T, const C: usize> {
    queue: Shared<MessageQueue<T, C>>,
}

impl<T, const C: usize> Mailbox<T, C> {
    pub const fn new() -> Self {
        Self {
            queue: Shared::new(MessageQueue::new()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MessageQueue<T, C>, &mut Scheduler) -> R) -> R {
        critical_section(|cs| {
            self.queue
                .lock_in(cs, |queue| api::with_kernel_in(cs, |kernel| f(queue, &mut kernel.scheduler)))
        })
    }

    fn send_with(&self, mut message: T, op: SendOp<T, C>) -> Result<(), SendError<T>> {
        loop {
            match self.with(|queue, sched| op(queue, sched, message, Mode::Block)) {
                Ok(()) => {
                    api::reschedule_point();
                    return Ok(());
                }
                Err(SendError {
                    error: QueueError::Blocked,
                    message: returned,
                }) => {
                    message = returned;
                    arch::request_reschedule();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Append a message, sleeping while the mailbox is full.
    pub fn send(&self, message: T) -> Result<(), SendError<T>> {
        self.send_with(message, MessageQueue::send)
    }

    /// Put a message in front of everything queued, sleeping while the
    /// mailbox is full.
    pub fn jam(&self, message: T) -> Result<(), SendError<T>> {
        self.send_with(message, MessageQueue::jam)
    }

    /// Append without waiting; `Full` hands the message back.
    pub fn try_send(&self, message: T) -> Result<(), SendError<T>> {
        let sent = self.with(|queue, sched| queue.send(sched, message, Mode::NoBlock));
        if sent.is_ok() {
            api::reschedule_point();
        }
        sent
    }

    pub fn try_jam(&self, message: T) -> Result<(), SendError<T>> {
        let sent = self.with(|queue, sched| queue.jam(sched, message, Mode::NoBlock));
        if sent.is_ok() {
            api::reschedule_point();
        }
        sent
    }

    /// Take the oldest message, sleeping while the mailbox is empty.
    pub fn receive(&self) -> Result<T, QueueError> {
        loop {
            match self.with(|queue, sched| queue.receive(sched, Mode::Block)) {
                Ok(message) => {
                    api::reschedule_point();
                    return Ok(message);
                }
                Err(QueueError::Blocked) => arch::request_reschedule(),
                Err(err) => return Err(err),
            }
        }
    }

    pub fn try_receive(&self) -> Result<T, QueueError> {
        let received = self.with(|queue, sched| queue.receive(sched, Mode::NoBlock));
        if received.is_ok() {
            api::reschedule_point();
        }
        received
    }

    /// Non-blocking send for interrupt handlers and alarm callbacks, which
    /// already hold the scheduler. The receiver it wakes runs at the next
    /// reschedule check.
    pub fn post(&self, sched: &mut Scheduler, message: T) -> Result<(), SendError<T>> {
        self.queue.lock(|queue| queue.send(sched, message, Mode::NoBlock))
    }

    /// Receive for callers that already hold the scheduler. With
    /// `Mode::Block` an empty mailbox puts the running thread to sleep and
    /// reports `Blocked`; the caller retries once it is resumed.
    pub fn receive_with(&self, sched: &mut Scheduler, mode: Mode) -> Result<T, QueueError> {
        self.queue.lock(|queue| queue.receive(sched, mode))
    }

    pub fn len(&self) -> usize {
        self.queue.lock(|queue| queue.len())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock(|queue| queue.is_empty())
    }

    pub const fn capacity(&self) -> usize {
        C
    }
}

impl<T: Clone, const C: usize> Mailbox<T, C> {
    /// Copy of the message `receive` would return next.
    pub fn peek(&self) -> Option<T> {
        self.queue.lock(|queue| queue.peek().cloned())
    }
}

impl<T, const C: usize> Default for Mailbox<T, C> {
    fn default() -> Self {
        Self::new()
    }
}
