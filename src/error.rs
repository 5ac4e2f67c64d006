//! # Kernel Errors
//!
//! Expected conditions (full queue, empty queue, no ready thread) are
//! reported as values. Configuration errors are logged and, in debug
//! builds, abort with a diagnostic.

use core::fmt;

use crate::thread::{ThreadId, ThreadState};

/// Errors returned by scheduler, thread and alarm operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Every TCB in the fixed pool is in use.
    PoolExhausted,
    /// The id does not name an allocated thread.
    NoSuchThread(ThreadId),
    /// The operation needs a running thread, but the scheduler has not
    /// started one yet.
    NoCurrentThread,
    /// The thread is in a state the operation cannot start from.
    InvalidState {
        thread: ThreadId,
        state: ThreadState,
    },
    /// Priority level outside `0..=31`.
    InvalidPriority(u8),
    /// Caller-supplied stack is smaller than `MIN_STACK_SIZE`.
    StackTooSmall(usize),
    /// Every alarm slot is armed.
    AlarmPoolExhausted,
    /// A periodic alarm needs a period greater than zero.
    InvalidPeriod,
    /// A blocked thread can only leave its wait through a wake.
    ThreadBlocked(ThreadId),
    /// The idle thread keeps the CPU busy when nothing else can run and
    /// never terminates.
    IdleThread(ThreadId),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolExhausted => write!(f, "thread pool exhausted"),
            Self::NoSuchThread(id) => write!(f, "{} is not allocated", id),
            Self::NoCurrentThread => write!(f, "no thread is running yet"),
            Self::InvalidState { thread, state } => {
                write!(f, "{} is {:?}, operation not permitted", thread, state)
            }
            Self::InvalidPriority(level) => write!(f, "priority {} out of range", level),
            Self::StackTooSmall(size) => write!(f, "stack of {} bytes is too small", size),
            Self::AlarmPoolExhausted => write!(f, "alarm pool exhausted"),
            Self::InvalidPeriod => write!(f, "periodic alarm needs a non-zero period"),
            Self::ThreadBlocked(id) => write!(f, "{} is blocked and cannot be cancelled", id),
            Self::IdleThread(id) => write!(f, "{} is the idle thread", id),
        }
    }
}

/// Message-queue failure, surfaced to the caller and never dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Non-blocking send on a full queue.
    Full,
    /// Non-blocking receive on an empty queue.
    Empty,
    /// The calling thread was put to sleep on the queue; retry once the
    /// scheduler resumes it.
    Blocked,
    /// Blocking was requested from a context that cannot block.
    Kernel(KernelError),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "message queue full"),
            Self::Empty => write!(f, "message queue empty"),
            Self::Blocked => write!(f, "caller blocked on message queue"),
            Self::Kernel(err) => write!(f, "{}", err),
        }
    }
}

/// A send that did not complete. Carries the message back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendError<T> {
    pub error: QueueError,
    pub message: T,
}

impl<T> SendError<T> {
    /// Recover the message that could not be sent.
    pub fn into_inner(self) -> T {
        self.message
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send failed: {}", self.error)
    }
}

/// Report a configuration error: logged always, fatal in debug builds.
#[track_caller]
pub(crate) fn configuration_error(err: KernelError) -> KernelError {
    log::error!("configuration error: {}", err);
    if cfg!(debug_assertions) {
        panic!("kernel configuration error: {}", err);
    }
    err
}
