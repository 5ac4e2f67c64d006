//! # Synchronization Primitives
//!
//! Interrupt-safe critical section abstractions. All state shared between
//! threads and interrupt handlers (the kernel itself, user wait-queues,
//! mailboxes) is accessed within a critical section.
//!
//! On the Cortex-M4 the `critical-section` implementation comes from
//! `cortex-m` (`critical-section-single-core`: PRIMASK save/disable/restore).
//! Host tests link the `std` implementation instead.

use core::cell::RefCell;

pub use ::critical_section::CriticalSection;
use ::critical_section::Mutex;

/// Execute a closure within a critical section (interrupts disabled).
///
/// Interrupts are disabled on entry and restored on exit, so calls nest.
///
/// # Usage
/// ```ignore
/// sync::critical_section(|_cs| {
///     // Access shared state safely
/// });
/// ```
///
/// # Performance
/// Keep critical sections as short as possible to minimize interrupt
/// latency.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(CriticalSection<'_>) -> R,
{
    ::critical_section::with(f)
}

/// A value that can live in a `static` and be reached from both thread and
/// interrupt context.
///
/// ```ignore
/// static EVENTS: Shared<WaitQueue> = Shared::new(WaitQueue::new());
/// ```
pub struct Shared<T> {
    inner: Mutex<RefCell<T>>,
}

impl<T> Shared<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(value)),
        }
    }

    /// Run `f` with exclusive access, inside a critical section.
    ///
    /// # Panics
    /// If called again for the same value from inside `f`.
    pub fn lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    /// Same as [`lock`](Self::lock), for callers already holding a
    /// critical section.
    pub fn lock_in<R>(&self, cs: CriticalSection<'_>, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.borrow_ref_mut(cs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static COUNTER: Shared<u32> = Shared::new(0);

    #[test]
    fn test_shared_lock() {
        COUNTER.lock(|n| *n += 2);
        let seen = critical_section(|cs| COUNTER.lock_in(cs, |n| *n));
        assert!(seen >= 2);
    }

    #[test]
    #[should_panic]
    fn test_reentrant_lock_panics() {
        let shared = Shared::new(1u8);
        shared.lock(|_| shared.lock(|n| *n));
    }
}
