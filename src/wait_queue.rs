//! # Thread Wait-Queues
//!
//! A set of threads blocked until some condition holds. What the
//! condition *is* belongs to the owner of the queue (an interrupt source,
//! a message queue, a joining thread), not to the queue itself.
//!
//! Membership is a one-bit-per-thread bitmap for O(1) lookup. Wake order
//! comes from a FIFO chain threaded through the TCBs' `wait_next` links,
//! so the first thread to block is the first one woken.
//!
//! A thread is linked into at most one queue at a time. Linking a thread
//! that is already queued elsewhere is an invariant violation and aborts.

use crate::thread::{ThreadId, ThreadPool};

/// Queue header. Not `Clone`: a copy would share TCB links with the
/// original.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WaitQueue {
    head: Option<ThreadId>,
    tail: Option<ThreadId>,
    members: u32,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            members: 0,
        }
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.members == 0
    }

    #[inline]
    pub const fn len(&self) -> usize {
        self.members.count_ones() as usize
    }

    #[inline]
    pub const fn contains(&self, id: ThreadId) -> bool {
        self.members & id.bit() != 0
    }

    /// Membership bitmap, bit `n` for thread `n`.
    #[inline]
    pub const fn members(&self) -> u32 {
        self.members
    }

    /// First thread that would be woken.
    #[inline]
    pub const fn front(&self) -> Option<ThreadId> {
        self.head
    }

    /// Append `id` at the tail.
    pub(crate) fn push(&mut self, pool: &mut ThreadPool, id: ThreadId) {
        assert!(
            !pool[id].queued,
            "{} is already waiting on another queue",
            id
        );
        pool[id].queued = true;
        pool[id].wait_next = None;
        match self.tail {
            Some(tail) => pool[tail].wait_next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.members |= id.bit();
    }

    /// Unlink and return the head.
    pub(crate) fn pop(&mut self, pool: &mut ThreadPool) -> Option<ThreadId> {
        let id = self.head?;
        self.head = pool[id].wait_next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        pool[id].queued = false;
        self.members &= !id.bit();
        Some(id)
    }

    /// Unlink `id` wherever it sits. No-op (returns false) if absent.
    pub(crate) fn remove(&mut self, pool: &mut ThreadPool, id: ThreadId) -> bool {
        if !self.contains(id) {
            return false;
        }
        let mut prev: Option<ThreadId> = None;
        let mut cursor = self.head;
        while let Some(cur) = cursor {
            let next = pool[cur].wait_next;
            if cur == id {
                match prev {
                    Some(p) => pool[p].wait_next = next,
                    None => self.head = next,
                }
                if self.tail == Some(id) {
                    self.tail = prev;
                }
                pool[id].wait_next = None;
                pool[id].queued = false;
                self.members &= !id.bit();
                return true;
            }
            prev = Some(cur);
            cursor = next;
        }
        unreachable!("{} is marked in the bitmap but missing from the chain", id);
    }

    /// Waiters in wake order.
    pub fn iter<'a>(&self, pool: &'a ThreadPool) -> impl Iterator<Item = ThreadId> + 'a {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            let id = cursor?;
            cursor = pool[id].wait_next;
            Some(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{Priority, Stack};

    fn noop(_: usize) {}

    fn pool_with(n: usize) -> (ThreadPool, Vec<ThreadId>) {
        let mut pool = ThreadPool::new();
        let ids = (0..n)
            .map(|_| {
                let stack = Stack::new(Box::leak(Box::new([0u64; 64])));
                pool.allocate(noop, 0, stack, Priority::DEFAULT).unwrap()
            })
            .collect();
        (pool, ids)
    }

    #[test]
    fn test_fifo_wake_order() {
        let (mut pool, ids) = pool_with(3);
        let mut queue = WaitQueue::new();
        queue.push(&mut pool, ids[2]);
        queue.push(&mut pool, ids[0]);
        queue.push(&mut pool, ids[1]);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.iter(&pool).collect::<Vec<_>>(), vec![ids[2], ids[0], ids[1]]);
        assert_eq!(queue.pop(&mut pool), Some(ids[2]));
        assert_eq!(queue.pop(&mut pool), Some(ids[0]));
        assert_eq!(queue.pop(&mut pool), Some(ids[1]));
        assert_eq!(queue.pop(&mut pool), None);
        assert!(queue.is_empty());
        assert!(!pool[ids[0]].is_queued());
    }

    #[test]
    fn test_remove_from_middle_and_tail() {
        let (mut pool, ids) = pool_with(3);
        let mut queue = WaitQueue::new();
        for &id in &ids {
            queue.push(&mut pool, id);
        }

        assert!(queue.remove(&mut pool, ids[1]));
        assert!(!queue.contains(ids[1]));
        assert!(queue.remove(&mut pool, ids[2]));

        // Tail was fixed up: a new push lands right after ids[0]
        queue.push(&mut pool, ids[1]);
        assert_eq!(queue.iter(&pool).collect::<Vec<_>>(), vec![ids[0], ids[1]]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let (mut pool, ids) = pool_with(2);
        let mut queue = WaitQueue::new();
        queue.push(&mut pool, ids[0]);
        assert!(!queue.remove(&mut pool, ids[1]));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    #[should_panic(expected = "already waiting")]
    fn test_thread_in_two_queues_aborts() {
        let (mut pool, ids) = pool_with(1);
        let mut first = WaitQueue::new();
        let mut second = WaitQueue::new();
        first.push(&mut pool, ids[0]);
        second.push(&mut pool, ids[0]);
    }
}
