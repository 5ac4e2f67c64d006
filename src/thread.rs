//! # Thread Control Blocks and the Ready List
//!
//! Threads live in a fixed pool of TCBs allocated at startup. Every link
//! between TCBs (the ready list, wait-queue chains) is a `ThreadId` index
//! into that pool, never an address, so a TCB's identity is its slot.
//!
//! The ready list holds every live thread, ordered by priority with FIFO
//! order among equals. The scheduler walks it from the head and runs the
//! first runnable entry.

use core::fmt;
use core::ops::{Index, IndexMut};

use crate::arch::{self, Context};
use crate::config::MAX_THREADS;
use crate::wait_queue::WaitQueue;

// ---------------------------------------------------------------------------
// Identity and priority
// ---------------------------------------------------------------------------

/// Index of a TCB in the thread pool, `0..MAX_THREADS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u8);

impl ThreadId {
    /// Returns `None` if `index` is outside the pool.
    pub const fn new(index: usize) -> Option<Self> {
        if index < MAX_THREADS {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Membership bit of this thread in a wait-queue bitmap.
    #[inline]
    pub const fn bit(self) -> u32 {
        1 << self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Scheduling priority. Level 0 is the most urgent, 31 the least.
///
/// The derived ordering compares levels numerically, so a *smaller*
/// `Priority` is the *more important* one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Self = Self(0);
    pub const DEFAULT: Self = Self(16);
    pub const LOWEST: Self = Self(31);
    /// The idle thread runs at the lowest level.
    pub const IDLE: Self = Self::LOWEST;

    pub const fn new(level: u8) -> Option<Self> {
        if level <= Self::LOWEST.0 {
            Some(Self(level))
        } else {
            None
        }
    }

    #[inline]
    pub const fn level(self) -> u8 {
        self.0
    }

    /// True if `self` should run before `other`.
    #[inline]
    pub const fn is_higher_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

// ---------------------------------------------------------------------------
// Thread state machine
// ---------------------------------------------------------------------------

/// Execution state of a thread.
///
/// ```text
///   ┌──────────┐     reschedule      ┌─────────┐
///   │  Ready   │ ──────────────────► │ Running │
///   └──────────┘                     └─────────┘
///     ▲      ▲        preempted          │   │
///     │      └───────────────────────────┘   │ sleep_on
///     │                                      ▼
///     │            wake              ┌──────────┐
///     └───────────────────────────── │ Blocked  │
///                                    └──────────┘
///   Ready / Running ──exit / kill──► Terminated (final)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Runnable, waiting for the CPU.
    Ready,
    /// Currently executing. At most one thread is ever in this state.
    Running,
    /// Waiting for a wake (wait-queue, alarm, join).
    Blocked,
    /// Entry returned or the thread was killed. No way back.
    Terminated,
}

/// Thread entry point. When it returns, the thread exits.
pub type ThreadEntry = fn(usize);

// ---------------------------------------------------------------------------
// Stack region
// ---------------------------------------------------------------------------

/// A caller-supplied stack region. No dynamic growth: sizing is the
/// creator's responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stack {
    base: usize,
    size: usize,
}

impl Stack {
    /// Wrap a statically allocated region. `u64` words keep the base
    /// 8-byte aligned as AAPCS requires.
    pub fn new(memory: &'static mut [u64]) -> Self {
        Self {
            base: memory.as_mut_ptr() as usize,
            size: memory.len() * core::mem::size_of::<u64>(),
        }
    }

    /// Describe a region by address and length.
    ///
    /// # Safety
    /// `base..base + size` must be writable memory owned by the thread for
    /// its whole lifetime and not used by anything else.
    pub const unsafe fn from_raw(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub const fn empty() -> Self {
        Self { base: 0, size: 0 }
    }

    #[inline]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Initial stack pointer: the end of the region, rounded down to 8.
    #[inline]
    pub const fn top(&self) -> usize {
        (self.base + self.size) & !0x07
    }
}

// ---------------------------------------------------------------------------
// Thread Control Block
// ---------------------------------------------------------------------------

/// Per-thread state record.
pub struct Tcb {
    id: ThreadId,
    state: ThreadState,
    priority: Priority,
    /// Saved machine state. Meaningful only while not `Running`.
    pub(crate) context: Context,
    stack: Stack,
    entry: Option<ThreadEntry>,
    arg: usize,
    /// Ready-list link.
    pub(crate) next: Option<ThreadId>,
    /// Wait-queue link. Only valid while `queued`.
    pub(crate) wait_next: Option<ThreadId>,
    /// Linked into some wait-queue.
    pub(crate) queued: bool,
    /// Threads blocked in `join` on this one.
    pub(crate) joiners: WaitQueue,
    /// Slot holds a thread (running or terminated).
    allocated: bool,
}

impl Tcb {
    /// An unallocated slot. Used to initialize the static pool.
    pub const EMPTY: Self = Self {
        id: ThreadId(0),
        state: ThreadState::Terminated,
        priority: Priority::IDLE,
        context: Context::new(),
        stack: Stack::empty(),
        entry: None,
        arg: 0,
        next: None,
        wait_next: None,
        queued: false,
        joiners: WaitQueue::new(),
        allocated: false,
    };

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.context
    }

    #[inline]
    pub fn stack(&self) -> Stack {
        self.stack
    }

    #[inline]
    pub fn entry(&self) -> Option<ThreadEntry> {
        self.entry
    }

    #[inline]
    pub fn arg(&self) -> usize {
        self.arg
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Ready or Running: eligible for selection.
    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.allocated && matches!(self.state, ThreadState::Ready | ThreadState::Running)
    }

    /// Linked into a wait-queue.
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.queued
    }

    pub(crate) fn set_state(&mut self, next: ThreadState) {
        assert!(
            self.state != ThreadState::Terminated || next == ThreadState::Terminated,
            "{} is terminated and cannot become {:?}",
            self.id,
            next
        );
        self.state = next;
    }

    pub(crate) fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// A slot can be handed out again once its thread has terminated and
    /// no queue still links it.
    fn is_free(&self) -> bool {
        !self.allocated || (self.state == ThreadState::Terminated && !self.queued)
    }

    fn init(&mut self, id: ThreadId, entry: ThreadEntry, arg: usize, stack: Stack, priority: Priority) {
        self.id = id;
        self.state = ThreadState::Ready;
        self.priority = priority;
        self.stack = stack;
        self.entry = Some(entry);
        self.arg = arg;
        self.next = None;
        self.wait_next = None;
        self.queued = false;
        self.joiners = WaitQueue::new();
        self.allocated = true;
        arch::init_context(&mut self.context, entry, arg, &stack);
    }
}

// ---------------------------------------------------------------------------
// Thread pool and ready list
// ---------------------------------------------------------------------------

/// The fixed TCB pool plus the head of the priority-ordered ready list.
pub struct ThreadPool {
    tcbs: [Tcb; MAX_THREADS],
    head: Option<ThreadId>,
}

impl ThreadPool {
    pub const fn new() -> Self {
        Self {
            tcbs: [Tcb::EMPTY; MAX_THREADS],
            head: None,
        }
    }

    /// Claim a free slot and initialize it as a READY thread. The thread
    /// is not linked into the ready list yet.
    pub(crate) fn allocate(
        &mut self,
        entry: ThreadEntry,
        arg: usize,
        stack: Stack,
        priority: Priority,
    ) -> Option<ThreadId> {
        let index = self.tcbs.iter().position(Tcb::is_free)?;
        let id = ThreadId(index as u8);
        self.tcbs[index].init(id, entry, arg, stack, priority);
        Some(id)
    }

    /// The TCB for `id`, if that slot holds a thread.
    pub fn get(&self, id: ThreadId) -> Option<&Tcb> {
        let tcb = &self.tcbs[id.index()];
        tcb.allocated.then_some(tcb)
    }

    /// Insert into the ready list behind every thread of equal or higher
    /// priority.
    pub(crate) fn link(&mut self, id: ThreadId) {
        let priority = self[id].priority;
        let mut prev: Option<ThreadId> = None;
        let mut cursor = self.head;
        while let Some(cur) = cursor {
            if priority.is_higher_than(self[cur].priority) {
                break;
            }
            prev = Some(cur);
            cursor = self[cur].next;
        }
        self[id].next = cursor;
        match prev {
            Some(p) => self[p].next = Some(id),
            None => self.head = Some(id),
        }
    }

    /// Remove from the ready list. Returns false if it was not linked.
    pub(crate) fn unlink(&mut self, id: ThreadId) -> bool {
        let mut prev: Option<ThreadId> = None;
        let mut cursor = self.head;
        while let Some(cur) = cursor {
            if cur == id {
                let next = self[cur].next.take();
                match prev {
                    Some(p) => self[p].next = next,
                    None => self.head = next,
                }
                return true;
            }
            prev = Some(cur);
            cursor = self[cur].next;
        }
        false
    }

    /// Highest-priority runnable thread: the first runnable entry of the
    /// ready list.
    pub fn first_runnable(&self) -> Option<ThreadId> {
        self.iter().find(|tcb| tcb.is_runnable()).map(Tcb::id)
    }

    /// Walk the ready list in scheduling order.
    pub fn iter(&self) -> ReadyIter<'_> {
        ReadyIter {
            pool: self,
            cursor: self.head,
        }
    }

    /// Number of threads on the ready list.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<ThreadId> for ThreadPool {
    type Output = Tcb;

    fn index(&self, id: ThreadId) -> &Tcb {
        &self.tcbs[id.index()]
    }
}

impl IndexMut<ThreadId> for ThreadPool {
    fn index_mut(&mut self, id: ThreadId) -> &mut Tcb {
        &mut self.tcbs[id.index()]
    }
}

/// Iterator over the ready list.
pub struct ReadyIter<'a> {
    pool: &'a ThreadPool,
    cursor: Option<ThreadId>,
}

impl<'a> Iterator for ReadyIter<'a> {
    type Item = &'a Tcb;

    fn next(&mut self) -> Option<&'a Tcb> {
        let id = self.cursor?;
        let tcb = &self.pool[id];
        self.cursor = tcb.next;
        Some(tcb)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: usize) {}

    fn stack() -> Stack {
        Stack::new(Box::leak(Box::new([0u64; 64])))
    }

    fn spawn(pool: &mut ThreadPool, level: u8) -> ThreadId {
        let id = pool
            .allocate(noop, 0, stack(), Priority::new(level).unwrap())
            .unwrap();
        pool.link(id);
        id
    }

    fn order(pool: &ThreadPool) -> Vec<ThreadId> {
        pool.iter().map(Tcb::id).collect()
    }

    #[test]
    fn test_tcb_initialization() {
        let mut pool = ThreadPool::new();
        assert!(pool.get(ThreadId(0)).is_none());

        let id = pool
            .allocate(noop, 42, stack(), Priority::DEFAULT)
            .unwrap();
        let tcb = pool.get(id).unwrap();
        assert_eq!(tcb.state(), ThreadState::Ready);
        assert_eq!(tcb.priority(), Priority::DEFAULT);
        assert_eq!(tcb.arg(), 42);
        assert!(tcb.is_runnable());
        assert!(!tcb.is_queued());
    }

    #[test]
    fn test_ready_list_is_priority_ordered() {
        let mut pool = ThreadPool::new();
        let low = spawn(&mut pool, 20);
        let high = spawn(&mut pool, 2);
        let mid = spawn(&mut pool, 10);

        assert_eq!(order(&pool), vec![high, mid, low]);
        assert_eq!(pool.first_runnable(), Some(high));
    }

    #[test]
    fn test_equal_priorities_keep_insertion_order() {
        let mut pool = ThreadPool::new();
        let a = spawn(&mut pool, 5);
        let b = spawn(&mut pool, 5);
        let c = spawn(&mut pool, 5);
        assert_eq!(order(&pool), vec![a, b, c]);

        assert!(pool.unlink(a));
        pool.link(a);
        assert_eq!(order(&pool), vec![b, c, a]);
    }

    #[test]
    fn test_first_runnable_skips_blocked() {
        let mut pool = ThreadPool::new();
        let high = spawn(&mut pool, 1);
        let low = spawn(&mut pool, 9);

        pool[high].set_state(ThreadState::Blocked);
        assert_eq!(pool.first_runnable(), Some(low));

        pool[low].set_state(ThreadState::Blocked);
        assert_eq!(pool.first_runnable(), None);
    }

    #[test]
    fn test_unlink_missing_is_noop() {
        let mut pool = ThreadPool::new();
        let a = spawn(&mut pool, 3);
        assert!(pool.unlink(a));
        assert!(!pool.unlink(a));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pool_exhaustion_and_slot_reuse() {
        let mut pool = ThreadPool::new();
        for _ in 0..MAX_THREADS {
            spawn(&mut pool, 4);
        }
        assert!(pool.allocate(noop, 0, stack(), Priority::DEFAULT).is_none());

        let victim = ThreadId(3);
        pool.unlink(victim);
        pool[victim].set_state(ThreadState::Terminated);
        assert_eq!(
            pool.allocate(noop, 0, stack(), Priority::DEFAULT),
            Some(victim)
        );
    }

    #[test]
    #[should_panic(expected = "terminated")]
    fn test_terminated_is_final() {
        let mut pool = ThreadPool::new();
        let id = spawn(&mut pool, 3);
        pool[id].set_state(ThreadState::Terminated);
        pool[id].set_state(ThreadState::Ready);
    }

    #[test]
    fn test_priority_bounds() {
        assert_eq!(Priority::new(31), Some(Priority::LOWEST));
        assert_eq!(Priority::new(32), None);
        assert!(Priority::HIGHEST.is_higher_than(Priority::DEFAULT));
        assert!(!Priority::IDLE.is_higher_than(Priority::IDLE));
    }

    #[test]
    fn test_stack_top_is_aligned() {
        let stack = unsafe { Stack::from_raw(0x2000_0004, 1021) };
        assert_eq!(stack.top() % 8, 0);
        assert!(stack.top() <= 0x2000_0004 + 1021);
    }
}
