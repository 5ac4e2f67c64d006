//! # Interrupt Vector Table and Controller
//!
//! The kernel's view of the interrupt hardware: one bit per source in a
//! master enable (IME), a per-source enable mask (IE) and a pending latch
//! (IF), plus the vector table mapping each source to its handler.
//!
//! The controller is pure bookkeeping. The port layer latches a source
//! into IF when the hardware raises it; [`Kernel::dispatch`] consumes it.
//!
//! [`Kernel::dispatch`]: crate::kernel::Kernel::dispatch

use core::fmt;
use core::ops::{BitAnd, BitOr, Not};

use crate::config::IRQ_SOURCES;
use crate::kernel::Kernel;
use crate::wait_queue::WaitQueue;

// ---------------------------------------------------------------------------
// Sources and masks
// ---------------------------------------------------------------------------

/// Interrupt source index, `0..IRQ_SOURCES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqSource(u8);

impl IrqSource {
    /// The kernel tick timer.
    pub const TIMER: Self = Self(0);

    /// Panics if `index` is out of range: naming a source that does not
    /// exist is a programming error.
    pub const fn new(index: usize) -> Self {
        assert!(index < IRQ_SOURCES, "interrupt source out of range");
        Self(index as u8)
    }

    pub const fn checked(index: usize) -> Option<Self> {
        if index < IRQ_SOURCES {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn mask(self) -> IrqMask {
        IrqMask(1 << self.0)
    }
}

impl fmt::Display for IrqSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "irq#{}", self.0)
    }
}

/// A set of interrupt sources, bit `n` for source `n`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct IrqMask(u32);

impl IrqMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(u32::MAX >> (32 - IRQ_SOURCES));

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn contains(self, source: IrqSource) -> bool {
        self.0 & (1 << source.0) != 0
    }

    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Lowest-numbered source in the set.
    pub const fn lowest(self) -> Option<IrqSource> {
        if self.0 == 0 {
            None
        } else {
            Some(IrqSource(self.0.trailing_zeros() as u8))
        }
    }

    /// Sources in the set, lowest first.
    pub fn iter(self) -> impl Iterator<Item = IrqSource> {
        let mut rest = self;
        core::iter::from_fn(move || {
            let source = rest.lowest()?;
            rest.0 &= !(1 << source.0);
            Some(source)
        })
    }
}

impl From<IrqSource> for IrqMask {
    fn from(source: IrqSource) -> Self {
        source.mask()
    }
}

impl BitOr for IrqMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for IrqMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for IrqMask {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

// ---------------------------------------------------------------------------
// Vector table
// ---------------------------------------------------------------------------

/// Handler signature. Runs in interrupt context with the whole kernel
/// borrowed; it must never block.
pub type IrqHandler = fn(&mut Kernel, IrqSource);

/// What to do when a source fires.
#[derive(Clone, Copy)]
pub enum Handler {
    /// Call a driver routine.
    Func(IrqHandler),
    /// Nothing beyond the check flag and waking IRQ waiters, which every
    /// dispatch does anyway.
    Notify,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Func(func) => write!(f, "Func({:p})", *func as *const ()),
            Self::Notify => write!(f, "Notify"),
        }
    }
}

/// One handler slot per source.
#[derive(Debug, Clone, Copy)]
pub struct VectorTable {
    slots: [Option<Handler>; IRQ_SOURCES],
}

impl VectorTable {
    pub const fn new() -> Self {
        Self {
            slots: [None; IRQ_SOURCES],
        }
    }

    /// Register (or with `None`, remove) the handler for `source`,
    /// returning the one it replaces.
    pub fn install(&mut self, source: IrqSource, handler: Option<Handler>) -> Option<Handler> {
        core::mem::replace(&mut self.slots[source.index()], handler)
    }

    #[inline]
    pub fn get(&self, source: IrqSource) -> Option<Handler> {
        self.slots[source.index()]
    }
}

impl Default for VectorTable {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Enable/pending/check state for every source, the vector table and the
/// queue of threads waiting for an interrupt.
#[derive(Debug)]
pub struct InterruptController {
    master: bool,
    enabled: IrqMask,
    pending: IrqMask,
    check: IrqMask,
    vectors: VectorTable,
    /// Woken at the end of every dispatch pass.
    pub(crate) waiters: WaitQueue,
}

impl InterruptController {
    pub const fn new() -> Self {
        Self {
            master: false,
            enabled: IrqMask::NONE,
            pending: IrqMask::NONE,
            check: IrqMask::NONE,
            vectors: VectorTable::new(),
            waiters: WaitQueue::new(),
        }
    }

    // Master enable ---------------------------------------------------------

    #[inline]
    pub fn master_enabled(&self) -> bool {
        self.master
    }

    /// Returns the previous master state.
    pub fn enable_master(&mut self) -> bool {
        core::mem::replace(&mut self.master, true)
    }

    pub fn disable_master(&mut self) -> bool {
        core::mem::replace(&mut self.master, false)
    }

    /// Put back a state returned by `enable_master`/`disable_master`.
    pub fn restore_master(&mut self, previous: bool) -> bool {
        core::mem::replace(&mut self.master, previous)
    }

    // Per-source enable -----------------------------------------------------

    #[inline]
    pub fn enabled(&self) -> IrqMask {
        self.enabled
    }

    /// Replace the enable mask, returning the previous one.
    pub fn set_enabled(&mut self, mask: IrqMask) -> IrqMask {
        core::mem::replace(&mut self.enabled, mask)
    }

    pub fn enable(&mut self, mask: IrqMask) -> IrqMask {
        self.set_enabled(self.enabled | mask)
    }

    pub fn disable(&mut self, mask: IrqMask) -> IrqMask {
        self.set_enabled(self.enabled & !mask)
    }

    // Pending latch ---------------------------------------------------------

    #[inline]
    pub fn pending(&self) -> IrqMask {
        self.pending
    }

    /// Latch a source as pending. Called by the port when hardware fires.
    pub fn raise(&mut self, source: IrqSource) {
        self.pending = self.pending | source.mask();
    }

    /// Drop pending bits without dispatching them.
    pub fn acknowledge(&mut self, mask: IrqMask) {
        self.pending = self.pending & !mask;
    }

    /// Pending-and-enabled sources.
    #[inline]
    pub fn active(&self) -> IrqMask {
        self.pending & self.enabled
    }

    /// Claim the next source to service: the lowest-numbered one that is
    /// both pending and enabled. Its pending bit is cleared here, before
    /// any handler runs, so a re-trigger during handling is kept.
    pub fn take_next(&mut self) -> Option<IrqSource> {
        let source = self.active().lowest()?;
        self.acknowledge(source.mask());
        Some(source)
    }

    // Check flags -----------------------------------------------------------

    #[inline]
    pub fn check_flags(&self) -> IrqMask {
        self.check
    }

    pub fn set_check(&mut self, mask: IrqMask) {
        self.check = self.check | mask;
    }

    pub fn clear_check(&mut self, mask: IrqMask) {
        self.check = self.check & !mask;
    }

    // Vectors ---------------------------------------------------------------

    pub fn install(&mut self, source: IrqSource, handler: Option<Handler>) -> Option<Handler> {
        self.vectors.install(source, handler)
    }

    #[inline]
    pub fn handler(&self, source: IrqSource) -> Option<Handler> {
        self.vectors.get(source)
    }
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ignore(_: &mut Kernel, _: IrqSource) {}

    #[test]
    fn test_mask_operations() {
        let a = IrqSource::new(3);
        let b = IrqSource::new(17);
        let set = a.mask() | b.mask();

        assert!(set.contains(a));
        assert!(!set.contains(IrqSource::TIMER));
        assert_eq!(set.lowest(), Some(a));
        assert_eq!((set & !a.mask()).lowest(), Some(b));
        assert!(IrqMask::NONE.lowest().is_none());
        assert_eq!(!IrqMask::NONE, IrqMask::ALL);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_source_out_of_range() {
        IrqSource::new(IRQ_SOURCES);
    }

    #[test]
    fn test_checked_source() {
        assert_eq!(IrqSource::checked(IRQ_SOURCES - 1).map(IrqSource::index), Some(IRQ_SOURCES - 1));
        assert_eq!(IrqSource::checked(IRQ_SOURCES), None);
    }

    #[test]
    fn test_install_returns_previous() {
        let mut table = VectorTable::new();
        let source = IrqSource::new(5);
        assert!(table.install(source, Some(Handler::Notify)).is_none());
        assert!(matches!(table.install(source, Some(Handler::Func(ignore))), Some(Handler::Notify)));
        assert!(matches!(table.install(source, None), Some(Handler::Func(_))));
        assert!(table.get(source).is_none());
    }

    #[test]
    fn test_take_next_lowest_first() {
        let mut ctl = InterruptController::new();
        ctl.enable(IrqSource::new(2).mask() | IrqSource::new(9).mask());
        ctl.raise(IrqSource::new(9));
        ctl.raise(IrqSource::new(2));
        ctl.raise(IrqSource::new(4)); // not enabled

        assert_eq!(ctl.take_next(), Some(IrqSource::new(2)));
        assert_eq!(ctl.take_next(), Some(IrqSource::new(9)));
        assert_eq!(ctl.take_next(), None);
        // Disabled source stays latched
        assert!(ctl.pending().contains(IrqSource::new(4)));
    }

    #[test]
    fn test_enable_disable_return_previous() {
        let mut ctl = InterruptController::new();
        let a = IrqSource::new(1).mask();
        let b = IrqSource::new(6).mask();

        assert_eq!(ctl.enable(a), IrqMask::NONE);
        assert_eq!(ctl.enable(b), a);
        assert_eq!(ctl.disable(a), a | b);
        assert_eq!(ctl.enabled(), b);

        assert!(!ctl.enable_master());
        assert!(ctl.disable_master());
        assert!(!ctl.restore_master(true));
        assert!(ctl.master_enabled());
    }

    #[test]
    fn test_check_flags() {
        let mut ctl = InterruptController::new();
        let a = IrqSource::new(1).mask();
        let b = IrqSource::new(2).mask();
        ctl.set_check(a | b);
        ctl.clear_check(a);
        assert_eq!(ctl.check_flags(), b);
    }
}
