use std::sync::atomic::{AtomicU32, Ordering::*};

/// Bit that records a pending signal.
const PENDING: u32 = 1 << 31;

/// Bits that hold the nesting count.
const COUNT: u32 = PENDING - 1;

/// Atomic section nesting count and pending-signal flag of a processor.
///
/// Both live in one word, so decrementing the count
/// observes a signal that was marked pending before the decrement.
#[derive(Debug, Default)]
pub struct AtomicState
{
    bits: AtomicU32,
}

/// Snapshot of an [`AtomicState`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SectionState
{
    /// Not in an atomic section; the collector may run.
    Idle,

    /// Inside this many nested atomic sections.
    InRuntime(u32),

    /// A signal is waiting for the signal handler.
    SignalPending
    {
        /// Atomic section nesting count.
        depth: u32,
    },
}

impl SectionState
{
    fn from_bits(bits: u32) -> Self
    {
        let depth = bits & COUNT;
        if bits & PENDING != 0 {
            Self::SignalPending{depth}
        } else if depth == 0 {
            Self::Idle
        } else {
            Self::InRuntime(depth)
        }
    }

    /// Atomic section nesting count.
    pub fn depth(self) -> u32
    {
        match self {
            Self::Idle => 0,
            Self::InRuntime(depth) => depth,
            Self::SignalPending{depth} => depth,
        }
    }

    /// Whether a signal is pending.
    pub fn is_signal_pending(self) -> bool
    {
        matches!(self, Self::SignalPending{..})
    }
}

impl AtomicState
{
    /// Not in an atomic section and no signal pending.
    pub const fn new() -> Self
    {
        Self{bits: AtomicU32::new(0)}
    }

    /// Enter an atomic section.
    ///
    /// Returns the state after entering.
    pub fn begin(&self) -> SectionState
    {
        let previous = self.bits.fetch_add(1, AcqRel);
        debug_assert_ne!(previous & COUNT, COUNT, "Atomic section overflow");
        SectionState::from_bits(previous + 1)
    }

    /// Leave an atomic section.
    ///
    /// Returns the state after leaving,
    /// including whether a signal was pending at that point.
    pub fn end(&self) -> SectionState
    {
        let previous = self.bits.fetch_sub(1, AcqRel);
        debug_assert_ne!(previous & COUNT, 0, "Atomic section underflow");
        SectionState::from_bits(previous - 1)
    }

    /// The current state.
    pub fn get(&self) -> SectionState
    {
        SectionState::from_bits(self.bits.load(Acquire))
    }

    /// Atomic section nesting count.
    pub fn count(&self) -> u32
    {
        self.bits.load(Acquire) & COUNT
    }

    /// Replace the nesting count, keeping the pending flag.
    pub fn set_count(&self, count: u32)
    {
        debug_assert_eq!(count & PENDING, 0);
        let _ = self.bits.fetch_update(AcqRel, Acquire, |bits| {
            Some(bits & PENDING | count)
        });
    }

    /// Record that a signal arrived.
    pub fn mark_signal_pending(&self)
    {
        self.bits.fetch_or(PENDING, AcqRel);
    }

    /// Clear the pending flag, returning whether it was set.
    pub fn clear_signal_pending(&self) -> bool
    {
        self.bits.fetch_and(!PENDING, AcqRel) & PENDING != 0
    }

    /// Whether a signal is pending.
    pub fn is_signal_pending(&self) -> bool
    {
        self.bits.load(Acquire) & PENDING != 0
    }
}
