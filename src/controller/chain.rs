//! The pending-iteration chain: a single reassignable deferred that every
//! new iteration composes onto, so that outcomes are delivered to callers
//! in call order regardless of the order in which the underlying values
//! settle.
//!
//! Each iteration gets a `Gate` (the previous iteration's latch) to wait on
//! before it is allowed to surface a result, and installs a fresh `Latch` as
//! the new tail for whatever iteration comes after it.

use futures::channel::oneshot;

/// What an iteration signals to its successor once it settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// A real value (or this is the very first link): the next iteration
    /// should resolve its own outcome normally.
    Continue,
    /// This iteration settled into "done" (a terminal value, an error, or a
    /// plain end-of-stream): every iteration after it collapses to "done"
    /// with no value, without even looking at what it was assigned.
    Halt,
}

pub(crate) type Gate = oneshot::Receiver<Signal>;
pub(crate) type Latch = oneshot::Sender<Signal>;

#[derive(Default)]
pub(crate) struct Chain {
    tail: Option<Gate>,
}

impl Chain {
    /// Returns the gate this new iteration must wait on (`None` only for the
    /// very first iteration ever issued) and the latch it must eventually
    /// fire so the iteration issued after it can proceed.
    pub(crate) fn link(&mut self) -> (Option<Gate>, Latch) {
        let (latch, gate) = oneshot::channel();
        (self.tail.replace(gate), latch)
    }
}

/// A dropped `Sender` (e.g. a cancelled iteration) is observed by its
/// successor as a closed channel; we treat that the same as `Halt` since the
/// iteration that owned it never got to signal anything and the chain must
/// not stall forever waiting on it.
pub(crate) fn signal_or_halt(result: Result<Signal, oneshot::Canceled>) -> Signal {
    result.unwrap_or(Signal::Halt)
}
