//! Finite-capacity FIFO sitting between the executor's pushes and the
//! consumer's pulls.
//!
//! Unlike the ring buffers elsewhere in this crate's lineage, capacity here
//! is a runtime value rather than a const generic: a `Channel` is typically
//! constructed once per call site with a buffer shape chosen by the caller,
//! not monomorphized per size. A `VecDeque<T>` is the right backing store for
//! that.
//!
//! ```
//! use sluice::Buffer;
//!
//! let mut buf = Buffer::<i32>::sliding(2);
//! buf.add(1);
//! buf.add(2);
//! buf.add(3); // evicts 1
//! assert_eq!(buf.remove(), 2);
//! assert_eq!(buf.remove(), 3);
//! ```

use std::collections::VecDeque;

use crate::error::BufferError;

/// The four buffer shapes a [`Channel`](crate::Channel) can be built with.
#[derive(Debug)]
pub enum Buffer<T> {
    /// Rejects `add` once `len == cap`. `Fixed(0)` is simultaneously `empty`
    /// and `full`, forcing every push to either hand off to a waiting pull
    /// or park — the channel's default.
    Fixed { cap: usize, items: VecDeque<T> },
    /// Never reports `full`; `add` on a saturated buffer evicts the oldest
    /// element before appending the new one.
    Sliding { cap: usize, items: VecDeque<T> },
    /// Never reports `full`; `add` on a saturated buffer silently discards
    /// the new value.
    Dropping { cap: usize, items: VecDeque<T> },
}

impl<T> Buffer<T> {
    pub fn fixed(cap: usize) -> Self {
        Buffer::Fixed { cap, items: VecDeque::with_capacity(cap) }
    }

    pub fn sliding(cap: usize) -> Self {
        assert!(cap >= 1, "Sliding buffer capacity must be at least 1");
        Buffer::Sliding { cap, items: VecDeque::with_capacity(cap) }
    }

    pub fn dropping(cap: usize) -> Self {
        assert!(cap >= 1, "Dropping buffer capacity must be at least 1");
        Buffer::Dropping { cap, items: VecDeque::with_capacity(cap) }
    }

    /// The zero-capacity `Fixed` degenerate case: a [`Channel`](crate::Channel)
    /// built with this buffer always rendezvous a push directly with a pull.
    pub fn rendezvous() -> Self {
        Buffer::fixed(0)
    }

    pub fn len(&self) -> usize {
        match self {
            Buffer::Fixed { items, .. }
            | Buffer::Sliding { items, .. }
            | Buffer::Dropping { items, .. } => items.len(),
        }
    }

    pub fn empty(&self) -> bool {
        self.len() == 0
    }

    /// `Sliding`/`Dropping` never report full: an eviction or a drop
    /// always makes room instead.
    pub fn full(&self) -> bool {
        match self {
            Buffer::Fixed { cap, items } => items.len() >= *cap,
            Buffer::Sliding { .. } | Buffer::Dropping { .. } => false,
        }
    }

    /// Adds a value. On `Fixed`, calling this while `full()` is a programmer
    /// error — callers must check `full()` (or go through
    /// [`try_add`](Buffer::try_add)) first.
    pub fn add(&mut self, value: T) {
        self.try_add(value)
            .unwrap_or_else(|_| panic!("{}", BufferError::AddOnFull))
    }

    /// Fallible form of [`add`](Buffer::add); never errors for
    /// `Sliding`/`Dropping`.
    pub fn try_add(&mut self, value: T) -> Result<(), BufferError> {
        match self {
            Buffer::Fixed { cap, items } => {
                if items.len() >= *cap {
                    return Err(BufferError::AddOnFull);
                }
                items.push_back(value);
                Ok(())
            }
            Buffer::Sliding { cap, items } => {
                if items.len() >= *cap {
                    items.pop_front();
                }
                items.push_back(value);
                Ok(())
            }
            Buffer::Dropping { cap, items } => {
                if items.len() < *cap {
                    items.push_back(value);
                }
                Ok(())
            }
        }
    }

    /// Removes and returns the oldest element. Calling this on an empty
    /// buffer is a programmer error; check [`empty`](Buffer::empty) first.
    pub fn remove(&mut self) -> T {
        self.try_remove()
            .unwrap_or_else(|| panic!("{}", BufferError::RemoveOnEmpty))
    }

    /// Fallible form of [`remove`](Buffer::remove).
    pub fn try_remove(&mut self) -> Option<T> {
        match self {
            Buffer::Fixed { items, .. }
            | Buffer::Sliding { items, .. }
            | Buffer::Dropping { items, .. } => items.pop_front(),
        }
    }
}

impl<T> Default for Buffer<T> {
    /// The channel's default: a zero-capacity `Fixed` buffer, i.e. rendezvous.
    fn default() -> Self {
        Buffer::rendezvous()
    }
}
