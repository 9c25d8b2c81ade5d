//! `sluice` — a push/pull asynchronous channel primitive.
//!
//! A [`Channel`] is a lazy async sequence driven by a caller-supplied
//! *executor* closure: the executor produces values by calling [`Push::push`]
//! (or [`Push::push_deferred`] for a value that itself needs awaiting before
//! it is observable), and consumers drain them one at a time through
//! [`Channel::next`]. An optional [`Buffer`] sits between the two; a
//! zero-capacity buffer (the default) forces a direct rendezvous between a
//! push and a pull.
//!
//! The engineering problem this crate solves is not the surface API but the
//! state machine coordinating an arbitrary number of outstanding pushes and
//! pulls, executor termination racing with consumer-side `return`/`throw`,
//! and the single-shot `stop` signal an executor awaits to run scoped
//! teardown. See [`controller`] for the full state machine and
//! `Controller`-level invariants.
//!
//! ```
//! use sluice::{Buffer, Channel};
//!
//! # async fn run() {
//! let channel: Channel<i32, ()> = Channel::new(Buffer::default(), |push, stop| async move {
//!     for i in 0..3 {
//!         if push.push(i).is_err() {
//!             break;
//!         }
//!     }
//!     let _ = stop;
//!     Ok(3)
//! });
//!
//! let mut values = Vec::new();
//! loop {
//!     let iteration = channel.next().unwrap().await.unwrap();
//!     if iteration.done {
//!         break;
//!     }
//!     values.push(iteration.value.unwrap());
//! }
//! assert_eq!(values, vec![0, 1, 2]);
//! # }
//! ```
//!
//! # Combinators
//!
//! [`combinators::race`], [`combinators::merge`], [`combinators::zip`] and
//! [`combinators::latest`] each build a new [`Channel`] whose executor
//! consumes a `Vec` of [`combinators::Contender`]s (another async stream, an
//! eagerly-adapted sync iterator, or a single deferred value).
//!
//! # PubSub
//!
//! [`pubsub::PubSub`] is a trivial topic-to-subscribers fan-out layer built
//! entirely on the `push`/`close`/`stop` contract a [`Channel`]'s executor
//! already exposes — it needs nothing else from the core.

pub mod buffer;
pub mod channel;
pub mod combinators;
pub mod controller;
pub mod error;
pub mod pubsub;

pub use buffer::Buffer;
pub use channel::{Channel, ChannelStream};
pub use combinators::Contender;
pub use controller::{Iteration, Push, PushOutcome, Stop};
pub use error::{BufferError, ChannelError, OverflowError};
pub use pubsub::PubSub;

/// Caps both the push queue and the pull queue: parking more than this many
/// pushes, or more than this many pulls, at once is a programmer bug
/// signalled as [`OverflowError`] at the offending call site. The channel
/// itself is not torn down — it remains usable once the backlog drains.
pub const MAX_QUEUE_LENGTH: usize = 1024;
