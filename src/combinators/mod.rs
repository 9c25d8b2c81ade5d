//! `race`, `merge`, `zip`, `latest`: each combinator builds a new
//! [`Channel`](crate::Channel) whose executor owns a `Vec` of
//! [`Contender`]s — another async sequence, a sync sequence eagerly adapted
//! to async, a single deferred value, or another `Channel` itself.
//!
//! Type-system overloads and variadic helpers that would let these take a
//! heterogeneous fixed-arity argument list (as in languages with structural
//! tuple types) are out of scope here: contenders are passed as a plain
//! `Vec<Contender<T, E>>`.

mod contender;
mod latest;
mod merge;
mod race;
mod zip;

pub use contender::Contender;
pub use latest::latest;
pub use merge::merge;
pub use race::race;
pub use zip::zip;
