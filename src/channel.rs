//! The public façade: wraps the controller in a cheaply cloneable handle
//! and exposes it as both an explicit `next`/`return`/`throw` API and a
//! [`futures::Stream`].

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::Stream;

use crate::buffer::Buffer;
use crate::combinators::{self, Contender};
use crate::controller::{
    ChannelError, Iteration, NextFuture, Push, ReturnFuture, Shared, Stop,
};
use crate::error::OverflowError;

/// A push/pull asynchronous channel: constructed with an
/// executor closure that is handed a [`Push`] handle and a [`Stop`] handle,
/// runs lazily (nothing happens until the first `next`/`return`/`throw`
/// call), and yields [`Iteration`]s to however many concurrent callers await
/// them, in the order they called.
///
/// `H` is the hint type a caller may pass to [`Channel::next_with_hint`]; it
/// defaults to `()` for channels that don't use hints at all.
pub struct Channel<T, E, H = ()> {
    shared: std::sync::Arc<Shared<T, E, H>>,
}

impl<T, E, H> Clone for Channel<T, E, H> {
    fn clone(&self) -> Self {
        Channel { shared: self.shared.clone() }
    }
}

impl<T, E, H> Channel<T, E, H>
where
    T: Send + 'static,
    E: Send + 'static,
    H: Send + 'static,
{
    /// Builds a channel around an executor. The executor only starts running
    /// on the first call to `next`/`next_with_hint`/`return_`/`throw`.
    pub fn new<F, Fut>(buffer: Buffer<T>, executor: F) -> Self
    where
        F: FnOnce(Push<T, E, H>, Stop<T, E, H>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Channel { shared: Shared::new(buffer, executor) }
    }

    /// Requests the next value. Fails synchronously if more than
    /// [`MAX_QUEUE_LENGTH`](crate::MAX_QUEUE_LENGTH) pulls are already
    /// parked.
    pub fn next(&self) -> Result<NextFuture<T, E>, OverflowError>
    where
        H: Default,
    {
        self.next_with_hint(None)
    }

    /// Like [`next`](Channel::next), but also forwards `hint` to whichever
    /// producer ends up resolving this call.
    pub fn next_with_hint(&self, hint: Option<H>) -> Result<NextFuture<T, E>, OverflowError> {
        self.shared.next_sync(hint)
    }

    /// Requests early termination: if the executor never
    /// started, it never will; otherwise the stop signal fires and this call
    /// suspends until the executor's own outcome (if any) settles.
    pub fn return_(&self, value: Option<T>) -> ReturnFuture<T, E> {
        self.shared.return_sync(value)
    }

    /// Injects an error. Requires `E: Clone`: a throw can
    /// settle this call and an already-parked pull with the same error.
    pub fn throw(&self, error: E) -> Result<Iteration<T>, ChannelError<E>>
    where
        E: Clone,
    {
        self.shared.throw_sync(error)
    }
}

/// Combinator surface: `Channel::race`/`merge`/`zip`/`latest`
/// each take a `Vec` of [`Contender`]s and return a freshly-built `Channel`.
/// See [`combinators`](crate::combinators) for the shared `Contender` type
/// and per-combinator semantics.
impl<T, E> Channel<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn race(contenders: Vec<Contender<T, E>>) -> Channel<Option<T>, E> {
        combinators::race(contenders)
    }

    pub fn merge(contenders: Vec<Contender<T, E>>) -> Channel<Option<T>, E> {
        combinators::merge(contenders)
    }

    pub fn zip(contenders: Vec<Contender<T, E>>) -> Channel<Vec<Option<T>>, E> {
        combinators::zip(contenders)
    }
}

impl<T, E> Channel<T, E>
where
    T: Send + Clone + 'static,
    E: Send + 'static,
{
    /// Requires `T: Clone`: each per-contender loop needs
    /// to snapshot the shared "latest values" vector while the others may
    /// still be reading it.
    pub fn latest(contenders: Vec<Contender<T, E>>) -> Channel<Vec<Option<T>>, E> {
        combinators::latest(contenders)
    }
}

/// A [`Channel`] is itself a [`Stream`] over plain values:
/// iteration stops (`None`) the first time an `Iteration` comes back `done`,
/// and a rejection ends the stream by yielding `None` after having been
/// observed through [`Channel::next`] directly — callers that need to see
/// the eventual error should prefer the explicit `next` API, since a
/// `Stream`'s `Item` carries no error channel of its own beyond `T`.
impl<T, E, H> Stream for ChannelStream<T, E, H>
where
    T: Send + 'static,
    E: Send + 'static,
    H: Send + Default + 'static,
{
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if self.exhausted {
            return Poll::Ready(None);
        }
        loop {
            if self.pending.is_none() {
                match self.channel.next() {
                    Ok(fut) => self.pending = Some(Box::pin(fut)),
                    Err(_) => {
                        self.exhausted = true;
                        return Poll::Ready(None);
                    }
                }
            }
            let fut = self.pending.as_mut().unwrap();
            return match fut.as_mut().poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(result) => {
                    self.pending = None;
                    match result {
                        Ok(Iteration { value: Some(v), done: false }) => Poll::Ready(Some(v)),
                        Ok(Iteration { value, done: true }) => {
                            self.exhausted = true;
                            Poll::Ready(value)
                        }
                        Ok(Iteration { value: None, done: false }) => continue,
                        Err(_) => {
                            self.exhausted = true;
                            Poll::Ready(None)
                        }
                    }
                }
            };
        }
    }
}

/// Adapts a [`Channel`] into a [`Stream`] of its values.
pub struct ChannelStream<T, E, H> {
    channel: Channel<T, E, H>,
    pending: Option<BoxFuture<'static, Result<Iteration<T>, ChannelError<E>>>>,
    exhausted: bool,
}

impl<T, E, H> Channel<T, E, H>
where
    T: Send + 'static,
    E: Send + 'static,
    H: Send + Default + 'static,
{
    pub fn into_stream(self) -> ChannelStream<T, E, H> {
        ChannelStream { channel: self, pending: None, exhausted: false }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::buffer::Buffer;

    /// A zero-capacity buffer forces the first value to hand directly to
    /// the pull already parked waiting for it; only once that rendezvous
    /// has happened does the buffer start sliding.
    #[tokio::test]
    async fn sliding_buffer_drops_middle_values() {
        let channel: Channel<i32, ()> = Channel::new(Buffer::sliding(3), |push, stop| async move {
            for i in 0..100 {
                let _ = push.push(i);
            }
            stop.signal(None);
            Ok(-1)
        });

        let mut seen = Vec::new();
        for _ in 0..4 {
            let iteration = channel.next().unwrap().await.unwrap();
            seen.push(iteration.value);
        }
        assert_eq!(seen, vec![Some(0), Some(97), Some(98), Some(99)]);

        let done = channel.next().unwrap().await.unwrap();
        assert_eq!(done, Iteration { value: Some(-1), done: true });
        let done_again = channel.next().unwrap().await.unwrap();
        assert_eq!(done_again, Iteration { value: None, done: true });
    }

    #[tokio::test]
    async fn dropping_buffer_discards_newest() {
        let channel: Channel<i32, ()> = Channel::new(Buffer::dropping(3), |push, stop| async move {
            for i in 0..100 {
                let _ = push.push(i);
            }
            stop.signal(None);
            Ok(-1)
        });

        let mut seen = Vec::new();
        for _ in 0..4 {
            let iteration = channel.next().unwrap().await.unwrap();
            seen.push(iteration.value);
        }
        assert_eq!(seen, vec![Some(0), Some(1), Some(2), Some(3)]);
    }

    /// The `Stream` adapter yields every pushed value, then (since a `done`
    /// iteration may itself carry the executor's terminal value) the
    /// terminal value as one final item before ending.
    #[tokio::test]
    async fn stream_adapter_stops_at_done() {
        let channel: Channel<i32, ()> = Channel::new(Buffer::default(), |push, _stop| async move {
            for i in 0..3 {
                let _ = push.push(i).unwrap().await;
            }
            Ok(3)
        });

        let values: Vec<i32> = channel.into_stream().collect().await;
        assert_eq!(values, vec![0, 1, 2, 3]);
    }
}
