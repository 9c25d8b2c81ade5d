//! A *contender*: any input to a combinator. The three shapes allowed — an
//! async sequence, a sync sequence eagerly adapted to async, or a single
//! deferred/plain value adapted to a one-shot sequence — are unified here
//! behind one trait object so `race`/`merge`/`zip`/`latest` can treat a
//! `Vec<Contender<T, E>>` uniformly.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{self, BoxFuture};
use futures::stream::{BoxStream, Stream, StreamExt};

use crate::channel::Channel;
use crate::controller::{ChannelError, Iteration, NextFuture};

/// Internal driver every contender shape implements. `poll_next` mirrors
/// [`Channel::next`]'s `{value, done}` contract (a one-shot contender
/// delivers both in the same call, exactly as a generator that only ever
/// wraps a single promise would).
///
/// Each implementation owns whatever in-flight future backs its current
/// pull, rather than handing it out to the caller: `race` polls every
/// contender concurrently each round and only one of them wins, so a
/// contender that doesn't keep its own pending future alive across rounds
/// would silently restart (or, for a one-shot value, wrongly report
/// "done") every time it loses a round.
pub(crate) trait Contend<T, E>: Send {
    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Result<Iteration<T>, E>>;
    fn terminate(&mut self) -> BoxFuture<'_, ()>;
}

struct StreamSource<T, E> {
    stream: BoxStream<'static, Result<T, E>>,
}

impl<T, E> Contend<T, E> for StreamSource<T, E>
where
    T: Send,
    E: Send,
{
    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Result<Iteration<T>, E>> {
        self.stream.as_mut().poll_next(cx).map(|opt| match opt {
            Some(Ok(v)) => Ok(Iteration { value: Some(v), done: false }),
            Some(Err(e)) => Err(e),
            None => Ok(Iteration { value: None, done: true }),
        })
    }

    fn terminate(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

struct SingleSource<T, E> {
    fut: Option<Pin<Box<dyn Future<Output = Result<T, E>> + Send>>>,
}

impl<T, E> Contend<T, E> for SingleSource<T, E>
where
    T: Send,
    E: Send,
{
    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Result<Iteration<T>, E>> {
        let Some(fut) = self.fut.as_mut() else {
            return Poll::Ready(Ok(Iteration { value: None, done: true }));
        };
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(r) => {
                self.fut = None;
                Poll::Ready(r.map(|v| Iteration { value: Some(v), done: true }))
            }
        }
    }

    fn terminate(&mut self) -> BoxFuture<'_, ()> {
        self.fut = None;
        Box::pin(async {})
    }
}

struct ChannelSource<T, E, H> {
    channel: Channel<T, E, H>,
    pending: Option<NextFuture<T, E>>,
}

impl<T, E, H> Contend<T, E> for ChannelSource<T, E, H>
where
    T: Send + 'static,
    E: Send + 'static,
    H: Send + Default + 'static,
{
    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Result<Iteration<T>, E>> {
        loop {
            if self.pending.is_none() {
                match self.channel.next() {
                    Ok(fut) => self.pending = Some(fut),
                    // The contender's own pull queue overflowed. Combinators
                    // never issue more than one outstanding pull per
                    // contender at a time, so this is unreachable in
                    // practice; treat it as the contender simply being done
                    // rather than panicking.
                    Err(_overflow) => return Poll::Ready(Ok(Iteration { value: None, done: true })),
                }
            }
            let fut = self.pending.as_mut().unwrap();
            return match Pin::new(fut).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(result) => {
                    self.pending = None;
                    match result {
                        Ok(it) => Poll::Ready(Ok(it)),
                        Err(ChannelError::Executor(e)) => Poll::Ready(Err(e)),
                        Err(ChannelError::Buffer(e)) => {
                            unreachable!("buffer contract violations panic at the call site: {e}")
                        }
                    }
                }
            };
        }
    }

    fn terminate(&mut self) -> BoxFuture<'_, ()> {
        self.pending = None;
        let channel = self.channel.clone();
        Box::pin(async move {
            let _ = channel.return_(None).await;
        })
    }
}

/// One input to a combinator: an async [`Stream`], a sync
/// [`IntoIterator`] eagerly adapted via [`futures::stream::iter`], a single
/// [`Future`], or another [`Channel`].
pub struct Contender<T, E>(pub(crate) Box<dyn Contend<T, E> + Send>);

impl<T, E> Contender<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Wraps any [`Stream`] of `Result<T, E>` as a contender.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        Contender(Box::new(StreamSource { stream: stream.boxed() }))
    }

    /// Eagerly adapts a sync sequence to an async one.
    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_stream(futures::stream::iter(iter.into_iter().map(Ok)))
    }

    /// Adapts a single deferred value to a one-shot sequence: its only
    /// iteration carries both the value and `done: true` in the same step,
    /// matching how a generator wrapping one promise behaves.
    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Contender(Box::new(SingleSource { fut: Some(Box::pin(fut)) }))
    }

    /// Wraps another [`Channel`] as a contender, driving it with
    /// [`Channel::next`] and terminating it with [`Channel::return_`] on
    /// teardown — the one contender shape that actually has a termination
    /// operation to call.
    pub fn from_channel<H>(channel: Channel<T, E, H>) -> Self
    where
        H: Send + Default + 'static,
    {
        Contender(Box::new(ChannelSource { channel, pending: None }))
    }
}

impl<T, E> Contender<T, E> {
    /// A pull against this contender. Backed by `poll_next`, so the
    /// in-flight state (an unfinished sleep, a partially-polled one-shot
    /// future, a parked pull against an inner channel) lives in the
    /// contender itself and survives this particular `Future` being dropped
    /// before it resolves — the case every round of `race` produces for
    /// whichever contenders don't win.
    pub(crate) fn next(&mut self) -> impl Future<Output = Result<Iteration<T>, E>> + '_ {
        future::poll_fn(move |cx| self.0.poll_next(cx))
    }

    pub(crate) fn terminate(&mut self) -> BoxFuture<'_, ()> {
        self.0.terminate()
    }
}

pub(crate) async fn terminate_all<T, E>(contenders: &mut [Contender<T, E>]) {
    for c in contenders.iter_mut() {
        c.terminate().await;
    }
}
