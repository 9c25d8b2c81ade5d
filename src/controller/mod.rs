//! The state machine: owns the push queue, pull queue, buffer, executor
//! future, stop signal, pending-iteration chain and final-outcome slot, and
//! exposes the three entry points (`next`, `return`, `throw`) plus the
//! `push`/`stop` handles the executor itself is given.
//!
//! Concurrency model: a single `std::sync::Mutex` guards everything
//! mutable. No `.await` ever happens while the lock is held — the lock only
//! ever protects synchronous bookkeeping; the state machine itself is
//! conceptually single-threaded-cooperative, with the mutex added purely to
//! serialize concurrent callers on a multi-threaded executor.

pub(crate) mod chain;

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crossbeam_utils::CachePadded;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture};
use futures::task::AtomicWaker;

use crate::buffer::Buffer;
use crate::error::{OverflowError, QueueKind};
use crate::MAX_QUEUE_LENGTH;
use chain::{signal_or_halt, Chain, Gate, Latch, Signal};

pub use crate::error::ChannelError;

const INITIAL: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;
const FINISHED: u8 = 3;

/// One observable step of the lazy async sequence: either a value (`done ==
/// false`) or the terminal step, which carries the terminal value at most
/// once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iteration<T> {
    pub value: Option<T>,
    pub done: bool,
}

impl<T> Iteration<T> {
    pub(crate) fn done(value: Option<T>) -> Self {
        Iteration { value, done: true }
    }
}

/// A value handed to [`Push::push`], or the boxed future a deferred value is
/// unwrapped from: pushed deferred values are awaited to their underlying
/// value before being exposed to consumers.
pub(crate) enum PushValue<T, E> {
    Value(T),
    Deferred(BoxFuture<'static, Result<T, E>>),
}

impl<T, E> PushValue<T, E> {
    async fn resolve(self) -> Result<T, E> {
        match self {
            PushValue::Value(v) => Ok(v),
            PushValue::Deferred(fut) => fut.await,
        }
    }
}

/// What `push`'s returned future resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome<H> {
    /// The push landed; carries the hint of whichever pull consumed it, if
    /// that pull was itself called with one.
    Accepted(Option<H>),
    /// The channel was already stopped; the value was dropped.
    NotAccepted,
}

/// What a parked pull (or buffer/push-queue hand-off) resolves to before any
/// deferred unwrapping happens.
pub(crate) enum RawOutcome<T, E> {
    Pushed(PushValue<T, E>),
    Done(Option<T>),
    Rejected(E),
}

enum OwnSource<T, E> {
    Ready(RawOutcome<T, E>),
    Parked(oneshot::Receiver<RawOutcome<T, E>>),
}

impl<T, E> OwnSource<T, E> {
    fn poll_resolve(&mut self, cx: &mut Context<'_>) -> Poll<RawOutcome<T, E>> {
        match self {
            OwnSource::Ready(_) => {
                let OwnSource::Ready(raw) = std::mem::replace(self, OwnSource::Parked(never_receiver()))
                else {
                    unreachable!()
                };
                Poll::Ready(raw)
            }
            OwnSource::Parked(rx) => Pin::new(rx).poll(cx).map(|r| r.unwrap_or(RawOutcome::Done(None))),
        }
    }
}

/// A receiver whose sender is already dropped, used as a throwaway
/// placeholder once a `Ready` source has been consumed.
fn never_receiver<T, E>() -> oneshot::Receiver<RawOutcome<T, E>> {
    let (_tx, rx) = oneshot::channel();
    rx
}

struct PendingPush<T, E, H> {
    value: PushValue<T, E>,
    hint_tx: oneshot::Sender<PushOutcome<H>>,
}

struct PendingPull<T, E, H> {
    tx: oneshot::Sender<RawOutcome<T, E>>,
    hint: Option<H>,
}

struct Inner<T, E, H> {
    buffer: Buffer<PushValue<T, E>>,
    /// Mirrors `buffer` 1:1: `Some(hint_tx)` when the slot holds a value
    /// moved in from a parked push still owed a hint resolution, `None`
    /// when the slot was filled by a direct (already-resolved) push.
    buffer_hints: VecDeque<Option<oneshot::Sender<PushOutcome<H>>>>,
    push_queue: VecDeque<PendingPush<T, E, H>>,
    pull_queue: VecDeque<PendingPull<T, E, H>>,
    exec: Option<BoxFuture<'static, Result<T, E>>>,
    final_outcome: Option<Result<T, E>>,
    /// `false` while the outcome is only `return`'s provisional fallback
    /// value, still overwritable by whatever the executor itself produces.
    final_outcome_committed: bool,
    final_outcome_delivered: bool,
    chain: Chain,
}

type ExecutorFn<T, E, H> =
    Box<dyn FnOnce(Push<T, E, H>, Stop<T, E, H>) -> BoxFuture<'static, Result<T, E>> + Send>;

pub(crate) struct Shared<T, E, H> {
    state: CachePadded<AtomicU8>,
    inner: Mutex<Inner<T, E, H>>,
    executor_fn: Mutex<Option<ExecutorFn<T, E, H>>>,
    stop_fired: AtomicBool,
    stop_waker: AtomicWaker,
}

impl<T, E, H> Shared<T, E, H>
where
    T: Send + 'static,
    E: Send + 'static,
    H: Send + 'static,
{
    pub(crate) fn new<F, Fut>(buffer: Buffer<T>, executor: F) -> Arc<Self>
    where
        F: FnOnce(Push<T, E, H>, Stop<T, E, H>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let remapped: Buffer<PushValue<T, E>> = match buffer {
            Buffer::Fixed { cap, .. } => Buffer::fixed(cap),
            Buffer::Sliding { cap, .. } => Buffer::sliding(cap),
            Buffer::Dropping { cap, .. } => Buffer::dropping(cap),
        };
        Arc::new(Shared {
            state: CachePadded::new(AtomicU8::new(INITIAL)),
            inner: Mutex::new(Inner {
                buffer: remapped,
                buffer_hints: VecDeque::new(),
                push_queue: VecDeque::new(),
                pull_queue: VecDeque::new(),
                exec: None,
                final_outcome: None,
                final_outcome_committed: false,
                final_outcome_delivered: false,
                chain: Chain::default(),
            }),
            executor_fn: Mutex::new(Some(Box::new(move |push, stop| {
                Box::pin(executor(push, stop)) as BoxFuture<'static, Result<T, E>>
            }))),
            stop_fired: AtomicBool::new(false),
            stop_waker: AtomicWaker::new(),
        })
    }

    fn advance_state(&self, to: u8) {
        let mut cur = self.state.load(Ordering::Acquire);
        while cur < to {
            match self
                .state
                .compare_exchange(cur, to, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    tracing::trace!(from = cur, to, "channel state transition");
                    return;
                }
                Err(observed) => cur = observed,
            }
        }
    }

    /// Starts the executor exactly once: runs it
    /// synchronously up to its first suspension, driven by whichever call
    /// triggered the start.
    fn ensure_started(self: &Arc<Self>) {
        if self.state.load(Ordering::Acquire) != INITIAL {
            return;
        }
        if self
            .state
            .compare_exchange(INITIAL, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!("starting channel executor");
            let exec_fn = self
                .executor_fn
                .lock()
                .unwrap()
                .take()
                .expect("executor already consumed");
            let push = Push { shared: self.clone() };
            let stop = Stop { shared: self.clone() };
            let fut = exec_fn(push, stop);
            self.inner.lock().unwrap().exec = Some(fut);
        }
    }

    /// Polls the stored executor future, if any, driving it forward and
    /// capturing its eventual output as the (possibly-fallback-overriding)
    /// final outcome. A no-op once the executor has already completed.
    fn poll_exec(self: &Arc<Self>, cx: &mut Context<'_>) {
        let mut inner = match self.inner.try_lock() {
            Ok(g) => g,
            // Another call is already driving (or mutating) the controller
            // this instant; it will make whatever progress is possible.
            Err(_) => return,
        };
        let Some(fut) = inner.exec.as_mut() else { return };
        match fut.as_mut().poll(cx) {
            Poll::Pending => {}
            Poll::Ready(result) => {
                inner.exec = None;
                let err = result.is_err();
                self.try_set_final(&mut inner, result, true);
                drop(inner);
                self.advance_state(STOPPED);
                if err {
                    tracing::debug!("executor rejected");
                } else {
                    tracing::trace!("executor returned");
                }
            }
        }
    }

    /// First-wins terminal-outcome slot, except a `committed` write always
    /// overrides a previously-uncommitted (`return`-supplied fallback) one.
    fn try_set_final(&self, inner: &mut Inner<T, E, H>, outcome: Result<T, E>, committed: bool) {
        if inner.final_outcome.is_none() || (!inner.final_outcome_committed && committed) {
            inner.final_outcome = Some(outcome);
            inner.final_outcome_committed = inner.final_outcome_committed || committed;
        }
    }

    /// Drains the single terminal-outcome slot: the first caller gets the
    /// value or error (if any), every subsequent one gets `done` with no
    /// value.
    fn take_terminal_raw(&self, inner: &mut Inner<T, E, H>) -> RawOutcome<T, E> {
        if !inner.final_outcome_delivered {
            inner.final_outcome_delivered = true;
            match inner.final_outcome.take() {
                Some(Ok(v)) => RawOutcome::Done(Some(v)),
                Some(Err(e)) => RawOutcome::Rejected(e),
                None => RawOutcome::Done(None),
            }
        } else {
            RawOutcome::Done(None)
        }
    }

    /// Fires the stop signal (idempotent), resolves every parked push with
    /// `NotAccepted` and every parked pull with the terminal outcome, and
    /// advances state to (at least) `Stopped`.
    fn request_stop(self: &Arc<Self>, err: Option<E>) {
        if self.stop_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("stop signal fired");
        let mut inner = self.inner.lock().unwrap();
        if let Some(e) = err {
            self.try_set_final(&mut inner, Err(e), true);
        }
        self.advance_state(STOPPED);
        for p in inner.push_queue.drain(..) {
            let _ = p.hint_tx.send(PushOutcome::NotAccepted);
        }
        while let Some(pull) = inner.pull_queue.pop_front() {
            let raw = self.take_terminal_raw(&mut inner);
            let _ = pull.tx.send(raw);
        }
        drop(inner);
        self.stop_waker.wake();
    }

    fn is_stopped(&self) -> bool {
        self.state.load(Ordering::Acquire) >= STOPPED
    }

    /// `push`: synchronous bookkeeping; the returned
    /// future only suspends if the value is actually parked.
    fn push_value(self: &Arc<Self>, value: PushValue<T, E>) -> Result<PushFuture<H>, OverflowError> {
        let mut inner = self.inner.lock().unwrap();
        let (tx, rx) = oneshot::channel();

        if self.is_stopped() {
            let _ = tx.send(PushOutcome::NotAccepted);
            return Ok(PushFuture { rx });
        }

        if let Some(mut pull) = inner.pull_queue.pop_front() {
            let hint = pull.hint.take();
            let _ = pull.tx.send(RawOutcome::Pushed(value));
            let _ = tx.send(PushOutcome::Accepted(hint));
            return Ok(PushFuture { rx });
        }

        if !inner.buffer.full() {
            inner.buffer.add(value);
            inner.buffer_hints.push_back(None);
            let _ = tx.send(PushOutcome::Accepted(None));
            return Ok(PushFuture { rx });
        }

        if inner.push_queue.len() >= MAX_QUEUE_LENGTH {
            tracing::warn!("push queue overflow");
            return Err(OverflowError { which: QueueKind::Push });
        }

        inner.push_queue.push_back(PendingPush { value, hint_tx: tx });
        Ok(PushFuture { rx })
    }

    /// `next(hint)`: path selection happens synchronously
    /// here, at call time, which is what gives concurrently-issued calls
    /// their call-order assignment before any of them are ever polled.
    fn next_sync(self: &Arc<Self>, hint: Option<H>) -> Result<NextFuture<T, E>, OverflowError> {
        self.ensure_started();
        let mut inner = self.inner.lock().unwrap();

        let own = if !inner.buffer.empty() {
            let pv = inner.buffer.remove();
            if let Some(hint_tx) = inner.buffer_hints.pop_front().flatten() {
                let _ = hint_tx.send(PushOutcome::Accepted(hint));
            }
            if let Some(p) = inner.push_queue.pop_front() {
                inner.buffer.add(p.value);
                inner.buffer_hints.push_back(Some(p.hint_tx));
            }
            OwnSource::Ready(RawOutcome::Pushed(pv))
        } else if let Some(p) = inner.push_queue.pop_front() {
            let _ = p.hint_tx.send(PushOutcome::Accepted(hint));
            OwnSource::Ready(RawOutcome::Pushed(p.value))
        } else if self.is_stopped() {
            self.advance_state(FINISHED);
            OwnSource::Ready(self.take_terminal_raw(&mut inner))
        } else {
            if inner.pull_queue.len() >= MAX_QUEUE_LENGTH {
                tracing::warn!("pull queue overflow");
                return Err(OverflowError { which: QueueKind::Pull });
            }
            let (tx, rx) = oneshot::channel();
            inner.pull_queue.push_back(PendingPull { tx, hint });
            OwnSource::Parked(rx)
        };

        let (gate, latch) = inner.chain.link();
        drop(inner);
        Ok(NextFuture::new(self.clone(), own, gate, latch))
    }

    /// `return(value)`.
    fn return_sync(self: &Arc<Self>, value: Option<T>) -> ReturnFuture<T, E> {
        if self.state.load(Ordering::Acquire) == INITIAL {
            // Never started: the executor is never invoked.
            self.advance_state(FINISHED);
            self.stop_fired.store(true, Ordering::Release);
            let mut inner = self.inner.lock().unwrap();
            inner.final_outcome_delivered = true;
            for p in inner.push_queue.drain(..) {
                let _ = p.hint_tx.send(PushOutcome::NotAccepted);
            }
            while let Some(pull) = inner.pull_queue.pop_front() {
                let _ = pull.tx.send(RawOutcome::Done(None));
            }
            while !inner.buffer.empty() {
                inner.buffer.remove();
            }
            inner.buffer_hints.clear();
            drop(inner);
            return ReturnFuture::ready(Iteration { value, done: true });
        }

        self.request_stop(None);
        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(v) = value {
                self.try_set_final(&mut inner, Ok(v), false);
            }
            // I5: once state reaches Finished, buffer and push queue must be
            // empty — `return` moves straight there, so drain them here
            // rather than leaving stale values for a later `next` to hand
            // out as live iterations after the channel already finished.
            while !inner.buffer.empty() {
                inner.buffer.remove();
            }
            inner.buffer_hints.clear();
        }
        self.advance_state(FINISHED);
        ReturnFuture::pending(self.clone())
    }

    fn is_finished(&self) -> bool {
        self.state.load(Ordering::Acquire) >= FINISHED
    }

    fn buffer_empty(&self) -> bool {
        self.inner.lock().unwrap().buffer.empty()
    }
}

impl<T, E, H> Shared<T, E, H>
where
    T: Send + 'static,
    E: Send + Clone + 'static,
    H: Send + 'static,
{
    /// `throw(error)`. Requires `E: Clone` because a
    /// throw can simultaneously settle this call *and* an already-parked
    /// pull with the same error (mirroring the `Clone` bound
    /// `tokio::sync::broadcast` places on its message type for the same
    /// structural reason: one value observed by more than one waiter).
    fn throw_sync(self: &Arc<Self>, error: E) -> Result<Iteration<T>, ChannelError<E>> {
        if self.state.load(Ordering::Acquire) == INITIAL || self.is_finished() || !self.buffer_empty() {
            self.advance_state(FINISHED);
            self.stop_fired.store(true, Ordering::Release);
            let mut inner = self.inner.lock().unwrap();
            inner.final_outcome_delivered = true;
            for p in inner.push_queue.drain(..) {
                let _ = p.hint_tx.send(PushOutcome::NotAccepted);
            }
            while let Some(pull) = inner.pull_queue.pop_front() {
                let _ = pull.tx.send(RawOutcome::Done(None));
            }
            while !inner.buffer.empty() {
                inner.buffer.remove();
            }
            inner.buffer_hints.clear();
            drop(inner);
            return Err(ChannelError::Executor(error));
        }

        if self.stop_fired.swap(true, Ordering::AcqRel) {
            return Err(ChannelError::Executor(error));
        }
        let mut inner = self.inner.lock().unwrap();
        self.try_set_final(&mut inner, Err(error.clone()), true);
        self.advance_state(FINISHED);
        for p in inner.push_queue.drain(..) {
            let _ = p.hint_tx.send(PushOutcome::NotAccepted);
        }
        let mut first = true;
        while let Some(pull) = inner.pull_queue.pop_front() {
            if first {
                first = false;
                let _ = pull.tx.send(RawOutcome::Rejected(error.clone()));
            } else {
                let _ = pull.tx.send(RawOutcome::Done(None));
            }
        }
        inner.final_outcome_delivered = true;
        drop(inner);
        self.stop_waker.wake();
        Err(ChannelError::Executor(error))
    }
}

/// The callable half of the executor's second argument: enqueues a value
/// and returns a future resolving to the hint it was matched with.
pub struct Push<T, E, H = ()> {
    shared: Arc<Shared<T, E, H>>,
}

impl<T, E, H> Clone for Push<T, E, H> {
    fn clone(&self) -> Self {
        Push { shared: self.shared.clone() }
    }
}

impl<T, E, H> Push<T, E, H>
where
    T: Send + 'static,
    E: Send + 'static,
    H: Send + 'static,
{
    pub fn push(&self, value: T) -> Result<PushFuture<H>, OverflowError> {
        self.shared.push_value(PushValue::Value(value))
    }

    /// Identity comparison between two `Push` handles derived from the same
    /// channel (used by [`crate::pubsub::PubSub`] to find and remove its own
    /// handle from a subscriber list on teardown).
    pub(crate) fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn push_deferred<F>(&self, value: F) -> Result<PushFuture<H>, OverflowError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.shared.push_value(PushValue::Deferred(Box::pin(value)))
    }
}

#[must_use = "futures do nothing unless polled"]
pub struct PushFuture<H> {
    rx: oneshot::Receiver<PushOutcome<H>>,
}

impl<H> Future for PushFuture<H> {
    type Output = PushOutcome<H>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(v)) => Poll::Ready(v),
            Poll::Ready(Err(_)) => Poll::Ready(PushOutcome::NotAccepted),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The dual stop handle: a future the executor can
/// `.await` to learn when to tear down, and a plain method it can call to
/// request that teardown itself.
pub struct Stop<T, E, H> {
    shared: Arc<Shared<T, E, H>>,
}

impl<T, E, H> Clone for Stop<T, E, H> {
    fn clone(&self) -> Self {
        Stop { shared: self.shared.clone() }
    }
}

impl<T, E, H> Stop<T, E, H>
where
    T: Send + 'static,
    E: Send + 'static,
    H: Send + 'static,
{
    /// Requests teardown with an optional error, same as `close`/`stop` in
    /// the executor contract. Idempotent; the first call wins.
    pub fn signal(&self, error: Option<E>) {
        self.shared.request_stop(error);
    }

    pub fn is_signaled(&self) -> bool {
        self.shared.stop_fired.load(Ordering::Acquire)
    }
}

impl<T, E, H> Future for Stop<T, E, H> {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.shared.stop_fired.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        self.shared.stop_waker.register(cx.waker());
        if self.shared.stop_fired.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

/// Returned by [`Channel::return_`](crate::Channel::return_).
#[must_use = "futures do nothing unless polled"]
pub struct ReturnFuture<T, E> {
    inner: Pin<Box<dyn Future<Output = Iteration<T>> + Send>>,
    _marker: std::marker::PhantomData<fn() -> E>,
}

impl<T, E> ReturnFuture<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn ready(iteration: Iteration<T>) -> Self {
        ReturnFuture { inner: Box::pin(future::ready(iteration)), _marker: std::marker::PhantomData }
    }

    fn pending<H>(shared: Arc<Shared<T, E, H>>) -> Self
    where
        H: Send + 'static,
    {
        ReturnFuture {
            inner: Box::pin(async move {
                future::poll_fn(|cx| {
                    shared.poll_exec(cx);
                    let inner = shared.inner.lock().unwrap();
                    if inner.exec.is_none() {
                        Poll::Ready(())
                    } else {
                        Poll::Pending
                    }
                })
                .await;
                let mut inner = shared.inner.lock().unwrap();
                match shared.take_terminal_raw(&mut inner) {
                    RawOutcome::Done(v) => Iteration { value: v, done: true },
                    // The executor's own rejection always wins over return's
                    // fallback value once it actually completes; `return`
                    // itself never surfaces an error, so a
                    // rejection just collapses to a valueless `done` here.
                    RawOutcome::Rejected(_) => Iteration { value: None, done: true },
                    RawOutcome::Pushed(_) => unreachable!("buffer/push queue hold only pending values, never terminal ones"),
                }
            }),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, E> Future for ReturnFuture<T, E> {
    type Output = Result<Iteration<T>, ChannelError<E>>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx).map(Ok)
    }
}

/// Returned by [`Channel::next`](crate::Channel::next) and friends.
#[must_use = "futures do nothing unless polled"]
pub struct NextFuture<T, E> {
    inner: Pin<Box<dyn Future<Output = Result<Iteration<T>, ChannelError<E>>> + Send>>,
}

impl<T, E> NextFuture<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn new<H>(
        shared: Arc<Shared<T, E, H>>,
        own: OwnSource<T, E>,
        gate: Option<Gate>,
        latch: Latch,
    ) -> Self
    where
        H: Send + 'static,
    {
        NextFuture { inner: Box::pin(resolve_iteration(shared, own, gate, latch)) }
    }
}

impl<T, E> Future for NextFuture<T, E> {
    type Output = Result<Iteration<T>, ChannelError<E>>;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

async fn resolve_iteration<T, E, H>(
    shared: Arc<Shared<T, E, H>>,
    mut own: OwnSource<T, E>,
    gate: Option<Gate>,
    latch: Latch,
) -> Result<Iteration<T>, ChannelError<E>>
where
    T: Send + 'static,
    E: Send + 'static,
    H: Send + 'static,
{
    let shared_for_poll = shared.clone();
    let raw = future::poll_fn(move |cx| {
        shared_for_poll.poll_exec(cx);
        own.poll_resolve(cx)
    })
    .await;

    let (tentative, signal) = match raw {
        RawOutcome::Done(v) => (Ok(Iteration { value: v, done: true }), Signal::Halt),
        RawOutcome::Rejected(e) => (Err(ChannelError::Executor(e)), Signal::Halt),
        RawOutcome::Pushed(pv) => match pv.resolve().await {
            Ok(v) => (Ok(Iteration { value: Some(v), done: false }), Signal::Continue),
            Err(e) => {
                // This call's own pushed value rejected: it is the one
                // consumer that reports the error (the "pushed-deferred
                // rejection" precedence tier). Every other
                // iteration just needs to know the channel is now done —
                // `final_outcome_delivered` alone carries that, so there is
                // no need to stash (and re-deliver) a second copy of `e`.
                let mut inner = shared.inner.lock().unwrap();
                let already_terminal = inner.final_outcome_delivered;
                inner.final_outcome_delivered = true;
                drop(inner);
                if !already_terminal {
                    // Mirrors `poll_exec`'s own natural-termination path:
                    // advance only to `Stopped` and let `next_sync`'s own
                    // buffer-then-push-queue-then-stopped ordering promote to
                    // `Finished` once they have genuinely drained empty,
                    // rather than jumping straight to `Finished` while other
                    // already-buffered values are still sitting there (I5).
                    shared.request_stop(None);
                    (Err(ChannelError::Executor(e)), Signal::Halt)
                } else {
                    (Ok(Iteration { value: None, done: true }), Signal::Halt)
                }
            }
        },
    };

    if let Some(gate) = gate {
        let sig = signal_or_halt(gate.await);
        if sig == Signal::Halt {
            let _ = latch.send(Signal::Halt);
            return Ok(Iteration { value: None, done: true });
        }
    }

    let _ = latch.send(signal);
    tentative
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::buffer::Buffer;
    use crate::channel::Channel;

    /// `return` before the first `next` means the executor never runs at
    /// all, and the first subsequent `next` echoes the value.
    #[tokio::test]
    async fn return_before_first_next_skips_executor() {
        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_clone = ran.clone();
        let channel: Channel<i32, ()> = Channel::new(Buffer::default(), move |_push, _stop| {
            let ran = ran_clone.clone();
            async move {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(0)
            }
        });

        let iteration = channel.return_(Some(42)).await.unwrap();
        assert_eq!(iteration, super::Iteration { value: Some(42), done: true });
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));

        let next = channel.next().unwrap().await.unwrap();
        assert_eq!(next, super::Iteration { value: None, done: true });
    }

    /// A push is "not accepted" exactly when the channel was already
    /// stopped at the time of the call.
    #[tokio::test]
    async fn push_not_accepted_once_stopped() {
        let checked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let checked_clone = checked.clone();
        let channel: Channel<i32, ()> = Channel::new(Buffer::default(), move |push, stop| {
            let checked = checked_clone.clone();
            async move {
                stop.clone().await;
                let outcome = push.push(1).unwrap().await;
                assert!(matches!(outcome, super::PushOutcome::NotAccepted));
                checked.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(0)
            }
        });

        // Starts the executor (parking a pull, since nothing has been
        // pushed yet) before `return` fires the stop signal it's awaiting.
        let pending = channel.next().unwrap();
        let _ = channel.return_(None).await.unwrap();
        let _ = pending.await;
        assert!(checked.load(std::sync::atomic::Ordering::SeqCst));
    }

    /// The 1025th parked pull raises `Overflow`; the channel remains
    /// usable once the backlog drains.
    #[tokio::test]
    async fn pull_overflow_then_recovers() {
        let channel: Channel<i32, ()> = Channel::new(Buffer::default(), |_push, stop| async move {
            stop.clone().await;
            Ok(-1)
        });

        let mut parked = Vec::new();
        for _ in 0..crate::MAX_QUEUE_LENGTH {
            parked.push(channel.next().unwrap());
        }
        assert!(channel.next().is_err());

        let _ = channel.return_(None).await.unwrap();
        for fut in parked {
            let iteration = fut.await.unwrap();
            assert!(iteration.done);
        }
    }

    /// Results settle in call order, regardless of which underlying
    /// deferred settles first.
    #[tokio::test]
    async fn iterations_settle_in_call_order() {
        let channel: Channel<i32, ()> = Channel::new(Buffer::default(), |push, _stop| async move {
            let _ = push
                .push_deferred(async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(1)
                })
                .unwrap();
            let _ = push
                .push_deferred(async {
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    Ok(2)
                })
                .unwrap();
            let _ = push
                .push_deferred(async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(3)
                })
                .unwrap();
            Ok(4)
        });

        let a = channel.next().unwrap();
        let b = channel.next().unwrap();
        let c = channel.next().unwrap();
        let d = channel.next().unwrap();

        assert_eq!(a.await.unwrap().value, Some(1));
        assert_eq!(b.await.unwrap().value, Some(2));
        assert_eq!(c.await.unwrap().value, Some(3));
        let last = d.await.unwrap();
        assert!(last.done);
        assert_eq!(last.value, Some(4));
    }
}
