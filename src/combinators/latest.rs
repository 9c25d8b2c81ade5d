//! `Channel.latest`: an initial `zip`-style round, then one parallel loop
//! per contender that pushes a fresh snapshot of a shared "latest values"
//! vector every time any single contender produces.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{join_all, select, Either};
use futures::stream::{FuturesUnordered, StreamExt};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::controller::{Push, Stop};

use super::contender::{terminate_all, Contender};

type Slots<T> = Arc<Mutex<Vec<Option<T>>>>;

async fn latest_one<T, E>(
    idx: usize,
    mut contender: Contender<T, E>,
    push: Push<Vec<Option<T>>, E>,
    stop: Stop<Vec<Option<T>>, E, ()>,
    slots: Slots<T>,
    abort: Arc<AtomicBool>,
) -> Result<(), E>
where
    T: Send + Clone + 'static,
    E: Send + 'static,
{
    loop {
        if abort.load(Ordering::Acquire) {
            contender.terminate().await;
            return Ok(());
        }
        match select(contender.next(), stop.clone()).await {
            Either::Left((Ok(it), _)) => {
                let done = it.done;
                slots.lock().unwrap()[idx] = it.value;
                if done {
                    return Ok(());
                }
                let snapshot = slots.lock().unwrap().clone();
                if let Err(e) = push.push(snapshot) {
                    tracing::warn!(%e, "latest: push queue overflow, dropping snapshot");
                }
            }
            Either::Left((Err(e), _)) => {
                contender.terminate().await;
                return Err(e);
            }
            Either::Right(_) => {
                contender.terminate().await;
                return Ok(());
            }
        }
    }
}

/// Like [`zip`](super::zip), but emits a snapshot every time *any* single
/// contender produces, rather than waiting for all of them each round. The
/// initial round behaves like `zip`'s: one pull from
/// every contender, pushed as the first snapshot. Finishes once every
/// contender's loop has finished.
///
/// An empty `contenders` finishes immediately with `[]`.
pub fn latest<T, E>(contenders: Vec<Contender<T, E>>) -> Channel<Vec<Option<T>>, E>
where
    T: Send + Clone + 'static,
    E: Send + 'static,
{
    Channel::new(Buffer::default(), move |push, stop| async move {
        let mut contenders = contenders;
        if contenders.is_empty() {
            tracing::trace!("latest: no contenders, finishing immediately");
            return Ok(Vec::new());
        }
        let n = contenders.len();

        let initial = join_all(contenders.iter_mut().map(|c| c.next())).await;
        let mut slots: Vec<Option<T>> = Vec::with_capacity(n);
        let mut any_done = false;
        let mut err = None;
        for r in initial {
            match r {
                Ok(it) => {
                    any_done = any_done || it.done;
                    slots.push(it.value);
                }
                Err(e) => {
                    if err.is_none() {
                        err = Some(e);
                    }
                }
            }
        }
        if let Some(e) = err {
            terminate_all(&mut contenders).await;
            return Err(e);
        }
        if any_done {
            terminate_all(&mut contenders).await;
            return Ok(slots);
        }
        if let Err(e) = push.push(slots.clone()) {
            tracing::warn!(%e, "latest: push queue overflow, dropping initial snapshot");
        }

        let shared: Slots<T> = Arc::new(Mutex::new(slots));
        let abort = Arc::new(AtomicBool::new(false));
        let mut tasks = FuturesUnordered::new();
        for (idx, c) in contenders.into_iter().enumerate() {
            tasks.push(latest_one(idx, c, push.clone(), stop.clone(), shared.clone(), abort.clone()));
        }

        let mut first_err = None;
        while let Some(result) = tasks.next().await {
            if let Err(e) = result {
                if first_err.is_none() {
                    tracing::debug!("latest: inner contender rejected, absorbing the rest");
                    first_err = Some(e);
                    abort.store(true, Ordering::Release);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(shared.lock().unwrap().clone()),
        }
    })
}
