//! `Channel.merge`: one consumer loop per contender, running concurrently,
//! pushing values as they arrive; finishes once every loop has finished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{select, Either};
use futures::stream::{FuturesUnordered, StreamExt};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::controller::{Push, Stop};

use super::contender::Contender;

async fn merge_one<T, E>(
    mut contender: Contender<T, E>,
    push: Push<Option<T>, E>,
    stop: Stop<Option<T>, E, ()>,
    abort: Arc<AtomicBool>,
) -> Result<Option<T>, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    loop {
        if abort.load(Ordering::Acquire) {
            contender.terminate().await;
            return Ok(None);
        }
        match select(contender.next(), stop.clone()).await {
            Either::Left((Ok(it), _)) => {
                if it.done {
                    return Ok(it.value);
                }
                if let Some(v) = it.value {
                    if let Err(e) = push.push(Some(v)) {
                        tracing::warn!(%e, "merge: push queue overflow, dropping value");
                    }
                }
            }
            Either::Left((Err(e), _)) => {
                contender.terminate().await;
                return Err(e);
            }
            Either::Right(_) => {
                contender.terminate().await;
                return Ok(None);
            }
        }
    }
}

/// Merges `contenders` into a single stream of their combined values. The
/// terminal value is the last done-value observed — deterministic up to
/// task scheduling, not call order. When more than one contender rejects,
/// the first rejection observed wins and the rest are silently absorbed,
/// and every still-running loop is asked to terminate early.
pub fn merge<T, E>(contenders: Vec<Contender<T, E>>) -> Channel<Option<T>, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    Channel::new(Buffer::default(), move |push, stop| async move {
        if contenders.is_empty() {
            tracing::trace!("merge: no contenders, finishing immediately");
            return Ok(None);
        }

        let abort = Arc::new(AtomicBool::new(false));
        let mut tasks = FuturesUnordered::new();
        for c in contenders {
            tasks.push(merge_one(c, push.clone(), stop.clone(), abort.clone()));
        }

        let mut last = None;
        let mut first_err = None;
        while let Some(result) = tasks.next().await {
            match result {
                Ok(v) => last = v,
                Err(e) => {
                    if first_err.is_none() {
                        tracing::debug!("merge: inner contender rejected, absorbing the rest");
                        first_err = Some(e);
                        abort.store(true, Ordering::Release);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(last),
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::channel::Channel;

    use super::Contender;

    /// Every value from every contender surfaces, interleaved by however
    /// the scheduler runs the per-contender loops; a contender's own
    /// done-value is never yielded as a value.
    #[tokio::test]
    async fn merge_surfaces_every_value_from_every_contender() {
        let channel: Channel<Option<i32>, ()> = Channel::merge(vec![
            Contender::from_iter(vec![1, 2]),
            Contender::from_iter(vec![10, 20]),
        ]);

        let mut seen = Vec::new();
        loop {
            let iteration = channel.next().unwrap().await.unwrap();
            if iteration.done {
                break;
            }
            seen.push(iteration.value.flatten().unwrap());
        }
        seen.sort();
        assert_eq!(seen, vec![1, 2, 10, 20]);
    }

    #[tokio::test]
    async fn empty_contenders_finishes_immediately() {
        let channel: Channel<Option<i32>, ()> = Channel::merge(Vec::new());
        let iteration = channel.next().unwrap().await.unwrap();
        assert_eq!(iteration, crate::controller::Iteration { value: Some(None), done: true });
    }

    #[tokio::test]
    async fn merge_propagates_one_of_simultaneous_errors() {
        let channel: Channel<Option<i32>, &'static str> = Channel::merge(vec![
            Contender::from_stream(futures::stream::iter(vec![Err("boom")])),
            Contender::from_stream(futures::stream::iter(vec![Err("bang")])),
        ]);

        let err = channel.next().unwrap().await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::ChannelError::Executor("boom") | crate::error::ChannelError::Executor("bang")
        ));
    }
}
