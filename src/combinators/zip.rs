//! `Channel.zip`: each round, pulls one value from every contender
//! concurrently; finishes as soon as any of them is done.

use futures::future::{join_all, select, Either};

use crate::buffer::Buffer;
use crate::channel::Channel;

use super::contender::{terminate_all, Contender};

/// Zips `contenders` into a stream of per-round snapshots (`Vec<Option<T>>`,
/// one slot per contender in input order). A slot is `None` only in the
/// finishing round, for whichever contender(s) reached "done" with no value
/// of their own. A genuinely heterogeneous tuple return (one element type
/// per contender) is out of scope here; this crate's `Contender<T, E>` is
/// necessarily homogeneous, so the per-round snapshot is a `Vec` rather than
/// a tuple.
///
/// An empty `contenders` finishes immediately with `[]`.
pub fn zip<T, E>(contenders: Vec<Contender<T, E>>) -> Channel<Vec<Option<T>>, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    Channel::new(Buffer::default(), move |push, stop| async move {
        let mut contenders = contenders;
        if contenders.is_empty() {
            tracing::trace!("zip: no contenders, finishing immediately");
            return Ok(Vec::new());
        }

        loop {
            let round = join_all(contenders.iter_mut().map(|c| c.next()));
            match select(Box::pin(round), stop.clone()).await {
                Either::Left((results, _stop_fut)) => {
                    let mut any_done = false;
                    let mut err = None;
                    let mut tuple = Vec::with_capacity(results.len());
                    for r in results {
                        match r {
                            Ok(it) => {
                                any_done = any_done || it.done;
                                tuple.push(it.value);
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
                        return Ok(tuple);
                    }
                    if let Err(e) = push.push(tuple) {
                        tracing::warn!(%e, "zip: push queue overflow, dropping round");
                    }
                }
                Either::Right((_unit, _round)) => {
                    terminate_all(&mut contenders).await;
                    return Ok(Vec::new());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::channel::Channel;

    use super::Contender;

    /// Each round pairs up one value from every contender, in input order;
    /// the shortest contender's exhaustion ends the zip for all of them, on
    /// the round where it runs out (not the round after).
    #[tokio::test]
    async fn zip_pairs_rounds_and_stops_at_shortest() {
        let channel: Channel<Vec<Option<i32>>, ()> = Channel::zip(vec![
            Contender::from_iter(vec![1, 2, 3]),
            Contender::from_iter(vec![10, 20]),
        ]);

        let mut rounds = Vec::new();
        let done = loop {
            let iteration = channel.next().unwrap().await.unwrap();
            if iteration.done {
                break iteration.value.unwrap();
            }
            rounds.push(iteration.value.unwrap());
        };
        assert_eq!(rounds, vec![vec![Some(1), Some(10)], vec![Some(2), Some(20)]]);
        assert_eq!(done, vec![Some(3), None]);
    }

    #[tokio::test]
    async fn zip_propagates_inner_error() {
        let channel: Channel<Vec<Option<i32>>, &'static str> = Channel::zip(vec![
            Contender::from_iter(vec![1, 2, 3]),
            Contender::from_stream(futures::stream::iter(vec![Ok(10), Err("boom")])),
        ]);

        let first = channel.next().unwrap().await.unwrap();
        assert_eq!(first.value, Some(vec![Some(1), Some(10)]));

        let err = channel.next().unwrap().await.unwrap_err();
        assert!(matches!(err, crate::error::ChannelError::Executor("boom")));
    }

    #[tokio::test]
    async fn empty_contenders_finishes_immediately() {
        let channel: Channel<Vec<Option<i32>>, ()> = Channel::zip(Vec::new());
        let iteration = channel.next().unwrap().await.unwrap();
        assert_eq!(iteration, crate::controller::Iteration { value: Some(Vec::new()), done: true });
    }
}
