//! `Channel.race`: yields values from whichever contender produces next;
//! finishes as soon as any contender finishes.

use futures::future::{select, select_all, Either};

use crate::buffer::Buffer;
use crate::channel::Channel;

use super::contender::{terminate_all, Contender};

/// Races `contenders` against each other: at the end of each round, a pull is
/// started from every contender concurrently. The first to resolve "done"
/// finishes the race with its done-value (possibly absent, if that
/// contender's underlying stream simply ran out). The first to resolve with
/// a value is pushed immediately and the round repeats. A rejection from any
/// contender ends the race with that error.
///
/// An empty `contenders` finishes immediately with no value — there is no
/// meaningful identity value for a race with nothing to race.
pub fn race<T, E>(contenders: Vec<Contender<T, E>>) -> Channel<Option<T>, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    Channel::new(Buffer::default(), move |push, stop| async move {
        let mut contenders = contenders;
        if contenders.is_empty() {
            tracing::trace!("race: no contenders, finishing immediately");
            return Ok(None);
        }

        loop {
            let futs: Vec<_> = contenders.iter_mut().map(|c| c.next()).collect();
            match select(select_all(futs), stop.clone()).await {
                Either::Left(((result, _idx, _rest), _stop_fut)) => match result {
                    Ok(it) if it.done => {
                        terminate_all(&mut contenders).await;
                        return Ok(it.value);
                    }
                    Ok(it) => {
                        if let Some(v) = it.value {
                            if let Err(e) = push.push(Some(v)) {
                                tracing::warn!(%e, "race: push queue overflow, dropping value");
                            }
                        }
                    }
                    Err(e) => {
                        terminate_all(&mut contenders).await;
                        return Err(e);
                    }
                },
                Either::Right((_unit, _racer)) => {
                    terminate_all(&mut contenders).await;
                    return Ok(None);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::channel::Channel;

    use super::Contender;

    /// A finite contender finishing ends the race immediately, even though
    /// the other contender (here one that never produces at all) would
    /// otherwise keep it running forever.
    #[tokio::test]
    async fn race_finishes_as_soon_as_one_contender_is_done() {
        let channel: Channel<Option<i32>, ()> = Channel::race(vec![
            Contender::from_iter(vec![1, 2, 3]),
            Contender::from_future(futures::future::pending()),
        ]);

        let mut seen = Vec::new();
        loop {
            let iteration = channel.next().unwrap().await.unwrap();
            if iteration.done {
                assert_eq!(iteration.value.flatten(), None);
                break;
            }
            seen.push(iteration.value.flatten());
        }
        assert_eq!(seen, vec![Some(1), Some(2), Some(3)]);
    }

    #[tokio::test]
    async fn race_propagates_inner_error() {
        let channel: Channel<Option<i32>, &'static str> = Channel::race(vec![
            Contender::from_stream(futures::stream::iter(vec![Err("boom")])),
            Contender::from_future(futures::future::pending()),
        ]);

        let err = channel.next().unwrap().await.unwrap_err();
        assert!(matches!(err, crate::error::ChannelError::Executor("boom")));
    }

    #[tokio::test]
    async fn empty_contenders_finishes_immediately() {
        let channel: Channel<Option<i32>, ()> = Channel::race(Vec::new());
        let iteration = channel.next().unwrap().await.unwrap();
        assert_eq!(iteration, crate::controller::Iteration { value: Some(None), done: true });
    }
}
