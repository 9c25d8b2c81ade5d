//! End-to-end reproductions of the concrete push/pull scenarios this crate's
//! state machine must get right: out-of-order settlement resolving in call
//! order, a mid-stream pushed-value rejection collapsing every later
//! already-parked pull to `done`, and the buffer variants' drop semantics.

use std::time::Duration;

use sluice::{Buffer, Channel};
use tokio::time::sleep;

/// Four concurrent pushed deferreds settle out of order (the middle one
/// first, the first one last); the four waiting pulls must still resolve in
/// the order they were issued.
#[tokio::test]
async fn out_of_order_pushes_settle_in_call_order() {
    let channel: Channel<i32, ()> = Channel::new(Buffer::default(), |push, _stop| async move {
        let _ = push.push_deferred(async {
            sleep(Duration::from_millis(30)).await;
            Ok(1)
        });
        let _ = push.push_deferred(async {
            sleep(Duration::from_millis(15)).await;
            Ok(2)
        });
        let _ = push.push_deferred(async {
            sleep(Duration::from_millis(5)).await;
            Ok(3)
        });
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
    assert_eq!(last, sluice::Iteration { value: Some(4), done: true });
}

/// A pushed deferred rejecting mid-stream ends the channel: the pull it
/// settles rejects with that error, and every pull issued after it collapses
/// to `done` with no value, even though its own pushed deferred had already
/// independently resolved to a real value by the time the chain reaches it.
#[tokio::test]
async fn rejection_mid_stream_ends_every_later_pull() {
    let channel: Channel<i32, &'static str> =
        Channel::new(Buffer::default(), |push, _stop| async move {
            let _ = push.push_deferred(async {
                sleep(Duration::from_millis(100)).await;
                Ok(1)
            });
            let _ = push.push_deferred(async {
                sleep(Duration::from_millis(20)).await;
                Ok(2)
            });
            let _ = push.push_deferred(async {
                sleep(Duration::from_millis(50)).await;
                Err("boom")
            });
            let _ = push.push_deferred(async {
                sleep(Duration::from_millis(10)).await;
                Ok(4)
            });
            Ok(6)
        });

    let a = channel.next().unwrap();
    let b = channel.next().unwrap();
    let c = channel.next().unwrap();
    let d = channel.next().unwrap();

    assert_eq!(a.await.unwrap().value, Some(1));
    assert_eq!(b.await.unwrap().value, Some(2));

    let rejected = c.await.unwrap_err();
    assert!(matches!(rejected, sluice::ChannelError::Executor("boom")));

    // `d`'s own pushed value (4) had already resolved well before `c`
    // rejected, but the chain still collapses it to a valueless `done`
    // because it comes after the rejection in call order.
    let done = d.await.unwrap();
    assert_eq!(done, sluice::Iteration { value: None, done: true });
}

/// A pull parked before any push is resolved directly by the first push,
/// bypassing the buffer entirely, even for a non-zero-capacity buffer —
/// only once that first rendezvous has happened does the buffer start
/// sliding.
#[tokio::test]
async fn sliding_buffer_first_pull_bypasses_buffer() {
    let channel: Channel<i32, ()> = Channel::new(Buffer::sliding(3), |push, stop| async move {
        for i in 0..100 {
            let _ = push.push(i);
        }
        stop.signal(None);
        Ok(-1)
    });

    let first = channel.next().unwrap().await.unwrap();
    assert_eq!(first.value, Some(0));

    let mut rest = Vec::new();
    for _ in 0..3 {
        rest.push(channel.next().unwrap().await.unwrap().value);
    }
    assert_eq!(rest, vec![Some(97), Some(98), Some(99)]);
}

/// `return` before the channel ever started skips the executor entirely,
/// and a `throw` that arrives while a pull is already parked rejects
/// exactly that pull with the injected error.
#[tokio::test]
async fn throw_rejects_the_parked_pull() {
    let channel: Channel<i32, &'static str> = Channel::new(Buffer::default(), |_push, stop| async move {
        stop.clone().await;
        Ok(0)
    });

    let parked = channel.next().unwrap();
    let thrown = channel.throw("injected").unwrap_err();
    assert!(matches!(thrown, sluice::ChannelError::Executor("injected")));

    let rejected = parked.await.unwrap_err();
    assert!(matches!(rejected, sluice::ChannelError::Executor("injected")));
}
