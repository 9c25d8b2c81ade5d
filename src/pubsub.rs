//! A trivial topic-to-subscribers fan-out layer built entirely on the
//! `push`/`close`/`stop` contract every [`Channel`] executor already
//! exposes — it needs nothing else from the core.
//!
//! `publish` pushes a value to every channel currently subscribed to a
//! topic; `subscribe` hands back a fresh [`Channel`] that registers itself
//! on first `next` and deregisters itself once its own `stop` signal fires
//! (i.e. once the consumer calls `return`/`throw`, or drops its last handle
//! and calls `return` on the way out).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::controller::Push;

type Subscribers<Topic, T, E> = Arc<Mutex<HashMap<Topic, Vec<Push<Option<T>, E>>>>>;

/// A `Mutex<HashMap<Topic, Vec<Push<..>>>>` fan-out registry. Cheaply
/// cloneable (`Clone` just clones the `Arc`), so a single `PubSub` can be
/// shared across however many publishers and subscribers need it.
pub struct PubSub<Topic, T, E> {
    subscribers: Subscribers<Topic, T, E>,
}

impl<Topic, T, E> Clone for PubSub<Topic, T, E> {
    fn clone(&self) -> Self {
        PubSub { subscribers: self.subscribers.clone() }
    }
}

impl<Topic, T, E> Default for PubSub<Topic, T, E> {
    fn default() -> Self {
        PubSub { subscribers: Arc::new(Mutex::new(HashMap::new())) }
    }
}

impl<Topic, T, E> PubSub<Topic, T, E>
where
    Topic: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes `value` to every channel currently subscribed to `topic`. A
    /// subscriber whose push queue has overflowed drops the value for that
    /// subscriber only — publishing to the others still proceeds.
    pub fn publish(&self, topic: &Topic, value: T) {
        let subs = self.subscribers.lock().unwrap();
        let Some(pushes) = subs.get(topic) else {
            tracing::trace!("publish: no subscribers for topic");
            return;
        };
        for p in pushes {
            if let Err(e) = p.push(Some(value.clone())) {
                tracing::warn!(%e, "pubsub: subscriber push queue overflow, dropping value");
            }
        }
    }

    /// Subscribes to `topic`, returning a fresh channel. Nothing happens
    /// until the first `next`/`return`/`throw` call on it: the returned
    /// channel registers its `Push` handle into
    /// the topic's subscriber list only once its executor actually starts,
    /// and removes it once the executor observes `stop`.
    pub fn subscribe(&self, topic: Topic, buffer: Buffer<Option<T>>) -> Channel<Option<T>, E> {
        let subscribers = self.subscribers.clone();
        Channel::new(buffer, move |push, stop| async move {
            subscribers
                .lock()
                .unwrap()
                .entry(topic.clone())
                .or_default()
                .push(push.clone());
            tracing::debug!("pubsub: subscriber registered");

            stop.clone().await;

            if let Some(pushes) = subscribers.lock().unwrap().get_mut(&topic) {
                pushes.retain(|p| !p.same_channel(&push));
            }
            tracing::debug!("pubsub: subscriber deregistered");
            Ok(None)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let pubsub: PubSub<&'static str, i32, ()> = PubSub::new();
        let channel = pubsub.subscribe("topic", Buffer::default());

        // Spawn the pull so it actually gets polled (registering the
        // subscriber) before `publish` runs on this task.
        let next = channel.next().unwrap();
        let handle = tokio::spawn(next);
        tokio::task::yield_now().await;
        pubsub.publish(&"topic", 42);
        let iteration = handle.await.unwrap().unwrap();
        assert_eq!(iteration.value, Some(Some(42)));
        assert!(!iteration.done);
    }

    #[tokio::test]
    async fn unsubscribed_topics_are_noop() {
        let pubsub: PubSub<&'static str, i32, ()> = PubSub::new();
        pubsub.publish(&"nobody-listening", 1);
    }
}
