//! An exact-match, explicit-topic pub/sub variant, grounded on
//! `modules/pubsub_tiny/src/pubsub_tiny.c`. Where the wildcard bus in the
//! parent module matches any topic string against a flat filter pool, this
//! variant requires topics to be created up front and only delivers to
//! subscribers of that exact name — no `+`/`#` expansion. Destroying a
//! topic broadcasts [`TOPIC_DESTROY_MESSAGE`] to its subscribers before
//! dropping them, matching the original's `pubsub_destroy`.
//!
//! Topic and subscription slots are tombstoned (`None`) rather than
//! compacted on removal, so a [`SubscriptionHandle`] returned by
//! [`TinyPubSub::subscribe`] stays valid (or cleanly reports "gone") even
//! after unrelated topics are destroyed — unlike `Vec::remove`, which would
//! shift every handle positioned after the removed entry.

use alloc::vec::Vec;

use crate::Callback;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TinyError {
    InvalidParam,
    ExistTopic,
    NoExistTopic,
}

pub const TOPIC_DESTROY_MESSAGE: &[u8] = b"topic destroyed";

struct Subscription {
    callback: Callback,
    context: usize,
}

struct Topic {
    name: &'static str,
    subscriptions: Vec<Option<Subscription>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
    topic: usize,
    slot: usize,
}

#[derive(Default)]
pub struct TinyPubSub {
    topics: Vec<Option<Topic>>,
}

impl TinyPubSub {
    pub fn new() -> Self {
        Self { topics: Vec::new() }
    }

    fn find_topic(&self, name: &str) -> Option<usize> {
        self.topics
            .iter()
            .position(|t| t.as_ref().is_some_and(|t| t.name == name))
    }

    pub fn create(&mut self, name: &'static str) -> Result<(), TinyError> {
        if name.is_empty() {
            return Err(TinyError::InvalidParam);
        }
        if self.find_topic(name).is_some() {
            return Err(TinyError::ExistTopic);
        }

        let topic = Topic {
            name,
            subscriptions: Vec::new(),
        };

        if let Some(slot) = self.topics.iter_mut().find(|t| t.is_none()) {
            *slot = Some(topic);
        } else {
            self.topics.push(Some(topic));
        }

        Ok(())
    }

    /// Removes the topic, notifying every current subscriber with
    /// [`TOPIC_DESTROY_MESSAGE`] first.
    pub fn destroy(&mut self, name: &str) -> Result<(), TinyError> {
        let idx = self.find_topic(name).ok_or(TinyError::NoExistTopic)?;
        let topic = self.topics[idx].take().expect("index came from find_topic");

        for sub in topic.subscriptions.iter().flatten() {
            (sub.callback)(sub.context, TOPIC_DESTROY_MESSAGE);
        }

        Ok(())
    }

    pub fn publish(&self, name: &str, msg: &[u8]) -> Result<(), TinyError> {
        let idx = self.find_topic(name).ok_or(TinyError::NoExistTopic)?;
        let topic = self.topics[idx].as_ref().unwrap();

        for sub in topic.subscriptions.iter().flatten() {
            (sub.callback)(sub.context, msg);
        }

        Ok(())
    }

    pub fn subscribe(
        &mut self,
        name: &str,
        callback: Callback,
        context: usize,
    ) -> Result<SubscriptionHandle, TinyError> {
        let idx = self.find_topic(name).ok_or(TinyError::NoExistTopic)?;
        let topic = self.topics[idx].as_mut().unwrap();

        let sub = Some(Subscription { callback, context });
        let slot = if let Some(empty) = topic.subscriptions.iter_mut().position(|s| s.is_none()) {
            topic.subscriptions[empty] = sub;
            empty
        } else {
            topic.subscriptions.push(sub);
            topic.subscriptions.len() - 1
        };

        Ok(SubscriptionHandle { topic: idx, slot })
    }

    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Result<(), TinyError> {
        let topic = self
            .topics
            .get_mut(handle.topic)
            .and_then(|t| t.as_mut())
            .ok_or(TinyError::InvalidParam)?;

        match topic.subscriptions.get_mut(handle.slot) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(TinyError::InvalidParam),
        }
    }

    pub fn count(&self, name: &str) -> Result<usize, TinyError> {
        let idx = self.find_topic(name).ok_or(TinyError::NoExistTopic)?;
        Ok(self.topics[idx]
            .as_ref()
            .unwrap()
            .subscriptions
            .iter()
            .flatten()
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);
    static LAST_LEN: AtomicUsize = AtomicUsize::new(0);

    fn reset() {
        HITS.store(0, Ordering::SeqCst);
        LAST_LEN.store(0, Ordering::SeqCst);
    }

    fn bump(_ctx: usize, msg: &[u8]) {
        HITS.fetch_add(1, Ordering::SeqCst);
        LAST_LEN.store(msg.len(), Ordering::SeqCst);
    }

    #[test]
    fn create_duplicate_topic_is_rejected() {
        let mut ps = TinyPubSub::new();
        ps.create("a").unwrap();
        assert_eq!(Err(TinyError::ExistTopic), ps.create("a"));
    }

    #[test]
    fn subscribe_requires_existing_topic() {
        let mut ps = TinyPubSub::new();
        assert_eq!(Err(TinyError::NoExistTopic), ps.subscribe("missing", bump, 0));
    }

    #[test]
    fn publish_reaches_only_exact_topic_subscribers() {
        reset();
        let mut ps = TinyPubSub::new();
        ps.create("a").unwrap();
        ps.create("a/b").unwrap();
        ps.subscribe("a", bump, 0).unwrap();
        ps.subscribe("a/b", bump, 0).unwrap();

        ps.publish("a", b"hello").unwrap();
        assert_eq!(1, HITS.load(Ordering::SeqCst));
    }

    #[test]
    fn destroy_notifies_subscribers_then_removes_topic() {
        reset();
        let mut ps = TinyPubSub::new();
        ps.create("a").unwrap();
        ps.subscribe("a", bump, 0).unwrap();

        ps.destroy("a").unwrap();
        assert_eq!(1, HITS.load(Ordering::SeqCst));
        assert_eq!(TOPIC_DESTROY_MESSAGE.len(), LAST_LEN.load(Ordering::SeqCst));

        assert_eq!(Err(TinyError::NoExistTopic), ps.publish("a", b"x"));
    }

    #[test]
    fn handles_for_other_topics_survive_unrelated_destroy() {
        reset();
        let mut ps = TinyPubSub::new();
        ps.create("a").unwrap();
        ps.create("b").unwrap();
        let handle_b = ps.subscribe("b", bump, 0).unwrap();

        ps.destroy("a").unwrap();

        ps.publish("b", b"still here").unwrap();
        assert_eq!(1, HITS.load(Ordering::SeqCst));
        ps.unsubscribe(handle_b).unwrap();
    }

    #[test]
    fn count_reflects_live_subscriptions() {
        let mut ps = TinyPubSub::new();
        ps.create("a").unwrap();
        let h1 = ps.subscribe("a", bump, 0).unwrap();
        ps.subscribe("a", bump, 0).unwrap();
        assert_eq!(2, ps.count("a").unwrap());

        ps.unsubscribe(h1).unwrap();
        assert_eq!(1, ps.count("a").unwrap());
    }
}
