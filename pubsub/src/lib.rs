#![cfg_attr(not(test), no_std)]

//! A wildcard-matching publish/subscribe bus, grounded on
//! `modules/pubsub/src/pubsub.c`.
//!
//! The original keeps subscriptions in a `calloc`'d pointer array that it
//! doubles or halves as needed, and tells a statically-provided subscriber
//! apart from a heap-allocated one by stealing the low bit of the stored
//! `context` pointer (`GET_SUBSCRIBER_CONTEXT`/`IS_SUBSCRIBER_STATIC`).
//! Rust's ownership model makes that trick both unnecessary and unsound
//! (pointer tagging assumes an alignment guarantee the type system can't
//! check), so [`Subscription::storage`] carries the same distinction as a
//! plain enum field instead — informational only, since a `Box` always
//! frees its contents on drop regardless of how it got created.
//!
//! See [`tiny`] for the exact-match, explicit-topic variant grounded on
//! `modules/pubsub_tiny/src/pubsub_tiny.c`.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

pub mod tiny;

const MIN_SUBSCRIPTION_CAPACITY: u8 = 4;

pub type Callback = fn(context: usize, msg: &[u8]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStorage {
    Static,
    Heap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubSubError {
    InvalidParam,
    NoExistSubscriber,
    /// The registry is already at the 255-subscription ceiling the
    /// original enforces via an 8-bit capacity/length pair.
    CapacityExceeded,
}

struct Subscription {
    topic_filter: &'static str,
    callback: Callback,
    context: usize,
    storage: SubscriptionStorage,
}

/// Identifies a live subscription for [`PubSub::unsubscribe`]. An index
/// into the registry's pool rather than the raw subscriber pointer the
/// original hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(usize);

/// True if `topic` matches `filter`, honouring MQTT-style `+` (single
/// level) and `#` (remainder) wildcards. Ported byte-for-byte from
/// `is_topic_matched_with`.
pub fn is_topic_matched_with(filter: &str, topic: &str) -> bool {
    let f = filter.as_bytes();
    let t = topic.as_bytes();
    let (mut fi, mut ti) = (0usize, 0usize);

    while fi < f.len() && ti < t.len() {
        if f[fi] == b'#' {
            return true;
        }
        if f[fi] == b'+' {
            fi = next_topic_word(f, fi);
            ti = next_topic_word(t, ti);
            continue;
        }
        if f[fi] != t[ti] {
            return false;
        }
        fi += 1;
        ti += 1;
    }

    fi == f.len() && ti == t.len()
}

fn next_topic_word(s: &[u8], mut i: usize) -> usize {
    while i < s.len() && s[i] != b'/' {
        i += 1;
    }
    i
}

/// A dynamically resized registry of topic-filter subscriptions.
pub struct PubSub {
    pool: Vec<Option<Box<Subscription>>>,
    length: u8,
}

impl PubSub {
    pub fn new() -> Self {
        let mut pool = Vec::with_capacity(MIN_SUBSCRIPTION_CAPACITY as usize);
        pool.resize_with(MIN_SUBSCRIPTION_CAPACITY as usize, || None);
        Self { pool, length: 0 }
    }

    fn expand(&mut self) -> Result<(), PubSubError> {
        let capacity = self.pool.len() as u16;
        let new_capacity = capacity * 2;
        if new_capacity >= 256 {
            return Err(PubSubError::CapacityExceeded);
        }
        self.pool.resize_with(new_capacity as usize, || None);
        Ok(())
    }

    fn shrink(&mut self) {
        let capacity = self.pool.len() as u16;
        if capacity <= MIN_SUBSCRIPTION_CAPACITY as u16 {
            return;
        }
        if (self.length as u16) * 2 >= capacity {
            return;
        }

        let new_capacity = capacity / 2;
        let mut compacted: Vec<Option<Box<Subscription>>> = Vec::with_capacity(new_capacity as usize);
        for slot in self.pool.drain(..) {
            if slot.is_some() {
                compacted.push(slot);
            }
        }
        compacted.resize_with(new_capacity as usize, || None);
        self.pool = compacted;
    }

    fn register(&mut self, sub: Subscription) -> Result<SubscriptionHandle, PubSubError> {
        if self.length as usize >= self.pool.len() {
            self.expand()?;
        }

        for (i, slot) in self.pool.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Box::new(sub));
                self.length += 1;
                return Ok(SubscriptionHandle(i));
            }
        }

        Err(PubSubError::CapacityExceeded)
    }

    /// Registers a subscriber whose storage is owned by the caller for the
    /// life of the bus (no corresponding heap allocation here).
    pub fn subscribe_static(
        &mut self,
        topic_filter: &'static str,
        callback: Callback,
        context: usize,
    ) -> Result<SubscriptionHandle, PubSubError> {
        self.register(Subscription {
            topic_filter,
            callback,
            context,
            storage: SubscriptionStorage::Static,
        })
    }

    pub fn subscribe(
        &mut self,
        topic_filter: &'static str,
        callback: Callback,
        context: usize,
    ) -> Result<SubscriptionHandle, PubSubError> {
        self.register(Subscription {
            topic_filter,
            callback,
            context,
            storage: SubscriptionStorage::Heap,
        })
    }

    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Result<(), PubSubError> {
        match self.pool.get_mut(handle.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.length -= 1;
                self.shrink();
                Ok(())
            }
            _ => Err(PubSubError::NoExistSubscriber),
        }
    }

    pub fn publish(&self, topic: &str, msg: &[u8]) {
        for slot in self.pool.iter().flatten() {
            if is_topic_matched_with(slot.topic_filter, topic) {
                (slot.callback)(slot.context, msg);
            }
        }
    }

    pub fn count(&self, topic: &str) -> usize {
        self.pool
            .iter()
            .flatten()
            .filter(|sub| is_topic_matched_with(sub.topic_filter, topic))
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.pool.len()
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn reset() {
        HITS.store(0, Ordering::SeqCst);
    }

    fn bump(_ctx: usize, _msg: &[u8]) {
        HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn exact_topic_matches() {
        assert!(is_topic_matched_with("a/b/c", "a/b/c"));
        assert!(!is_topic_matched_with("a/b/c", "a/b"));
    }

    #[test]
    fn plus_matches_single_level() {
        assert!(is_topic_matched_with("a/+/c", "a/b/c"));
        assert!(!is_topic_matched_with("a/+/c", "a/b/x/c"));
    }

    #[test]
    fn hash_matches_remainder() {
        assert!(is_topic_matched_with("a/#", "a/b/c/d"));
        assert!(is_topic_matched_with("#", "anything"));
    }

    #[test]
    fn publish_invokes_matching_subscribers_only() {
        reset();
        let mut bus = PubSub::new();
        bus.subscribe("sensors/+/temp", bump, 0).unwrap();
        bus.subscribe("sensors/+/humidity", bump, 0).unwrap();

        bus.publish("sensors/1/temp", b"21.0");
        assert_eq!(1, HITS.load(Ordering::SeqCst));
    }

    #[test]
    fn unsubscribe_then_publish_does_not_call_back() {
        reset();
        let mut bus = PubSub::new();
        let handle = bus.subscribe("a/#", bump, 0).unwrap();
        bus.unsubscribe(handle).unwrap();

        bus.publish("a/b", b"x");
        assert_eq!(0, HITS.load(Ordering::SeqCst));
    }

    #[test]
    fn unsubscribe_twice_reports_missing() {
        let mut bus = PubSub::new();
        let handle = bus.subscribe("a", bump, 0).unwrap();
        bus.unsubscribe(handle).unwrap();
        assert_eq!(Err(PubSubError::NoExistSubscriber), bus.unsubscribe(handle));
    }

    #[test]
    fn count_reports_matching_subscribers() {
        let mut bus = PubSub::new();
        bus.subscribe("a/+", bump, 0).unwrap();
        bus.subscribe("a/+", bump, 0).unwrap();
        bus.subscribe("b", bump, 0).unwrap();

        assert_eq!(2, bus.count("a/x"));
        assert_eq!(0, bus.count("c"));
    }

    #[test]
    fn registry_expands_past_initial_capacity() {
        let mut bus = PubSub::new();
        let initial_capacity = bus.capacity();

        for _ in 0..(initial_capacity + 1) {
            bus.subscribe("a", bump, 0).unwrap();
        }

        assert!(bus.capacity() > initial_capacity);
    }

    #[test]
    fn registry_shrinks_after_bulk_unsubscribe() {
        let mut bus = PubSub::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            handles.push(bus.subscribe("a", bump, 0).unwrap());
        }
        let grown_capacity = bus.capacity();

        for handle in handles.drain(..15) {
            bus.unsubscribe(handle).unwrap();
        }

        assert!(bus.capacity() < grown_capacity);
    }
}
