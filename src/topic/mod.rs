//! Topic matching, subscriptions and retained messages
//!
//! [`TopicMatcher`] is the broker-wide registry shared by every connection.
//! Matching only takes the read side of its locks, so fan-out never blocks
//! behind another publisher; subscribe, unsubscribe and retain take the
//! write side briefly.

mod trie;
pub mod validation;


pub use trie::TopicTrie;
pub use validation::{topic_matches_filter, validate_topic_filter, validate_topic_name};

use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::protocol::{Publish, QoS};

/// A subscriber registered on one filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// Client identifier of the owning session
    pub client_id: Arc<str>,
    /// Requested QoS
    pub qos: QoS,
}

/// Matching subscriber and the QoS the message is delivered at
pub type Match = (Arc<str>, QoS);

/// Last retained message for a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
}

impl RetainedMessage {
    /// PUBLISH replaying this message to a subscriber granted `granted`
    pub fn to_publish(&self, granted: QoS) -> Publish {
        Publish {
            qos: self.qos.min(granted),
            retain: true,
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            ..Default::default()
        }
    }
}

/// Thread-safe subscription trie plus retained message table
#[derive(Debug, Default)]
pub struct TopicMatcher {
    trie: RwLock<TopicTrie<Vec<Subscriber>>>,
    retained: RwLock<AHashMap<Arc<str>, RetainedMessage>>,
}

impl TopicMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription, replacing the QoS of an existing one for the
    /// same filter and subscriber
    pub fn subscribe(&self, filter: &str, qos: QoS, client_id: &Arc<str>) {
        let mut trie = self.trie.write();
        let subs = trie.entry(filter);
        match subs.iter_mut().find(|s| s.client_id == *client_id) {
            Some(existing) => existing.qos = qos,
            None => subs.push(Subscriber {
                client_id: client_id.clone(),
                qos,
            }),
        }
    }

    /// Remove a subscription, returning whether one existed
    pub fn unsubscribe(&self, filter: &str, client_id: &str) -> bool {
        let mut trie = self.trie.write();
        let Some(subs) = trie.get_mut(filter) else {
            return false;
        };

        let len_before = subs.len();
        subs.retain(|s| s.client_id.as_ref() != client_id);
        let removed = subs.len() != len_before;
        if subs.is_empty() {
            trie.remove(filter);
        }
        removed
    }

    /// Remove all subscriptions for a client
    pub fn unsubscribe_all(&self, client_id: &str) {
        let mut trie = self.trie.write();
        trie.remove_by_predicate(|subs| {
            subs.retain(|s| s.client_id.as_ref() != client_id);
            subs.is_empty()
        });
    }

    /// Subscribers matching `topic`, in first-match order
    ///
    /// Each subscriber appears once. When several of its filters match, the
    /// message is delivered at the highest effective QoS among them, where
    /// the effective QoS of one match is `min(publish_qos, requested)`.
    pub fn matches(&self, topic: &str, publish_qos: QoS) -> SmallVec<[Match; 16]> {
        let mut result: SmallVec<[Match; 16]> = SmallVec::new();
        let mut index: AHashMap<Arc<str>, usize> = AHashMap::new();

        let trie = self.trie.read();
        trie.matches(topic, |subs| {
            for sub in subs {
                let qos = publish_qos.min(sub.qos);
                match index.get(&sub.client_id) {
                    Some(&i) => {
                        if qos > result[i].1 {
                            result[i].1 = qos;
                        }
                    }
                    None => {
                        index.insert(sub.client_id.clone(), result.len());
                        result.push((sub.client_id.clone(), qos));
                    }
                }
            }
        });

        result
    }

    /// Store, replace or (with an empty payload) clear the retained message
    /// for `topic`
    pub fn retain(&self, topic: &Arc<str>, payload: Bytes, qos: QoS) {
        let mut retained = self.retained.write();
        if payload.is_empty() {
            retained.remove(topic);
        } else {
            retained.insert(
                topic.clone(),
                RetainedMessage {
                    topic: topic.clone(),
                    payload,
                    qos,
                },
            );
        }
    }

    /// Retained messages whose topic matches `filter`
    pub fn retained_for(&self, filter: &str) -> Vec<RetainedMessage> {
        let retained = self.retained.read();

        // Exact filters hit a single entry
        if !filter.contains(['+', '#']) {
            return retained.get(filter).cloned().into_iter().collect();
        }

        let mut messages: Vec<RetainedMessage> = retained
            .values()
            .filter(|m| topic_matches_filter(&m.topic, filter))
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.topic.cmp(&b.topic));
        messages
    }

    /// Number of retained topics
    pub fn retained_count(&self) -> usize {
        self.retained.read().len()
    }
}
