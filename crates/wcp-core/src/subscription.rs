//! Active-topic registry.
//!
//! Maps each subscribed topic to its owning sequence kind and expiry so
//! inbound traffic can be routed and stale interests swept. Decryption keys
//! live with the relay client, which is the component that opens envelopes.

use dashmap::DashMap;

use wcp_crypto::Topic;
use wcp_relay::SubscriptionId;

use crate::types::SequenceKind;

/// Sweep cadence for expired subscriptions, in milliseconds.
pub const SWEEP_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct SubscriptionEntry {
    pub id: SubscriptionId,
    pub kind: SequenceKind,
    pub expiry: u64,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: DashMap<Topic, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, topic: Topic, id: SubscriptionId, kind: SequenceKind, expiry: u64) {
        self.entries.insert(topic, SubscriptionEntry { id, kind, expiry });
    }

    pub fn remove(&self, topic: &Topic) -> Option<SubscriptionEntry> {
        self.entries.remove(topic).map(|(_, e)| e)
    }

    pub fn kind_of(&self, topic: &Topic) -> Option<SequenceKind> {
        self.entries.get(topic).map(|e| e.kind)
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.entries.contains_key(topic)
    }

    /// Extend a topic's lifetime, e.g. after an update that pushed expiry.
    pub fn touch(&self, topic: &Topic, expiry: u64) {
        if let Some(mut entry) = self.entries.get_mut(topic) {
            entry.expiry = expiry;
        }
    }

    /// Topics whose expiry has passed, for the sweeper to clean up.
    pub fn expired(&self, now: u64) -> Vec<(Topic, SequenceKind)> {
        self.entries
            .iter()
            .filter(|e| e.value().expiry <= now)
            .map(|e| (*e.key(), e.value().kind))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_remove() {
        let registry = SubscriptionRegistry::new();
        let topic = Topic::generate();
        registry.register(topic, SubscriptionId(1), SequenceKind::Pairing, 100);

        assert_eq!(registry.kind_of(&topic), Some(SequenceKind::Pairing));
        assert!(registry.contains(&topic));

        let entry = registry.remove(&topic).unwrap();
        assert_eq!(entry.id, SubscriptionId(1));
        assert!(!registry.contains(&topic));
    }

    #[test]
    fn expired_reports_only_past_due() {
        let registry = SubscriptionRegistry::new();
        let stale = Topic::generate();
        let live = Topic::generate();
        registry.register(stale, SubscriptionId(1), SequenceKind::Session, 50);
        registry.register(live, SubscriptionId(2), SequenceKind::Session, 500);

        let expired = registry.expired(100);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, stale);
    }

    #[test]
    fn touch_extends_expiry() {
        let registry = SubscriptionRegistry::new();
        let topic = Topic::generate();
        registry.register(topic, SubscriptionId(1), SequenceKind::Session, 50);
        registry.touch(&topic, 500);
        assert!(registry.expired(100).is_empty());
    }
}
