//! Retained message store.
//!
//! Holds the last retained payload per topic. A retained publish with an
//! empty payload deletes the entry. New subscribers receive every retained
//! message whose topic matches their filter, at min(stored QoS, granted QoS).

use ahash::AHashMap;
use bytes::Bytes;

use mqttd_core::packet::QoS;
use mqttd_core::topic;

/// The most recent retained publish on a topic.
#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

/// Topic → retained message map.
#[derive(Default)]
pub struct RetainedStore {
    messages: AHashMap<String, RetainedMessage>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a retained message. An empty payload deletes the entry.
    pub fn store(&mut self, topic: &str, payload: Bytes, qos: QoS) {
        if payload.is_empty() {
            self.messages.remove(topic);
        } else {
            self.messages.insert(
                topic.to_string(),
                RetainedMessage {
                    topic: topic.to_string(),
                    payload,
                    qos,
                },
            );
        }
    }

    #[allow(dead_code)]
    pub fn get(&self, topic: &str) -> Option<&RetainedMessage> {
        self.messages.get(topic)
    }

    /// All entries whose topics match the filter.
    pub fn for_matching(&self, filter: &str) -> Vec<RetainedMessage> {
        self.messages
            .values()
            .filter(|m| topic::matches(filter, &m.topic))
            .cloned()
            .collect()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_and_match() {
        let mut store = RetainedStore::new();
        store.store("s/t", Bytes::from_static(b"ON"), QoS::AtMostOnce);
        store.store("s/u", Bytes::from_static(b"OFF"), QoS::AtLeastOnce);
        store.store("other", Bytes::from_static(b"x"), QoS::AtMostOnce);

        let mut matched = store.for_matching("s/+");
        matched.sort_by(|a, b| a.topic.cmp(&b.topic));
        assert_eq!(matched.len(), 2);
        assert_eq!(matched[0].topic, "s/t");
        assert_eq!(&matched[0].payload[..], b"ON");
        assert_eq!(matched[1].topic, "s/u");
        assert_eq!(matched[1].qos, QoS::AtLeastOnce);

        assert_eq!(store.for_matching("#").len(), 3);
        assert!(store.for_matching("nothing/here").is_empty());
    }

    #[test]
    fn test_new_retained_replaces_old() {
        let mut store = RetainedStore::new();
        store.store("t", Bytes::from_static(b"v1"), QoS::AtMostOnce);
        store.store("t", Bytes::from_static(b"v2"), QoS::ExactlyOnce);

        let msg = store.get("t").unwrap();
        assert_eq!(&msg.payload[..], b"v2");
        assert_eq!(msg.qos, QoS::ExactlyOnce);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_empty_payload_deletes() {
        let mut store = RetainedStore::new();
        store.store("t", Bytes::from_static(b"v"), QoS::AtMostOnce);
        assert_eq!(store.len(), 1);

        store.store("t", Bytes::new(), QoS::AtMostOnce);
        assert!(store.get("t").is_none());
        assert!(store.is_empty());

        // Deleting an absent topic is a no-op
        store.store("t", Bytes::new(), QoS::AtMostOnce);
        assert!(store.is_empty());
    }
}
