//! Subscription store: a level-indexed trie.
//!
//! Filters are split on `/` and stored as a path of child nodes; the `+` and
//! `#` wildcards are ordinary child keys. Each node carries a map of
//! ClientID → Subscription, so a re-subscribe replaces the prior entry.
//! Filter validation guarantees `#` only ever appears as a terminal level,
//! which keeps `#` nodes leaf-only.
//!
//! The trie is a pure data structure: matching returns the subscription set
//! and the connection dispatcher performs all socket effects.

use std::collections::HashMap;
use std::sync::Arc;

use mqttd_core::packet::QoS;

/// A stored subscription. Unique per (client id, topic filter).
#[derive(Debug, Clone)]
pub struct Subscription {
    pub client_id: Arc<str>,
    pub topic_filter: Arc<str>,
    pub qos: QoS,
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    subscribers: HashMap<Arc<str>, Subscription>,
}

impl TrieNode {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscribers.is_empty()
    }

    fn remove(&mut self, levels: &[&str], client_id: &str) {
        if levels.is_empty() {
            self.subscribers.remove(client_id);
            return;
        }
        if let Some(child) = self.children.get_mut(levels[0]) {
            child.remove(&levels[1..], client_id);
            if child.is_empty() {
                self.children.remove(levels[0]);
            }
        }
    }

    fn remove_client(&mut self, client_id: &str) {
        self.subscribers.remove(client_id);
        self.children.retain(|_, child| {
            child.remove_client(client_id);
            !child.is_empty()
        });
    }

    fn collect(&self, levels: &[&str], out: &mut Vec<Subscription>) {
        // A `#` child matches the remainder from here, including zero levels
        if let Some(multi) = self.children.get("#") {
            out.extend(multi.subscribers.values().cloned());
        }

        if levels.is_empty() {
            out.extend(self.subscribers.values().cloned());
            return;
        }

        if let Some(plus) = self.children.get("+") {
            plus.collect(&levels[1..], out);
        }
        if let Some(child) = self.children.get(levels[0]) {
            child.collect(&levels[1..], out);
        }
    }

    #[cfg(test)]
    fn has_empty_descendant(&self) -> bool {
        self.children
            .values()
            .any(|c| c.is_empty() || c.has_empty_descendant())
    }

    #[cfg(test)]
    fn contains_client(&self, client_id: &str) -> bool {
        self.subscribers.contains_key(client_id)
            || self.children.values().any(|c| c.contains_client(client_id))
    }
}

/// Topic filter trie. Guarded by a single RwLock in `SharedState`: matches
/// take the read lock, mutations the write lock.
#[derive(Default)]
pub struct SubscriptionTree {
    root: TrieNode,
}

impl SubscriptionTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the (client, filter) subscription. The filter must
    /// already be validated.
    pub fn subscribe(&mut self, client_id: Arc<str>, filter: &str, qos: QoS) {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            node = node.children.entry(level.to_string()).or_default();
        }
        node.subscribers.insert(
            client_id.clone(),
            Subscription {
                client_id,
                topic_filter: Arc::from(filter),
                qos,
            },
        );
    }

    /// Remove one (client, filter) subscription; nodes left empty are pruned
    /// on the way back to the root. Unknown paths are a no-op.
    pub fn unsubscribe(&mut self, client_id: &str, filter: &str) {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.remove(&levels, client_id);
    }

    /// Remove a client from every node it touches, collapsing empty nodes.
    pub fn remove_client(&mut self, client_id: &str) {
        self.root.remove_client(client_id);
    }

    /// All subscriptions matching a topic name. This is a multiset: a client
    /// holding several overlapping filters appears once per filter.
    pub fn matches(&self, topic: &str) -> Vec<Subscription> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut out = Vec::new();
        self.root.collect(&levels, &mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Arc<str> {
        Arc::from(s)
    }

    fn client_ids(subs: &[Subscription]) -> Vec<&str> {
        let mut ids: Vec<&str> = subs.iter().map(|s| s.client_id.as_ref()).collect();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn test_exact_match() {
        let mut tree = SubscriptionTree::new();
        tree.subscribe(id("c1"), "sensors/temp", QoS::AtMostOnce);

        assert_eq!(client_ids(&tree.matches("sensors/temp")), ["c1"]);
        assert!(tree.matches("sensors/humidity").is_empty());
        assert!(tree.matches("sensors").is_empty());
        assert!(tree.matches("sensors/temp/celsius").is_empty());
    }

    #[test]
    fn test_single_level_wildcard() {
        let mut tree = SubscriptionTree::new();
        tree.subscribe(id("c1"), "sport/+/player1", QoS::AtMostOnce);

        assert_eq!(client_ids(&tree.matches("sport/tennis/player1")), ["c1"]);
        assert!(tree.matches("sport/tennis/player2").is_empty());
        assert!(tree.matches("sport/tennis/player1/ranking").is_empty());
    }

    #[test]
    fn test_multi_level_wildcard() {
        let mut tree = SubscriptionTree::new();
        tree.subscribe(id("c1"), "sport/#", QoS::AtMostOnce);

        assert_eq!(client_ids(&tree.matches("sport/tennis/player1")), ["c1"]);
        assert_eq!(client_ids(&tree.matches("sport/tennis/player2")), ["c1"]);
        assert_eq!(
            client_ids(&tree.matches("sport/tennis/player1/ranking")),
            ["c1"]
        );
        // '#' also matches the parent level itself
        assert_eq!(client_ids(&tree.matches("sport")), ["c1"]);
        assert!(tree.matches("other").is_empty());
    }

    #[test]
    fn test_root_multi_level_wildcard() {
        let mut tree = SubscriptionTree::new();
        tree.subscribe(id("c1"), "#", QoS::AtMostOnce);
        assert_eq!(client_ids(&tree.matches("a")), ["c1"]);
        assert_eq!(client_ids(&tree.matches("a/b/c")), ["c1"]);
    }

    #[test]
    fn test_overlapping_filters_yield_multiset() {
        let mut tree = SubscriptionTree::new();
        tree.subscribe(id("c1"), "a/b", QoS::AtMostOnce);
        tree.subscribe(id("c1"), "a/+", QoS::AtLeastOnce);
        tree.subscribe(id("c1"), "a/#", QoS::ExactlyOnce);

        // One entry per overlapping filter; deliveries may be duplicated
        assert_eq!(tree.matches("a/b").len(), 3);
    }

    #[test]
    fn test_resubscribe_replaces_entry() {
        let mut tree = SubscriptionTree::new();
        tree.subscribe(id("c1"), "a/b", QoS::AtMostOnce);
        tree.subscribe(id("c1"), "a/b", QoS::ExactlyOnce);

        let matches = tree.matches("a/b");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].qos, QoS::ExactlyOnce);
    }

    #[test]
    fn test_unsubscribe_prunes_empty_nodes() {
        let mut tree = SubscriptionTree::new();
        tree.subscribe(id("c1"), "a/b/c/d", QoS::AtMostOnce);
        tree.subscribe(id("c2"), "a/b", QoS::AtMostOnce);

        tree.unsubscribe("c1", "a/b/c/d");
        assert!(tree.matches("a/b/c/d").is_empty());
        assert_eq!(client_ids(&tree.matches("a/b")), ["c2"]);
        assert!(!tree.root.has_empty_descendant());

        // Unknown path is a no-op
        tree.unsubscribe("c1", "x/y");
        assert_eq!(client_ids(&tree.matches("a/b")), ["c2"]);
    }

    #[test]
    fn test_remove_client_removes_everything_and_collapses() {
        let mut tree = SubscriptionTree::new();
        tree.subscribe(id("c1"), "a/b", QoS::AtMostOnce);
        tree.subscribe(id("c1"), "a/+/c", QoS::AtLeastOnce);
        tree.subscribe(id("c1"), "d/#", QoS::ExactlyOnce);
        tree.subscribe(id("c2"), "a/b", QoS::AtMostOnce);

        tree.remove_client("c1");

        assert!(!tree.root.contains_client("c1"));
        assert!(!tree.root.has_empty_descendant());
        assert_eq!(client_ids(&tree.matches("a/b")), ["c2"]);
        assert!(tree.matches("d/e").is_empty());
    }

    #[test]
    fn test_match_agrees_with_filter_walk() {
        // With a single subscription, trie matching and the level-walk
        // matcher must agree on every (filter, name) pair.
        let filters = ["a/b", "a/+", "a/#", "+/b", "#", "a/b/c", "+/+"];
        let names = ["a/b", "a/c", "a", "a/b/c", "b/b", "x"];

        for filter in filters {
            for name in names {
                let mut tree = SubscriptionTree::new();
                tree.subscribe(id("c1"), filter, QoS::AtMostOnce);
                let trie_match = !tree.matches(name).is_empty();
                let walk_match = mqttd_core::topic::matches(filter, name);
                assert_eq!(trie_match, walk_match, "filter={} name={}", filter, name);
            }
        }
    }
}
