//! Process-wide shared broker state.
//!
//! Each structure is guarded by its own read/write lock; the flow engine's
//! tables carry their own. A connection task never holds two of these locks
//! simultaneously, which rules out lock-order cycles.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::qos::QosFlow;
use crate::retained::RetainedStore;
use crate::session::SessionRegistry;
use crate::subscription::SubscriptionTree;

pub struct SharedState {
    /// ClientID → Session.
    pub sessions: RwLock<SessionRegistry>,
    /// Topic filter trie.
    pub subscriptions: RwLock<SubscriptionTree>,
    /// Topic → retained message.
    pub retained: RwLock<RetainedStore>,
    /// QoS 1/2 in-flight tables and packet id allocation.
    pub qos: QosFlow,
    /// Live connection count, checked against the listener cap.
    pub connections: AtomicUsize,
    conn_id_seq: AtomicU64,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(SessionRegistry::new()),
            subscriptions: RwLock::new(SubscriptionTree::new()),
            retained: RwLock::new(RetainedStore::new()),
            qos: QosFlow::new(),
            connections: AtomicUsize::new(0),
            conn_id_seq: AtomicU64::new(0),
        }
    }

    /// Unique id for each accepted connection; guards session teardown
    /// against takeover races.
    pub fn next_conn_id(&self) -> u64 {
        self.conn_id_seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedStateHandle = Arc<SharedState>;
