//! Client sessions and the session registry.
//!
//! The registry is the source of truth for which client ids are currently
//! known. Each live session owns the sending half of its connection task's
//! outbound channel; the connection task is the only writer to its socket,
//! so every other component reaches a client through that channel.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::AHashMap;
use tokio::sync::mpsc;

use mqttd_core::packet::{Connect, Packet, Will};

/// Capacity of each session's outbound channel. A full channel drops the
/// delivery attempt; QoS 1/2 messages stay pending and are retransmitted.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Commands delivered to a connection task through its session channel.
#[derive(Debug)]
pub enum Outbound {
    /// Write this packet to the client socket.
    Packet(Packet),
    /// Close the connection (session superseded, or server policy).
    Shutdown,
}

/// Per-client session state, created by CONNECT.
#[derive(Debug, Clone)]
pub struct Session {
    pub client_id: Arc<str>,
    pub clean_session: bool,
    /// Will data captured from CONNECT. Stored, never delivered.
    pub will: Option<Will>,
    pub keep_alive: u16,
    /// Unix timestamp of the CONNECT that created this session.
    pub connected_at: u64,
    /// Identifies the owning connection; teardown is guarded by it so a
    /// superseded connection cannot destroy its successor's state.
    pub conn_id: u64,
    /// Outbound channel of the owning connection; `None` once it is gone.
    sender: Option<mpsc::Sender<Outbound>>,
}

impl Session {
    pub fn new(
        client_id: Arc<str>,
        connect: &Connect,
        conn_id: u64,
        sender: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            client_id,
            clean_session: connect.clean_session,
            will: connect.will.clone(),
            keep_alive: connect.keep_alive,
            connected_at: unix_timestamp(),
            conn_id,
            sender: Some(sender),
        }
    }

    pub fn sender(&self) -> Option<mpsc::Sender<Outbound>> {
        self.sender.clone()
    }
}

/// ClientID → Session map.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: AHashMap<Arc<str>, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    /// Store a session, replacing any prior entry for the same client id.
    pub fn put(&mut self, session: Session) {
        self.sessions.insert(session.client_id.clone(), session);
    }

    pub fn delete(&mut self, client_id: &str) -> Option<Session> {
        self.sessions.remove(client_id)
    }

    /// Live outbound channel for a client, if it is currently connected.
    pub fn sender(&self, client_id: &str) -> Option<mpsc::Sender<Outbound>> {
        self.sessions.get(client_id).and_then(Session::sender)
    }

    /// Whether `conn_id` still owns the session for `client_id`.
    pub fn owns(&self, client_id: &str, conn_id: u64) -> bool {
        self.sessions
            .get(client_id)
            .is_some_and(|s| s.conn_id == conn_id)
    }

    /// Drop the connection handle from a persistent session when its
    /// connection closes. No-op if the session was taken over.
    pub fn release_connection(&mut self, client_id: &str, conn_id: u64) {
        if let Some(session) = self.sessions.get_mut(client_id) {
            if session.conn_id == conn_id {
                session.sender = None;
            }
        }
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
