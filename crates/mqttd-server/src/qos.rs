//! QoS 1/2 flow-control engine.
//!
//! In-flight handshakes live in tables keyed by client id, then packet id:
//!
//! - `qos1_out`: outbound QoS 1 PUBLISH awaiting PUBACK
//! - `qos2_out`: outbound QoS 2 PUBLISH awaiting PUBREC
//! - `qos2_rel`: PUBREL sent, awaiting PUBCOMP
//! - `qos2_in`:  inbound QoS 2 PUBLISH held until PUBREL arrives
//!
//! Entries reference sessions by client id only; the retry loop looks the
//! session up at send time and drops the entry if it is gone. A background
//! task ticks every 10 seconds, re-sending unacknowledged PUBLISH frames
//! with DUP set and purging stale inbound state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mqttd_core::packet::{Packet, Publish, QoS};

use crate::session::Outbound;
use crate::shared::SharedStateHandle;

/// Retry ticker period.
pub const RETRY_TICK: Duration = Duration::from_secs(10);

/// Retries per pending entry before it is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Minimum age before an unacknowledged PUBLISH is re-sent.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Inbound QoS 2 state older than this is garbage-collected.
pub const INBOUND_QOS2_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// An outbound QoS 1/2 PUBLISH awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct PendingPublish {
    pub client_id: Arc<str>,
    pub packet_id: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub first_sent: Instant,
    pub last_sent: Instant,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl PendingPublish {
    /// The retransmission frame: same message with DUP set.
    pub fn to_dup_publish(&self) -> Publish {
        Publish {
            dup: true,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic.clone(),
            packet_id: Some(self.packet_id),
            payload: self.payload.clone(),
        }
    }
}

/// An inbound QoS 2 PUBLISH for which PUBREC was sent, held until PUBREL.
#[derive(Debug, Clone)]
pub struct ReceivedPublish {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
    pub received_at: Instant,
}

type Table<T> = RwLock<AHashMap<Arc<str>, AHashMap<u16, T>>>;

fn table_remove<T>(table: &Table<T>, client_id: &str, packet_id: u16) -> Option<T> {
    let mut table = table.write();
    let entries = table.get_mut(client_id)?;
    let removed = entries.remove(&packet_id);
    if entries.is_empty() {
        table.remove(client_id);
    }
    removed
}

fn table_insert<T>(table: &Table<T>, client_id: Arc<str>, packet_id: u16, value: T) {
    table.write().entry(client_id).or_default().insert(packet_id, value);
}

/// The flow engine. Each table carries its own lock; no operation holds two
/// locks at once.
pub struct QosFlow {
    qos1_out: Table<PendingPublish>,
    qos2_out: Table<PendingPublish>,
    qos2_rel: Table<PendingPublish>,
    qos2_in: Table<ReceivedPublish>,
    packet_id_seq: AtomicU32,
}

impl Default for QosFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl QosFlow {
    pub fn new() -> Self {
        Self {
            qos1_out: RwLock::new(AHashMap::new()),
            qos2_out: RwLock::new(AHashMap::new()),
            qos2_rel: RwLock::new(AHashMap::new()),
            qos2_in: RwLock::new(AHashMap::new()),
            packet_id_seq: AtomicU32::new(0),
        }
    }

    /// Allocate the next packet id: a single monotonically increasing
    /// counter wrapped to u16, skipping zero. Ids are not scoped per client;
    /// the tables are keyed by (client id, packet id).
    pub fn next_packet_id(&self) -> u16 {
        loop {
            let id = self.packet_id_seq.fetch_add(1, Ordering::Relaxed) as u16;
            if id != 0 {
                return id;
            }
        }
    }

    /// Track an outbound QoS 1/2 PUBLISH that was just handed to a
    /// subscriber's connection. No-op for QoS 0 or a missing packet id.
    pub fn track_outbound(&self, client_id: Arc<str>, publish: &Publish) {
        let Some(packet_id) = publish.packet_id else {
            return;
        };
        let now = Instant::now();
        let pending = PendingPublish {
            client_id: client_id.clone(),
            packet_id,
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
            first_sent: now,
            last_sent: now,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        };
        match publish.qos {
            QoS::AtLeastOnce => table_insert(&self.qos1_out, client_id, packet_id, pending),
            QoS::ExactlyOnce => table_insert(&self.qos2_out, client_id, packet_id, pending),
            QoS::AtMostOnce => {}
        }
    }

    /// PUBACK received: complete the QoS 1 flow. Returns whether the id was
    /// known.
    pub fn handle_puback(&self, client_id: &str, packet_id: u16) -> bool {
        table_remove(&self.qos1_out, client_id, packet_id).is_some()
    }

    /// PUBREC received: migrate the entry from awaiting-PUBREC to
    /// awaiting-PUBCOMP. The caller sends PUBREL when this returns true.
    pub fn handle_pubrec(&self, client_id: &str, packet_id: u16) -> bool {
        let Some(pending) = table_remove(&self.qos2_out, client_id, packet_id) else {
            return false;
        };
        table_insert(&self.qos2_rel, pending.client_id.clone(), packet_id, pending);
        true
    }

    /// PUBCOMP received: the QoS 2 outbound flow is complete.
    pub fn handle_pubcomp(&self, client_id: &str, packet_id: u16) -> bool {
        table_remove(&self.qos2_rel, client_id, packet_id).is_some()
    }

    /// Register an inbound QoS 2 PUBLISH. Returns `false` for a duplicate
    /// (same client id and packet id already held): the caller re-sends
    /// PUBREC but must not deliver a second time.
    pub fn register_inbound(
        &self,
        client_id: Arc<str>,
        packet_id: u16,
        topic: &str,
        payload: Bytes,
        retain: bool,
    ) -> bool {
        let mut table = self.qos2_in.write();
        let entries = table.entry(client_id).or_default();
        if entries.contains_key(&packet_id) {
            return false;
        }
        entries.insert(
            packet_id,
            ReceivedPublish {
                topic: topic.to_string(),
                payload,
                retain,
                received_at: Instant::now(),
            },
        );
        true
    }

    /// PUBREL received: release the held message for delivery. PUBCOMP is
    /// sent by the caller regardless of whether the id was known.
    pub fn release_inbound(&self, client_id: &str, packet_id: u16) -> Option<ReceivedPublish> {
        table_remove(&self.qos2_in, client_id, packet_id)
    }

    /// Forget one outbound entry, wherever it lives. Used when the owning
    /// session disappeared between tick and send.
    pub fn forget_outbound(&self, client_id: &str, packet_id: u16) {
        table_remove(&self.qos1_out, client_id, packet_id);
        table_remove(&self.qos2_out, client_id, packet_id);
        table_remove(&self.qos2_rel, client_id, packet_id);
    }

    /// Purge every table for a departing client.
    pub fn remove_client(&self, client_id: &str) {
        self.qos1_out.write().remove(client_id);
        self.qos2_out.write().remove(client_id);
        self.qos2_rel.write().remove(client_id);
        self.qos2_in.write().remove(client_id);
    }

    /// Entries due for retransmission: bumps their retry count and
    /// last-sent time. Entries out of retries are removed and returned
    /// separately for logging.
    pub fn collect_retries(&self, now: Instant) -> (Vec<PendingPublish>, Vec<PendingPublish>) {
        let mut due = Vec::new();
        let mut exhausted = Vec::new();

        for table in [&self.qos1_out, &self.qos2_out] {
            let mut table = table.write();
            table.retain(|_, entries| {
                entries.retain(|_, msg| {
                    if now.saturating_duration_since(msg.last_sent) < msg.retry_interval {
                        return true;
                    }
                    if msg.retry_count < msg.max_retries {
                        msg.retry_count += 1;
                        msg.last_sent = now;
                        due.push(msg.clone());
                        true
                    } else {
                        exhausted.push(msg.clone());
                        false
                    }
                });
                !entries.is_empty()
            });
        }

        (due, exhausted)
    }

    /// Drop inbound QoS 2 state older than the timeout. Returns how many
    /// entries were purged.
    pub fn purge_expired_inbound(&self, now: Instant) -> usize {
        let mut purged = 0;
        let mut table = self.qos2_in.write();
        table.retain(|_, entries| {
            entries.retain(|_, msg| {
                let expired =
                    now.saturating_duration_since(msg.received_at) >= INBOUND_QOS2_TIMEOUT;
                if expired {
                    purged += 1;
                }
                !expired
            });
            !entries.is_empty()
        });
        purged
    }

    /// How many of the three outbound tables hold this (client, packet id).
    /// At most one at any time.
    #[allow(dead_code)]
    pub fn outbound_entry_count(&self, client_id: &str, packet_id: u16) -> usize {
        [&self.qos1_out, &self.qos2_out, &self.qos2_rel]
            .into_iter()
            .filter(|t| {
                t.read()
                    .get(client_id)
                    .is_some_and(|entries| entries.contains_key(&packet_id))
            })
            .count()
    }

    /// Total pending entries for a client across all tables.
    #[allow(dead_code)]
    pub fn pending_for_client(&self, client_id: &str) -> usize {
        let outbound: usize = [&self.qos1_out, &self.qos2_out, &self.qos2_rel]
            .into_iter()
            .filter_map(|t| t.read().get(client_id).map(|entries| entries.len()))
            .sum();
        let inbound = self
            .qos2_in
            .read()
            .get(client_id)
            .map(|entries| entries.len())
            .unwrap_or(0);
        outbound + inbound
    }
}

/// Background retry task: every tick, re-send due PUBLISH frames with DUP
/// set and purge stale inbound QoS 2 state.
pub async fn retry_loop(shared: SharedStateHandle, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(RETRY_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        let (due, exhausted) = shared.qos.collect_retries(now);

        for msg in exhausted {
            warn!(
                client_id = %msg.client_id,
                packet_id = msg.packet_id,
                retries = msg.max_retries,
                "dropping unacknowledged publish after retry budget"
            );
        }

        for msg in due {
            let sender = shared.sessions.read().sender(&msg.client_id);
            let Some(sender) = sender else {
                // Session is gone; the entry must not linger
                shared.qos.forget_outbound(&msg.client_id, msg.packet_id);
                continue;
            };
            debug!(
                client_id = %msg.client_id,
                packet_id = msg.packet_id,
                qos = msg.qos as u8,
                retry = msg.retry_count,
                "re-sending publish with DUP"
            );
            // A full channel leaves the entry in place for the next tick
            let _ = sender.try_send(Outbound::Packet(Packet::Publish(msg.to_dup_publish())));
        }

        let purged = shared.qos.purge_expired_inbound(now);
        if purged > 0 {
            debug!(count = purged, "purged stale inbound QoS 2 state");
        }
    }
}
