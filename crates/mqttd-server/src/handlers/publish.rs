//! PUBLISH handling: retained storage and fanout.
//!
//! Field-level validation (wildcards in the topic, DUP on QoS 0, missing or
//! zero packet ids) already happened in the codec; a packet that reaches
//! this module is well-formed. The trie hands back (client id, granted QoS)
//! pairs and this module pushes deliveries onto each subscriber's outbound
//! channel; the owning connection task performs the socket writes.

use bytes::Bytes;
use tracing::{debug, info};

use mqttd_core::packet::{Packet, Publish, QoS};

use crate::session::Outbound;
use crate::shared::SharedState;

/// The broker's publish path: update retained state, then deliver to every
/// matching subscriber at min(publish QoS, granted QoS). Returns how many
/// deliveries were queued.
///
/// Runs for QoS 0/1 PUBLISH on receipt and for QoS 2 on PUBREL release.
pub fn process_publish(
    shared: &SharedState,
    publisher_id: &str,
    topic: &str,
    payload: &Bytes,
    qos: QoS,
    retain: bool,
) -> usize {
    info!(
        client_id = publisher_id,
        topic,
        qos = qos as u8,
        retain,
        payload_size = payload.len(),
        "publish"
    );

    if retain {
        handle_retained(shared, topic, payload, qos);
    }

    fanout(shared, topic, payload, qos, retain)
}

/// Store or delete retained state. An empty payload deletes.
fn handle_retained(shared: &SharedState, topic: &str, payload: &Bytes, qos: QoS) {
    shared.retained.write().store(topic, payload.clone(), qos);
    if payload.is_empty() {
        debug!(topic, "retained message removed");
    } else {
        debug!(topic, qos = qos as u8, payload_size = payload.len(), "retained message stored");
    }
}

/// Deliver to all matching subscribers. The subscription read lock is
/// released before any session or flow-engine lock is taken.
fn fanout(shared: &SharedState, topic: &str, payload: &Bytes, qos: QoS, retain: bool) -> usize {
    let matches = shared.subscriptions.read().matches(topic);

    let mut delivered = 0;
    for sub in matches {
        let sender = shared.sessions.read().sender(&sub.client_id);
        let Some(sender) = sender else {
            // Subscriber known but not currently connected
            continue;
        };

        let out_qos = qos.min(sub.qos);
        let packet_id = (out_qos != QoS::AtMostOnce).then(|| shared.qos.next_packet_id());

        let publish = Publish {
            dup: false,
            qos: out_qos,
            retain,
            topic: topic.to_string(),
            packet_id,
            payload: payload.clone(),
        };

        if out_qos != QoS::AtMostOnce {
            shared.qos.track_outbound(sub.client_id.clone(), &publish);
        }

        if sender
            .try_send(Outbound::Packet(Packet::Publish(publish)))
            .is_ok()
        {
            delivered += 1;
        } else {
            // Slow or closing subscriber. QoS 0 is lost by contract; QoS 1/2
            // entries stay pending and the retry ticker re-sends them.
            debug!(client_id = %sub.client_id, topic, "outbound queue full, delivery dropped");
        }
    }
    delivered
}
