//! SUBSCRIBE / UNSUBSCRIBE handling.
//!
//! Each requested filter is validated on its own: an invalid filter yields
//! return code 0x80 for that slot without affecting the others. The SUBACK
//! is the first packet written after a subscribe; matching retained
//! messages follow it.

use std::sync::Arc;

use tracing::{info, warn};

use mqttd_core::packet::{Packet, Publish, QoS, Suback, Subscribe, Unsubscribe, SUBACK_FAILURE};
use mqttd_core::topic;

use crate::shared::SharedState;

/// Process a SUBSCRIBE: validate and insert each filter, build the SUBACK.
pub fn subscribe(shared: &SharedState, client_id: &Arc<str>, subscribe: &Subscribe) -> Suback {
    let mut return_codes = Vec::with_capacity(subscribe.filters.len());

    for (filter, qos) in &subscribe.filters {
        match topic::validate_filter(filter) {
            Ok(()) => {
                shared
                    .subscriptions
                    .write()
                    .subscribe(client_id.clone(), filter, *qos);
                info!(
                    client_id = %client_id,
                    topic_filter = %filter,
                    qos = *qos as u8,
                    "subscribed"
                );
                return_codes.push(*qos as u8);
            }
            Err(e) => {
                warn!(
                    client_id = %client_id,
                    topic_filter = %filter,
                    error = %e,
                    "subscription rejected"
                );
                return_codes.push(SUBACK_FAILURE);
            }
        }
    }

    Suback {
        packet_id: subscribe.packet_id,
        return_codes,
    }
}

/// Retained messages matching the granted filters, ready for delivery at
/// min(stored QoS, granted QoS). QoS 1/2 deliveries get fresh packet ids
/// and are registered with the flow engine; the caller writes the frames
/// after the SUBACK.
pub fn retained_for_delivery(
    shared: &SharedState,
    client_id: &Arc<str>,
    subscribe: &Subscribe,
    return_codes: &[u8],
) -> Vec<Publish> {
    let mut out = Vec::new();

    for ((filter, granted), code) in subscribe.filters.iter().zip(return_codes) {
        if *code == SUBACK_FAILURE {
            continue;
        }
        // Collect before touching the flow engine: no two shared locks at once
        let matching = shared.retained.read().for_matching(filter);
        for msg in matching {
            let qos = msg.qos.min(*granted);
            let packet_id = (qos != QoS::AtMostOnce).then(|| shared.qos.next_packet_id());
            let publish = Publish {
                dup: false,
                qos,
                retain: true,
                topic: msg.topic,
                packet_id,
                payload: msg.payload,
            };
            if qos != QoS::AtMostOnce {
                shared.qos.track_outbound(client_id.clone(), &publish);
            }
            out.push(publish);
        }
    }

    out
}

/// Process an UNSUBSCRIBE: remove each filter, reply with UNSUBACK.
pub fn unsubscribe(shared: &SharedState, client_id: &str, unsubscribe: &Unsubscribe) -> Packet {
    for filter in &unsubscribe.filters {
        shared.subscriptions.write().unsubscribe(client_id, filter);
        info!(client_id, topic_filter = %filter, "unsubscribed");
    }
    Packet::Unsuback {
        packet_id: unsubscribe.packet_id,
    }
}
