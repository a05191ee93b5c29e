//! QoS acknowledgment handling: PUBACK, PUBREC, PUBREL, PUBCOMP.
//!
//! Thin dispatch over the flow engine; the connection task writes whatever
//! reply packet comes back.

use tracing::debug;

use mqttd_core::packet::Packet;

use crate::qos::ReceivedPublish;
use crate::shared::SharedState;

/// PUBACK from a subscriber completes a QoS 1 delivery.
pub fn handle_puback(shared: &SharedState, client_id: &str, packet_id: u16) {
    if shared.qos.handle_puback(client_id, packet_id) {
        debug!(client_id, packet_id, step = "PUBACK_RECEIVED", "qos flow");
    } else {
        debug!(client_id, packet_id, "PUBACK for unknown packet id, ignoring");
    }
}

/// PUBREC from a subscriber advances an outbound QoS 2 delivery; the reply
/// is the PUBREL to write.
pub fn handle_pubrec(shared: &SharedState, client_id: &str, packet_id: u16) -> Option<Packet> {
    if shared.qos.handle_pubrec(client_id, packet_id) {
        debug!(client_id, packet_id, step = "PUBREC_RECEIVED", "qos flow");
        Some(Packet::Pubrel { packet_id })
    } else {
        debug!(client_id, packet_id, "PUBREC for unknown packet id, ignoring");
        None
    }
}

/// PUBREL from a publisher releases a held inbound QoS 2 message. PUBCOMP
/// is returned regardless; the released message, if any, goes through the
/// publish path exactly once.
pub fn handle_pubrel(
    shared: &SharedState,
    client_id: &str,
    packet_id: u16,
) -> (Option<ReceivedPublish>, Packet) {
    let released = shared.qos.release_inbound(client_id, packet_id);
    if released.is_some() {
        debug!(client_id, packet_id, step = "PUBREL_RECEIVED", "qos flow");
    } else {
        debug!(client_id, packet_id, "PUBREL for unknown packet id");
    }
    (released, Packet::Pubcomp { packet_id })
}

/// PUBCOMP from a subscriber completes an outbound QoS 2 delivery.
pub fn handle_pubcomp(shared: &SharedState, client_id: &str, packet_id: u16) {
    if shared.qos.handle_pubcomp(client_id, packet_id) {
        debug!(client_id, packet_id, step = "PUBCOMP_RECEIVED", "qos flow");
    } else {
        debug!(client_id, packet_id, "PUBCOMP for unknown packet id, ignoring");
    }
}
