//! Connection teardown.

use tracing::info;

use crate::shared::SharedState;

/// Run when a connection closes, gracefully or not.
///
/// Ownership-guarded by the connection id: if another CONNECT for the same
/// client id has superseded this connection, its state now belongs to the
/// new connection and must be left alone.
///
/// Subscriptions and pending QoS state are always discarded for the
/// departing client; the session record itself survives only for
/// clean-session=false clients (with its connection handle released), so a
/// later CONNECT sees SessionPresent.
pub fn handle_disconnect(
    shared: &SharedState,
    client_id: &str,
    conn_id: u64,
    clean_session: bool,
) {
    if !shared.sessions.read().owns(client_id, conn_id) {
        return;
    }

    shared.subscriptions.write().remove_client(client_id);
    shared.qos.remove_client(client_id);

    if clean_session {
        shared.sessions.write().delete(client_id);
    } else {
        shared.sessions.write().release_connection(client_id, conn_id);
    }

    info!(client_id, clean_session, "client disconnected");
}
