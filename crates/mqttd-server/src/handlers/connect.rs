//! CONNECT packet handling.
//!
//! Owns everything behind the CONNECT gate: mapping parse failures to
//! CONNACK return codes, authentication, client id assignment, and
//! clean-session resolution.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{info, warn};

use mqttd_core::error::ProtocolError;
use mqttd_core::packet::{Connack, ConnackCode, Connect, Packet};

use crate::auth::{AuthError, CredentialStore};
use crate::session::{Outbound, Session};
use crate::shared::SharedState;

/// Map a parse failure during the CONNECT gate to a CONNACK return code.
///
/// Unsupported protocol name/level → 0x01; client id problems → 0x02;
/// credential field problems → 0x04; everything else → 0x03.
pub fn rejection_code(err: &ProtocolError) -> ConnackCode {
    match err {
        ProtocolError::InvalidProtocolName(_) | ProtocolError::UnsupportedProtocolLevel(_) => {
            ConnackCode::UnacceptableProtocolVersion
        }
        ProtocolError::EmptyClientIdWithoutCleanSession
        | ProtocolError::ClientIdTooLong(_)
        | ProtocolError::ClientIdInvalidChars => ConnackCode::IdentifierRejected,
        ProtocolError::PasswordWithoutUsername
        | ProtocolError::MalformedUsername
        | ProtocolError::MalformedPassword => ConnackCode::BadUsernamePassword,
        _ => ConnackCode::ServerUnavailable,
    }
}

/// CONNACK return code for an authentication failure.
pub fn auth_rejection_code(err: &AuthError) -> ConnackCode {
    match err {
        AuthError::UserNotFound | AuthError::BadPassword => ConnackCode::BadUsernamePassword,
        AuthError::Store(_) | AuthError::Internal => ConnackCode::ServerUnavailable,
    }
}

/// Build a CONNACK packet.
pub fn connack(session_present: bool, code: ConnackCode) -> Packet {
    Packet::Connack(Connack {
        session_present,
        code,
    })
}

/// Broker-assigned identifier for connects with an empty client id.
/// Nanosecond timestamp plus the connection id keeps it collision-free.
pub fn generate_client_id(conn_id: u64) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("mqttd-{:016x}-{}", nanos, conn_id)
}

/// Verify credentials on the blocking pool; bcrypt and the SQLite lookup
/// both block.
pub async fn authenticate(
    store: Arc<CredentialStore>,
    username: String,
    password: Vec<u8>,
) -> Result<(), AuthError> {
    tokio::task::spawn_blocking(move || store.verify(&username, &password))
        .await
        .unwrap_or(Err(AuthError::Internal))
}

/// Outcome of storing a new session.
pub struct ConnectOutcome {
    pub session_present: bool,
    /// Outbound channel of a superseded live connection, to be shut down.
    pub previous: Option<mpsc::Sender<Outbound>>,
}

/// Resolve clean-session semantics and store the new session.
///
/// With clean session set, any prior state for this client id (session
/// record, subscriptions, pending QoS) is discarded and SessionPresent is
/// false. Without it, an existing record flags SessionPresent. Either way a
/// prior live connection for the same id is superseded.
pub fn establish_session(
    shared: &SharedState,
    connect: &Connect,
    client_id: Arc<str>,
    conn_id: u64,
    sender: mpsc::Sender<Outbound>,
) -> ConnectOutcome {
    let (previous, session_present);
    {
        let mut sessions = shared.sessions.write();
        let existing = sessions.get(&client_id);
        previous = existing.and_then(Session::sender);
        session_present = existing.is_some() && !connect.clean_session;
        sessions.put(Session::new(client_id.clone(), connect, conn_id, sender));
    }

    if connect.clean_session {
        shared.subscriptions.write().remove_client(&client_id);
        shared.qos.remove_client(&client_id);
    }

    if previous.is_some() {
        warn!(client_id = %client_id, "existing connection superseded by new CONNECT");
    }
    info!(
        client_id = %client_id,
        clean_session = connect.clean_session,
        session_present,
        keep_alive = connect.keep_alive,
        "session established"
    );

    ConnectOutcome {
        session_present,
        previous,
    }
}
