//! Per-connection task.
//!
//! Each accepted socket gets one task that owns it end to end: it reads and
//! frames bytes, decodes packets, dispatches them, and performs every write.
//! Other components reach the socket only through the session's outbound
//! channel, so writes never race.
//!
//! States: AwaitConnect → Established → Closed. The first packet must be
//! CONNECT; any failure afterwards closes the connection (MQTT 3.1.1 has no
//! error packet once the CONNACK is out).

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mqttd_core::error::ProtocolError;
use mqttd_core::packet::{self, ConnackCode, Packet, Publish, QoS};

use crate::auth::CredentialStore;
use crate::handlers::{connect, disconnect, publish, qos as qos_handlers, subscribe};
use crate::session::{Outbound, OUTBOUND_CHANNEL_CAPACITY};
use crate::shared::SharedStateHandle;

#[derive(Debug, Error)]
pub(crate) enum ConnectionError {
    #[error("connection closed by peer")]
    Closed,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Buffered packet transport over one TCP stream.
pub(crate) struct Connection {
    stream: TcpStream,
    read: BytesMut,
    write: Vec<u8>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            read: BytesMut::with_capacity(4096),
            write: Vec::with_capacity(1024),
        }
    }

    /// Read one complete packet.
    ///
    /// Bytes accumulate in the read buffer across await points and a frame
    /// is only ever consumed whole, so this is safe to race in a select
    /// loop. The decoder bounds the Remaining Length field at 4 bytes; an
    /// oversized field surfaces as a protocol error and closes the
    /// connection.
    pub(crate) async fn read_packet(&mut self) -> Result<Packet, ConnectionError> {
        loop {
            match packet::decode_packet(&self.read) {
                Ok(Some((packet, consumed))) => {
                    self.read.advance(consumed);
                    return Ok(packet);
                }
                Ok(None) => {}
                Err(e) => return Err(e.into()),
            }

            if self.stream.read_buf(&mut self.read).await? == 0 {
                return Err(ConnectionError::Closed);
            }
        }
    }

    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> io::Result<()> {
        self.write.clear();
        packet::encode_packet(packet, &mut self.write);
        self.stream.write_all(&self.write).await
    }
}

/// Entry point for one accepted socket.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: SharedStateHandle,
    credentials: Arc<CredentialStore>,
    shutdown: CancellationToken,
    at_capacity: bool,
) {
    let mut conn = Connection::new(stream);

    // Operational gate: reject before reading any CONNECT
    if at_capacity || shutdown.is_cancelled() {
        debug!(%addr, "rejecting connection: server unavailable");
        let _ = conn
            .write_packet(&connect::connack(false, ConnackCode::ServerUnavailable))
            .await;
        return;
    }

    shared.connections.fetch_add(1, Ordering::Relaxed);
    debug!(%addr, "connection accepted");

    if let Err(e) = run(&mut conn, addr, &shared, &credentials, &shutdown).await {
        match e {
            ConnectionError::Closed => debug!(%addr, "connection closed by peer"),
            ConnectionError::Io(e) => debug!(%addr, error = %e, "connection I/O error"),
            ConnectionError::Protocol(e) => {
                warn!(%addr, error = %e, "protocol error, closing connection");
            }
        }
    }

    shared.connections.fetch_sub(1, Ordering::Relaxed);
    debug!(%addr, "connection closed");
}

async fn run(
    conn: &mut Connection,
    addr: SocketAddr,
    shared: &SharedStateHandle,
    credentials: &Arc<CredentialStore>,
    shutdown: &CancellationToken,
) -> Result<(), ConnectionError> {
    // ---- AwaitConnect ----
    let first = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        result = conn.read_packet() => result,
    };

    let connect_packet = match first {
        Ok(Packet::Connect(c)) => c,
        Ok(other) => {
            warn!(%addr, packet = other.name(), "expected CONNECT as first packet");
            let _ = conn
                .write_packet(&connect::connack(
                    false,
                    ConnackCode::UnacceptableProtocolVersion,
                ))
                .await;
            return Ok(());
        }
        Err(ConnectionError::Protocol(e)) => {
            // An oversized Remaining Length closes immediately; any other
            // parse failure during the gate maps to a CONNACK code first
            if !matches!(e, ProtocolError::InvalidRemainingLength) {
                let code = connect::rejection_code(&e);
                let _ = conn.write_packet(&connect::connack(false, code)).await;
            }
            return Err(e.into());
        }
        Err(e) => return Err(e),
    };

    // Authenticate when both credential fields are present
    if let (Some(username), Some(password)) = (&connect_packet.username, &connect_packet.password)
    {
        match connect::authenticate(credentials.clone(), username.clone(), password.clone()).await
        {
            Ok(()) => {
                info!(%addr, username = %username, outcome = "success", "authentication")
            }
            Err(e) => {
                warn!(%addr, username = %username, outcome = "failure", error = %e, "authentication");
                let _ = conn
                    .write_packet(&connect::connack(false, connect::auth_rejection_code(&e)))
                    .await;
                return Ok(());
            }
        }
    }

    let conn_id = shared.next_conn_id();
    let client_id: Arc<str> = if connect_packet.client_id.is_empty() {
        let assigned = connect::generate_client_id(conn_id);
        debug!(%addr, client_id = %assigned, "assigned client id");
        Arc::from(assigned)
    } else {
        Arc::from(connect_packet.client_id.as_str())
    };

    let (sender, mut receiver) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
    let outcome =
        connect::establish_session(shared, &connect_packet, client_id.clone(), conn_id, sender);
    if let Some(previous) = outcome.previous {
        let _ = previous.try_send(Outbound::Shutdown);
    }

    // ---- Established ----
    let result = match conn
        .write_packet(&connect::connack(
            outcome.session_present,
            ConnackCode::Accepted,
        ))
        .await
    {
        Ok(()) => {
            info!(client_id = %client_id, %addr, "client connected");
            established(conn, &mut receiver, shared, &client_id, shutdown).await
        }
        Err(e) => Err(e.into()),
    };

    // ---- Closed ----
    disconnect::handle_disconnect(shared, &client_id, conn_id, connect_packet.clean_session);

    result
}

enum Event {
    Inbound(Packet),
    Outbound(Option<Outbound>),
    Shutdown,
}

async fn established(
    conn: &mut Connection,
    receiver: &mut mpsc::Receiver<Outbound>,
    shared: &SharedStateHandle,
    client_id: &Arc<str>,
    shutdown: &CancellationToken,
) -> Result<(), ConnectionError> {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => Event::Shutdown,
            outbound = receiver.recv() => Event::Outbound(outbound),
            result = conn.read_packet() => Event::Inbound(result?),
        };

        match event {
            Event::Shutdown => return Ok(()),
            Event::Outbound(Some(Outbound::Packet(packet))) => {
                conn.write_packet(&packet).await?;
            }
            Event::Outbound(Some(Outbound::Shutdown)) | Event::Outbound(None) => {
                debug!(client_id = %client_id, "connection shut down by broker");
                return Ok(());
            }
            Event::Inbound(packet) => {
                if !dispatch(conn, shared, client_id, packet).await? {
                    return Ok(());
                }
            }
        }
    }
}

/// Handle one packet in the Established state. Returns `false` for a clean
/// close (DISCONNECT).
async fn dispatch(
    conn: &mut Connection,
    shared: &SharedStateHandle,
    client_id: &Arc<str>,
    packet: Packet,
) -> Result<bool, ConnectionError> {
    match packet {
        Packet::Connect(_) => {
            warn!(client_id = %client_id, "second CONNECT on established connection");
            Err(ProtocolError::MalformedPacket("duplicate CONNECT".into()).into())
        }

        Packet::Publish(publish) => {
            handle_publish(conn, shared, client_id, publish).await?;
            Ok(true)
        }

        Packet::Puback { packet_id } => {
            qos_handlers::handle_puback(shared, client_id, packet_id);
            Ok(true)
        }

        Packet::Pubrec { packet_id } => {
            if let Some(pubrel) = qos_handlers::handle_pubrec(shared, client_id, packet_id) {
                conn.write_packet(&pubrel).await?;
                debug!(client_id = %client_id, packet_id, step = "PUBREL_SENT", "qos flow");
            }
            Ok(true)
        }

        Packet::Pubrel { packet_id } => {
            let (released, pubcomp) = qos_handlers::handle_pubrel(shared, client_id, packet_id);
            if let Some(msg) = released {
                // Exactly-once delivery happens here, not at receipt
                publish::process_publish(
                    shared,
                    client_id,
                    &msg.topic,
                    &msg.payload,
                    QoS::ExactlyOnce,
                    msg.retain,
                );
            }
            conn.write_packet(&pubcomp).await?;
            debug!(client_id = %client_id, packet_id, step = "PUBCOMP_SENT", "qos flow");
            Ok(true)
        }

        Packet::Pubcomp { packet_id } => {
            qos_handlers::handle_pubcomp(shared, client_id, packet_id);
            Ok(true)
        }

        Packet::Subscribe(request) => {
            let suback = subscribe::subscribe(shared, client_id, &request);
            let retained =
                subscribe::retained_for_delivery(shared, client_id, &request, &suback.return_codes);
            // The SUBACK is the first outbound packet after a subscribe;
            // retained messages follow it
            conn.write_packet(&Packet::Suback(suback)).await?;
            for publish in retained {
                debug!(
                    client_id = %client_id,
                    topic = %publish.topic,
                    "delivering retained message"
                );
                conn.write_packet(&Packet::Publish(publish)).await?;
            }
            Ok(true)
        }

        Packet::Unsubscribe(request) => {
            let unsuback = subscribe::unsubscribe(shared, client_id, &request);
            conn.write_packet(&unsuback).await?;
            Ok(true)
        }

        Packet::Pingreq => {
            conn.write_packet(&Packet::Pingresp).await?;
            Ok(true)
        }

        Packet::Disconnect => {
            info!(client_id = %client_id, "DISCONNECT received");
            Ok(false)
        }

        Packet::Connack(_) | Packet::Suback(_) | Packet::Unsuback { .. } | Packet::Pingresp => {
            warn!(
                client_id = %client_id,
                packet = packet.name(),
                "unexpected packet from client, ignoring"
            );
            Ok(true)
        }
    }
}

async fn handle_publish(
    conn: &mut Connection,
    shared: &SharedStateHandle,
    client_id: &Arc<str>,
    publish: Publish,
) -> Result<(), ConnectionError> {
    match publish.qos {
        QoS::AtMostOnce => {
            publish::process_publish(
                shared,
                client_id,
                &publish.topic,
                &publish.payload,
                publish.qos,
                publish.retain,
            );
        }

        QoS::AtLeastOnce => {
            let Some(packet_id) = publish.packet_id else {
                return Err(ProtocolError::ZeroPacketId.into());
            };
            publish::process_publish(
                shared,
                client_id,
                &publish.topic,
                &publish.payload,
                publish.qos,
                publish.retain,
            );
            conn.write_packet(&Packet::Puback { packet_id }).await?;
            debug!(client_id = %client_id, packet_id, step = "PUBACK_SENT", "qos flow");
        }

        QoS::ExactlyOnce => {
            let Some(packet_id) = publish.packet_id else {
                return Err(ProtocolError::ZeroPacketId.into());
            };
            let fresh = shared.qos.register_inbound(
                client_id.clone(),
                packet_id,
                &publish.topic,
                publish.payload.clone(),
                publish.retain,
            );
            if fresh {
                debug!(
                    client_id = %client_id,
                    packet_id,
                    topic = %publish.topic,
                    "QoS 2 publish held until PUBREL"
                );
            } else {
                debug!(
                    client_id = %client_id,
                    packet_id,
                    "duplicate QoS 2 publish, re-sending PUBREC"
                );
            }
            conn.write_packet(&Packet::Pubrec { packet_id }).await?;
            debug!(client_id = %client_id, packet_id, step = "PUBREC_SENT", "qos flow");
        }
    }
    Ok(())
}
