//! TCP listener: accept loop, connection cap, graceful drain.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::CredentialStore;
use crate::connection;
use crate::shared::SharedStateHandle;

/// Cap on simultaneously connected clients. Connections beyond it receive
/// CONNACK 0x03 and are closed before any CONNECT is read.
pub const MAX_CONNECTIONS: usize = 1000;

/// How long shutdown waits for connection tasks to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The broker's TCP listener.
pub struct Server {
    listener: TcpListener,
    shared: SharedStateHandle,
    credentials: Arc<CredentialStore>,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        shared: SharedStateHandle,
        credentials: Arc<CredentialStore>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "mqttd listening");
        Ok(Self {
            listener,
            shared,
            credentials,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop. Each connection gets its own task owning the socket.
    /// Returns once the shutdown token fires and connection tasks have
    /// drained.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let at_capacity =
                        self.shared.connections.load(Ordering::Relaxed) >= MAX_CONNECTIONS;
                    tokio::spawn(connection::handle_connection(
                        stream,
                        addr,
                        self.shared.clone(),
                        self.credentials.clone(),
                        shutdown.clone(),
                        at_capacity,
                    ));
                }
                // Transient accept errors do not stop the listener
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }

        info!("listener stopped, draining connections");
        self.drain().await;
    }

    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        loop {
            let remaining = self.shared.connections.load(Ordering::Relaxed);
            if remaining == 0 {
                info!("all connections drained");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "drain timeout, abandoning connections");
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
