//! mqttd - an MQTT 3.1.1 broker.
//!
//! Reads `config.yml` from the working directory, verifies credentials
//! against `./store/store.db`, and serves MQTT over TCP until SIGINT or
//! SIGTERM. Exits 0 on clean shutdown, non-zero on configuration or bind
//! failure.

mod auth;
mod config;
mod connection;
mod handlers;
mod qos;
mod retained;
mod server;
mod session;
mod shared;
mod subscription;

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::auth::CredentialStore;
use crate::config::{Config, Env, DEFAULT_CONFIG_PATH};
use crate::server::Server;
use crate::shared::SharedState;

#[tokio::main]
async fn main() {
    let config = match Config::load(DEFAULT_CONFIG_PATH) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    init_logging(config.server.env);
    info!(
        name = %config.name,
        version = %config.version,
        env = ?config.server.env,
        port = config.server.port,
        "starting mqttd"
    );

    let credentials = match CredentialStore::open(auth::DEFAULT_STORE_PATH) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, path = auth::DEFAULT_STORE_PATH, "failed to open credential store");
            process::exit(1);
        }
    };

    let shared = Arc::new(SharedState::new());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let server = match Server::bind(addr, shared.clone(), credentials).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind listener");
            process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();

    tokio::spawn(qos::retry_loop(shared.clone(), shutdown.clone()));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    server.run(shutdown).await;
    info!("shutdown complete");
}

/// Log format follows the environment: JSON in production, human-readable
/// text in development. Level comes from RUST_LOG, defaulting to info.
fn init_logging(env: Env) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env.is_production() {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
