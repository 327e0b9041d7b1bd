//! kube-relay
//!
//! Exposes TCP ports on the overlay network and forwards every connection to
//! a Kubernetes service whose address is discovered from the API server.
//!
//! This service:
//! - Binds one listener per configured port on the overlay interface
//! - Resolves the backend service address and caches it
//! - Re-resolves once when dialing the cached address fails
//! - Pipes bytes between client and backend without inspecting them

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kube_relay::config::{Config, ConfigSource};
use kube_relay::{KubeControlPlane, ListenerState, ProxyService, TcpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize tracing (prefer RUST_LOG, fallback to RELAY_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting kube-relay");
    match &config.source {
        ConfigSource::File(path) => info!(file = %path.display(), "Using config file"),
        ConfigSource::CreatedDefault(path) => {
            info!(file = %path.display(), "Config file not found, created default config")
        }
        ConfigSource::Defaults { write_error } => {
            warn!(error = %write_error, "Config file not found, using defaults")
        }
    }
    info!(
        kube_api_url = %config.kube.api_url,
        backend = %config.proxy.backend,
        listen_addr = %config.listen_addr,
        listener_count = config.proxy.ports.len(),
        "Configuration loaded"
    );

    let control_plane =
        KubeControlPlane::new(&config.kube).context("Failed to create Kubernetes API client")?;
    let transport = TcpTransport::new(config.listen_addr);

    let service = Arc::new(
        ProxyService::new(config.proxy.clone(), transport, Arc::new(control_plane))
            .context("Invalid proxy configuration")?,
    );

    let handle = service.start();

    let states = handle.wait_settled().await;
    let accepting = states
        .iter()
        .filter(|(_, state)| *state == ListenerState::Accepting)
        .count();

    for (binding, state) in &states {
        if *state != ListenerState::Accepting {
            error!(
                local_port = %binding.local_port,
                remote_port = %binding.remote_port,
                state = ?state,
                "Listener not serving"
            );
        }
    }

    if accepting == 0 {
        bail!("No listener could be started");
    }

    info!(
        accepting,
        configured = states.len(),
        "Relay ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    handle.shutdown().await;

    info!("Relay shutdown complete");
    Ok(())
}
