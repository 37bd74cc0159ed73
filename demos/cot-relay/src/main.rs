//! CoT relay.
//!
//! Listens on the mesh and on a direct TCP port, and forwards everything it
//! hears to a TAK server stream. Configured through `RELAY_*` variables; see
//! [`config::RelayConfig::from_env`].

mod config;
mod health;
mod relay;

use std::sync::Arc;

use commo_core::core::{CoTMessageListener, ContactPresenceListener, InterfaceStatusListener};
use commo_core::{CoTMessageType, CoTSendMethod, Commo, ContactUid};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::RelayConfig;
use crate::health::{HealthState, start_health_server};
use crate::relay::{Inbound, RelayListener, RelayStats, should_relay};

const ALL_TYPES: [CoTMessageType; 2] = [CoTMessageType::SituationalAwareness, CoTMessageType::Chat];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RelayConfig::from_env()?;
    info!(uid = %config.uid, callsign = %config.callsign, "starting CoT relay");

    let commo = Arc::new(Commo::new(ContactUid::from(config.uid.as_str()), &config.callsign)?);

    let stats = Arc::new(RelayStats::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = Arc::new(RelayListener::new(stats.clone(), tx));
    commo.add_cot_message_listener(listener.clone() as Arc<dyn CoTMessageListener>)?;
    commo.add_contact_presence_listener(listener.clone() as Arc<dyn ContactPresenceListener>)?;
    commo.add_interface_status_listener(listener as Arc<dyn InterfaceStatusListener>)?;

    if let Some(iface) = &config.mesh_iface {
        commo.add_inbound_interface(iface, config.mesh_port, &[config.mesh_group.as_str()], false)?;
        info!(iface = %iface, group = %config.mesh_group, port = config.mesh_port, "mesh enabled");
    }
    if config.tcp_port != 0 {
        commo.add_tcp_inbound_interface(config.tcp_port)?;
        info!(port = config.tcp_port, "direct TCP enabled");
    }
    let server_endpoint = match &config.server {
        Some((host, port)) => {
            let stream = commo.add_streaming_interface(host, *port, &ALL_TYPES, None, None)?;
            info!(endpoint = %stream.remote_endpoint_id, "relaying to server");
            Some(stream.remote_endpoint_id)
        }
        None => {
            warn!("RELAY_SERVER not set, only logging traffic");
            None
        }
    };

    let health = HealthState::new(&config.callsign, server_endpoint.clone(), stats.clone());
    let health_task = tokio::spawn(start_health_server(config.health_addr, health));
    let relay_task = tokio::spawn(relay_loop(commo.clone(), rx, stats, server_endpoint));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        res = health_task => match res {
            Ok(Err(e)) => error!(error = %e, "health server failed"),
            Err(e) => error!(error = %e, "health server panicked"),
            Ok(Ok(())) => {}
        },
    }
    relay_task.abort();
    drop(commo);
    Ok(())
}

async fn relay_loop(
    commo: Arc<Commo>,
    mut rx: mpsc::UnboundedReceiver<Inbound>,
    stats: Arc<RelayStats>,
    server_endpoint: Option<String>,
) {
    while let Some(msg) = rx.recv().await {
        if !should_relay(msg.endpoint.as_deref(), server_endpoint.as_deref()) {
            continue;
        }
        match commo.broadcast_cot(&msg.xml, CoTSendMethod::TakServer) {
            Ok(()) => stats.mark_relayed(),
            Err(e) => warn!(error = %e, "relay to server failed"),
        }
    }
}
