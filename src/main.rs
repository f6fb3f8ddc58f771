/**
 * main.rs
 *
 * peerbridge-net: the privileged networking helper daemon.
 *
 * Startup order matters: the UDP socket is bound and STUN-queried before the
 * RPC listener comes up, so the first get_stun_info already has an answer.
 * The socket then stays alive for the whole process lifetime to preserve the
 * NAT mapping STUN reported.
 */

use anyhow::{Context, Result};
use log::{error, info, warn};
use peerbridge::config::DaemonConfig;
use peerbridge::helper::mesh::MeshConfig;
use peerbridge::helper::stun::StunClient;
use peerbridge::helper::{server, HelperService, StunSnapshot};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let config = DaemonConfig::from_env();
    info!("peerbridge-net starting (rpc port {})", config.rpc_port);

    let stun_client =
        StunClient::new(config.stun_server.clone()).context("Failed to set up STUN client")?;

    let snapshot = match stun_client.query().await {
        Ok(response) => {
            info!(
                "STUN: external address {}:{}",
                response.external_ip, response.external_port
            );
            StunSnapshot {
                public_ip: response.external_ip.to_string(),
                public_port: response.external_port,
                error_message: String::new(),
            }
        }
        Err(e) => {
            // Soft failure: the daemon still serves RPC, clients see the error
            warn!("STUN discovery failed: {:#}", e);
            StunSnapshot {
                public_ip: String::new(),
                public_port: 0,
                error_message: format!("STUN discovery failed: {:#}", e),
            }
        }
    };

    let socket = stun_client.into_socket();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = Arc::new(HelperService::new(
        socket,
        snapshot,
        MeshConfig::default(),
        shutdown_tx,
    ));

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.rpc_port);
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind RPC listener on {}", bind_addr))?;

    tokio::select! {
        result = server::run(listener, service.clone(), shutdown_rx) => {
            if let Err(e) = result {
                error!("RPC server failed: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    service.teardown().await;
    info!("peerbridge-net exiting");
    Ok(())
}
