/**
 * context.rs
 *
 * Owns the helper's full lifecycle on the client side: spawn, channel
 * establishment, and teardown in the right order.
 *
 * Teardown ordering matters: ask the helper to exit over RPC first so its
 * sockets get released cleanly, wait out a short grace period, then kill
 * whatever is left. Cleanup never fails; every step tolerates a helper that
 * already died on its own.
 */

use crate::config::ClientConfig;
use crate::rpc::RpcClient;
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};
use anyhow::{Context, Result};
use log::{info, warn};
use std::time::Duration;

pub struct NetworkingContext {
    supervisor: ProcessSupervisor,
    client: RpcClient,
    connect_attempts: u32,
    connect_backoff: Duration,
    shutdown_grace: Duration,
    started: bool,
}

impl NetworkingContext {
    pub fn new(supervisor_config: SupervisorConfig, client_config: ClientConfig) -> Self {
        Self {
            supervisor: ProcessSupervisor::new(supervisor_config),
            client: RpcClient::from_config(&client_config),
            connect_attempts: client_config.connect_attempts,
            connect_backoff: client_config.connect_backoff,
            shutdown_grace: client_config.shutdown_grace,
            started: false,
        }
    }

    pub fn from_env() -> Self {
        Self::new(SupervisorConfig::from_env(), ClientConfig::from_env())
    }

    /// Spawn the helper and wait for its RPC listener to come up.
    ///
    /// Safe to call again after a successful initialize; the running helper
    /// is reused.
    pub async fn initialize(&mut self) -> Result<()> {
        self.supervisor
            .start()
            .await
            .context("Failed to start helper process")?;

        self.client
            .connect_with_backoff(self.connect_attempts, self.connect_backoff)
            .await
            .context("Helper never became reachable")?;

        self.started = true;
        info!("networking context initialized");
        Ok(())
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.client
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Tear everything down. Idempotent: a second call, or a call after the
    /// helper crashed, is a cheap no-op.
    pub async fn cleanup(&mut self) {
        if !self.started && !self.supervisor.is_tracking() {
            return;
        }

        // Graceful exit first so the helper can release its sockets.
        // Failure here just means we skip straight to the kill.
        if self.client.is_connected().await {
            match self.client.stop_process(false).await {
                Ok(()) => {
                    tokio::time::sleep(self.shutdown_grace).await;
                }
                Err(e) => {
                    warn!("graceful stop request failed: {}", e);
                }
            }
        }

        self.client.close().await;
        self.supervisor.stop().await;
        self.started = false;
        info!("networking context cleaned up");
    }
}
