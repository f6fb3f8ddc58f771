/**
 * coordinator.rs
 *
 * Bridges lobby lifecycle events to the helper: reacts to lobby starts and
 * stops, turns signaling payloads into connection sessions, and reports the
 * outcome back to the signaling service.
 *
 * Nothing here panics on bad input from the service; every failure turns into
 * a peer-failed notification with a human-readable reason.
 */

use crate::context::NetworkingContext;
use crate::rpc::{ConnectionSession, PeerDescriptor, RpcError, StunResult};
use crate::signaling::{
    KeyMaterial, LobbyEvent, PeerConnectionInfo, PublishedStunInfo, SignalingGateway,
};
use anyhow::{anyhow, bail, Result};
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct PeerBootstrapCoordinator<G: SignalingGateway> {
    context: NetworkingContext,
    gateway: G,
    should_fail: AtomicBool,
}

/// Decode whatever key encoding the service sent into raw bytes.
///
/// Absent and empty keys are both legal (the service sends "" for this host's
/// own entry and for unreachable peers) and normalize to an empty vector.
pub fn normalize_key_material(key: Option<&KeyMaterial>) -> Result<Vec<u8>> {
    match key {
        None => Ok(Vec::new()),
        Some(KeyMaterial::Raw(bytes)) => Ok(bytes.clone()),
        Some(KeyMaterial::Hex(text)) => {
            if text.is_empty() {
                return Ok(Vec::new());
            }
            hex::decode(text).map_err(|e| anyhow!("Invalid hex key material: {}", e))
        }
    }
}

impl<G: SignalingGateway> PeerBootstrapCoordinator<G> {
    pub fn new(context: NetworkingContext, gateway: G) -> Self {
        Self {
            context,
            gateway,
            should_fail: AtomicBool::new(false),
        }
    }

    /// Testing hook: the next connect attempt reports a deterministic failure
    /// without touching the network
    pub fn set_should_fail(&self, value: bool) {
        self.should_fail.store(value, Ordering::SeqCst);
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    /// Bring up the helper and publish this host's reachable endpoint.
    ///
    /// STUN failure is soft: the session can still be joined (peers just
    /// cannot dial in), so only the helper being unreachable is fatal.
    pub async fn initialize(&mut self) -> Result<()> {
        self.context.initialize().await?;

        match self.context.rpc().get_stun_info().await {
            Ok(StunResult {
                public_ip,
                public_port,
                public_key,
                ..
            }) => {
                let published = PublishedStunInfo {
                    public_ip,
                    public_port,
                    public_key,
                };
                if let Err(e) = self.gateway.publish_stun_info(&published).await {
                    warn!("failed to publish STUN info: {}", e);
                }
            }
            Err(RpcError::Remote(msg)) => {
                // Soft failure: still publish so the service sees this host,
                // with empty/zero defaults marking it as not dialable
                warn!("STUN discovery failed, peers cannot dial in: {}", msg);
                let published = PublishedStunInfo {
                    public_ip: String::new(),
                    public_port: 0,
                    public_key: Vec::new(),
                };
                if let Err(e) = self.gateway.publish_stun_info(&published).await {
                    warn!("failed to publish STUN defaults: {}", e);
                }
            }
            Err(e) => {
                warn!("STUN request failed, skipping publish: {}", e);
            }
        }

        Ok(())
    }

    pub async fn handle_event(&self, event: &LobbyEvent) {
        match event {
            LobbyEvent::Starting { lobby_id } => self.handle_lobby_starting(lobby_id).await,
            LobbyEvent::Stopping { lobby_id } => self.handle_lobby_stopping(lobby_id).await,
        }
    }

    /// React to a lobby start: fetch the peer list, hand it to the helper,
    /// and report the outcome. Never returns an error; every failure path
    /// ends in a peer-failed notification instead.
    pub async fn handle_lobby_starting(&self, lobby_id: &str) {
        info!("lobby {} starting, bootstrapping peer connections", lobby_id);

        match self.bootstrap(lobby_id).await {
            Ok(()) => {
                info!("lobby {} connected", lobby_id);
                if let Err(e) = self.gateway.notify_peer_connected(lobby_id).await {
                    warn!("connected notification failed: {}", e);
                }
            }
            Err(e) => {
                error!("lobby {} bootstrap failed: {:#}", lobby_id, e);
                if let Err(notify_err) = self
                    .gateway
                    .notify_peer_failed(lobby_id, &format!("{:#}", e))
                    .await
                {
                    warn!("failure notification failed: {}", notify_err);
                }
            }
        }
    }

    async fn bootstrap(&self, lobby_id: &str) -> Result<()> {
        let info = self.gateway.fetch_peer_info(lobby_id).await?;
        let session = self.build_session(info)?;

        let outcome = match self.context.rpc().start_connection(&session).await {
            Ok(outcome) => outcome,
            Err(RpcError::SessionActive) => {
                bail!("A connection attempt is already in flight for this host")
            }
            Err(e) => return Err(e.into()),
        };

        if outcome.success {
            Ok(())
        } else {
            bail!("Helper reported connect failure: {}", outcome.error_message)
        }
    }

    /// Turn the service's peer-info payload into a session the helper accepts:
    /// validate this host's position and canonicalize every key to raw bytes.
    fn build_session(&self, info: PeerConnectionInfo) -> Result<ConnectionSession> {
        if info.self_index < 0 {
            bail!("Signaling service could not place this host in the lobby");
        }
        let self_index = info.self_index as usize;
        if self_index >= info.peers.len() {
            bail!(
                "self_index {} out of range for {} peers",
                self_index,
                info.peers.len()
            );
        }

        let mut peers = Vec::with_capacity(info.peers.len());
        for entry in &info.peers {
            let key = normalize_key_material(entry.public_key.as_ref())?;
            peers.push(PeerDescriptor::new(entry.stun_info.clone(), key));
        }

        let mut session = ConnectionSession::new(peers, self_index);
        session.should_fail = self.should_fail.load(Ordering::SeqCst);
        Ok(session)
    }

    /// React to a lobby stop: tear down the mesh, keep the helper alive for
    /// the next lobby. Failures are logged, not propagated.
    pub async fn handle_lobby_stopping(&self, lobby_id: &str) {
        info!("lobby {} stopping, tearing down peer connections", lobby_id);
        if let Err(e) = self.context.rpc().stop_connection().await {
            warn!("stop_connection failed: {}", e);
        }
    }

    /// Full teardown, helper process included
    pub async fn shutdown(&mut self) {
        self.context.cleanup().await;
    }
}
