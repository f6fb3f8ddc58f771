/**
 * signaling/mod.rs
 *
 * Gateway to the lobby's signaling service: peer info retrieval, STUN info
 * publication, and connect/fail notifications.
 *
 * The gateway trait is the seam between bootstrap logic and transport; the
 * production implementation speaks WebSocket (ws.rs), tests plug in mocks.
 */

pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use ws::WsSignalingGateway;

/// Signaling errors
#[derive(Debug)]
pub enum SignalingError {
    /// The transport failed (connect, send, receive)
    Transport(String),
    /// The service answered with an error of its own
    Rejected(String),
    /// The service sent something we could not make sense of
    Malformed(String),
}

impl std::fmt::Display for SignalingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalingError::Transport(e) => write!(f, "Signaling transport error: {}", e),
            SignalingError::Rejected(e) => write!(f, "Signaling service rejected request: {}", e),
            SignalingError::Malformed(e) => write!(f, "Malformed signaling payload: {}", e),
        }
    }
}

impl std::error::Error for SignalingError {}

/// Key material as it appears on the signaling wire.
///
/// Older backends publish hex strings, newer ones raw byte arrays; both are
/// accepted and normalized to raw bytes before anything touches the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyMaterial {
    Raw(Vec<u8>),
    Hex(String),
}

/// One peer's entry in the service's peer-info payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfoEntry {
    /// "ip:port", or the sentinels "self" / "unavailable"
    pub stun_info: String,
    #[serde(default)]
    pub public_key: Option<KeyMaterial>,
}

/// The service's answer to a peer-info request.
///
/// `self_index` is signed because the service reports -1 when it cannot place
/// this host in the list; validation happens in the coordinator, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConnectionInfo {
    pub peers: Vec<PeerInfoEntry>,
    pub self_index: i32,
}

/// Lobby lifecycle events the coordinator reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyEvent {
    Starting { lobby_id: String },
    Stopping { lobby_id: String },
}

/// This host's STUN-resolved endpoint, as published to the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedStunInfo {
    pub public_ip: String,
    pub public_port: u16,
    pub public_key: Vec<u8>,
}

#[async_trait]
pub trait SignalingGateway: Send + Sync {
    /// Fetch the ordered peer list for a lobby
    async fn fetch_peer_info(&self, lobby_id: &str) -> Result<PeerConnectionInfo, SignalingError>;

    /// Publish this host's reachable endpoint ahead of a lobby start
    async fn publish_stun_info(&self, info: &PublishedStunInfo) -> Result<(), SignalingError>;

    /// Report that the mesh came up
    async fn notify_peer_connected(&self, lobby_id: &str) -> Result<(), SignalingError>;

    /// Report that the connect attempt failed, with a reason the lobby UI can show
    async fn notify_peer_failed(&self, lobby_id: &str, message: &str)
        -> Result<(), SignalingError>;
}
