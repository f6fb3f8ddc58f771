/**
 * rpc/mod.rs
 *
 * Wire contract between the lobby client and the helper daemon:
 * - four request/response pairs, serialized as tagged JSON
 * - one message per line over a loopback TCP socket
 *
 * The channel carries no transport encryption; it never leaves the local host.
 */

pub mod client;

use serde::{Deserialize, Serialize};

pub use client::{RpcClient, RpcError};

/// One remote participant's connection material, as submitted to the helper.
///
/// `public_key` is always raw bytes on the wire. An absent key is an empty
/// vector, never a missing field, so the encoding stays deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// STUN-resolved "ip:port", or the gateway sentinels "self"/"unavailable"
    pub stun_info: String,
    pub public_key: Vec<u8>,
}

impl PeerDescriptor {
    pub fn new(stun_info: impl Into<String>, public_key: Vec<u8>) -> Self {
        Self {
            stun_info: stun_info.into(),
            public_key,
        }
    }
}

/// One attempt to form a mesh of direct connections for a lobby.
///
/// The peer list is ordered; `self_index` is this host's position in it and
/// must satisfy `self_index < peers.len()`. The list is immutable once
/// submitted to the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
    pub peers: Vec<PeerDescriptor>,
    pub self_index: usize,
    /// Testing flag: forces a simulated failure without touching the network
    pub should_fail: bool,
}

impl ConnectionSession {
    pub fn new(peers: Vec<PeerDescriptor>, self_index: usize) -> Self {
        Self {
            peers,
            self_index,
            should_fail: false,
        }
    }
}

/// Result of a STUN discovery, as reported by the helper.
///
/// A non-empty `error_message` signals a soft failure: the caller may proceed
/// with empty/zero defaults, but must surface the message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StunResult {
    pub public_ip: String,
    pub public_port: u16,
    pub public_key: Vec<u8>,
    pub error_message: String,
}

/// Aggregate outcome of a multi-peer connect attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub success: bool,
    pub error_message: String,
}

impl ConnectOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_message: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: message.into(),
        }
    }
}

/// Requests accepted by the helper's RPC server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcRequest {
    GetStunInfo,
    StartConnection {
        peers: Vec<PeerDescriptor>,
        self_index: usize,
        should_fail: bool,
    },
    StopConnection,
    StopProcess {
        force: bool,
    },
}

/// Responses produced by the helper's RPC server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcResponse {
    StunInfo {
        public_ip: String,
        public_port: u16,
        public_key: Vec<u8>,
        error_message: String,
    },
    ConnectResult {
        success: bool,
        error_message: String,
    },
    Ack {
        success: bool,
        message: String,
    },
}
