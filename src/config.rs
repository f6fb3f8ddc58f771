/**
 * config.rs
 *
 * Environment-driven configuration for the helper daemon and the client side
 */

use std::env;
use std::time::Duration;

/// Loopback port the helper's RPC server listens on
pub const DEFAULT_RPC_PORT: u16 = 50051;

/// Public STUN server used for NAT discovery
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Grace period between a graceful stop request and a forced kill
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Configuration for the helper daemon (peerbridge-net)
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Port for the loopback RPC listener
    pub rpc_port: u16,

    /// STUN server address (host:port)
    pub stun_server: String,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let rpc_port = env::var("PEERBRIDGE_RPC_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RPC_PORT);

        let stun_server = env::var("PEERBRIDGE_STUN_SERVER")
            .unwrap_or_else(|_| DEFAULT_STUN_SERVER.to_string());

        Self { rpc_port, stun_server }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            rpc_port: DEFAULT_RPC_PORT,
            stun_server: DEFAULT_STUN_SERVER.to_string(),
        }
    }
}

/// Client-side connection policy towards the helper
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Port of the helper's loopback RPC endpoint
    pub rpc_port: u16,

    /// Number of connect attempts while the helper is coming up
    /// (the helper may still be waiting on an OS elevation prompt)
    pub connect_attempts: u32,

    /// Delay between connect attempts
    pub connect_backoff: Duration,

    /// Grace period before the supervisor force-kills the helper
    pub shutdown_grace: Duration,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let rpc_port = env::var("PEERBRIDGE_RPC_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RPC_PORT);

        Self {
            rpc_port,
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rpc_port: DEFAULT_RPC_PORT,
            connect_attempts: 10,
            connect_backoff: Duration::from_millis(500),
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}
