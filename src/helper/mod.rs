/**
 * helper/mod.rs
 *
 * The helper daemon's service core: owns the UDP socket, the key pair, the
 * STUN snapshot and the single connection slot, and dispatches RPC requests.
 *
 * At most one session exists at a time. A second start while one is
 * connecting or active is refused; the caller must stop the first.
 */

pub mod mesh;
pub mod server;
pub mod stun;

use crate::rpc::{ConnectOutcome, ConnectionSession, RpcRequest, RpcResponse};
use log::{info, warn};
use mesh::{MeshConfig, MeshSession};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use x25519_dalek::{PublicKey, StaticSecret};

/// What STUN discovery produced at startup. A failure is recorded, not fatal;
/// clients see the error message and decide what to do with it.
#[derive(Debug, Clone, Default)]
pub struct StunSnapshot {
    pub public_ip: String,
    pub public_port: u16,
    pub error_message: String,
}

enum SessionSlot {
    Idle,
    /// Holds the cancel handle for the one in-flight connect attempt; a stop
    /// can only reach the attempt it observed, never a later one
    Connecting(watch::Sender<bool>),
    Active(MeshSession),
}

pub struct HelperService {
    secret: StaticSecret,
    public_key: PublicKey,
    stun: StunSnapshot,
    socket: Arc<UdpSocket>,
    slot: tokio::sync::Mutex<SessionSlot>,
    mesh_config: MeshConfig,
    shutdown: watch::Sender<bool>,
}

impl HelperService {
    pub fn new(
        socket: Arc<UdpSocket>,
        stun: StunSnapshot,
        mesh_config: MeshConfig,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public_key = PublicKey::from(&secret);

        Self {
            secret,
            public_key,
            stun,
            socket,
            slot: tokio::sync::Mutex::new(SessionSlot::Idle),
            mesh_config,
            shutdown,
        }
    }

    /// Dispatch one RPC request. Every request gets a response; errors travel
    /// inside the response types, never as a dropped connection.
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::GetStunInfo => self.get_stun_info(),
            RpcRequest::StartConnection {
                peers,
                self_index,
                should_fail,
            } => {
                let mut session = ConnectionSession::new(peers, self_index);
                session.should_fail = should_fail;
                let outcome = self.start_connection(session).await;
                RpcResponse::ConnectResult {
                    success: outcome.success,
                    error_message: outcome.error_message,
                }
            }
            RpcRequest::StopConnection => {
                self.stop_connection().await;
                RpcResponse::Ack {
                    success: true,
                    message: String::new(),
                }
            }
            RpcRequest::StopProcess { force } => self.stop_process(force),
        }
    }

    fn get_stun_info(&self) -> RpcResponse {
        RpcResponse::StunInfo {
            public_ip: self.stun.public_ip.clone(),
            public_port: self.stun.public_port,
            public_key: self.public_key.as_bytes().to_vec(),
            error_message: self.stun.error_message.clone(),
        }
    }

    /// Run a full connect attempt. Blocks until the mesh is up, the attempt
    /// fails, or a concurrent stop cancels it.
    async fn start_connection(&self, session: ConnectionSession) -> ConnectOutcome {
        // Deterministic failure for test flows, before any validation or
        // network traffic
        if session.should_fail {
            info!("failing connection on request (should_fail set)");
            return ConnectOutcome::failed(
                "Connection failed due to shouldFail flag being set.",
            );
        }

        if session.self_index >= session.peers.len() {
            return ConnectOutcome::failed(format!(
                "self_index {} out of range for {} peers",
                session.self_index,
                session.peers.len()
            ));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut slot = self.slot.lock().await;
            if !matches!(*slot, SessionSlot::Idle) {
                return ConnectOutcome::failed(
                    "A connection is already active; stop it first",
                );
            }
            *slot = SessionSlot::Connecting(cancel_tx);
        }

        let (mesh, outcome) = mesh::establish(
            self.socket.clone(),
            &self.secret,
            &session,
            &self.mesh_config,
            cancel_rx,
        )
        .await;

        let mut slot = self.slot.lock().await;
        match mesh {
            Some(mesh) => *slot = SessionSlot::Active(mesh),
            None => *slot = SessionSlot::Idle,
        }
        outcome
    }

    /// Tear down whatever session state exists. Safe to call at any time,
    /// any number of times.
    async fn stop_connection(&self) {
        let mut slot = self.slot.lock().await;
        match &*slot {
            SessionSlot::Active(_) => {
                if let SessionSlot::Active(mesh) =
                    std::mem::replace(&mut *slot, SessionSlot::Idle)
                {
                    mesh.stop().await;
                }
            }
            SessionSlot::Connecting(cancel) => {
                // The connect attempt resets the slot itself once it aborts;
                // repeated sends land on the same attempt and nothing else
                let _ = cancel.send(true);
                info!("cancelled in-flight connect attempt");
            }
            SessionSlot::Idle => {}
        }
    }

    fn stop_process(&self, force: bool) -> RpcResponse {
        if force {
            warn!("forced process stop requested");
            std::process::exit(0);
        }

        info!("graceful process stop requested");
        if self.shutdown.send(true).is_err() {
            warn!("shutdown receiver already gone");
        }
        RpcResponse::Ack {
            success: true,
            message: String::new(),
        }
    }

    /// Final teardown before the daemon exits
    pub async fn teardown(&self) {
        self.stop_connection().await;
    }
}
