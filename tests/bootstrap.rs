/**
 * tests/bootstrap.rs
 *
 * End-to-end exercises of the RPC contract: a real HelperService behind a
 * real loopback listener, driven by the real client. No helper process is
 * spawned; the service runs in-process on an ephemeral port.
 */

use async_trait::async_trait;
use peerbridge::helper::mesh::MeshConfig;
use peerbridge::helper::{server, HelperService, StunSnapshot};
use peerbridge::rpc::{ConnectionSession, PeerDescriptor, RpcClient, RpcError};
use peerbridge::signaling::{
    KeyMaterial, PeerConnectionInfo, PeerInfoEntry, PublishedStunInfo, SignalingError,
    SignalingGateway,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{watch, Mutex};

async fn spawn_helper(stun: StunSnapshot, mesh_config: MeshConfig) -> (u16, Arc<HelperService>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind udp");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = Arc::new(HelperService::new(
        Arc::new(socket),
        stun,
        mesh_config,
        shutdown_tx,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind tcp");
    let port = listener.local_addr().expect("local addr").port();

    let server_service = service.clone();
    tokio::spawn(async move {
        let _ = server::run(listener, server_service, shutdown_rx).await;
    });

    (port, service)
}

fn solo_session() -> ConnectionSession {
    ConnectionSession::new(vec![PeerDescriptor::new("self", Vec::new())], 0)
}

#[tokio::test]
async fn stun_info_travels_over_the_rpc_channel() {
    let (port, _service) = spawn_helper(
        StunSnapshot {
            public_ip: "203.0.113.7".to_string(),
            public_port: 40000,
            error_message: String::new(),
        },
        MeshConfig::default(),
    )
    .await;

    let client = RpcClient::new(port);
    let info = client.get_stun_info().await.expect("stun info");
    assert_eq!(info.public_ip, "203.0.113.7");
    assert_eq!(info.public_port, 40000);
    assert_eq!(info.public_key.len(), 32);
}

#[tokio::test]
async fn stun_failure_surfaces_as_a_remote_error() {
    let (port, _service) = spawn_helper(
        StunSnapshot {
            public_ip: String::new(),
            public_port: 0,
            error_message: "STUN discovery failed: timed out".to_string(),
        },
        MeshConfig::default(),
    )
    .await;

    let client = RpcClient::new(port);
    match client.get_stun_info().await {
        Err(RpcError::Remote(msg)) => assert!(msg.contains("timed out")),
        other => panic!("expected remote error, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn should_fail_is_deterministic_over_rpc() {
    let (port, _service) = spawn_helper(StunSnapshot::default(), MeshConfig::default()).await;
    let client = RpcClient::new(port);

    let mut session = solo_session();
    session.should_fail = true;

    let outcome = client.start_connection(&session).await.expect("call");
    assert!(!outcome.success);
    assert!(outcome.error_message.contains("shouldFail"));

    // Identical session without the flag succeeds
    session.should_fail = false;
    let outcome = client.start_connection(&session).await.expect("call");
    assert!(outcome.success, "{}", outcome.error_message);
    client.stop_connection().await.expect("stop");
}

#[tokio::test]
async fn sessions_cycle_through_start_stop_start() {
    let (port, _service) = spawn_helper(StunSnapshot::default(), MeshConfig::default()).await;
    let client = RpcClient::new(port);

    let outcome = client.start_connection(&solo_session()).await.expect("call");
    assert!(outcome.success, "{}", outcome.error_message);

    // Second start on a live session is refused by the helper
    let refused = client.start_connection(&solo_session()).await.expect("call");
    assert!(!refused.success);
    assert!(refused.error_message.contains("already active"));

    client.stop_connection().await.expect("stop");

    let outcome = client.start_connection(&solo_session()).await.expect("call");
    assert!(outcome.success, "{}", outcome.error_message);
    client.stop_connection().await.expect("stop");
}

#[tokio::test]
async fn unreachable_peer_fails_within_the_punch_deadline() {
    let (port, _service) = spawn_helper(
        StunSnapshot::default(),
        MeshConfig {
            punch_timeout: Duration::from_millis(300),
            probe_interval: Duration::from_millis(50),
            ..MeshConfig::default()
        },
    )
    .await;

    // A socket that never answers stands in for an unreachable peer
    let silent = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
    let silent_addr = silent.local_addr().expect("addr");

    let client = RpcClient::new(port);
    let session = ConnectionSession::new(
        vec![
            PeerDescriptor::new("self", Vec::new()),
            PeerDescriptor::new(silent_addr.to_string(), Vec::new()),
        ],
        0,
    );

    let outcome = client.start_connection(&session).await.expect("call");
    assert!(!outcome.success);
    assert!(outcome.error_message.contains("no response"));
}

#[tokio::test]
async fn unavailable_peers_fail_without_network_traffic() {
    let (port, _service) = spawn_helper(StunSnapshot::default(), MeshConfig::default()).await;
    let client = RpcClient::new(port);

    let session = ConnectionSession::new(
        vec![
            PeerDescriptor::new("self", Vec::new()),
            PeerDescriptor::new("unavailable", Vec::new()),
        ],
        0,
    );

    let outcome = client.start_connection(&session).await.expect("call");
    assert!(!outcome.success);
    assert!(outcome.error_message.contains("no reachable address"));
}

#[tokio::test]
async fn dead_helper_fails_fast_with_unavailable() {
    // Nothing listens on this port; the channel must not hang
    let client = RpcClient::new(1);
    match client.get_stun_info().await {
        Err(RpcError::Unavailable(_)) => {}
        other => panic!("expected unavailable, got {:?}", other.map(|_| ())),
    }
}

#[derive(Default)]
struct RecordingGateway {
    info: Option<PeerConnectionInfo>,
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl SignalingGateway for RecordingGateway {
    async fn fetch_peer_info(&self, _lobby_id: &str) -> Result<PeerConnectionInfo, SignalingError> {
        self.info
            .clone()
            .ok_or_else(|| SignalingError::Rejected("no lobby".to_string()))
    }

    async fn publish_stun_info(&self, info: &PublishedStunInfo) -> Result<(), SignalingError> {
        self.events
            .lock()
            .await
            .push(format!("publish {}:{}", info.public_ip, info.public_port));
        Ok(())
    }

    async fn notify_peer_connected(&self, lobby_id: &str) -> Result<(), SignalingError> {
        self.events.lock().await.push(format!("connected {}", lobby_id));
        Ok(())
    }

    async fn notify_peer_failed(
        &self,
        lobby_id: &str,
        message: &str,
    ) -> Result<(), SignalingError> {
        self.events
            .lock()
            .await
            .push(format!("failed {}: {}", lobby_id, message));
        Ok(())
    }
}

mod coordinator_flow {
    use super::*;
    use peerbridge::config::ClientConfig;
    use peerbridge::supervisor::{LaunchMode, SupervisorConfig};
    use peerbridge::{NetworkingContext, PeerBootstrapCoordinator};
    use std::path::PathBuf;

    fn context_for(port: u16) -> NetworkingContext {
        // /bin/true stands in for the helper binary; the RPC endpoint the
        // client actually reaches is the in-process service
        NetworkingContext::new(
            SupervisorConfig {
                executable: PathBuf::from("/bin/true"),
                launch_mode: LaunchMode::Direct,
            },
            ClientConfig {
                rpc_port: port,
                connect_attempts: 3,
                connect_backoff: Duration::from_millis(50),
                shutdown_grace: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn lobby_start_ends_in_a_connected_notification() {
        let (port, _service) =
            spawn_helper(StunSnapshot::default(), MeshConfig::default()).await;

        let gateway = RecordingGateway {
            info: Some(PeerConnectionInfo {
                peers: vec![PeerInfoEntry {
                    stun_info: "self".to_string(),
                    public_key: Some(KeyMaterial::Hex(String::new())),
                }],
                self_index: 0,
            }),
            events: Mutex::new(Vec::new()),
        };

        let mut context = context_for(port);
        context.initialize().await.expect("initialize");
        let mut coordinator = PeerBootstrapCoordinator::new(context, gateway);

        coordinator.handle_lobby_starting("lobby-1").await;

        let events = coordinator.gateway().events.lock().await.clone();
        assert_eq!(events, vec!["connected lobby-1".to_string()]);

        coordinator.handle_lobby_stopping("lobby-1").await;
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn stun_failure_still_publishes_empty_defaults() {
        let (port, _service) = spawn_helper(
            StunSnapshot {
                public_ip: String::new(),
                public_port: 0,
                error_message: "STUN discovery failed: timed out".to_string(),
            },
            MeshConfig::default(),
        )
        .await;

        let gateway = RecordingGateway {
            info: None,
            events: Mutex::new(Vec::new()),
        };

        let mut coordinator =
            PeerBootstrapCoordinator::new(context_for(port), gateway);
        coordinator.initialize().await.expect("initialize");

        // Login proceeds with a published entry carrying empty/zero defaults
        let events = coordinator.gateway().events.lock().await.clone();
        assert_eq!(events, vec!["publish :0".to_string()]);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn successful_stun_publishes_the_real_endpoint() {
        let (port, _service) = spawn_helper(
            StunSnapshot {
                public_ip: "203.0.113.7".to_string(),
                public_port: 40000,
                error_message: String::new(),
            },
            MeshConfig::default(),
        )
        .await;

        let gateway = RecordingGateway {
            info: None,
            events: Mutex::new(Vec::new()),
        };

        let mut coordinator =
            PeerBootstrapCoordinator::new(context_for(port), gateway);
        coordinator.initialize().await.expect("initialize");

        let events = coordinator.gateway().events.lock().await.clone();
        assert_eq!(events, vec!["publish 203.0.113.7:40000".to_string()]);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn unplaceable_host_ends_in_a_failed_notification() {
        let (port, _service) =
            spawn_helper(StunSnapshot::default(), MeshConfig::default()).await;

        let gateway = RecordingGateway {
            info: Some(PeerConnectionInfo {
                peers: vec![],
                self_index: -1,
            }),
            events: Mutex::new(Vec::new()),
        };

        let mut context = context_for(port);
        context.initialize().await.expect("initialize");
        let mut coordinator = PeerBootstrapCoordinator::new(context, gateway);

        coordinator.handle_lobby_starting("lobby-2").await;

        let events = coordinator.gateway().events.lock().await.clone();
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("failed lobby-2"));
        assert!(events[0].contains("could not place"));

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn should_fail_flag_flows_through_the_coordinator() {
        let (port, _service) =
            spawn_helper(StunSnapshot::default(), MeshConfig::default()).await;

        let gateway = RecordingGateway {
            info: Some(PeerConnectionInfo {
                peers: vec![PeerInfoEntry {
                    stun_info: "self".to_string(),
                    public_key: None,
                }],
                self_index: 0,
            }),
            events: Mutex::new(Vec::new()),
        };

        let mut context = context_for(port);
        context.initialize().await.expect("initialize");
        let mut coordinator = PeerBootstrapCoordinator::new(context, gateway);
        coordinator.set_should_fail(true);

        coordinator.handle_lobby_starting("lobby-3").await;

        let events = coordinator.gateway().events.lock().await.clone();
        assert_eq!(events.len(), 1);
        assert!(events[0].contains("shouldFail"));

        coordinator.shutdown().await;
    }
}
