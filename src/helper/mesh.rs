/**
 * helper/mesh.rs
 *
 * UDP hole punching and mesh maintenance with authenticated probe packets.
 *
 * All traffic runs over the socket the STUN query used, so the NAT mapping
 * the peers were told about stays valid. Probes carry a keyed MAC derived
 * from a Diffie-Hellman exchange with each peer; peers without published key
 * material fall back to an unkeyed digest.
 */

use crate::rpc::{ConnectOutcome, ConnectionSession};
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::future;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use x25519_dalek::{PublicKey, StaticSecret};

/// Probe packet magic marker
const PROBE_MAGIC: &[u8; 4] = b"PBRG";

/// Domain separator for the probe MAC
const PROBE_CONTEXT: &[u8] = b"PEERBRIDGE_PROBE_V1";

/// Wire size: magic(4) + kind(1) + sender(2) + nonce(8) + mac(32)
const PROBE_LEN: usize = 47;

const DISCONNECT_REPEATS: u32 = 3;
const DISCONNECT_SPACING: Duration = Duration::from_millis(50);

/// Mesh timing knobs, injectable for tests
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Overall deadline for establishing every link
    pub punch_timeout: Duration,
    /// Spacing between punch probe bursts
    pub probe_interval: Duration,
    /// Spacing between keep-alive probes on an established mesh
    pub keepalive_interval: Duration,
    /// A peer silent for this long is considered gone
    pub peer_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            punch_timeout: Duration::from_secs(10),
            probe_interval: Duration::from_millis(200),
            keepalive_interval: Duration::from_secs(4),
            peer_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Punch,
    KeepAlive,
    Disconnect,
}

impl ProbeKind {
    fn to_byte(self) -> u8 {
        match self {
            ProbeKind::Punch => 1,
            ProbeKind::KeepAlive => 2,
            ProbeKind::Disconnect => 3,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            1 => Ok(ProbeKind::Punch),
            2 => Ok(ProbeKind::KeepAlive),
            3 => Ok(ProbeKind::Disconnect),
            other => Err(anyhow!("Unknown probe kind: {}", other)),
        }
    }
}

/// Authenticated UDP probe packet
#[derive(Debug, Clone)]
pub struct ProbePacket {
    pub kind: ProbeKind,
    pub sender_index: u16,
    pub nonce: u64,
    mac: [u8; 32],
}

impl ProbePacket {
    /// Create and authenticate a new probe
    pub fn new(kind: ProbeKind, sender_index: u16, shared_key: Option<&[u8; 32]>) -> Self {
        let nonce = rand::random::<u64>();
        let mac = Self::compute_mac(kind, sender_index, nonce, shared_key);
        Self {
            kind,
            sender_index,
            nonce,
            mac,
        }
    }

    /// Verify the probe against the key agreed with its claimed sender
    pub fn verify(&self, shared_key: Option<&[u8; 32]>) -> Result<()> {
        let expected = Self::compute_mac(self.kind, self.sender_index, self.nonce, shared_key);
        if self.mac == expected {
            Ok(())
        } else {
            Err(anyhow!("Probe MAC mismatch"))
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PROBE_LEN);
        bytes.extend_from_slice(PROBE_MAGIC);
        bytes.push(self.kind.to_byte());
        bytes.extend_from_slice(&self.sender_index.to_be_bytes());
        bytes.extend_from_slice(&self.nonce.to_be_bytes());
        bytes.extend_from_slice(&self.mac);
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != PROBE_LEN {
            return Err(anyhow!("Invalid probe packet length: {}", data.len()));
        }

        if &data[0..4] != PROBE_MAGIC {
            return Err(anyhow!("Invalid probe packet magic"));
        }

        let kind = ProbeKind::from_byte(data[4])?;
        let sender_index = u16::from_be_bytes([data[5], data[6]]);
        let nonce = u64::from_be_bytes(
            data[7..15]
                .try_into()
                .map_err(|_| anyhow!("Invalid nonce"))?,
        );
        let mut mac = [0u8; 32];
        mac.copy_from_slice(&data[15..47]);

        Ok(Self {
            kind,
            sender_index,
            nonce,
            mac,
        })
    }

    fn compute_mac(
        kind: ProbeKind,
        sender_index: u16,
        nonce: u64,
        shared_key: Option<&[u8; 32]>,
    ) -> [u8; 32] {
        let mut message = Vec::new();
        message.extend_from_slice(PROBE_CONTEXT);
        message.push(kind.to_byte());
        message.extend_from_slice(&sender_index.to_be_bytes());
        message.extend_from_slice(&nonce.to_be_bytes());

        match shared_key {
            Some(key) => *blake3::keyed_hash(key, &message).as_bytes(),
            None => *blake3::hash(&message).as_bytes(),
        }
    }
}

/// Agree on a per-peer probe key. Peers without 32-byte key material get no
/// shared key and their probes fall back to the unkeyed digest.
pub fn derive_shared_key(secret: &StaticSecret, peer_public_key: &[u8]) -> Option<[u8; 32]> {
    let bytes: [u8; 32] = peer_public_key.try_into().ok()?;
    let peer_public = PublicKey::from(bytes);
    Some(secret.diffie_hellman(&peer_public).to_bytes())
}

struct PeerLink {
    index: u16,
    shared_key: Option<[u8; 32]>,
    established: bool,
    last_seen: Instant,
}

/// An established mesh with its maintenance tasks
pub struct MeshSession {
    socket: Arc<UdpSocket>,
    links: Arc<tokio::sync::Mutex<HashMap<SocketAddr, PeerLink>>>,
    self_index: u16,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshSession {
    pub async fn peer_count(&self) -> usize {
        self.links.lock().await.len()
    }

    /// Tear the mesh down: notify peers a few times (UDP, no delivery
    /// guarantee) and stop the maintenance tasks.
    pub async fn stop(mut self) {
        let targets: Vec<(SocketAddr, Option<[u8; 32]>)> = self
            .links
            .lock()
            .await
            .iter()
            .map(|(addr, link)| (*addr, link.shared_key))
            .collect();

        for _ in 0..DISCONNECT_REPEATS {
            for (addr, key) in &targets {
                let probe =
                    ProbePacket::new(ProbeKind::Disconnect, self.self_index, key.as_ref());
                let _ = self.socket.send_to(&probe.to_bytes(), addr).await;
            }
            tokio::time::sleep(DISCONNECT_SPACING).await;
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("mesh session stopped ({} peers notified)", targets.len());
    }
}

/// Punch through to every peer in the session and keep the links alive.
///
/// Returns the session (on success) plus an aggregate outcome naming every
/// peer that could not be reached. Cancellation via `cancel` aborts the
/// attempt and reports failure.
///
/// `cancel` belongs to this attempt alone; a stop issued against an earlier
/// attempt cannot leak into this one.
pub async fn establish(
    socket: Arc<UdpSocket>,
    secret: &StaticSecret,
    session: &ConnectionSession,
    config: &MeshConfig,
    mut cancel: watch::Receiver<bool>,
) -> (Option<MeshSession>, ConnectOutcome) {
    let self_index = session.self_index as u16;
    let mut links: HashMap<SocketAddr, PeerLink> = HashMap::new();
    let mut failures: Vec<String> = Vec::new();

    for (i, peer) in session.peers.iter().enumerate() {
        if i == session.self_index {
            continue;
        }
        match peer.stun_info.parse::<SocketAddr>() {
            Ok(addr) => {
                links.insert(
                    addr,
                    PeerLink {
                        index: i as u16,
                        shared_key: derive_shared_key(secret, &peer.public_key),
                        established: false,
                        last_seen: Instant::now(),
                    },
                );
            }
            Err(_) => {
                failures.push(format!("peer {}: no reachable address ({})", i, peer.stun_info));
            }
        }
    }

    if !failures.is_empty() {
        return (None, ConnectOutcome::failed(failures.join("; ")));
    }

    if links.is_empty() {
        // Solo lobby: nothing to punch, the mesh is trivially up
        let links = Arc::new(tokio::sync::Mutex::new(links));
        let tasks = spawn_maintenance(socket.clone(), links.clone(), self_index, config);
        return (
            Some(MeshSession {
                socket,
                links,
                self_index,
                tasks,
            }),
            ConnectOutcome::ok(),
        );
    }

    let deadline = Instant::now() + config.punch_timeout;
    let mut probe_tick = tokio::time::interval(config.probe_interval);
    let mut buffer = vec![0u8; 1024];

    // Registered once so a stop arriving between loop iterations still lands
    let cancelled = async {
        loop {
            if cancel.changed().await.is_err() {
                // Sender gone, nobody can cancel this attempt anymore
                future::pending::<()>().await;
            }
            if *cancel.borrow() {
                return;
            }
        }
    };
    tokio::pin!(cancelled);

    loop {
        let pending: Vec<SocketAddr> = links
            .iter()
            .filter(|(_, link)| !link.established)
            .map(|(addr, _)| *addr)
            .collect();

        if pending.is_empty() {
            break;
        }

        tokio::select! {
            _ = &mut cancelled => {
                info!("connect attempt cancelled");
                return (None, ConnectOutcome::failed("Connection attempt cancelled"));
            }
            _ = probe_tick.tick() => {
                if Instant::now() >= deadline {
                    let missing: Vec<String> = links
                        .iter()
                        .filter(|(_, link)| !link.established)
                        .map(|(addr, link)| format!("peer {}: no response from {}", link.index, addr))
                        .collect();
                    return (None, ConnectOutcome::failed(missing.join("; ")));
                }
                for addr in &pending {
                    if let Some(link) = links.get(addr) {
                        let probe = ProbePacket::new(
                            ProbeKind::Punch,
                            self_index,
                            link.shared_key.as_ref(),
                        );
                        let _ = socket.send_to(&probe.to_bytes(), addr).await;
                    }
                }
            }
            received = socket.recv_from(&mut buffer) => {
                let (len, from) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("socket error during punch: {}", e);
                        continue;
                    }
                };

                let link = match links.get_mut(&from) {
                    Some(link) => link,
                    None => {
                        debug!("ignoring packet from unknown address {}", from);
                        continue;
                    }
                };

                match ProbePacket::from_bytes(&buffer[..len]) {
                    Ok(probe) => {
                        if let Err(e) = probe.verify(link.shared_key.as_ref()) {
                            warn!("rejected probe from {}: {}", from, e);
                            continue;
                        }
                        link.last_seen = Instant::now();
                        if !link.established {
                            link.established = true;
                            info!("link to peer {} ({}) established", link.index, from);
                            // Answer so the peer's own punch completes
                            let reply = ProbePacket::new(
                                ProbeKind::Punch,
                                self_index,
                                link.shared_key.as_ref(),
                            );
                            let _ = socket.send_to(&reply.to_bytes(), from).await;
                        }
                    }
                    Err(e) => {
                        debug!("ignoring malformed packet from {}: {}", from, e);
                    }
                }
            }
        }
    }

    let peer_total = links.len();
    let links = Arc::new(tokio::sync::Mutex::new(links));
    let tasks = spawn_maintenance(socket.clone(), links.clone(), self_index, config);
    info!("mesh established with {} peers", peer_total);

    (
        Some(MeshSession {
            socket,
            links,
            self_index,
            tasks,
        }),
        ConnectOutcome::ok(),
    )
}

/// Background upkeep on an established mesh: answer inbound traffic, send
/// keep-alives, expire peers that went silent.
fn spawn_maintenance(
    socket: Arc<UdpSocket>,
    links: Arc<tokio::sync::Mutex<HashMap<SocketAddr, PeerLink>>>,
    self_index: u16,
    config: &MeshConfig,
) -> Vec<JoinHandle<()>> {
    let keepalive_interval = config.keepalive_interval;
    let peer_timeout = config.peer_timeout;

    let receiver = {
        let socket = socket.clone();
        let links = links.clone();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 1024];
            loop {
                let (len, from) = match socket.recv_from(&mut buffer).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("mesh receive error: {}", e);
                        continue;
                    }
                };

                let probe = match ProbePacket::from_bytes(&buffer[..len]) {
                    Ok(probe) => probe,
                    Err(e) => {
                        debug!("ignoring malformed packet from {}: {}", from, e);
                        continue;
                    }
                };

                let mut guard = links.lock().await;
                match probe.kind {
                    ProbeKind::Disconnect => {
                        // Same authentication as every other probe, or a
                        // spoofed datagram could evict a live link
                        let verified = guard
                            .get(&from)
                            .map(|link| probe.verify(link.shared_key.as_ref()).is_ok())
                            .unwrap_or(false);
                        if verified {
                            if let Some(link) = guard.remove(&from) {
                                info!("peer {} ({}) disconnected", link.index, from);
                            }
                        } else {
                            warn!("rejected unauthenticated disconnect from {}", from);
                        }
                    }
                    ProbeKind::Punch | ProbeKind::KeepAlive => {
                        if let Some(link) = guard.get_mut(&from) {
                            if probe.verify(link.shared_key.as_ref()).is_ok() {
                                link.last_seen = Instant::now();
                            }
                        }
                    }
                }
            }
        })
    };

    let keepalive = tokio::spawn(async move {
        let mut tick = tokio::time::interval(keepalive_interval);
        loop {
            tick.tick().await;
            let mut guard = links.lock().await;

            let now = Instant::now();
            let expired: Vec<SocketAddr> = guard
                .iter()
                .filter(|(_, link)| now.duration_since(link.last_seen) > peer_timeout)
                .map(|(addr, _)| *addr)
                .collect();
            for addr in expired {
                if let Some(link) = guard.remove(&addr) {
                    warn!("peer {} ({}) timed out", link.index, addr);
                }
            }

            for (addr, link) in guard.iter() {
                let probe =
                    ProbePacket::new(ProbeKind::KeepAlive, self_index, link.shared_key.as_ref());
                let _ = socket.send_to(&probe.to_bytes(), addr).await;
            }
        }
    });

    vec![receiver, keepalive]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_round_trips_and_verifies() {
        let key = [9u8; 32];
        let probe = ProbePacket::new(ProbeKind::Punch, 2, Some(&key));
        let bytes = probe.to_bytes();
        assert_eq!(bytes.len(), PROBE_LEN);

        let parsed = ProbePacket::from_bytes(&bytes).expect("parse");
        assert_eq!(parsed.kind, ProbeKind::Punch);
        assert_eq!(parsed.sender_index, 2);
        assert!(parsed.verify(Some(&key)).is_ok());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let probe = ProbePacket::new(ProbeKind::KeepAlive, 0, Some(&[1u8; 32]));
        let parsed = ProbePacket::from_bytes(&probe.to_bytes()).expect("parse");
        assert!(parsed.verify(Some(&[2u8; 32])).is_err());
        assert!(parsed.verify(None).is_err());
    }

    #[test]
    fn keyless_probes_use_the_unkeyed_digest() {
        let probe = ProbePacket::new(ProbeKind::Punch, 1, None);
        let parsed = ProbePacket::from_bytes(&probe.to_bytes()).expect("parse");
        assert!(parsed.verify(None).is_ok());
        assert!(parsed.verify(Some(&[0u8; 32])).is_err());
    }

    #[test]
    fn malformed_packets_are_rejected() {
        assert!(ProbePacket::from_bytes(&[0u8; 10]).is_err());

        let mut bytes = ProbePacket::new(ProbeKind::Punch, 0, None).to_bytes();
        bytes[0] = b'X'; // break the magic
        assert!(ProbePacket::from_bytes(&bytes).is_err());

        let mut bytes = ProbePacket::new(ProbeKind::Punch, 0, None).to_bytes();
        bytes[4] = 99; // unknown kind
        assert!(ProbePacket::from_bytes(&bytes).is_err());
    }

    #[tokio::test]
    async fn forged_disconnects_do_not_evict_links() {
        let mesh_socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let mesh_addr = mesh_socket.local_addr().expect("addr");
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let peer_addr = peer_socket.local_addr().expect("addr");

        let key = [5u8; 32];
        let mut links = HashMap::new();
        links.insert(
            peer_addr,
            PeerLink {
                index: 1,
                shared_key: Some(key),
                established: true,
                last_seen: Instant::now(),
            },
        );
        let links = Arc::new(tokio::sync::Mutex::new(links));

        let config = MeshConfig {
            keepalive_interval: Duration::from_secs(60),
            ..MeshConfig::default()
        };
        let tasks = spawn_maintenance(Arc::new(mesh_socket), links.clone(), 0, &config);

        // A disconnect without the shared key is rejected
        let forged = ProbePacket::new(ProbeKind::Disconnect, 1, None);
        peer_socket
            .send_to(&forged.to_bytes(), mesh_addr)
            .await
            .expect("send");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(links.lock().await.len(), 1);

        // The keyed disconnect removes the link
        let real = ProbePacket::new(ProbeKind::Disconnect, 1, Some(&key));
        peer_socket
            .send_to(&real.to_bytes(), mesh_addr)
            .await
            .expect("send");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(links.lock().await.is_empty());

        for task in tasks {
            task.abort();
        }
    }

    #[test]
    fn shared_keys_agree_across_both_sides() {
        let a = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let b = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let a_pub = PublicKey::from(&a);
        let b_pub = PublicKey::from(&b);

        let ab = derive_shared_key(&a, b_pub.as_bytes()).expect("key");
        let ba = derive_shared_key(&b, a_pub.as_bytes()).expect("key");
        assert_eq!(ab, ba);

        // Key material of the wrong size yields no key
        assert!(derive_shared_key(&a, &[1, 2, 3]).is_none());
        assert!(derive_shared_key(&a, &[]).is_none());
    }
}
