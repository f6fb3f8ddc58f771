/**
 * helper/stun.rs
 *
 * STUN client for NAT discovery.
 *
 * The socket used for the binding request is the same socket later used for
 * hole punching; rebinding would get a different NAT mapping and make the
 * published address useless.
 */

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

/// STUN message types
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;

/// STUN magic cookie
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;

/// STUN attribute types
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const QUERY_ATTEMPTS: u32 = 3;
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// STUN query response
#[derive(Debug, Clone)]
pub struct StunResponse {
    pub external_ip: IpAddr,
    pub external_port: u16,
}

/// STUN client
pub struct StunClient {
    socket: UdpSocket,
    server: String,
}

impl StunClient {
    /// Bind the UDP socket the whole session will run on.
    ///
    /// `server` is a "host:port" STUN server address, resolved at query time.
    pub fn new(server: impl Into<String>) -> Result<Self> {
        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("Failed to create UDP socket")?;
        raw.set_reuse_address(true)
            .context("Failed to set SO_REUSEADDR")?;
        raw.set_nonblocking(true)
            .context("Failed to set nonblocking mode")?;

        let bind_addr: SocketAddr = "0.0.0.0:0"
            .parse()
            .context("Invalid bind address")?;
        raw.bind(&bind_addr.into())
            .context("Failed to bind UDP socket")?;

        let socket = UdpSocket::from_std(raw.into())
            .context("Failed to register socket with the runtime")?;

        Ok(Self {
            socket,
            server: server.into(),
        })
    }

    /// Query the STUN server for this host's external address.
    ///
    /// Retries a few times; STUN runs over UDP and a single lost datagram
    /// should not sink the whole startup.
    pub async fn query(&self) -> Result<StunResponse> {
        let server_addr = tokio::net::lookup_host(&self.server)
            .await
            .with_context(|| format!("Failed to resolve STUN server {}", self.server))?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| anyhow!("No IPv4 address for STUN server {}", self.server))?;

        let mut last_err = anyhow!("no STUN attempts made");
        for attempt in 1..=QUERY_ATTEMPTS {
            match self.query_once(server_addr).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("STUN attempt {}/{} failed: {}", attempt, QUERY_ATTEMPTS, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn query_once(&self, server_addr: SocketAddr) -> Result<StunResponse> {
        let transaction_id: [u8; 12] = rand::random();
        let request = build_binding_request(&transaction_id);

        self.socket
            .send_to(&request, server_addr)
            .await
            .context("Failed to send STUN request")?;

        let mut buffer = vec![0u8; 1024];
        let (len, from) = tokio::time::timeout(QUERY_TIMEOUT, self.socket.recv_from(&mut buffer))
            .await
            .context("STUN response timed out")?
            .context("Failed to receive STUN response")?;

        debug!("STUN response ({} bytes) from {}", len, from);
        parse_binding_response(&buffer[..len], &transaction_id)
    }

    /// Local socket address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("Failed to get local address")
    }

    /// Hand the socket over for hole punching, preserving the NAT binding
    pub fn into_socket(self) -> Arc<UdpSocket> {
        Arc::new(self.socket)
    }
}

/// Build a STUN binding request
fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut request = Vec::new();

    // Message type (16 bits)
    request.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());

    // Message length (16 bits) - no attributes
    request.extend_from_slice(&0u16.to_be_bytes());

    // Magic cookie (32 bits)
    request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());

    // Transaction ID (96 bits)
    request.extend_from_slice(transaction_id);

    request
}

/// Parse a STUN binding response
fn parse_binding_response(data: &[u8], expected_transaction_id: &[u8; 12]) -> Result<StunResponse> {
    if data.len() < 20 {
        return Err(anyhow!("STUN response too short"));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != STUN_BINDING_RESPONSE {
        return Err(anyhow!("Invalid STUN response type: 0x{:04x}", msg_type));
    }

    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != STUN_MAGIC_COOKIE {
        return Err(anyhow!("Invalid magic cookie"));
    }

    if &data[8..20] != expected_transaction_id {
        return Err(anyhow!("Transaction ID mismatch"));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    if data.len() < 20 + msg_len {
        return Err(anyhow!("STUN response truncated"));
    }

    let mut offset = 20;
    while offset < 20 + msg_len {
        if offset + 4 > data.len() {
            break;
        }

        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if offset + attr_len > data.len() {
            break;
        }

        let attr_data = &data[offset..offset + attr_len];

        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            return parse_xor_mapped_address(attr_data, expected_transaction_id);
        } else if attr_type == ATTR_MAPPED_ADDRESS {
            return parse_mapped_address(attr_data);
        }

        // Attributes are padded to 4-byte boundaries
        offset += (attr_len + 3) & !3;
    }

    Err(anyhow!("No address attribute found in STUN response"))
}

/// Parse XOR-MAPPED-ADDRESS attribute
fn parse_xor_mapped_address(data: &[u8], transaction_id: &[u8; 12]) -> Result<StunResponse> {
    if data.len() < 8 {
        return Err(anyhow!("XOR-MAPPED-ADDRESS too short"));
    }

    let family = data[1];
    let xor_port = u16::from_be_bytes([data[2], data[3]]);
    let port = xor_port ^ (STUN_MAGIC_COOKIE >> 16) as u16;

    let ip = match family {
        0x01 => {
            let xor_addr = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            let addr = xor_addr ^ STUN_MAGIC_COOKIE;
            IpAddr::from(addr.to_be_bytes())
        }
        0x02 => {
            if data.len() < 20 {
                return Err(anyhow!("Invalid IPv6 address length"));
            }
            let mut addr_bytes = [0u8; 16];
            addr_bytes.copy_from_slice(&data[4..20]);

            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);

            for i in 0..16 {
                addr_bytes[i] ^= xor_key[i];
            }

            IpAddr::from(addr_bytes)
        }
        _ => {
            return Err(anyhow!("Unknown address family: {}", family));
        }
    };

    Ok(StunResponse {
        external_ip: ip,
        external_port: port,
    })
}

/// Parse MAPPED-ADDRESS attribute (fallback)
fn parse_mapped_address(data: &[u8]) -> Result<StunResponse> {
    if data.len() < 8 {
        return Err(anyhow!("MAPPED-ADDRESS too short"));
    }

    let family = data[1];
    let port = u16::from_be_bytes([data[2], data[3]]);

    let ip = match family {
        0x01 => IpAddr::from([data[4], data[5], data[6], data[7]]),
        0x02 => {
            if data.len() < 20 {
                return Err(anyhow!("Invalid IPv6 address length"));
            }
            let mut addr_bytes = [0u8; 16];
            addr_bytes.copy_from_slice(&data[4..20]);
            IpAddr::from(addr_bytes)
        }
        _ => {
            return Err(anyhow!("Unknown address family: {}", family));
        }
    };

    Ok(StunResponse {
        external_ip: ip,
        external_port: port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_response(transaction_id: &[u8; 12], ip: [u8; 4], port: u16) -> Vec<u8> {
        let xor_port = port ^ (STUN_MAGIC_COOKIE >> 16) as u16;
        let xor_addr = u32::from_be_bytes(ip) ^ STUN_MAGIC_COOKIE;

        let mut attr = Vec::new();
        attr.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        attr.extend_from_slice(&8u16.to_be_bytes());
        attr.push(0x00);
        attr.push(0x01); // IPv4
        attr.extend_from_slice(&xor_port.to_be_bytes());
        attr.extend_from_slice(&xor_addr.to_be_bytes());

        let mut response = Vec::new();
        response.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        response.extend_from_slice(&(attr.len() as u16).to_be_bytes());
        response.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        response.extend_from_slice(transaction_id);
        response.extend_from_slice(&attr);
        response
    }

    #[test]
    fn binding_request_has_rfc_layout() {
        let tid = [7u8; 12];
        let req = build_binding_request(&tid);
        assert_eq!(req.len(), 20);
        assert_eq!(&req[0..2], &STUN_BINDING_REQUEST.to_be_bytes());
        assert_eq!(&req[4..8], &STUN_MAGIC_COOKIE.to_be_bytes());
        assert_eq!(&req[8..20], &tid);
    }

    #[test]
    fn xor_mapped_address_round_trips() {
        let tid = [3u8; 12];
        let response = synthetic_response(&tid, [203, 0, 113, 7], 40000);

        let parsed = parse_binding_response(&response, &tid).expect("parse");
        assert_eq!(parsed.external_ip, IpAddr::from([203, 0, 113, 7]));
        assert_eq!(parsed.external_port, 40000);
    }

    #[test]
    fn transaction_id_mismatch_is_rejected() {
        let tid = [3u8; 12];
        let response = synthetic_response(&tid, [203, 0, 113, 7], 40000);

        let wrong = [4u8; 12];
        assert!(parse_binding_response(&response, &wrong).is_err());
    }

    #[test]
    fn short_responses_are_rejected() {
        let tid = [0u8; 12];
        assert!(parse_binding_response(&[0u8; 10], &tid).is_err());
    }
}
