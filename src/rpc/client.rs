/**
 * rpc/client.rs
 *
 * Client side of the helper's loopback RPC channel.
 *
 * One logical channel per client: lazily connected, shared behind a mutex,
 * explicitly closable. A dead helper makes the next call fail fast with
 * `RpcError::Unavailable` instead of hanging.
 */

use crate::config::ClientConfig;
use crate::rpc::{ConnectOutcome, ConnectionSession, RpcRequest, RpcResponse, StunResult};
use log::{debug, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// RPC client errors
#[derive(Debug)]
pub enum RpcError {
    /// No channel could be established, or the helper went away
    Unavailable(String),
    /// The helper answered, but reported an error of its own
    Remote(String),
    /// A connect attempt is already outstanding on this channel
    SessionActive,
    /// Malformed traffic or misuse of the call contract
    Protocol(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Unavailable(e) => write!(f, "RPC unavailable: {}", e),
            RpcError::Remote(e) => write!(f, "Helper error: {}", e),
            RpcError::SessionActive => write!(f, "A connection attempt is already in flight"),
            RpcError::Protocol(e) => write!(f, "Protocol error: {}", e),
        }
    }
}

impl std::error::Error for RpcError {}

struct Channel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Clears the in-flight flag even if the call future is dropped mid-way
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Typed request/response channel to the helper daemon
pub struct RpcClient {
    addr: SocketAddr,
    channel: tokio::sync::Mutex<Option<Channel>>,
    connect_in_flight: AtomicBool,
}

impl RpcClient {
    pub fn new(rpc_port: u16) -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), rpc_port),
            channel: tokio::sync::Mutex::new(None),
            connect_in_flight: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.rpc_port)
    }

    /// Establish the channel now instead of on first call
    pub async fn connect(&self) -> Result<(), RpcError> {
        let mut guard = self.channel.lock().await;
        if guard.is_none() {
            *guard = Some(Self::dial(self.addr).await?);
        }
        Ok(())
    }

    /// Connect with bounded retry. The helper reports "spawned" before its
    /// RPC listener is up (it may be waiting on an elevation prompt), so the
    /// first attempts are expected to fail.
    pub async fn connect_with_backoff(
        &self,
        attempts: u32,
        backoff: Duration,
    ) -> Result<(), RpcError> {
        let mut last_err = RpcError::Unavailable("no connect attempts made".to_string());
        for attempt in 1..=attempts.max(1) {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("helper connect attempt {}/{} failed: {}", attempt, attempts, e);
                    last_err = e;
                }
            }
            tokio::time::sleep(backoff).await;
        }
        Err(last_err)
    }

    async fn dial(addr: SocketAddr) -> Result<Channel, RpcError> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Unavailable(format!("connect to {} timed out", addr)))?
            .map_err(|e| RpcError::Unavailable(format!("connect to {} failed: {}", addr, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| RpcError::Unavailable(format!("socket setup failed: {}", e)))?;

        let (read_half, write_half) = stream.into_split();
        Ok(Channel {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    /// Send one request and wait for its response. Drops the channel on any
    /// transport error so the next call re-dials instead of reusing a broken
    /// stream.
    async fn call(&self, request: &RpcRequest) -> Result<RpcResponse, RpcError> {
        let mut guard = self.channel.lock().await;
        if guard.is_none() {
            *guard = Some(Self::dial(self.addr).await?);
        }

        let channel = match guard.as_mut() {
            Some(c) => c,
            None => return Err(RpcError::Unavailable("channel missing".to_string())),
        };

        let mut line = serde_json::to_string(request)
            .map_err(|e| RpcError::Protocol(format!("request serialization failed: {}", e)))?;
        line.push('\n');

        if let Err(e) = channel.writer.write_all(line.as_bytes()).await {
            *guard = None;
            return Err(RpcError::Unavailable(format!("send failed: {}", e)));
        }

        let mut response_line = String::new();
        match channel.reader.read_line(&mut response_line).await {
            Ok(0) => {
                *guard = None;
                Err(RpcError::Unavailable("helper closed the channel".to_string()))
            }
            Ok(_) => serde_json::from_str(&response_line)
                .map_err(|e| RpcError::Protocol(format!("bad response: {}", e))),
            Err(e) => {
                *guard = None;
                Err(RpcError::Unavailable(format!("receive failed: {}", e)))
            }
        }
    }

    /// Fetch this host's STUN-resolved public address and key material.
    ///
    /// A non-empty helper-side error message becomes `RpcError::Remote`; the
    /// caller may proceed with defaults (login does not require STUN info).
    pub async fn get_stun_info(&self) -> Result<StunResult, RpcError> {
        match self.call(&RpcRequest::GetStunInfo).await? {
            RpcResponse::StunInfo {
                public_ip,
                public_port,
                public_key,
                error_message,
            } => {
                if !error_message.is_empty() {
                    return Err(RpcError::Remote(error_message));
                }
                Ok(StunResult {
                    public_ip,
                    public_port,
                    public_key,
                    error_message: String::new(),
                })
            }
            other => Err(RpcError::Protocol(format!(
                "unexpected response to GetStunInfo: {:?}",
                other
            ))),
        }
    }

    /// Submit the full peer list in one blocking call and wait for the
    /// aggregate result. At most one such call may be in flight; a second
    /// caller fails fast with `SessionActive` instead of queueing.
    pub async fn start_connection(
        &self,
        session: &ConnectionSession,
    ) -> Result<ConnectOutcome, RpcError> {
        if session.self_index >= session.peers.len() {
            return Err(RpcError::Protocol(format!(
                "self_index {} out of range for {} peers",
                session.self_index,
                session.peers.len()
            )));
        }

        if self.connect_in_flight.swap(true, Ordering::SeqCst) {
            return Err(RpcError::SessionActive);
        }
        let _in_flight = InFlightGuard(&self.connect_in_flight);

        let result = self
            .call(&RpcRequest::StartConnection {
                peers: session.peers.clone(),
                self_index: session.self_index,
                should_fail: session.should_fail,
            })
            .await;

        match result? {
            RpcResponse::ConnectResult {
                success,
                error_message,
            } => Ok(ConnectOutcome {
                success,
                error_message,
            }),
            other => Err(RpcError::Protocol(format!(
                "unexpected response to StartConnection: {:?}",
                other
            ))),
        }
    }

    /// Tear down the active session's sockets. Soft failure: callers log and
    /// proceed rather than blocking shutdown on it.
    pub async fn stop_connection(&self) -> Result<(), RpcError> {
        match self.call(&RpcRequest::StopConnection).await? {
            RpcResponse::Ack { success, message } => {
                if success {
                    Ok(())
                } else {
                    Err(RpcError::Remote(message))
                }
            }
            other => Err(RpcError::Protocol(format!(
                "unexpected response to StopConnection: {:?}",
                other
            ))),
        }
    }

    /// Ask the helper to terminate itself. `force = false` requests a
    /// graceful shutdown so sockets get released.
    pub async fn stop_process(&self, force: bool) -> Result<(), RpcError> {
        match self.call(&RpcRequest::StopProcess { force }).await? {
            RpcResponse::Ack { success, message } => {
                if !success {
                    warn!("helper rejected stop request: {}", message);
                }
                Ok(())
            }
            other => Err(RpcError::Protocol(format!(
                "unexpected response to StopProcess: {:?}",
                other
            ))),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.lock().await.is_some()
    }

    /// Drop the channel. The helper process, if any, is untouched.
    pub async fn close(&self) {
        let mut guard = self.channel.lock().await;
        if guard.take().is_some() {
            debug!("RPC channel closed");
        }
    }
}
