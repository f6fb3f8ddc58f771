/**
 * signaling/ws.rs
 *
 * TLS WebSocket implementation of the signaling gateway
 * (self-signed certs allowed for development)
 */

use crate::signaling::{
    PeerConnectionInfo, PublishedStunInfo, SignalingError, SignalingGateway,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use native_tls::TlsConnector;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    Register {
        client_id: String,
    },
    RegisterAck {
        success: bool,
        message: String,
    },
    PublishStunInfo {
        public_ip: String,
        public_port: u16,
        public_key: Vec<u8>,
    },
    PeerInfoRequest {
        lobby_id: String,
    },
    PeerInfoResponse {
        #[serde(flatten)]
        info: PeerConnectionInfo,
    },
    PeerConnected {
        lobby_id: String,
    },
    PeerFailed {
        lobby_id: String,
        message: String,
    },
    Keepalive,
    Error {
        message: String,
    },
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production signaling gateway over a TLS WebSocket
pub struct WsSignalingGateway {
    stream: tokio::sync::Mutex<WsStream>,
}

impl WsSignalingGateway {
    /// Connect and register with the signaling service.
    ///
    /// `accept_invalid_certs` exists for development setups running the
    /// service behind a self-signed certificate.
    pub async fn connect(
        url: &str,
        client_id: &str,
        accept_invalid_certs: bool,
    ) -> Result<Self, SignalingError> {
        let req = url
            .into_client_request()
            .map_err(|e| SignalingError::Transport(format!("invalid signaling URL: {}", e)))?;

        let mut tls_builder = TlsConnector::builder();
        if accept_invalid_certs {
            tls_builder.danger_accept_invalid_certs(true);
        }
        let tls = tls_builder
            .build()
            .map_err(|e| SignalingError::Transport(format!("TLS setup failed: {}", e)))?;

        let host = req
            .uri()
            .host()
            .ok_or_else(|| SignalingError::Transport("missing hostname".to_string()))?
            .to_string();
        let port = req.uri().port_u16().unwrap_or(443);

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|e| SignalingError::Transport(format!("TCP connect failed: {}", e)))?;

        let (stream, _resp) =
            client_async_tls_with_config(req, tcp, None, Some(Connector::NativeTls(tls)))
                .await
                .map_err(|e| SignalingError::Transport(format!("WebSocket handshake failed: {}", e)))?;

        let gateway = Self {
            stream: tokio::sync::Mutex::new(stream),
        };

        gateway
            .send(&GatewayMessage::Register {
                client_id: client_id.to_string(),
            })
            .await?;

        match gateway.receive().await? {
            GatewayMessage::RegisterAck { success, message } => {
                if success {
                    Ok(gateway)
                } else {
                    Err(SignalingError::Rejected(message))
                }
            }
            other => Err(SignalingError::Malformed(format!(
                "unexpected registration response: {:?}",
                other
            ))),
        }
    }

    async fn send(&self, msg: &GatewayMessage) -> Result<(), SignalingError> {
        let json = serde_json::to_string(msg)
            .map_err(|e| SignalingError::Malformed(format!("serialization failed: {}", e)))?;

        self.stream
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .map_err(|e| SignalingError::Transport(format!("send failed: {}", e)))
    }

    async fn receive(&self) -> Result<GatewayMessage, SignalingError> {
        let mut stream = self.stream.lock().await;
        loop {
            let msg = stream
                .next()
                .await
                .ok_or_else(|| SignalingError::Transport("connection closed".to_string()))?
                .map_err(|e| SignalingError::Transport(format!("receive failed: {}", e)))?;

            match msg {
                Message::Text(text) => {
                    return serde_json::from_str(&text).map_err(|e| {
                        SignalingError::Malformed(format!("bad signaling payload: {}", e))
                    });
                }
                Message::Ping(data) => {
                    stream
                        .send(Message::Pong(data))
                        .await
                        .map_err(|e| SignalingError::Transport(format!("pong failed: {}", e)))?;
                }
                Message::Pong(_) => {}
                Message::Close(_) => {
                    return Err(SignalingError::Transport(
                        "server closed WebSocket".to_string(),
                    ));
                }
                _ => {}
            }
        }
    }

    pub async fn close(self) -> Result<(), SignalingError> {
        self.stream
            .lock()
            .await
            .close(None)
            .await
            .map_err(|e| SignalingError::Transport(format!("close failed: {}", e)))
    }
}

#[async_trait]
impl SignalingGateway for WsSignalingGateway {
    async fn fetch_peer_info(&self, lobby_id: &str) -> Result<PeerConnectionInfo, SignalingError> {
        self.send(&GatewayMessage::PeerInfoRequest {
            lobby_id: lobby_id.to_string(),
        })
        .await?;

        loop {
            match self.receive().await? {
                GatewayMessage::PeerInfoResponse { info } => return Ok(info),
                GatewayMessage::Error { message } => {
                    return Err(SignalingError::Rejected(message));
                }
                GatewayMessage::Keepalive => {}
                other => {
                    return Err(SignalingError::Malformed(format!(
                        "unexpected peer-info response: {:?}",
                        other
                    )));
                }
            }
        }
    }

    async fn publish_stun_info(&self, info: &PublishedStunInfo) -> Result<(), SignalingError> {
        self.send(&GatewayMessage::PublishStunInfo {
            public_ip: info.public_ip.clone(),
            public_port: info.public_port,
            public_key: info.public_key.clone(),
        })
        .await
    }

    async fn notify_peer_connected(&self, lobby_id: &str) -> Result<(), SignalingError> {
        self.send(&GatewayMessage::PeerConnected {
            lobby_id: lobby_id.to_string(),
        })
        .await
    }

    async fn notify_peer_failed(
        &self,
        lobby_id: &str,
        message: &str,
    ) -> Result<(), SignalingError> {
        self.send(&GatewayMessage::PeerFailed {
            lobby_id: lobby_id.to_string(),
            message: message.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_info_response_flattens_the_payload() {
        let text = r#"{
            "type": "peer_info_response",
            "peers": [{"stun_info": "self", "public_key": ""}],
            "self_index": 0
        }"#;

        let msg: GatewayMessage = serde_json::from_str(text).expect("parse");
        match msg {
            GatewayMessage::PeerInfoResponse { info } => {
                assert_eq!(info.peers.len(), 1);
                assert_eq!(info.self_index, 0);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn notifications_carry_the_lobby_id() {
        let msg = GatewayMessage::PeerFailed {
            lobby_id: "lobby-7".to_string(),
            message: "no response from peer 2".to_string(),
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains(r#""type":"peer_failed""#));
        assert!(json.contains("lobby-7"));
    }
}
