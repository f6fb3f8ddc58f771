/**
 * helper/server.rs
 *
 * Loopback RPC server: accepts client connections and feeds requests to the
 * service core, one JSON line in, one JSON line out.
 */

use crate::helper::HelperService;
use crate::rpc::RpcResponse;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Accept loop. Returns when the shutdown flag flips, leaving in-flight
/// connections to finish on their own tasks.
pub async fn run(
    listener: TcpListener,
    service: Arc<HelperService>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr().context("Listener has no address")?;
    info!("RPC server listening on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("Accept failed")?;
                debug!("RPC client connected from {}", peer);
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, service).await {
                        warn!("RPC connection error: {}", e);
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("RPC server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// One client connection: read request lines until the client goes away.
/// Unparseable requests get an error Ack instead of killing the connection.
async fn serve_connection(stream: TcpStream, service: Arc<HelperService>) -> Result<()> {
    stream.set_nodelay(true).context("Socket setup failed")?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await.context("Read failed")?;
        if read == 0 {
            debug!("RPC client disconnected");
            return Ok(());
        }

        let response = match serde_json::from_str(line.trim_end()) {
            Ok(request) => service.handle(request).await,
            Err(e) => RpcResponse::Ack {
                success: false,
                message: format!("invalid request: {}", e),
            },
        };

        let mut out = serde_json::to_string(&response).context("Response serialization failed")?;
        out.push('\n');
        write_half
            .write_all(out.as_bytes())
            .await
            .context("Write failed")?;
    }
}
