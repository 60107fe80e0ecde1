//! A logging pass-through proxy for the STRATUM conversation.
//!
//! Point a miner at the proxy and the proxy at a pool; every line crossing
//! in either direction is logged before being forwarded. Handy when a pool
//! speaks a dialect this client does not expect yet.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use super::StratumError;

/// Accept miner connections on `listen_port` and relay each to
/// `pool:pool_port`, logging the full line traffic. Runs until the listener
/// fails.
pub async fn run(listen_port: u16, pool: &str, pool_port: u16) -> Result<(), StratumError> {
    let listener = TcpListener::bind(("0.0.0.0", listen_port)).await?;
    tracing::info!(listen_port, pool, pool_port, "proxy listening");

    loop {
        let (client, peer) = listener.accept().await?;
        tracing::info!(peer = %peer, "miner connected");

        let upstream = match TcpStream::connect((pool.to_string(), pool_port)).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "failed to reach pool, dropping miner");
                continue;
            }
        };

        let _ = client.set_nodelay(true);
        let _ = upstream.set_nodelay(true);

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();
        tokio::spawn(relay(client_read, upstream_write, "miner -> pool"));
        tokio::spawn(relay(upstream_read, client_write, "pool -> miner"));
    }
}

/// Copy lines from one half to the other, logging each as it passes.
async fn relay(read: OwnedReadHalf, mut write: OwnedWriteHalf, direction: &'static str) {
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                tracing::info!(direction, "connection closed");
                return;
            }
            Ok(_) => {
                tracing::info!(direction, line = line.trim_end());
                if let Err(e) = write.write_all(line.as_bytes()).await {
                    tracing::info!(direction, error = %e, "forward failed");
                    return;
                }
            }
            Err(e) => {
                tracing::info!(direction, error = %e, "read failed");
                return;
            }
        }
    }
}
