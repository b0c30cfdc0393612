//! Shared test fixtures.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tandem_core::bus::{BusConn, BusQueue};
use tandem_core::utils;

/// Bind a loopback listener which captures every received chunk onto a channel.
pub async fn capture_listener() -> Result<(SocketAddr, mpsc::UnboundedReceiver<Bytes>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await.context("error binding capture listener")?;
    let addr = listener.local_addr().context("error resolving capture listener address")?;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let (mut stream, _peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            let _ = tx.send(Bytes::copy_from_slice(&buf[..n]));
                        }
                    }
                }
            });
        }
    });
    Ok((addr, rx))
}

/// Declare a queue bound to the given topic for observing published messages.
pub fn tap(conn: &BusConn, topic: &str) -> BusQueue {
    let queue = conn.declare_queue();
    conn.bind(&queue, topic);
    queue
}

/// Decode the next message on the given queue, failing on timeout.
pub async fn next_msg<T: DeserializeOwned>(queue: &mut BusQueue, timeout: Duration) -> Result<T> {
    let msg = queue.recv_timeout(timeout).await.context("timed out awaiting message on queue")?;
    utils::decode_msg(&msg)
}

/// Await the next captured chunk on the given channel, failing on timeout.
pub async fn next_chunk(rx: &mut mpsc::UnboundedReceiver<Bytes>, timeout: Duration) -> Result<Bytes> {
    tokio::time::timeout(timeout, rx.recv()).await.context("timed out awaiting captured chunk")?.context("capture channel closed")
}
