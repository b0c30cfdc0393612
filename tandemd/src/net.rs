//! Best-effort outbound TCP links.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// A best-effort outbound TCP link maintained by a dedicated task.
///
/// The task dials the target, resets and redials with a fixed backoff on any send
/// failure, and drops units with a log line while the link is down; nothing is ever
/// buffered beyond the inbound channel. Dropped units additionally bump the link's
/// drop metric.
pub struct Link {
    /// The sending side of the link's unit channel.
    tx: mpsc::UnboundedSender<Bytes>,
    /// The join handle of the link's maintain task.
    handle: JoinHandle<()>,
}

/// A cheaply cloneable sending handle onto a [`Link`].
#[derive(Clone)]
pub struct LinkSender(mpsc::UnboundedSender<Bytes>);

impl LinkSender {
    /// Enqueue a unit for best-effort delivery on the link.
    pub fn send(&self, unit: Bytes) {
        let _ = self.0.send(unit);
    }
}

impl Link {
    /// Spawn a new link towards the given target.
    pub fn spawn(target: String, backoff: Duration, drop_metric: &'static str, shutdown: broadcast::Receiver<()>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::maintain(target, backoff, drop_metric, rx, shutdown));
        Self { tx, handle }
    }

    /// A cloneable sending handle onto this link.
    pub fn sender(&self) -> LinkSender {
        LinkSender(self.tx.clone())
    }

    /// Enqueue a unit for best-effort delivery on the link.
    pub fn send(&self, unit: Bytes) {
        let _ = self.tx.send(unit);
    }

    /// Shut the link down, dropping its channel and joining the maintain task.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(err) = self.handle.await {
            tracing::error!(error = ?err, "error joining link maintain task");
        }
    }

    async fn maintain(target: String, backoff: Duration, drop_metric: &'static str, mut rx: mpsc::UnboundedReceiver<Bytes>, mut shutdown: broadcast::Receiver<()>) {
        let mut stream: Option<TcpStream> = None;
        let redial = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(redial);
        loop {
            tokio::select! {
                unit_opt = rx.recv() => {
                    let unit = match unit_opt {
                        Some(unit) => unit,
                        None => break,
                    };
                    match stream.as_mut() {
                        Some(conn) => {
                            if let Err(err) = conn.write_all(&unit).await {
                                tracing::warn!(error = ?err, target, "error writing to link, resetting connection");
                                metrics::increment_counter!(drop_metric);
                                stream = None;
                                redial.as_mut().reset(tokio::time::Instant::now() + backoff);
                            }
                        }
                        None => {
                            tracing::debug!(target, "link is down, dropping unit");
                            metrics::increment_counter!(drop_metric);
                        }
                    }
                }
                _ = &mut redial, if stream.is_none() => {
                    match TcpStream::connect(&target).await {
                        Ok(conn) => {
                            tracing::info!(target, "link established");
                            stream = Some(conn);
                        }
                        Err(err) => {
                            tracing::debug!(error = ?err, target, "link dial failed, backing off");
                            redial.as_mut().reset(tokio::time::Instant::now() + backoff);
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}
