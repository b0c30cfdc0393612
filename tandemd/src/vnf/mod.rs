//! The generic VNF workload.
//!
//! A workload is a single forwarding node in a service chain: it receives units of data
//! on an inbound channel, applies its network function, and forwards non-empty results
//! to its next hop. Inbound and outbound can each be either a TCP endpoint or a named
//! bus queue; the two modes share one forwarding loop. The workload obeys a command
//! channel (`run` with outbound target, `stop`) so the infrastructure manager can drive
//! it, and binds a per-VNF control queue on the member control topic as an extension
//! point for future lifecycle commands.

#[cfg(test)]
mod mod_test;

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::stream::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use tandem_core::bus::{BusConn, BusQueue};
use tandem_core::TOPIC_VNF_CONTROL;

/// Read buffer size for inbound TCP data; one read is one forwardable unit.
const READ_BUF_SIZE: usize = 64 * 1024;
/// Counter metric: units dropped by a workload's outbound link while down.
const METRIC_VNF_FORWARD_DROPS: &str = "tandem_vnf_forward_drops";

/// The packet transform applied by a workload to each inbound unit.
///
/// Returning `Ok(None)` or an empty buffer means "do not forward"; an error is logged
/// and the unit skipped, never crashing the forwarding loop.
pub trait NetworkFunction: Send + Sync + 'static {
    fn apply(&self, unit: Bytes) -> Result<Option<Bytes>>;
}

/// The default network function: forward every unit unchanged.
pub struct Passthrough;

impl NetworkFunction for Passthrough {
    fn apply(&self, unit: Bytes) -> Result<Option<Bytes>> {
        Ok(Some(unit))
    }
}

/// Commands accepted by a running workload.
#[derive(Debug)]
pub enum WorkloadCmd {
    /// Begin forwarding towards the given outbound target.
    Run { outbound: String },
    /// Shut the workload down.
    Stop,
}

/// The workload's outbound side.
enum Outbound {
    /// No target configured yet; units are dropped.
    NotSet,
    /// A retrying TCP link towards the next hop.
    Tcp(crate::net::Link),
    /// A named bus queue.
    Bus(String),
}

/// A generic VNF workload task.
pub struct VnfWorkload {
    /// The ID of the VNF this workload realizes.
    vnf_id: String,
    /// The workload's TCP listener; `None` in bus mode.
    listener: Option<TcpListener>,
    /// The workload's inbound bus queue; `None` in TCP mode.
    inbound_queue: Option<BusQueue>,
    /// The workload's outbound side.
    outbound: Outbound,
    /// The network function applied to each unit.
    transform: Box<dyn NetworkFunction>,
    /// The workload's bus connection, used for bus-addressed forwarding.
    conn: BusConn,
    /// The per-VNF control queue, bound to the member control topic.
    control: BusQueue,
    /// Inbound command channel from the workload's owner.
    cmd_rx: mpsc::UnboundedReceiver<WorkloadCmd>,
    /// Internal channel carrying inbound units from reader tasks.
    units_tx: mpsc::UnboundedSender<Bytes>,
    /// Internal channel carrying inbound units from reader tasks.
    units_rx: mpsc::UnboundedReceiver<Bytes>,
    /// Backoff applied by the outbound link when its target is down.
    backoff: Duration,
    /// Internal channel used to stop this workload's helper tasks.
    stop_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl VnfWorkload {
    /// Create a new TCP-addressed workload accepting upstream hops on the given listener.
    pub fn new_tcp(
        vnf_id: String, listener: TcpListener, transform: Box<dyn NetworkFunction>, conn: BusConn, backoff: Duration, shutdown: broadcast::Receiver<()>,
    ) -> Result<(Self, mpsc::UnboundedSender<WorkloadCmd>)> {
        Self::new(vnf_id, Some(listener), None, Outbound::NotSet, transform, conn, backoff, shutdown)
    }

    /// Create a new bus-addressed workload consuming from `inbound` and forwarding to
    /// the `outbound` queue.
    pub fn new_bus(
        vnf_id: String, inbound: &str, outbound: String, transform: Box<dyn NetworkFunction>, conn: BusConn, backoff: Duration, shutdown: broadcast::Receiver<()>,
    ) -> Result<(Self, mpsc::UnboundedSender<WorkloadCmd>)> {
        let queue = conn.declare_queue_named(inbound)?;
        Self::new(vnf_id, None, Some(queue), Outbound::Bus(outbound), transform, conn, backoff, shutdown)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        vnf_id: String, listener: Option<TcpListener>, inbound_queue: Option<BusQueue>, outbound: Outbound, transform: Box<dyn NetworkFunction>, conn: BusConn,
        backoff: Duration, shutdown: broadcast::Receiver<()>,
    ) -> Result<(Self, mpsc::UnboundedSender<WorkloadCmd>)> {
        let control = conn.declare_queue_named(&format!("control-{}", vnf_id))?;
        conn.bind(&control, TOPIC_VNF_CONTROL);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (units_tx, units_rx) = mpsc::unbounded_channel();
        let (stop_tx, _) = broadcast::channel(1);
        let this = Self {
            vnf_id,
            listener,
            inbound_queue,
            outbound,
            transform,
            conn,
            control,
            cmd_rx,
            units_tx,
            units_rx,
            backoff,
            stop_tx,
            shutdown_rx: BroadcastStream::new(shutdown),
        };
        Ok((this, cmd_tx))
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(vnf_id = %self.vnf_id, "vnf workload has started");
        if let Some(listener) = self.listener.take() {
            tokio::spawn(Self::accept_upstream(listener, self.units_tx.clone(), self.stop_tx.subscribe()));
        }
        if let Some(queue) = self.inbound_queue.take() {
            tokio::spawn(Self::pump_bus_inbound(queue, self.units_tx.clone(), self.stop_tx.subscribe()));
        }

        loop {
            tokio::select! {
                cmd_opt = self.cmd_rx.recv() => match cmd_opt {
                    Some(WorkloadCmd::Run { outbound }) => self.handle_run(outbound),
                    Some(WorkloadCmd::Stop) | None => break,
                },
                Some(unit) = self.units_rx.recv() => self.handle_unit(unit),
                ctl_opt = self.control.recv() => match ctl_opt {
                    Some(msg) => tracing::info!(vnf_id = %self.vnf_id, len = msg.len(), "control message received"),
                    None => break,
                },
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Stop helper tasks and tear down the outbound link.
        let _ = self.stop_tx.send(());
        if let Outbound::Tcp(link) = std::mem::replace(&mut self.outbound, Outbound::NotSet) {
            link.shutdown().await;
        }
        tracing::info!(vnf_id = %self.vnf_id, "vnf workload has shutdown");
        Ok(())
    }

    /// Begin forwarding towards the given target.
    fn handle_run(&mut self, outbound: String) {
        tracing::info!(vnf_id = %self.vnf_id, outbound = %outbound, "vnf workload is forwarding");
        match &self.outbound {
            Outbound::Bus(_) => self.outbound = Outbound::Bus(outbound),
            _ => {
                self.outbound = Outbound::Tcp(crate::net::Link::spawn(outbound, self.backoff, METRIC_VNF_FORWARD_DROPS, self.stop_tx.subscribe()));
            }
        }
    }

    /// Apply the network function to one inbound unit and forward the result.
    #[tracing::instrument(level = "trace", skip(self, unit))]
    fn handle_unit(&mut self, unit: Bytes) {
        let output = match self.transform.apply(unit) {
            Ok(Some(output)) if !output.is_empty() => output,
            Ok(_) => {
                tracing::debug!(vnf_id = %self.vnf_id, "network function yielded no output, skipping unit");
                return;
            }
            Err(err) => {
                tracing::warn!(error = ?err, vnf_id = %self.vnf_id, "network function failed, skipping unit");
                return;
            }
        };
        match &self.outbound {
            Outbound::NotSet => tracing::debug!(vnf_id = %self.vnf_id, "no outbound target configured, dropping unit"),
            Outbound::Tcp(link) => link.send(output),
            Outbound::Bus(queue) => {
                if let Err(err) = self.conn.send_to_queue(queue, output) {
                    tracing::warn!(error = ?err, vnf_id = %self.vnf_id, queue = %queue, "error forwarding unit to bus queue");
                }
            }
        }
    }

    /// Accept upstream hop connections, spawning a reader per connection.
    async fn accept_upstream(listener: TcpListener, units_tx: mpsc::UnboundedSender<Bytes>, mut stop: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, _addr)) => {
                        tokio::spawn(Self::read_upstream(stream, units_tx.clone()));
                    }
                    Err(err) => tracing::debug!(error = ?err, "error accepting upstream connection"),
                },
                _ = stop.recv() => return,
            }
        }
    }

    /// Read units from one upstream connection until it closes.
    async fn read_upstream(mut stream: tokio::net::TcpStream, units_tx: mpsc::UnboundedSender<Bytes>) {
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    let _ = units_tx.send(Bytes::copy_from_slice(&buf[..n]));
                }
            }
        }
    }

    /// Pump units from the inbound bus queue into the forwarding loop.
    async fn pump_bus_inbound(mut queue: BusQueue, units_tx: mpsc::UnboundedSender<Bytes>, mut stop: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                msg_opt = queue.recv() => match msg_opt {
                    Some(unit) => {
                        let _ = units_tx.send(unit);
                    }
                    None => return,
                },
                _ = stop.recv() => return,
            }
        }
    }
}
