//! Infrastructure manager (VIM) controller.
//!
//! Owns workload lifecycle and address lookup for this compute domain. Every command
//! arrives over the VIM topic; reply-expecting commands answer point-to-point on the
//! caller's reply queue. Workloads are realized as in-process [`VnfWorkload`] tasks
//! bound to ephemeral local TCP ports; there is no container runtime behind this shim,
//! only the six-message contract the rest of the control plane depends on.


use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use futures::stream::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use crate::vnf::{Passthrough, VnfWorkload, WorkloadCmd};
use tandem_core::bus::{BusConn, BusQueue};
use tandem_core::msg::{VimCmd, VnfIpReply};
use tandem_core::rpc::OK_REPLY;
use tandem_core::{utils, TOPIC_VIM};

/// Counter metric: workloads started by this VIM.
const METRIC_VNFS_STARTED: &str = "tandem_vnfs_started";
/// Counter metric: workloads stopped by this VIM.
const METRIC_VNFS_STOPPED: &str = "tandem_vnfs_stopped";

/// A tracked workload and the handles needed to drive it.
struct WorkloadHandle {
    /// The workload's reachable `host:port` address.
    addr: String,
    /// The workload's command channel.
    cmd_tx: mpsc::UnboundedSender<WorkloadCmd>,
    /// The workload's join handle.
    handle: JoinHandle<Result<()>>,
}

/// The infrastructure manager controller.
pub struct VimCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// This controller's bus connection.
    conn: BusConn,
    /// This controller's command queue, bound to the VIM topic.
    queue: BusQueue,
    /// All tracked workloads, keyed by VNF ID.
    workloads: HashMap<String, WorkloadHandle>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl VimCtl {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, conn: BusConn, shutdown_tx: broadcast::Sender<()>) -> Self {
        let queue = conn.declare_queue();
        conn.bind(&queue, TOPIC_VIM);
        metrics::register_counter!(METRIC_VNFS_STARTED, metrics::Unit::Count, "workloads started by the VIM");
        metrics::register_counter!(METRIC_VNFS_STOPPED, metrics::Unit::Count, "workloads stopped by the VIM");
        Self {
            config,
            conn,
            queue,
            workloads: HashMap::new(),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("VIM controller has started");

        loop {
            tokio::select! {
                msg_opt = self.queue.recv() => self.handle_msg(msg_opt).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Stop every workload still tracked by this VIM.
        for (vnf_id, workload) in self.workloads.drain() {
            let _ = workload.cmd_tx.send(WorkloadCmd::Stop);
            if let Err(err) = workload.handle.await {
                tracing::error!(error = ?err, vnf_id = %vnf_id, "error joining workload task");
            }
        }
        tracing::info!("VIM controller has shutdown");
        Ok(())
    }

    /// Handle an inbound message from the VIM topic.
    #[tracing::instrument(level = "trace", skip(self, msg_opt))]
    async fn handle_msg(&mut self, msg_opt: Option<Bytes>) {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                let _res = self.shutdown_tx.send(());
                return;
            }
        };
        let cmd: VimCmd = match utils::decode_msg(&msg) {
            Ok(cmd) => cmd,
            Err(err) => {
                tracing::warn!(error = ?err, "dropping malformed message on VIM topic");
                return;
            }
        };
        match cmd {
            VimCmd::Start { vnf_id, sfc_id } => self.handle_start(vnf_id, sfc_id).await,
            VimCmd::RunVnf { vnf_id, inbound, outbound } => self.handle_run_vnf(vnf_id, inbound, outbound),
            VimCmd::GetVnfIp { vnf_id, rqueue } => self.handle_get_vnf_ip(vnf_id, rqueue),
            VimCmd::Stop { vnf_id } => self.handle_stop(vnf_id),
            VimCmd::Heartbeat { rqueue } => {
                if let Err(err) = self.conn.send_to_queue(&rqueue, Bytes::from_static(OK_REPLY)) {
                    tracing::warn!(error = ?err, "error replying to heartbeat");
                }
            }
        }
    }

    /// Start a workload for the given VNF; best-effort fire-and-forget.
    async fn handle_start(&mut self, vnf_id: String, sfc_id: String) {
        if self.workloads.contains_key(&vnf_id) {
            tracing::warn!(vnf_id = %vnf_id, "start for already running workload, ignoring");
            return;
        }
        let listener = match TcpListener::bind((self.config.workload_host.as_str(), 0u16)).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = ?err, vnf_id = %vnf_id, "error binding workload listener");
                return;
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr.to_string(),
            Err(err) => {
                tracing::error!(error = ?err, vnf_id = %vnf_id, "error resolving workload listener address");
                return;
            }
        };
        let workload = VnfWorkload::new_tcp(
            vnf_id.clone(),
            listener,
            Box::new(Passthrough),
            self.conn.clone(),
            self.config.connect_backoff(),
            self.shutdown_tx.subscribe(),
        );
        let (workload, cmd_tx) = match workload {
            Ok(parts) => parts,
            Err(err) => {
                tracing::error!(error = ?err, vnf_id = %vnf_id, "error building workload");
                return;
            }
        };
        let handle = workload.spawn();
        tracing::info!(vnf_id = %vnf_id, sfc_id = %sfc_id, addr = %addr, "workload started");
        metrics::increment_counter!(METRIC_VNFS_STARTED);
        self.workloads.insert(vnf_id, WorkloadHandle { addr, cmd_tx, handle });
    }

    /// Instruct a running workload to begin forwarding towards the given target.
    fn handle_run_vnf(&mut self, vnf_id: String, inbound: String, outbound: String) {
        match self.workloads.get(&vnf_id) {
            Some(workload) => {
                if workload.addr != inbound {
                    tracing::warn!(vnf_id = %vnf_id, expected = %workload.addr, got = %inbound, "run_vnf inbound address does not match workload listener");
                }
                let _ = workload.cmd_tx.send(WorkloadCmd::Run { outbound });
            }
            None => tracing::warn!(vnf_id = %vnf_id, "run_vnf for unknown workload, ignoring"),
        }
    }

    /// Resolve a workload's reachable address, replying on the caller's queue.
    ///
    /// An unknown VNF gets no reply; the caller's RPC deadline covers that case.
    fn handle_get_vnf_ip(&mut self, vnf_id: String, rqueue: String) {
        let addr = match self.workloads.get(&vnf_id) {
            Some(workload) => workload.addr.clone(),
            None => {
                tracing::warn!(vnf_id = %vnf_id, "address lookup for unknown workload, no reply sent");
                return;
            }
        };
        let reply = VnfIpReply { ip: addr };
        match utils::encode_msg(&reply) {
            Ok(payload) => {
                if let Err(err) = self.conn.send_to_queue(&rqueue, payload) {
                    tracing::warn!(error = ?err, vnf_id = %vnf_id, "error replying to address lookup");
                }
            }
            Err(err) => tracing::error!(error = ?err, "error encoding address lookup reply"),
        }
    }

    /// Stop the given workload and forget its handle; fire-and-forget.
    fn handle_stop(&mut self, vnf_id: String) {
        match self.workloads.remove(&vnf_id) {
            Some(workload) => {
                let _ = workload.cmd_tx.send(WorkloadCmd::Stop);
                tracing::info!(vnf_id = %vnf_id, "workload stopped");
                metrics::increment_counter!(METRIC_VNFS_STOPPED);
            }
            None => tracing::warn!(vnf_id = %vnf_id, "stop for unknown workload, ignoring"),
        }
    }
}
