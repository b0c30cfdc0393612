//! VNF lifecycle manager (VNFM) controller.
//!
//! Tracks per chain which members have been created, fanning a start command out to the
//! VIM for each one. Once the count of created members reaches the chain's declared
//! size, the chain is finalized: every member's address is resolved from the VIM over
//! RPC, the forward graph is built, each member is told to begin forwarding, and chain
//! readiness is announced on the gateway topic. That announcement is the sole signal
//! the gateway uses to learn a chain exists.


use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::config::Config;
use tandem_core::bus::{BusConn, BusQueue};
use tandem_core::chain::{forward_graph, ChainState};
use tandem_core::msg::{GatewayCmd, SfcMember, VimCmd, VnfIpReply, VnfmCmd};
use tandem_core::rpc::{RpcClient, OK_REPLY};
use tandem_core::{utils, TOPIC_GATEWAY, TOPIC_VIM, TOPIC_VNFM};

/// Per-chain creation tracking state.
struct ChainTracker {
    /// The created member IDs, in creation order.
    members: Vec<String>,
    /// The chain's declared total size.
    size: usize,
    /// Current lifecycle state as observed by this manager.
    state: ChainState,
}

/// The VNF lifecycle manager controller.
pub struct VnfmCtl {
    /// The application's runtime config.
    config: Arc<Config>,
    /// This controller's bus connection.
    conn: BusConn,
    /// This controller's command queue, bound to the VNFM topic.
    queue: BusQueue,
    /// RPC handle used for member address lookup against the VIM.
    rpc: RpcClient,
    /// Per-chain creation trackers, keyed by chain ID.
    chains: HashMap<String, ChainTracker>,
    /// Every VNF ID ever seen, guarding against duplicate creation commands.
    seen_vnfs: HashSet<String>,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl VnfmCtl {
    /// Create a new instance.
    pub fn new(config: Arc<Config>, conn: BusConn, shutdown_tx: broadcast::Sender<()>) -> Self {
        let queue = conn.declare_queue();
        conn.bind(&queue, TOPIC_VNFM);
        let rpc = RpcClient::new(conn.clone());
        Self {
            config,
            conn,
            queue,
            rpc,
            chains: HashMap::new(),
            seen_vnfs: HashSet::new(),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("VNFM controller has started");

        loop {
            tokio::select! {
                msg_opt = self.queue.recv() => self.handle_msg(msg_opt).await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::info!("VNFM controller has shutdown");
        Ok(())
    }

    /// Handle an inbound message from the VNFM topic.
    #[tracing::instrument(level = "trace", skip(self, msg_opt))]
    async fn handle_msg(&mut self, msg_opt: Option<Bytes>) {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                let _res = self.shutdown_tx.send(());
                return;
            }
        };
        let cmd: VnfmCmd = match utils::decode_msg(&msg) {
            Ok(cmd) => cmd,
            Err(err) => {
                tracing::warn!(error = ?err, "dropping malformed message on VNFM topic");
                return;
            }
        };
        match cmd {
            VnfmCmd::CreateVnf { vnf_id, sfc_id, vnf_num, sfc_size } => self.handle_create_vnf(vnf_id, sfc_id, vnf_num, sfc_size).await,
            VnfmCmd::DeleteVnf { sfc_id } => self.handle_delete_vnf(sfc_id),
            VnfmCmd::Heartbeat { rqueue } => {
                if let Err(err) = self.conn.send_to_queue(&rqueue, Bytes::from_static(OK_REPLY)) {
                    tracing::warn!(error = ?err, "error replying to heartbeat");
                }
            }
        }
    }

    /// Track a new chain member, forward its start command and finalize the chain once
    /// all declared members have been created.
    async fn handle_create_vnf(&mut self, vnf_id: String, sfc_id: String, vnf_num: usize, sfc_size: usize) {
        if !self.seen_vnfs.insert(vnf_id.clone()) {
            // A repeated ID signals an orchestrator bug, not a retryable condition.
            tracing::error!(vnf_id = %vnf_id, sfc_id = %sfc_id, "duplicate VNF ID in creation command, aborting");
            return;
        }
        let tracker = self.chains.entry(sfc_id.clone()).or_insert_with(|| ChainTracker {
            members: Vec::with_capacity(sfc_size),
            size: sfc_size,
            state: ChainState::Pending,
        });
        if tracker.state == ChainState::Active {
            // The chain has already been finalized; a late acknowledgement must not
            // downgrade it and re-run finalization.
            tracing::warn!(vnf_id = %vnf_id, sfc_id = %sfc_id, "member creation for already active chain, ignoring");
            return;
        }
        tracker.members.push(vnf_id.clone());
        tracker.state = ChainState::ReadyPartial;
        tracing::debug!(vnf_id = %vnf_id, sfc_id = %sfc_id, vnf_num, sfc_size, created = tracker.members.len(), "tracking new chain member");

        let start = VimCmd::Start { vnf_id, sfc_id: sfc_id.clone() };
        match utils::encode_msg(&start) {
            Ok(payload) => self.conn.publish(TOPIC_VIM, payload),
            Err(err) => tracing::error!(error = ?err, "error encoding workload start command"),
        }

        let complete = tracker.members.len() >= tracker.size;
        if complete {
            self.finalize_chain(&sfc_id).await;
        }
    }

    /// Resolve every member's address, build the forward graph, start forwarding and
    /// announce the chain to the gateway.
    ///
    /// Address lookups are sequential and each bounded by the RPC deadline; a stuck VIM
    /// stalls this chain's activation only. A timed-out lookup aborts finalization and
    /// leaves the chain partially ready; nothing retries automatically.
    async fn finalize_chain(&mut self, sfc_id: &str) {
        let members = match self.chains.get(sfc_id) {
            Some(tracker) => tracker.members.clone(),
            None => return,
        };

        let mut addresses = Vec::with_capacity(members.len());
        for member in &members {
            let cmd = VimCmd::GetVnfIp {
                vnf_id: member.clone(),
                rqueue: self.rpc.reply_queue().to_string(),
            };
            match self.rpc.call::<_, VnfIpReply>(TOPIC_VIM, &cmd, self.config.rpc_timeout()).await {
                Ok(Some(reply)) => addresses.push(reply.ip),
                Ok(None) => {
                    tracing::error!(sfc_id = %sfc_id, vnf_id = %member, "timed out resolving member address, aborting chain activation");
                    return;
                }
                Err(err) => {
                    tracing::error!(error = ?err, sfc_id = %sfc_id, vnf_id = %member, "error resolving member address, aborting chain activation");
                    return;
                }
            }
        }

        let addrs: HashMap<String, String> = members.iter().cloned().zip(addresses.iter().cloned()).collect();
        let graph = match forward_graph(&members, &addrs, &self.config.sink_addr) {
            Ok(graph) => graph,
            Err(err) => {
                tracing::error!(error = ?err, sfc_id = %sfc_id, "error building forward graph, aborting chain activation");
                return;
            }
        };

        for ((member, next_hop), addr) in graph.iter().zip(addresses.iter()) {
            let cmd = VimCmd::RunVnf {
                vnf_id: member.clone(),
                inbound: addr.clone(),
                outbound: next_hop.clone(),
            };
            match utils::encode_msg(&cmd) {
                Ok(payload) => self.conn.publish(TOPIC_VIM, payload),
                Err(err) => tracing::error!(error = ?err, "error encoding run command"),
            }
        }

        let announce = GatewayCmd::SfcCreation {
            sfc_id: sfc_id.to_string(),
            members: members
                .iter()
                .zip(addresses.iter())
                .map(|(vnf_id, address)| SfcMember {
                    vnf_id: vnf_id.clone(),
                    address: address.clone(),
                })
                .collect(),
        };
        match utils::encode_msg(&announce) {
            Ok(payload) => self.conn.publish(TOPIC_GATEWAY, payload),
            Err(err) => tracing::error!(error = ?err, "error encoding chain announcement"),
        }

        if let Some(tracker) = self.chains.get_mut(sfc_id) {
            tracker.state = ChainState::Active;
        }
        tracing::info!(sfc_id = %sfc_id, members = members.len(), "chain activated");
    }

    /// Relay a stop to the VIM for every tracked member of the chain, then drop the
    /// chain's tracker.
    fn handle_delete_vnf(&mut self, sfc_id: String) {
        let tracker = match self.chains.remove(&sfc_id) {
            Some(tracker) => tracker,
            None => {
                tracing::info!(sfc_id = %sfc_id, "delete for untracked chain, ignoring");
                return;
            }
        };
        for member in tracker.members {
            let cmd = VimCmd::Stop { vnf_id: member };
            match utils::encode_msg(&cmd) {
                Ok(payload) => self.conn.publish(TOPIC_VIM, payload),
                Err(err) => tracing::error!(error = ?err, "error encoding workload stop command"),
            }
        }
        tracing::info!(sfc_id = %sfc_id, "chain members stopped");
    }
}
