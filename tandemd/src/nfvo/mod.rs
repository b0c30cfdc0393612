//! Orchestrator (NFVO) controller.
//!
//! The operator-facing entry point of the control plane: creates and deletes service
//! chains and owns the authoritative in-memory chain catalog. Creation allocates fresh
//! VNF IDs and fans one creation command per member out to the lifecycle manager,
//! carrying each member's ordinal position and the chain's total size so the manager
//! can detect completion without a separate handshake.

#[cfg(test)]
mod mod_test;

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Result;
use bytes::Bytes;
use futures::stream::StreamExt;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use tandem_core::bus::{BusConn, BusQueue};
use tandem_core::chain::{Chain, ChainState, VnfDescriptor};
use tandem_core::client::CHAIN_SIZE_RANGE;
use tandem_core::error::AppError;
use tandem_core::msg::{ChainCatalog, GatewayCmd, NfvoCmd, VnfmCmd};
use tandem_core::rpc::OK_REPLY;
use tandem_core::{utils, TOPIC_FORWARDER, TOPIC_GATEWAY, TOPIC_NFVO, TOPIC_VNFM};

/// The prefix of every generated VNF ID.
const ID_PREFIX: &str = "vnf-";
/// The length of the random suffix of a generated VNF ID.
const ID_SUFFIX_LEN: usize = 6;
/// Maximum generation attempts before ID allocation fails.
const MAX_ID_ATTEMPTS: usize = 20;
/// The alphabet used for ID suffixes.
const ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Counter metric: chains created by the orchestrator.
const METRIC_CHAINS_CREATED: &str = "tandem_chains_created";
/// Counter metric: chains deleted by the orchestrator.
const METRIC_CHAINS_DELETED: &str = "tandem_chains_deleted";

/// The registry of every VNF ID issued over this orchestrator's lifetime.
///
/// IDs are never recycled: an aborted chain creation leaves its already allocated IDs
/// registered, preserving global uniqueness at the cost of a few burned suffixes.
#[derive(Default)]
pub struct IdRegistry {
    issued: HashSet<String>,
}

impl IdRegistry {
    /// Allocate a fresh VNF ID, retrying on collision up to the attempt bound.
    pub fn generate(&mut self) -> Result<String, AppError> {
        self.generate_with(random_vnf_id)
    }

    fn generate_with(&mut self, mut gen: impl FnMut() -> String) -> Result<String, AppError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let candidate = gen();
            if self.issued.insert(candidate.clone()) {
                return Ok(candidate);
            }
        }
        Err(AppError::IdExhausted(MAX_ID_ATTEMPTS))
    }
}

/// Generate a random VNF ID candidate.
fn random_vnf_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..ID_SUFFIX_LEN).map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char).collect();
    format!("{}{}", ID_PREFIX, suffix)
}

/// The orchestrator controller.
pub struct NfvoCtl {
    /// This controller's bus connection.
    conn: BusConn,
    /// This controller's command queue, bound to the NFVO topic.
    queue: BusQueue,
    /// The authoritative chain catalog, keyed by chain ID.
    catalog: HashMap<String, Chain>,
    /// The registry of issued VNF IDs.
    ids: IdRegistry,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl NfvoCtl {
    /// Create a new instance.
    pub fn new(conn: BusConn, shutdown_tx: broadcast::Sender<()>) -> Self {
        let queue = conn.declare_queue();
        conn.bind(&queue, TOPIC_NFVO);
        metrics::register_counter!(METRIC_CHAINS_CREATED, metrics::Unit::Count, "chains created by the orchestrator");
        metrics::register_counter!(METRIC_CHAINS_DELETED, metrics::Unit::Count, "chains deleted by the orchestrator");
        Self {
            conn,
            queue,
            catalog: HashMap::new(),
            ids: IdRegistry::default(),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!("NFVO controller has started");

        loop {
            tokio::select! {
                msg_opt = self.queue.recv() => self.handle_msg(msg_opt),
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::info!("NFVO controller has shutdown");
        Ok(())
    }

    /// Handle an inbound message from the NFVO topic.
    #[tracing::instrument(level = "trace", skip(self, msg_opt))]
    fn handle_msg(&mut self, msg_opt: Option<Bytes>) {
        let msg = match msg_opt {
            Some(msg) => msg,
            None => {
                let _res = self.shutdown_tx.send(());
                return;
            }
        };
        let cmd: NfvoCmd = match utils::decode_msg(&msg) {
            Ok(cmd) => cmd,
            Err(err) => {
                tracing::warn!(error = ?err, "dropping malformed message on NFVO topic");
                return;
            }
        };
        match cmd {
            NfvoCmd::CreateSfc { sfc_id, sfc_size } => self.handle_create_sfc(sfc_id, sfc_size),
            NfvoCmd::DeleteSfc { sfc_id } => self.handle_delete_sfc(sfc_id),
            NfvoCmd::ListSfc { return_queue } => self.handle_list_sfc(return_queue),
            NfvoCmd::SfcInfo { sfc } => tracing::info!(sfc = %sfc, "sfc info received"),
            NfvoCmd::Heartbeat { rqueue } => {
                if let Err(err) = self.conn.send_to_queue(&rqueue, Bytes::from_static(OK_REPLY)) {
                    tracing::warn!(error = ?err, "error replying to heartbeat");
                }
            }
        }
    }

    /// Create a new chain, allocating its member descriptors and requesting their
    /// instantiation from the lifecycle manager.
    fn handle_create_sfc(&mut self, sfc_id: String, sfc_size: usize) {
        if !CHAIN_SIZE_RANGE.contains(&sfc_size) {
            tracing::warn!(sfc_id = %sfc_id, sfc_size, "rejecting chain creation, size must be in [1,8]");
            return;
        }
        if self.catalog.contains_key(&sfc_id) {
            tracing::warn!(sfc_id = %sfc_id, "rejecting chain creation, chain ID already in catalog");
            return;
        }

        let mut members = Vec::with_capacity(sfc_size);
        for _ in 0..sfc_size {
            match self.ids.generate() {
                Ok(vnf_id) => members.push(VnfDescriptor::new(vnf_id)),
                Err(err) => {
                    tracing::error!(error = ?err, sfc_id = %sfc_id, "error allocating VNF ID, aborting chain creation");
                    return;
                }
            }
        }

        for (idx, member) in members.iter().enumerate() {
            let cmd = VnfmCmd::CreateVnf {
                vnf_id: member.vnf_id.clone(),
                sfc_id: sfc_id.clone(),
                vnf_num: idx + 1,
                sfc_size,
            };
            match utils::encode_msg(&cmd) {
                Ok(payload) => self.conn.publish(TOPIC_VNFM, payload),
                Err(err) => tracing::error!(error = ?err, "error encoding member creation command"),
            }
        }

        tracing::info!(sfc_id = %sfc_id, sfc_size, "chain registered, member creation requested");
        metrics::increment_counter!(METRIC_CHAINS_CREATED);
        self.catalog.insert(sfc_id.clone(), Chain::new(sfc_id, members));
    }

    /// Delete a chain: cascade stops to its members and prune data-plane state.
    fn handle_delete_sfc(&mut self, sfc_id: String) {
        let mut chain = match self.catalog.remove(&sfc_id) {
            Some(chain) => chain,
            None => {
                tracing::info!(sfc_id = %sfc_id, "delete for unknown chain, ignoring");
                return;
            }
        };
        chain.state = ChainState::Deleting;

        let cmd = VnfmCmd::DeleteVnf { sfc_id: sfc_id.clone() };
        match utils::encode_msg(&cmd) {
            Ok(payload) => self.conn.publish(TOPIC_VNFM, payload),
            Err(err) => tracing::error!(error = ?err, "error encoding member deletion command"),
        }
        chain.clean(&self.conn);

        // Prune data-plane state even if no member ever acknowledges the stop.
        let announce = GatewayCmd::SfcDelete { sfc_id: sfc_id.clone() };
        match utils::encode_msg(&announce) {
            Ok(payload) => {
                self.conn.publish(TOPIC_GATEWAY, payload.clone());
                self.conn.publish(TOPIC_FORWARDER, payload);
            }
            Err(err) => tracing::error!(error = ?err, "error encoding chain deletion announcement"),
        }

        chain.state = ChainState::Deleted;
        tracing::info!(sfc_id = %sfc_id, "chain deleted");
        metrics::increment_counter!(METRIC_CHAINS_DELETED);
    }

    /// Reply with the full chain catalog on the caller's queue.
    fn handle_list_sfc(&mut self, return_queue: String) {
        let catalog = ChainCatalog {
            sfcs: self.catalog.iter().map(|(sfc_id, chain)| (sfc_id.clone(), chain.member_ids())).collect::<BTreeMap<_, _>>(),
        };
        match utils::encode_msg(&catalog) {
            Ok(payload) => {
                if let Err(err) = self.conn.send_to_queue(&return_queue, payload) {
                    tracing::warn!(error = ?err, "error replying to catalog listing");
                }
            }
            Err(err) => tracing::error!(error = ?err, "error encoding catalog listing reply"),
        }
    }
}
