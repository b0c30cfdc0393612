//! Wire messages exchanged between control-plane roles.
//!
//! Every bus message is a JSON object carrying a mandatory `action` tag; all other
//! fields are action-specific. Each role decodes the command enum matching its own
//! topic and drops anything that does not decode. Replies travel point-to-point to the
//! requester's reply queue, either as one of the typed reply objects below or as the
//! raw heartbeat acknowledgment `ok`, which is deliberately not JSON.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Commands understood by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NfvoCmd {
    /// Create a service chain with the given ID and member count.
    CreateSfc { sfc_id: String, sfc_size: usize },
    /// Delete a service chain, cascading stops to all of its members.
    DeleteSfc { sfc_id: String },
    /// List the chain catalog, replying on `return_queue`.
    ListSfc { return_queue: String },
    /// Forwarding-info hook; currently logged only.
    SfcInfo { sfc: serde_json::Value },
    /// Liveness probe, answered with the literal `ok` on `rqueue`.
    Heartbeat { rqueue: String },
}

/// Commands understood by the VNF lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum VnfmCmd {
    /// Track a new chain member and forward a start command to the VIM.
    ///
    /// `vnf_num` is the member's 1-based position and `sfc_size` the chain's declared
    /// total, which together let the manager detect chain completion without a separate
    /// handshake.
    CreateVnf {
        vnf_id: String,
        sfc_id: String,
        vnf_num: usize,
        sfc_size: usize,
    },
    /// Stop every tracked member of the given chain and drop its tracker.
    DeleteVnf { sfc_id: String },
    /// Liveness probe, answered with the literal `ok` on `rqueue`.
    Heartbeat { rqueue: String },
}

/// Commands understood by the infrastructure manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum VimCmd {
    /// Start a workload for the given VNF; fire-and-forget.
    Start { vnf_id: String, sfc_id: String },
    /// Instruct a running workload to forward from `in` to `out`.
    RunVnf {
        vnf_id: String,
        #[serde(rename = "in")]
        inbound: String,
        #[serde(rename = "out")]
        outbound: String,
    },
    /// Resolve a workload's reachable address, replying on `rqueue`.
    GetVnfIp { vnf_id: String, rqueue: String },
    /// Stop the given workload; fire-and-forget.
    Stop { vnf_id: String },
    /// Liveness probe, answered with the literal `ok` on `rqueue`.
    Heartbeat { rqueue: String },
}

/// Commands understood by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum GatewayCmd {
    /// A chain became active; members are listed in chain order.
    SfcCreation { sfc_id: String, members: Vec<SfcMember> },
    /// A chain was deleted; prune all data-plane state for it.
    SfcDelete { sfc_id: String },
    /// Liveness probe, answered with the literal `ok` on `rqueue`.
    Heartbeat { rqueue: String },
}

/// One chain member and its reachable address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfcMember {
    pub vnf_id: String,
    pub address: String,
}

/// Reply to `get_vnf_ip`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnfIpReply {
    pub ip: String,
}

/// Reply to `list_sfc`: every cataloged chain mapped to its ordered member IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainCatalog {
    pub sfcs: BTreeMap<String, Vec<String>>,
}
