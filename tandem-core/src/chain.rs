//! Service chain model.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::bus::BusConn;
use crate::error::AppError;
use crate::TOPIC_VNF_CONTROL;

/// Lifecycle states of a service chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// Members have been requested, none confirmed yet.
    Pending,
    /// Some members are created, not yet all of them.
    ReadyPartial,
    /// All members created, forward graph built, gateway notified.
    Active,
    /// Deletion is in progress.
    Deleting,
    /// The chain is gone; terminal.
    Deleted,
}

/// Static description of a single VNF, created at chain-creation time and immutable
/// thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnfDescriptor {
    /// The system-generated unique ID of this VNF.
    pub vnf_id: String,
    /// The name of the network function this VNF runs.
    pub nf_type: Option<String>,
    /// A reference to the workload image backing this VNF.
    pub sw_image: Option<String>,
}

impl VnfDescriptor {
    /// Create a descriptor for the given ID with no function type or image set.
    pub fn new(vnf_id: impl Into<String>) -> Self {
        Self {
            vnf_id: vnf_id.into(),
            nf_type: None,
            sw_image: None,
        }
    }
}

/// A service function chain: an ordered list of members plus lifecycle state.
#[derive(Debug)]
pub struct Chain {
    /// The operator-supplied chain ID.
    pub sfc_id: String,
    /// The chain members, in traversal order.
    pub members: Vec<VnfDescriptor>,
    /// Current lifecycle state.
    pub state: ChainState,
}

impl Chain {
    /// Create a new chain in state `Pending`.
    pub fn new(sfc_id: impl Into<String>, members: Vec<VnfDescriptor>) -> Self {
        Self {
            sfc_id: sfc_id.into(),
            members,
            state: ChainState::Pending,
        }
    }

    /// The member IDs of this chain, in traversal order.
    pub fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(|vnf| vnf.vnf_id.clone()).collect()
    }

    /// Broadcast this chain's deletion marker on the member control topic.
    pub fn clean(&self, conn: &BusConn) {
        let marker = format!("delete_sfc,{}", self.sfc_id);
        conn.publish(TOPIC_VNF_CONTROL, Bytes::from(marker));
    }
}

/// Build the forward graph for the given ordered members.
///
/// Each member's next hop is the following member's address; the last member's next hop
/// is the sink. The returned pairs preserve chain order.
pub fn forward_graph(members: &[String], addrs: &HashMap<String, String>, sink: &str) -> Result<Vec<(String, String)>, AppError> {
    let mut graph = Vec::with_capacity(members.len());
    for (idx, member) in members.iter().enumerate() {
        let next_hop = match members.get(idx + 1) {
            Some(next) => addrs
                .get(next)
                .cloned()
                .ok_or_else(|| AppError::InvalidInput(format!("no address recorded for chain member '{}'", next)))?,
            None => sink.to_string(),
        };
        graph.push((member.clone(), next_hop));
    }
    Ok(graph)
}
